use std::sync::Arc;

use async_trait::async_trait;
use chat_shared::{
    domain::ConnectionId,
    error::{ApiError, ErrorEnvelope},
    protocol::{QueryChannelsRequest, QueryChannelsResponse, SyncRequest, SyncResponse},
};
use reqwest::{header, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{ClientError, ClientResult},
    token::TokenManager,
};

/// REST calls the realtime core depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn sync(&self, request: SyncRequest) -> ClientResult<SyncResponse>;

    async fn query_channels(
        &self,
        request: QueryChannelsRequest,
    ) -> ClientResult<QueryChannelsResponse>;
}

pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    tokens: Arc<TokenManager>,
    connection_id: watch::Receiver<Option<ConnectionId>>,
}

impl HttpChatApi {
    pub fn new(
        base_url: Url,
        api_key: impl Into<String>,
        tokens: Arc<TokenManager>,
        connection_id: watch::Receiver<Option<ConnectionId>>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key: api_key.into(),
            tokens,
            connection_id,
        }
    }

    fn endpoint(&self, path: &str) -> ClientResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Config(format!("base url cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .push(path);
        Ok(url)
    }

    /// Posts `body`, refreshing the credential once if the backend reports
    /// it expired.
    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> ClientResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        match self.post_once(path, body).await {
            Err(err) if err.is_token_expired() => {
                debug!(path, "api: token expired, refreshing");
                self.tokens.refresh().await?;
                self.post_once(path, body).await
            }
            other => other,
        }
    }

    async fn post_once<Req, Resp>(&self, path: &str, body: &Req) -> ClientResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let token = self.tokens.token().await?;
        let connection_id = self.connection_id.borrow().clone();

        let mut query = vec![("api_key", self.api_key.clone())];
        if let Some(connection_id) = connection_id {
            query.push(("connection_id", connection_id.to_string()));
        }

        let response = self
            .http
            .post(url)
            .query(&query)
            .header(header::AUTHORIZATION, token)
            .header("stream-auth-type", "jwt")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<Resp>().await?);
        }
        let raw = response.text().await.unwrap_or_default();
        let err = decode_error(status, &raw);
        warn!(
            path,
            status = status.as_u16(),
            code = err.code,
            name = err.name(),
            "api: request failed"
        );
        Err(ClientError::from(err))
    }
}

/// Error bodies come either bare or wrapped in `{"error": {...}}`.
fn decode_error(status: StatusCode, raw: &str) -> ApiError {
    let decoded = serde_json::from_str::<ApiError>(raw)
        .or_else(|_| serde_json::from_str::<ErrorEnvelope>(raw).map(|envelope| envelope.error))
        .unwrap_or_else(|_| ApiError::new(-1, raw.trim().to_string()));
    match decoded.status_code {
        Some(_) => decoded,
        None => decoded.with_status(status.as_u16()),
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn sync(&self, request: SyncRequest) -> ClientResult<SyncResponse> {
        self.post("sync", &request).await
    }

    async fn query_channels(
        &self,
        request: QueryChannelsRequest,
    ) -> ClientResult<QueryChannelsResponse> {
        self.post("channels", &request).await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
