use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> ClientResult<String>;

    /// Static credentials cannot be refreshed; an expiry on them is terminal.
    fn is_static(&self) -> bool {
        false
    }
}

pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> ClientResult<String> {
        Ok(self.token.clone())
    }

    fn is_static(&self) -> bool {
        true
    }
}

/// Caches the current credential and reloads it from the provider on demand.
pub struct TokenManager {
    provider: Arc<dyn TokenProvider>,
    current: RwLock<Option<String>>,
}

impl TokenManager {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            current: RwLock::new(None),
        }
    }

    pub async fn token(&self) -> ClientResult<String> {
        if let Some(token) = self.current.read().await.clone() {
            return Ok(token);
        }
        self.reload().await
    }

    /// Fetches a fresh credential after the backend reported expiry.
    pub async fn refresh(&self) -> ClientResult<String> {
        if self.provider.is_static() {
            warn!("token: static credential expired and cannot be refreshed");
            return Err(ClientError::Auth {
                code: chat_shared::error::TOKEN_EXPIRED,
                message: "static token expired".to_string(),
                token_expired: true,
                retryable: false,
            });
        }
        debug!("token: refreshing credential");
        self.reload().await
    }

    pub async fn clear(&self) {
        *self.current.write().await = None;
    }

    async fn reload(&self) -> ClientResult<String> {
        let token = self.provider.get_token().await?;
        *self.current.write().await = Some(token.clone());
        Ok(token)
    }
}
