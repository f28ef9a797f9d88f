use chat_shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("sync requires at least one channel cid")]
    EmptyChannelList,
    #[error("sync requires a last_sync_at cursor")]
    MissingCursor,
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication failed ({code}): {message}")]
    Auth {
        code: i32,
        message: String,
        token_expired: bool,
        retryable: bool,
    },
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("api error {code} (status {status:?}): {message}")]
    Api {
        status: Option<u16>,
        code: i32,
        message: String,
        retryable: bool,
    },
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("connection closed by caller")]
    Disconnected,
    #[error("connection attempt superseded by a newer generation")]
    Superseded,
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    /// Whether the reconnect loop may retry after this failure without
    /// caller intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Protocol(_) | Self::Timeout(_) => true,
            Self::Auth { retryable, .. } => *retryable,
            Self::Api { retryable, .. } => *retryable,
            Self::Sync(_) | Self::Disconnected | Self::Superseded | Self::Config(_) => false,
        }
    }

    pub fn is_token_expired(&self) -> bool {
        matches!(
            self,
            Self::Auth {
                token_expired: true,
                ..
            }
        )
    }
}

impl From<ApiError> for ClientError {
    fn from(value: ApiError) -> Self {
        if value.is_auth_failure() {
            Self::Auth {
                code: value.code,
                token_expired: value.is_token_expired(),
                retryable: value.is_retryable(),
                message: value.message,
            }
        } else {
            Self::Api {
                status: value.status_code,
                code: value.code,
                retryable: value.is_retryable(),
                message: value.message,
            }
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match value {
            WsError::Http(response) if response.status().as_u16() == 401 => Self::Auth {
                code: 3,
                message: "websocket handshake rejected credential".to_string(),
                token_expired: false,
                retryable: false,
            },
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return Self::Transport(format!("request timed out: {value}"));
        }
        Self::Transport(value.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        Self::Protocol(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_shared::error::TOKEN_EXPIRED;

    #[test]
    fn expired_token_maps_to_refreshable_auth_error() {
        let err = ClientError::from(ApiError::new(TOKEN_EXPIRED, "expired").with_status(401));
        assert!(err.is_token_expired());
        // Recovery goes through a refresh, not a blind retry.
        assert!(!err.is_retryable());
    }

    #[test]
    fn invalid_signature_is_terminal() {
        let err = ClientError::from(ApiError::new(43, "bad signature").with_status(401));
        assert!(matches!(err, ClientError::Auth { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn sync_errors_are_never_retried() {
        let err = ClientError::from(SyncError::EmptyChannelList);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "sync requires at least one channel cid");
    }
}
