use serde::{Deserialize, Serialize};

pub const TOKEN_EXPIRED: i32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCodeInfo {
    pub code: i32,
    pub name: &'static str,
    pub retryable: bool,
}

const fn info(code: i32, name: &'static str, retryable: bool) -> ErrorCodeInfo {
    ErrorCodeInfo {
        code,
        name,
        retryable,
    }
}

/// Error codes the backend reports in `error.code`, with whether repeating the
/// same request can succeed without caller intervention.
pub const ERROR_CODES: &[ErrorCodeInfo] = &[
    info(-1, "InternalSystemError", true),
    info(2, "AccessKeyError", false),
    info(3, "AuthenticationFailedError", true),
    info(4, "InputError", false),
    info(6, "DuplicateUsernameError", false),
    info(9, "RateLimitError", true),
    info(16, "DoesNotExistError", false),
    info(17, "NotAllowedError", false),
    info(18, "EventNotSupportedError", false),
    info(19, "ChannelFeatureNotSupportedError", false),
    info(20, "MessageTooLongError", false),
    info(21, "MultipleNestingLevelError", false),
    info(22, "PayloadTooBigError", false),
    info(23, "RequestTimeoutError", true),
    info(24, "MaxHeaderSizeExceededError", false),
    info(40, "AuthErrorTokenExpired", false),
    info(41, "AuthErrorTokenNotValidYet", false),
    info(42, "AuthErrorTokenUsedBeforeIssuedAt", false),
    info(43, "AuthErrorTokenSignatureInvalid", false),
    info(44, "CustomCommandEndpointMissingError", false),
    info(45, "CustomCommandEndpointCallError", true),
    info(46, "ConnectionIDNotFoundError", false),
    info(60, "CoolDownError", true),
    info(69, "ErrWrongRegion", false),
    info(70, "ErrQueryChannelPermissions", false),
    info(71, "ErrTooManyConnections", true),
    info(99, "AppSuspendedError", false),
];

pub fn lookup_error_code(code: i32) -> Option<&'static ErrorCodeInfo> {
    ERROR_CODES.iter().find(|entry| entry.code == code)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: i32,
    pub message: String,
    #[serde(
        rename = "StatusCode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub status_code: Option<u16>,
}

impl ApiError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn name(&self) -> &'static str {
        lookup_error_code(self.code)
            .map(|entry| entry.name)
            .unwrap_or("UnknownError")
    }

    /// Unknown codes are treated as retryable unless the HTTP status says the
    /// request itself was rejected.
    pub fn is_retryable(&self) -> bool {
        match lookup_error_code(self.code) {
            Some(entry) => entry.retryable,
            None => !matches!(self.status_code, Some(400..=499)),
        }
    }

    pub fn is_token_expired(&self) -> bool {
        self.code == TOKEN_EXPIRED
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self.code, 2 | 3 | 40..=43) || self.status_code == Some(401)
    }
}

/// Error payload the backend sends as a socket frame or REST body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ApiError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_expiry_is_an_auth_failure_that_plain_retry_cannot_fix() {
        let err = ApiError::new(TOKEN_EXPIRED, "token expired").with_status(401);
        assert!(err.is_token_expired());
        assert!(err.is_auth_failure());
        assert!(!err.is_retryable());
        assert_eq!(err.name(), "AuthErrorTokenExpired");
    }

    #[test]
    fn unknown_codes_fall_back_to_status_class() {
        assert!(ApiError::new(1234, "boom").with_status(503).is_retryable());
        assert!(!ApiError::new(1234, "bad").with_status(422).is_retryable());
        assert!(ApiError::new(1234, "no status").is_retryable());
    }

    #[test]
    fn decodes_error_frame_with_status_code_field() {
        let raw = r#"{"error":{"code":43,"message":"signature invalid","StatusCode":401}}"#;
        let envelope: ErrorEnvelope = serde_json::from_str(raw).expect("frame");
        assert_eq!(envelope.error.code, 43);
        assert_eq!(envelope.error.status_code, Some(401));
        assert!(envelope.error.is_auth_failure());
    }
}
