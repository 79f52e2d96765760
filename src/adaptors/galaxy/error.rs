use thiserror::Error;

/// Errors raised while talking to a Galaxy server.
#[derive(Debug, Error)]
pub enum GalaxyError {
    /// The server answered with an error status. `message` carries Galaxy's
    /// `err_msg` when the body has one.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// DNS, refused connection, timeout or an undecodable body.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The server answered but not with what the call expects.
    #[error("unexpected response: {0}")]
    Unexpected(String),

    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

impl GalaxyError {
    /// Builds an [`ApiError`](GalaxyError::ApiError) from a response body,
    /// preferring Galaxy's `err_msg` over the raw text.
    pub fn from_body(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("err_msg").and_then(|m| m.as_str()).map(str::to_string))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                let body = body.trim();
                if body.is_empty() {
                    "unknown error".to_string()
                } else {
                    body.to_string()
                }
            });
        GalaxyError::ApiError { status, message }
    }

    /// Server-side and network trouble is worth retrying; client errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            GalaxyError::ApiError { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            GalaxyError::NetworkError(_) | GalaxyError::Unexpected(_) => true,
            GalaxyError::InvalidUrl(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_msg_is_extracted() {
        let err = GalaxyError::from_body(
            400,
            r#"{"err_msg": "Tool 'cat9' not found", "err_code": 400008}"#,
        );
        assert_eq!(
            err.to_string(),
            "API error (status 400): Tool 'cat9' not found"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn plain_body_is_kept() {
        let err = GalaxyError::from_body(502, "Bad Gateway\n");
        assert_eq!(err.to_string(), "API error (status 502): Bad Gateway");
        assert!(err.is_transient());
        assert_eq!(
            GalaxyError::from_body(500, "").to_string(),
            "API error (status 500): unknown error"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GalaxyError>();
    }
}
