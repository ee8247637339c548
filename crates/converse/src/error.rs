//! Unified error type for all chat operations.
//!
//! Every provider maps its native failures into [`ChatError`], giving
//! callers a single type to match against regardless of which backend
//! is in use. Note that provider *streams* never yield this type: a
//! failing stream terminates with a `StreamResult` whose `error` field
//! is set (see [`crate::chunk::StreamResult`]), so the caller can always
//! persist a partial or error-tagged message. `ChatError` surfaces from
//! the non-streaming seams — storage, tool execution, and request
//! construction.

/// The unified error type returned by non-streaming chat operations.
///
/// Variants are `#[non_exhaustive]` — new error kinds may be added in
/// minor releases without breaking downstream matches (always include a
/// wildcard arm).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChatError {
    /// An HTTP-level failure (transport error, unexpected status code).
    ///
    /// `status` is `None` when the request never received a response
    /// (e.g. DNS failure, connection reset).
    #[error("HTTP error (status={status:?}): {message}")]
    Http {
        /// The HTTP status code, if one was received.
        status: Option<http::StatusCode>,
        /// A human-readable description of the failure.
        message: String,
        /// Whether the caller should retry this request.
        retryable: bool,
    },

    /// The API key or token was rejected.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The request was malformed (missing fields, invalid parameters).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A provider-specific error that doesn't map to another variant.
    #[error("Provider error ({code}): {message}")]
    Provider {
        /// Provider-defined error code (e.g. `"overloaded"`).
        code: String,
        /// Human-readable error description.
        message: String,
        /// Whether the caller should retry this request.
        retryable: bool,
    },

    /// The response body could not be parsed.
    #[error("Response format error: {message}")]
    ResponseFormat {
        /// What went wrong during parsing.
        message: String,
        /// The raw response body, for diagnostics.
        raw: String,
    },

    /// A tool invocation raised an error before producing a result.
    #[error("Tool execution error ({tool_name}): {message}")]
    ToolExecution {
        /// The name of the tool that failed.
        tool_name: String,
        /// What went wrong.
        message: String,
    },

    /// A storage collaborator failed to read or write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The operation exceeded its deadline.
    #[error("Operation timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds elapsed before the timeout fired.
        elapsed_ms: u64,
    },
}

impl ChatError {
    /// Returns `true` if the error is transient and the request may
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { retryable, .. } | Self::Provider { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::ResponseFormat {
            message: err.to_string(),
            raw: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_http() {
        let err = ChatError::Http {
            status: Some(http::StatusCode::TOO_MANY_REQUESTS),
            message: "rate limited".into(),
            retryable: true,
        };
        let display = format!("{err}");
        assert!(display.contains("429"));
        assert!(display.contains("rate limited"));
    }

    #[test]
    fn test_error_display_tool_execution() {
        let err = ChatError::ToolExecution {
            tool_name: "calculator".into(),
            message: "boom".into(),
        };
        let display = format!("{err}");
        assert!(display.contains("calculator"));
        assert!(display.contains("boom"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(ChatError::Timeout { elapsed_ms: 5000 }.is_retryable());
        assert!(!ChatError::Auth("bad key".into()).is_retryable());
        assert!(
            ChatError::Http {
                status: Some(http::StatusCode::SERVICE_UNAVAILABLE),
                message: "overloaded".into(),
                retryable: true,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ChatError>();
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: ChatError = json_err.into();
        assert!(matches!(err, ChatError::ResponseFormat { .. }));
    }
}
