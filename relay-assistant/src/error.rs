use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AssistantError>;

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("assistant CLI timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("assistant CLI not found: {0}")]
    NotFound(String),

    #[error("failed to spawn assistant CLI: {0}")]
    Spawn(String),

    #[error("assistant CLI exited with {code}: {stderr}")]
    ProcessFailed { code: String, stderr: String },

    #[error("assistant reported an error: {0}")]
    Reported(String),

    #[error("assistant CLI produced no output")]
    EmptyOutput,

    #[error("io error: {0}")]
    Io(String),
}

/// Coarse failure buckets the dispatcher maps to user-facing diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Timeout,
    NotFound,
    ProcessError,
    Generic,
}

impl AssistantError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::ProcessFailed { .. } => ErrorCategory::ProcessError,
            Self::Spawn(_) | Self::Reported(_) | Self::EmptyOutput | Self::Io(_) => {
                ErrorCategory::Generic
            }
        }
    }
}

impl From<std::io::Error> for AssistantError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Errors raised by an [`crate::AssistantSdk`] implementation.
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),
}

impl From<reqwest::Error> for SdkError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_dispatch_categories() {
        assert_eq!(
            AssistantError::Timeout(Duration::from_secs(15)).category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            AssistantError::NotFound("claude".into()).category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            AssistantError::ProcessFailed {
                code: "exit status: 1".into(),
                stderr: "boom".into()
            }
            .category(),
            ErrorCategory::ProcessError
        );
        assert_eq!(AssistantError::EmptyOutput.category(), ErrorCategory::Generic);
    }

    #[test]
    fn timeout_message_reports_milliseconds() {
        let e = AssistantError::Timeout(Duration::from_millis(15_000));
        assert_eq!(e.to_string(), "assistant CLI timed out after 15000ms");
    }
}
