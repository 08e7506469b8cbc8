//! Error types for Topic Watch

use thiserror::Error;

/// Errors that can occur while managing topics or evaluating rules
#[derive(Debug, Error)]
pub enum TopicError {
    #[error("Invalid topic spec: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Resource limit exceeded: {0}")]
    Resource(String),

    #[error("Late sample dropped: {0}")]
    LateData(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Subscription closed: {0}")]
    Closed(String),

    #[error("Timed out waiting for the next message")]
    Timeout,

    #[error("Failed to parse input: {0}")]
    ParseError(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl TopicError {
    /// Numeric client error code, compatible with the time-series client
    /// error table (13000-13099).
    pub fn code(&self) -> u32 {
        match self {
            TopicError::Validation(_) => 13061,
            TopicError::NotFound(_) => 13013,
            TopicError::AlreadyExists(_) => 13074,
            TopicError::Resource(_) => 13050,
            TopicError::LateData(_) => 13033,
            TopicError::PermissionDenied(_) => 13040,
            TopicError::Evaluation(_) => 13011,
            TopicError::Closed(_) => 13072,
            TopicError::Timeout => 13014,
            TopicError::ParseError(_) | TopicError::JsonError(_) => 13012,
        }
    }

    /// Short machine-readable name, used by the CLI and the C ABI.
    pub fn kind(&self) -> &'static str {
        match self {
            TopicError::Validation(_) => "VALIDATION_ERROR",
            TopicError::NotFound(_) => "NOT_FOUND",
            TopicError::AlreadyExists(_) => "ALREADY_EXISTS",
            TopicError::Resource(_) => "RESOURCE_ERROR",
            TopicError::LateData(_) => "LATE_DATA",
            TopicError::PermissionDenied(_) => "PERMISSION_DENIED",
            TopicError::Evaluation(_) => "EVALUATION_ERROR",
            TopicError::Closed(_) => "CLOSED",
            TopicError::Timeout => "TIMEOUT",
            TopicError::ParseError(_) => "PARSE_ERROR",
            TopicError::JsonError(_) => "JSON_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_fall_in_client_range() {
        let errors = [
            TopicError::Validation("x".into()),
            TopicError::NotFound("x".into()),
            TopicError::AlreadyExists("x".into()),
            TopicError::Resource("x".into()),
            TopicError::LateData("x".into()),
            TopicError::PermissionDenied("x".into()),
            TopicError::Evaluation("x".into()),
            TopicError::Closed("x".into()),
            TopicError::Timeout,
            TopicError::ParseError("x".into()),
        ];

        for err in &errors {
            assert!((13000..13100).contains(&err.code()), "{err}");
        }
    }

    #[test]
    fn test_json_error_conversion() {
        let err: TopicError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "JSON_ERROR");
        assert_eq!(err.code(), 13012);
    }
}
