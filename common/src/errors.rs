// Error handling framework for the scheduler, the job store and the wire protocol

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheduler errors surfaced to sessions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job already exists: {func}/{name}")]
    JobExists { func: String, name: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Job {func}/{name} is not held by this worker")]
    NotOwner { func: String, name: String },

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Scheduler is shutting down")]
    Shutdown,
}

impl SchedError {
    pub fn not_owner(func: &str, name: &str) -> Self {
        SchedError::NotOwner {
            func: func.to_string(),
            name: name.to_string(),
        }
    }

    /// Stable wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            SchedError::InvalidJob(_) => ErrorCode::InvalidJob,
            SchedError::JobExists { .. } => ErrorCode::JobExists,
            SchedError::NotFound(_) => ErrorCode::NotFound,
            SchedError::NotOwner { .. } => ErrorCode::NotOwner,
            SchedError::PersistenceFailed(_) => ErrorCode::PersistenceFailed,
            SchedError::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            SchedError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            SchedError::Shutdown => ErrorCode::Shutdown,
        }
    }
}

/// Error codes carried in error replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidJob,
    JobExists,
    NotFound,
    NotOwner,
    PersistenceFailed,
    StoreUnavailable,
    ProtocolViolation,
    Shutdown,
}

/// Job store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Client-side protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Server error ({code:?}): {message}")]
    Server { code: ErrorCode, message: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(format!("Redis error: {}", err))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Record not found".to_string()),
            _ => StoreError::Unavailable(format!("Database error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_exists_display() {
        let err = SchedError::JobExists {
            func: "email".to_string(),
            name: "welcome-1".to_string(),
        };
        assert!(err.to_string().contains("email/welcome-1"));
        assert_eq!(err.code(), ErrorCode::JobExists);
    }

    #[test]
    fn test_error_code_wire_name() {
        let json = serde_json::to_string(&ErrorCode::PersistenceFailed).unwrap();
        assert_eq!(json, "\"persistence_failed\"");
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_serde_error_maps_to_serialization() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: StoreError = parse.unwrap_err().into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
