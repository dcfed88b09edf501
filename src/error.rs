//! Error taxonomy shared by the store, lifecycle, repair and command layers.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Stable, machine-readable error code surfaced at the command boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    StaleState,
    IoFailure,
    PartialFailure,
    InvalidInput,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::StaleState => "stale_state",
            ErrorCode::IoFailure => "io_failure",
            ErrorCode::PartialFailure => "partial_failure",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("stale state: {0}")]
    StaleState(String),

    #[error("I/O failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound { .. } => ErrorCode::NotFound,
            StoreError::Conflict(_) => ErrorCode::Conflict,
            StoreError::StaleState(_) => ErrorCode::StaleState,
            StoreError::Io { .. } => ErrorCode::IoFailure,
            StoreError::Database(e)
                if e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) =>
            {
                ErrorCode::Conflict
            }
            StoreError::Database(rusqlite::Error::QueryReturnedNoRows) => ErrorCode::NotFound,
            StoreError::Database(_) | StoreError::Serialization(_) | StoreError::Embedding(_) => {
                ErrorCode::Internal
            }
            StoreError::Parse(_) | StoreError::InvalidInput(_) => ErrorCode::InvalidInput,
        }
    }
}

/// One failed item inside a batch operation. Batches collect these instead of aborting.
#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub code: ErrorCode,
    pub message: String,
}

impl ItemError {
    pub fn new(file_id: Option<i64>, path: Option<&str>, err: &StoreError) -> Self {
        Self {
            file_id,
            path: path.map(str::to_string),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            StoreError::not_found("file", 7).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            StoreError::StaleState("x".into()).code().as_str(),
            "stale_state"
        );
        let io = StoreError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(io.code(), ErrorCode::IoFailure);
        assert!(io.to_string().contains("/tmp/x"));
    }

    #[test]
    fn test_item_error_serializes_code() {
        let err = StoreError::Conflict("taken".into());
        let item = ItemError::new(Some(3), Some("a.py"), &err);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["code"], "conflict");
        assert_eq!(json["file_id"], 3);
    }
}
