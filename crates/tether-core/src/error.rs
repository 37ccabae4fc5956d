use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TetherError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("timeout: {operation} exceeded {}ms", limit.as_millis())]
    Timeout { operation: String, limit: Duration },
    #[error("missing parameter: {0}")]
    MissingParameter(String),
    #[error("invalid database: {0}")]
    InvalidDatabase(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("driver error: {0}")]
    Driver(String),
    #[error("server fault: {0}")]
    ServerFault(String),
}

impl TetherError {
    pub fn timeout(operation: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            limit,
        }
    }

    pub fn missing(what: impl Into<String>) -> Self {
        Self::MissingParameter(what.into())
    }

    pub fn driver(err: impl std::fmt::Display) -> Self {
        Self::Driver(err.to_string())
    }

    /// Stable name carried in the `kind` field of Exception responses.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TetherError::ChecksumMismatch { .. } => "ChecksumMismatch",
            TetherError::Malformed(_) => "Malformed",
            TetherError::Timeout { .. } => "Timeout",
            TetherError::MissingParameter(_) => "MissingParameter",
            TetherError::InvalidDatabase(_) => "InvalidDatabase",
            TetherError::InvalidState(_) => "InvalidState",
            TetherError::Driver(_) => "Driver",
            TetherError::ServerFault(_) => "ServerFault",
        }
    }
}

pub type TetherResult<T> = Result<T, TetherError>;
