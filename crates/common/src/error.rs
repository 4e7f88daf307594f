//! Common error types for the L3 agent components.

use std::fmt;

/// A specialized Result type for L3 agent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for L3 agent operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No slot left in a bounded pool (rule priorities, link-local subnets).
    #[error("{pool} exhausted")]
    AllocationExhausted { pool: String },

    /// A floating IP, lease or router was absent when expected.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An external namespace/device/route/process primitive failed.
    #[error("{op} failed: {message}")]
    Primitive { op: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a new allocation-exhausted error for the named pool.
    pub fn exhausted(pool: impl fmt::Display) -> Self {
        Error::AllocationExhausted {
            pool: pool.to_string(),
        }
    }

    /// Create a new not-found error.
    pub fn not_found(msg: impl fmt::Display) -> Self {
        Error::NotFound(msg.to_string())
    }

    /// Create a new primitive failure for operation `op`.
    pub fn primitive(op: impl fmt::Display, msg: impl fmt::Display) -> Self {
        Error::Primitive {
            op: op.to_string(),
            message: msg.to_string(),
        }
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Whether this error is an absent-resource condition that cleanup paths
    /// treat as already satisfied.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
