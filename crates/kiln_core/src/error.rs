//! Core error types for KILN.

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Invalid encoding
    #[error("Invalid encoding: {reason}")]
    InvalidEncoding {
        /// What the encoder rejected
        reason: String,
    },

    /// Invalid hash format
    #[error("Invalid hash: {reason}")]
    InvalidHash {
        /// Why the hash was rejected
        reason: String,
    },

    /// Invalid element or variant identifier
    #[error("Invalid identifier '{value}': {reason}")]
    InvalidId {
        /// The rejected identifier
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// Invalid path inside a file tree
    #[error("Invalid tree path '{path}': {reason}")]
    InvalidPath {
        /// The rejected path
        path: String,
        /// Why it was rejected
        reason: String,
    },
}

impl From<postcard::Error> for CoreError {
    fn from(err: postcard::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}
