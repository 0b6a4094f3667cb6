//! Core error types for FAIRSHARE.

use std::fmt;
use std::path::Path;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid encoding
    InvalidEncoding,

    /// Invalid ID format
    InvalidId { reason: String },

    /// Parse error
    ParseError {
        /// Source being parsed (file name or description)
        source: String,
        /// Line number, 1-based
        line: usize,
        /// Error message
        message: String,
    },

    /// Filesystem error
    Io {
        /// Path involved in the failed operation
        path: String,
        /// Error message
        reason: String,
    },
}

impl CoreError {
    /// Wrap an I/O error together with the path it happened on
    #[must_use]
    pub fn io(path: &Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding => write!(f, "Invalid encoding"),
            Self::InvalidId { reason } => write!(f, "Invalid ID: {}", reason),
            Self::ParseError {
                source,
                line,
                message,
            } => write!(f, "Parse error in {} at line {}: {}", source, line, message),
            Self::Io { path, reason } => write!(f, "I/O error on {}: {}", path, reason),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(_err: serde_json::Error) -> Self {
        Self::InvalidEncoding
    }
}
