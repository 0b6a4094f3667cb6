//! Transport and handler errors.

use fairshare_core::CoreError;
use std::error::Error;

/// Maximum number of error sources rendered in a diagnostic
pub const MAX_DIAGNOSTIC_DEPTH: usize = 5;

/// Maximum length of a rendered diagnostic in bytes
pub const MAX_DIAGNOSTIC_LEN: usize = 4096;

/// Handler result type
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Client-side transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    /// Timeout
    #[error("Request to {address} timed out after {timeout_ms}ms")]
    Timeout { address: String, timeout_ms: u64 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid response
    #[error("Invalid response from {address}: {reason}")]
    InvalidResponse { address: String, reason: String },

    /// The server answered with the falsy sentinel
    #[error("Call {op} rejected by {address}")]
    Rejected { address: String, op: String },
}

/// Errors raised by operation handlers
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The handler asks the hosting process to exit
    #[error("Termination requested: {reason}")]
    Terminate { reason: String },

    /// The request was understood but cannot be honored
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Core error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A nested remote call failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Unexpected failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Build a termination request
    #[must_use]
    pub fn terminate(reason: impl Into<String>) -> Self {
        Self::Terminate {
            reason: reason.into(),
        }
    }
}

/// Render an error and its sources, bounded in depth and length
#[must_use]
pub fn diagnostic(err: &(dyn Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    let mut depth = 1;
    while let Some(cause) = source {
        if depth >= MAX_DIAGNOSTIC_DEPTH {
            out.push_str("\n  ...");
            break;
        }
        out.push_str("\n  caused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
        depth += 1;
    }
    truncate_diagnostic(out)
}

/// Cut a diagnostic down to [`MAX_DIAGNOSTIC_LEN`] bytes
#[must_use]
pub fn truncate_diagnostic(mut text: String) -> String {
    if text.len() > MAX_DIAGNOSTIC_LEN {
        let mut cut = MAX_DIAGNOSTIC_LEN;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...[truncated]");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Layer {
        level: usize,
        inner: Option<Box<Layer>>,
    }

    impl fmt::Display for Layer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "layer {}", self.level)
        }
    }

    impl Error for Layer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            self.inner.as_deref().map(|l| l as &(dyn Error + 'static))
        }
    }

    fn chain(depth: usize) -> Layer {
        let mut layer = Layer {
            level: depth,
            inner: None,
        };
        for level in (0..depth).rev() {
            layer = Layer {
                level,
                inner: Some(Box::new(layer)),
            };
        }
        layer
    }

    #[test]
    fn test_diagnostic_includes_sources() {
        let err = chain(2);
        let text = diagnostic(&err);
        assert!(text.starts_with("layer 0"));
        assert!(text.contains("caused by: layer 1"));
        assert!(text.contains("caused by: layer 2"));
    }

    #[test]
    fn test_diagnostic_depth_is_bounded() {
        let err = chain(20);
        let text = diagnostic(&err);
        assert_eq!(text.matches("caused by").count(), MAX_DIAGNOSTIC_DEPTH - 1);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn test_truncate_diagnostic() {
        let long = "x".repeat(MAX_DIAGNOSTIC_LEN * 2);
        let cut = truncate_diagnostic(long);
        assert!(cut.len() < MAX_DIAGNOSTIC_LEN + 32);
        assert!(cut.ends_with("[truncated]"));

        assert_eq!(truncate_diagnostic("short".to_string()), "short");
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Rejected {
            address: "node1:5000".to_string(),
            op: "next".to_string(),
        };
        assert_eq!(err.to_string(), "Call next rejected by node1:5000");
    }

    #[test]
    fn test_service_error_from_core() {
        let err: ServiceError = CoreError::InvalidEncoding.into();
        assert!(matches!(err, ServiceError::Core(CoreError::InvalidEncoding)));
    }
}
