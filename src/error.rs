//! Error types shared by the indexing and proxy engines.

use std::fmt;

use thiserror::Error;

use crate::classfile::ClassFormatError;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// A name could not be resolved to a loadable or mappable class.
    #[error("class not found: {0}")]
    NotFound(String),

    #[error("malformed class definition {name}: {source}")]
    Malformed {
        name: String,
        #[source]
        source: ClassFormatError,
    },

    /// Synthesis failed; the binding cannot be satisfied on this host version.
    #[error("failed to synthesize {name}: {reason}")]
    Generation { name: String, reason: String },

    /// Construction failed (no matching constructor, or the constructor failed).
    #[error("failed to instantiate {name}: {reason}")]
    Instantiation { name: String, reason: String },

    /// Two criteria registered under one name would share a category scope.
    #[error("criterion {0} is already registered")]
    DuplicateCriterion(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("jar error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("index store error: {0}")]
    Store(#[from] heed::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProxyError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// A classpath entry that could not be indexed. The scan continues without it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartialScanWarning {
    pub class_name: String,
    pub reason: String,
}

impl fmt::Display for PartialScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "skipped {}: {}", self.class_name, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session job failed: {0}")]
    Failed(String),

    #[error("session ended before the job ran")]
    Cancelled,

    #[error("session worker is gone")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display_carries_name() {
        let err = ProxyError::NotFound("a.b.EngineImpl".to_string());
        assert_eq!(err.to_string(), "class not found: a.b.EngineImpl");
        assert!(err.is_not_found());
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ProxyError = io.into();
        assert!(matches!(err, ProxyError::Io(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn partial_scan_warning_display() {
        let w = PartialScanWarning {
            class_name: "a.Broken".to_string(),
            reason: "bad magic".to_string(),
        };
        assert_eq!(w.to_string(), "skipped a.Broken: bad magic");
    }
}
