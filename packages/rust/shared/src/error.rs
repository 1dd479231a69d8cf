//! Error types for ReconPipe.
//!
//! Library crates use [`PipelineError`] via `thiserror`.
//! App crates (cli) wrap this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all ReconPipe operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to a collaborator or target site.
    #[error("network error: {0}")]
    Network(String),

    /// Page navigation never reached a usable state within the bound.
    #[error("navigation error: {0}")]
    Navigation(String),

    /// Expected content region absent from the rendered document.
    #[error("extraction error: {message}")]
    Extraction { message: String },

    /// HTML-to-Markdown conversion service unreachable or malformed reply.
    /// Recoverable: scraping jobs downgrade this to a placeholder payload.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Job could not be placed on a stage queue.
    #[error("enqueue error: {0}")]
    Enqueue(String),

    /// Data validation error (invalid status transition, bad payload, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an extraction error from any displayable message.
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures a scraping job may degrade instead of failing on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Conversion(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PipelineError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = PipelineError::extraction("main region not found");
        assert!(err.to_string().contains("main region"));
    }

    #[test]
    fn conversion_is_recoverable() {
        assert!(PipelineError::Conversion("service down".into()).is_recoverable());
        assert!(!PipelineError::Navigation("timed out".into()).is_recoverable());
    }
}
