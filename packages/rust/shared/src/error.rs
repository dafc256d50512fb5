//! Error types for pagescribe.
//!
//! Library crates use [`PagescribeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all pagescribe operations.
#[derive(Debug, thiserror::Error)]
pub enum PagescribeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Unrecoverable error reported by the reading surface.
    #[error("reading surface error: {0}")]
    Surface(String),

    /// Navigation gave up after exhausting the fallback ladder.
    #[error("navigation stuck after page {last_page:?} ({captures} captures): {message}")]
    Navigation {
        message: String,
        last_page: Option<u32>,
        captures: usize,
    },

    /// The reading surface layout is not what we expect (no TOC, no content pages).
    #[error("structural error: {message}")]
    Structural { message: String },

    /// Transcription backend error (HTTP, response shape, model failure).
    #[error("backend error: {message}")]
    Backend { message: String, retryable: bool },

    /// A single page could not be transcribed.
    #[error("transcription failed for capture {index} (page {page}): {message}")]
    Transcription {
        index: usize,
        page: u32,
        message: String,
    },

    /// Artifact store error (missing artifact, refusing to overwrite, etc.).
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Text or JSON parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The run was aborted by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PagescribeError>;

impl PagescribeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a structural (whole-run, never retried) error.
    pub fn structural(msg: impl Into<String>) -> Self {
        Self::Structural {
            message: msg.into(),
        }
    }

    /// Backend error that is worth retrying (rate limit, timeout, 5xx).
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Backend error that will not improve on retry (auth, bad request).
    pub fn fatal_backend(msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry of the same operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { retryable: true, .. })
    }
}
