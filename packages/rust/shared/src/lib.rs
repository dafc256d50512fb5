//! Shared types, error model, and configuration for pagescribe.
//!
//! This crate is the foundation depended on by all other pagescribe crates.
//! It provides:
//! - [`PagescribeError`] — the unified error type
//! - Domain types ([`LocationSample`], [`TocEntry`], [`PageCapture`],
//!   [`TranscriptChunk`], [`Chapter`], [`BookMetadata`])
//! - Configuration ([`AppConfig`], [`CaptureConfig`], [`TranscribeConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BOOK_ID_ENV, BackendKind, CaptureConfig, CaptureSection, DefaultsConfig,
    OllamaConfig, OpenAiConfig, SurfaceConfig, TranscribeConfig, TranscribeSection, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_api_key,
    validate_config,
};
pub use error::{PagescribeError, Result};
pub use types::{
    BookInfo, BookMetadata, CURRENT_SCHEMA_VERSION, Chapter, LocationSample, PageCapture, RunId,
    RunMeta, TocEntry, TranscriptChunk,
};
