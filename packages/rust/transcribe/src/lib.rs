//! Page image transcription for pagescribe.
//!
//! A [`TranscriptionBackend`] turns one page image into text. The
//! [`Orchestrator`] drives a backend over every capture of a book with
//! bounded concurrency, retries, refusal escalation and on-disk caching.

pub mod backend;
pub mod classify;
pub mod normalize;
pub mod ollama;
pub mod openai;
pub mod orchestrator;

pub use backend::{TranscriptionBackend, build_backend};
pub use classify::{Outcome, classify, is_refusal};
pub use normalize::{normalize, strip_heading_echo};
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
pub use orchestrator::{
    CancelFlag, ESCALATED_INSTRUCTION, INSTRUCTION, Orchestrator, SilentTranscribeObserver,
    TranscribeObserver, TranscriptionReport, backoff_delay,
};
