//! Transcription backend strategy.
//!
//! A backend turns one page image into text. The hosted OpenAI-compatible
//! endpoint and a self-hosted Ollama server are interchangeable; which one is
//! used is decided once, from configuration, by [`build_backend`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use pagescribe_shared::{AppConfig, BackendKind, PagescribeError, Result, validate_api_key};

use crate::ollama::OllamaBackend;
use crate::openai::OpenAiBackend;

/// User-Agent string for backend requests.
pub(crate) const USER_AGENT: &str = concat!("pagescribe/", env!("CARGO_PKG_VERSION"));

/// Turns a page image into text.
///
/// Errors are [`PagescribeError::Backend`] with `retryable` set for rate
/// limits, timeouts, server errors and dropped connections.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    async fn transcribe(&self, image: &[u8], instruction: &str, temperature: f32) -> Result<String>;

    /// Human-readable backend name for tracing.
    fn name(&self) -> &str;
}

/// Build the backend selected in config.
pub fn build_backend(config: &AppConfig) -> Result<Arc<dyn TranscriptionBackend>> {
    let timeout = Duration::from_secs(config.transcribe.request_timeout_secs.max(1));
    match config.transcribe.backend {
        BackendKind::OpenAi => {
            let api_key = validate_api_key(config)?;
            Ok(Arc::new(OpenAiBackend::new(&config.openai, api_key, timeout)?))
        }
        BackendKind::Ollama => Ok(Arc::new(OllamaBackend::new(&config.ollama, timeout)?)),
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| PagescribeError::fatal_backend(format!("failed to build HTTP client: {e}")))
}

/// Map a non-success HTTP status to a backend error.
pub(crate) fn status_error(backend: &str, status: StatusCode, body: &str) -> PagescribeError {
    let body = body.trim();
    let body = match body.char_indices().nth(300) {
        Some((i, _)) => &body[..i],
        None => body,
    };
    let message = format!("{backend} returned HTTP {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        PagescribeError::retryable(message)
    } else {
        PagescribeError::fatal_backend(message)
    }
}

/// Map a transport-level failure to a backend error.
pub(crate) fn request_error(backend: &str, err: reqwest::Error) -> PagescribeError {
    let message = format!("{backend} request failed: {err}");
    if err.is_builder() {
        PagescribeError::fatal_backend(message)
    } else {
        // Timeouts, refused/reset connections and truncated bodies.
        PagescribeError::retryable(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(status_error("x", StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(status_error("x", StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(status_error("x", StatusCode::REQUEST_TIMEOUT, "").is_retryable());
        assert!(!status_error("x", StatusCode::UNAUTHORIZED, "").is_retryable());
        assert!(!status_error("x", StatusCode::BAD_REQUEST, "").is_retryable());
    }

    #[test]
    fn status_error_truncates_body() {
        let body = "e".repeat(1000);
        let err = status_error("openai", StatusCode::BAD_REQUEST, &body);
        assert!(err.to_string().len() < 400);
    }

    #[test]
    fn builds_ollama_backend_without_api_key() {
        let mut config = AppConfig::default();
        config.transcribe.backend = BackendKind::Ollama;
        let backend = build_backend(&config).unwrap();
        assert_eq!(backend.name(), "ollama");
    }

    #[test]
    fn openai_backend_requires_api_key() {
        let mut config = AppConfig::default();
        config.openai.api_key_env = "PAGESCRIBE_TEST_MISSING_KEY_98765".into();
        let err = build_backend(&config).err().unwrap();
        assert!(matches!(err, PagescribeError::Config { .. }));
    }
}
