//! Self-hosted Ollama backend (`/api/generate`).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use pagescribe_shared::{OllamaConfig, PagescribeError, Result};

use crate::backend::{TranscriptionBackend, http_client, request_error, status_error};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

/// Client for an Ollama model server.
pub struct OllamaBackend {
    client: Client,
    endpoint: Url,
    model: String,
}

impl OllamaBackend {
    pub fn new(config: &OllamaConfig, timeout: Duration) -> Result<Self> {
        let base = format!("{}/", config.base_url.trim_end_matches('/'));
        let endpoint = Url::parse(&base)
            .and_then(|u| u.join("api/generate"))
            .map_err(|e| PagescribeError::config(format!("invalid ollama.base_url: {e}")))?;
        Ok(Self {
            client: http_client(timeout)?,
            endpoint,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl TranscriptionBackend for OllamaBackend {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn transcribe(&self, image: &[u8], instruction: &str, temperature: f32) -> Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: instruction,
            images: vec![BASE64.encode(image)],
            stream: false,
            options: GenerateOptions { temperature },
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error("ollama", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("ollama", status, &body));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| {
            PagescribeError::retryable(format!("ollama returned an unreadable body: {e}"))
        })?;
        if let Some(error) = body.error {
            return Err(PagescribeError::retryable(format!("ollama error: {error}")));
        }
        debug!(chars = body.response.len(), "ollama response");
        Ok(body.response)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_for(server: &wiremock::MockServer) -> OllamaBackend {
        let config = OllamaConfig {
            base_url: server.uri(),
            model: "llava".into(),
        };
        OllamaBackend::new(&config, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn sends_image_and_reads_response() {
        let server = wiremock::MockServer::start().await;

        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/api/generate"))
            .and(wiremock::matchers::body_partial_json(serde_json::json!({
                "model": "llava",
                "prompt": "read it",
                "images": ["cG5n"],
                "stream": false,
                "options": {"temperature": 0.5}
            })))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "llava",
                "response": "Call me Ishmael.",
                "done": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let text = backend_for(&server)
            .transcribe(b"png", "read it", 0.5)
            .await
            .unwrap();
        assert_eq!(text, "Call me Ishmael.");
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = backend_for(&server)
            .transcribe(b"png", "read it", 0.0)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unknown_model_is_fatal() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(
                wiremock::ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"error": "model 'llava' not found"})),
            )
            .mount(&server)
            .await;

        let err = backend_for(&server)
            .transcribe(b"png", "read it", 0.0)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("not found"));
    }
}
