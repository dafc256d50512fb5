//! Application configuration for pagescribe.
//!
//! User config lives at `~/.pagescribe/pagescribe.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PagescribeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "pagescribe.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".pagescribe";

/// Env var holding the identifier of the book to process.
pub const BOOK_ID_ENV: &str = "PAGESCRIBE_BOOK_ID";

// ---------------------------------------------------------------------------
// Config structs (matching pagescribe.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub capture: CaptureSection,

    #[serde(default)]
    pub transcribe: TranscribeSection,

    #[serde(default)]
    pub openai: OpenAiConfig,

    #[serde(default)]
    pub ollama: OllamaConfig,

    #[serde(default)]
    pub surface: SurfaceConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory for per-book artifact folders.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> String {
    "out".into()
}

/// `[capture]` section: page traversal tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSection {
    /// Ladder rounds allowed while stuck before giving up.
    #[serde(default = "default_capture_retries")]
    pub max_retries: u32,

    /// Consecutive captures of the same page that end the run.
    #[serde(default = "default_stagnation_limit")]
    pub stagnation_limit: u32,

    /// Upper bound on waiting for a page turn to render.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Sleep between render checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Pause after a render change before capturing.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Return the reader to where it was before the run.
    #[serde(default = "default_true")]
    pub restore_position: bool,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            max_retries: default_capture_retries(),
            stagnation_limit: default_stagnation_limit(),
            poll_timeout_ms: default_poll_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            settle_ms: default_settle_ms(),
            restore_position: true,
        }
    }
}

fn default_capture_retries() -> u32 {
    15
}
fn default_stagnation_limit() -> u32 {
    2
}
fn default_poll_timeout_ms() -> u64 {
    5_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_settle_ms() -> u64 {
    250
}
fn default_true() -> bool {
    true
}

/// Which transcription backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Hosted OpenAI-compatible vision model.
    #[default]
    #[serde(rename = "openai", alias = "open-ai")]
    OpenAi,
    /// Self-hosted Ollama model server.
    Ollama,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::Ollama => write!(f, "ollama"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = PagescribeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "open-ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(PagescribeError::config(format!(
                "unknown backend '{other}': expected 'openai' or 'ollama'"
            ))),
        }
    }
}

/// `[transcribe]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeSection {
    #[serde(default)]
    pub backend: BackendKind,

    /// Maximum in-flight transcription requests.
    #[serde(default = "default_transcribe_concurrency")]
    pub concurrency: u32,

    /// Attempts per page before it is declared failed.
    #[serde(default = "default_transcribe_retries")]
    pub max_retries: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Attempts after which refusals switch to the escalated instruction.
    #[serde(default = "default_escalate_after")]
    pub escalate_after: u32,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_escalated_temperature")]
    pub escalated_temperature: f32,
}

impl Default for TranscribeSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            concurrency: default_transcribe_concurrency(),
            max_retries: default_transcribe_retries(),
            request_timeout_secs: default_request_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            escalate_after: default_escalate_after(),
            temperature: 0.0,
            escalated_temperature: default_escalated_temperature(),
        }
    }
}

fn default_transcribe_concurrency() -> u32 {
    8
}
fn default_transcribe_retries() -> u32 {
    8
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_escalate_after() -> u32 {
    2
}
fn default_escalated_temperature() -> f32 {
    0.7
}

/// `[openai]` section: hosted OpenAI-compatible vision endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_openai_model() -> String {
    "gpt-4o".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}

/// `[ollama]` section: self-hosted model server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    #[serde(default = "default_ollama_model")]
    pub model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".into()
}
fn default_ollama_model() -> String {
    "llama3.2-vision".into()
}

/// `[surface]` section: the external reader driver process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceConfig {
    #[serde(default = "default_driver_cmd")]
    pub driver_cmd: String,

    #[serde(default = "default_driver_script")]
    pub driver_script: String,

    /// Working directory for the driver; empty means the current directory.
    #[serde(default)]
    pub working_dir: String,

    /// Upper bound on a single driver command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            driver_cmd: default_driver_cmd(),
            driver_script: default_driver_script(),
            working_dir: String::new(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

fn default_driver_cmd() -> String {
    "node".into()
}
fn default_driver_script() -> String {
    "driver/reader.mjs".into()
}
fn default_command_timeout_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime traversal configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub max_retries: u32,
    pub stagnation_limit: u32,
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    pub settle: Duration,
    pub restore_position: bool,
    /// Overwrite existing captures instead of resuming.
    pub force: bool,
}

impl From<&AppConfig> for CaptureConfig {
    fn from(config: &AppConfig) -> Self {
        let c = &config.capture;
        Self {
            max_retries: c.max_retries,
            stagnation_limit: c.stagnation_limit.max(1),
            poll_timeout: Duration::from_millis(c.poll_timeout_ms),
            poll_interval: Duration::from_millis(c.poll_interval_ms.max(1)),
            settle: Duration::from_millis(c.settle_ms),
            restore_position: c.restore_position,
            force: false,
        }
    }
}

/// Runtime transcription configuration.
#[derive(Debug, Clone)]
pub struct TranscribeConfig {
    pub concurrency: usize,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub escalate_after: u32,
    pub temperature: f32,
    pub escalated_temperature: f32,
    /// Re-transcribe pages that already have a transcript.
    pub force: bool,
}

impl From<&AppConfig> for TranscribeConfig {
    fn from(config: &AppConfig) -> Self {
        let t = &config.transcribe;
        Self {
            concurrency: t.concurrency.clamp(1, 16) as usize,
            max_retries: t.max_retries.max(1),
            request_timeout: Duration::from_secs(t.request_timeout_secs),
            backoff_base: Duration::from_millis(t.backoff_base_ms),
            backoff_max: Duration::from_millis(t.backoff_max_ms),
            escalate_after: t.escalate_after,
            temperature: t.temperature,
            escalated_temperature: t.escalated_temperature,
            force: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.pagescribe/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PagescribeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.pagescribe/pagescribe.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PagescribeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        PagescribeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PagescribeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PagescribeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PagescribeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject values that would make a run misbehave.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    for (name, url) in [
        ("openai.base_url", &config.openai.base_url),
        ("ollama.base_url", &config.ollama.base_url),
    ] {
        Url::parse(url)
            .map_err(|e| PagescribeError::config(format!("{name} '{url}' is not a URL: {e}")))?;
    }
    if config.transcribe.max_retries < 8 {
        return Err(PagescribeError::config(format!(
            "transcribe.max_retries must be at least 8 (got {})",
            config.transcribe.max_retries
        )));
    }
    if config.transcribe.backoff_base_ms > config.transcribe.backoff_max_ms {
        return Err(PagescribeError::config(
            "transcribe.backoff_base_ms exceeds transcribe.backoff_max_ms",
        ));
    }
    Ok(())
}

/// Check that the API key env var is set and non-empty; returns the key.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openai.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(PagescribeError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("output_dir"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
        assert!(toml_str.contains("stagnation_limit"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.capture.stagnation_limit, 2);
        assert_eq!(parsed.transcribe.backend, BackendKind::OpenAi);
        assert_eq!(parsed.openai.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[transcribe]
backend = "ollama"
concurrency = 4

[ollama]
model = "qwen2.5vl"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.transcribe.backend, BackendKind::Ollama);
        assert_eq!(config.transcribe.concurrency, 4);
        assert_eq!(config.transcribe.max_retries, 8);
        assert_eq!(config.ollama.model, "qwen2.5vl");
        assert_eq!(config.ollama.base_url, "http://localhost:11434");
    }

    #[test]
    fn backend_names_match_cli_spelling() {
        for name in ["openai", "open-ai"] {
            let config: AppConfig =
                toml::from_str(&format!("[transcribe]\nbackend = \"{name}\"\n")).expect("parse");
            assert_eq!(config.transcribe.backend, BackendKind::OpenAi);
        }
        assert_eq!(BackendKind::OpenAi.to_string(), "openai");
        assert_eq!("openai".parse::<BackendKind>().unwrap(), BackendKind::OpenAi);

        let shown = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        assert!(shown.contains("backend = \"openai\""));
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let app = AppConfig::default();

        let capture = CaptureConfig::from(&app);
        assert_eq!(capture.max_retries, 15);
        assert_eq!(capture.poll_timeout, Duration::from_secs(5));
        assert!(capture.restore_position);
        assert!(!capture.force);

        let transcribe = TranscribeConfig::from(&app);
        assert_eq!(transcribe.concurrency, 8);
        assert_eq!(transcribe.request_timeout, Duration::from_secs(120));
    }

    #[test]
    fn concurrency_is_clamped() {
        let mut app = AppConfig::default();
        app.transcribe.concurrency = 64;
        assert_eq!(TranscribeConfig::from(&app).concurrency, 16);
        app.transcribe.concurrency = 0;
        assert_eq!(TranscribeConfig::from(&app).concurrency, 1);
    }

    #[test]
    fn backend_kind_parsing() {
        assert_eq!("OpenAI".parse::<BackendKind>().unwrap(), BackendKind::OpenAi);
        assert_eq!("ollama".parse::<BackendKind>().unwrap(), BackendKind::Ollama);
        assert!("tesseract".parse::<BackendKind>().is_err());
    }

    #[test]
    fn validation_rejects_low_retry_budget() {
        let mut config = AppConfig::default();
        config.transcribe.max_retries = 3;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("at least 8"));
    }

    #[test]
    fn validation_rejects_bad_url() {
        let mut config = AppConfig::default();
        config.ollama.base_url = "not a url".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openai.api_key_env = "PAGESCRIBE_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
