//! Reading surface backed by an external browser-automation driver.
//!
//! The driver is a subprocess speaking JSON lines over stdin/stdout: it
//! announces `{"type":"ready"}` once the reader is open, then answers one
//! `command` request per line with a `result` or `error` message. Images are
//! returned base64-encoded. A `shutdown` message asks it to close the session.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use pagescribe_shared::{BookInfo, PagescribeError, Result, SurfaceConfig, TocEntry};

use crate::surface::ReadingSurface;

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Reader commands understood by the driver.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "name", rename_all = "snake_case")]
enum SurfaceCommand {
    BookInfo,
    OpenToc,
    ListToc,
    SelectToc { position: usize },
    FooterText,
    CaptureImage,
    RenderIdentity,
    AdvancePage,
    PressPagingKey,
    ClickForwardZone,
    JumpToPage { page: u32 },
    HasForwardControl,
}

/// Request message sent to the driver.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage {
    Command { id: String, command: SurfaceCommand },
    Shutdown,
}

/// Response message received from the driver.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready,
    Result {
        id: String,
        #[serde(default)]
        value: serde_json::Value,
    },
    Error {
        id: String,
        error: String,
    },
}

// ---------------------------------------------------------------------------
// BridgeSurface
// ---------------------------------------------------------------------------

/// Handle to the spawned driver subprocess.
pub struct BridgeSurface {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    request_counter: u64,
    timeout: Duration,
}

impl BridgeSurface {
    /// Spawn the driver for `book_id` and wait for its ready message.
    pub async fn spawn(config: &SurfaceConfig, book_id: &str) -> Result<Self> {
        info!(cmd = %config.driver_cmd, script = %config.driver_script, "spawning reader driver");

        let mut command = Command::new(&config.driver_cmd);
        if !config.driver_script.is_empty() {
            command.arg(&config.driver_script);
        }
        command.arg("--book").arg(book_id);
        if !config.working_dir.is_empty() {
            command.current_dir(&config.working_dir);
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PagescribeError::Surface(format!(
                    "failed to spawn reader driver: {e}. Is `{}` installed?",
                    config.driver_cmd
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PagescribeError::Surface("failed to capture driver stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PagescribeError::Surface("failed to capture driver stdout".into()))?;

        let mut surface = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
            timeout: Duration::from_secs(config.command_timeout_secs.max(1)),
        };
        surface.wait_for_ready().await?;
        Ok(surface)
    }

    async fn wait_for_ready(&mut self) -> Result<()> {
        let line = self.read_line().await?;
        match parse_response(&line)? {
            ResponseMessage::Ready => {
                info!("reader driver is ready");
                Ok(())
            }
            _ => Err(PagescribeError::Surface(format!(
                "expected ready message, got: {}",
                preview(&line)
            ))),
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = tokio::time::timeout(self.timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| {
                PagescribeError::Surface(format!("driver did not answer within {:?}", self.timeout))
            })?
            .map_err(|e| PagescribeError::Surface(format!("driver read error: {e}")))?;
        if read == 0 {
            return Err(PagescribeError::Surface(
                "driver closed stdout unexpectedly".into(),
            ));
        }
        Ok(line)
    }

    async fn write_message(&mut self, message: &RequestMessage) -> Result<()> {
        let json = serde_json::to_string(message).map_err(|e| {
            PagescribeError::Surface(format!("failed to serialize request: {e}"))
        })?;
        self.stdin
            .write_all(format!("{json}\n").as_bytes())
            .await
            .map_err(|e| PagescribeError::Surface(format!("failed to write to driver: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| PagescribeError::Surface(format!("failed to flush driver stdin: {e}")))
    }

    /// Send one command and decode its result value.
    async fn call<T: DeserializeOwned>(&mut self, command: SurfaceCommand) -> Result<T> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);
        debug!(%id, ?command, "driver command");

        self.write_message(&RequestMessage::Command {
            id: id.clone(),
            command,
        })
        .await?;

        let line = self.read_line().await?;
        match parse_response(&line)? {
            ResponseMessage::Result { id: resp_id, value } if resp_id == id => {
                serde_json::from_value(value).map_err(|e| {
                    PagescribeError::Surface(format!("unexpected result for {id}: {e}"))
                })
            }
            ResponseMessage::Error { id: resp_id, error } if resp_id == id => {
                Err(PagescribeError::Surface(error))
            }
            ResponseMessage::Ready => Err(PagescribeError::Surface(
                "unexpected ready message".into(),
            )),
            _ => Err(PagescribeError::Surface(format!(
                "response out of order (expected {id}): {}",
                preview(&line)
            ))),
        }
    }

    /// Ask the driver to close the session and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Err(e) = self.write_message(&RequestMessage::Shutdown).await {
            warn!(error = %e, "failed to send shutdown to driver");
        }
        match tokio::time::timeout(self.timeout, self.child.wait()).await {
            Ok(Ok(status)) => info!(?status, "reader driver exited"),
            Ok(Err(e)) => warn!("driver wait error: {e}"),
            Err(_) => {
                warn!("driver did not exit in time, killing it");
                let _ = self.child.kill().await;
            }
        }
        Ok(())
    }
}

fn parse_response(line: &str) -> Result<ResponseMessage> {
    serde_json::from_str(line.trim()).map_err(|e| {
        PagescribeError::Surface(format!("invalid driver message: {e} (got: {})", preview(line)))
    })
}

fn preview(line: &str) -> &str {
    let line = line.trim();
    match line.char_indices().nth(200) {
        Some((i, _)) => &line[..i],
        None => line,
    }
}

#[async_trait]
impl ReadingSurface for BridgeSurface {
    async fn book_info(&mut self) -> Result<BookInfo> {
        self.call(SurfaceCommand::BookInfo).await
    }

    async fn open_table_of_contents(&mut self) -> Result<()> {
        self.call::<serde_json::Value>(SurfaceCommand::OpenToc)
            .await
            .map(|_| ())
    }

    async fn list_toc_entries(&mut self) -> Result<Vec<TocEntry>> {
        self.call(SurfaceCommand::ListToc).await
    }

    async fn select_toc_entry(&mut self, position: usize) -> Result<()> {
        self.call::<serde_json::Value>(SurfaceCommand::SelectToc { position })
            .await
            .map(|_| ())
    }

    async fn footer_text(&mut self) -> Result<Option<String>> {
        self.call(SurfaceCommand::FooterText).await
    }

    async fn capture_page_image(&mut self) -> Result<Vec<u8>> {
        let encoded: String = self.call(SurfaceCommand::CaptureImage).await?;
        BASE64
            .decode(encoded.trim())
            .map_err(|e| PagescribeError::Surface(format!("invalid image encoding: {e}")))
    }

    async fn render_identity(&mut self) -> Result<String> {
        self.call(SurfaceCommand::RenderIdentity).await
    }

    async fn advance_page(&mut self) -> Result<bool> {
        self.call(SurfaceCommand::AdvancePage).await
    }

    async fn press_paging_key(&mut self) -> Result<bool> {
        self.call(SurfaceCommand::PressPagingKey).await
    }

    async fn click_forward_zone(&mut self) -> Result<bool> {
        self.call(SurfaceCommand::ClickForwardZone).await
    }

    async fn jump_to_page(&mut self, page: u32) -> Result<bool> {
        self.call(SurfaceCommand::JumpToPage { page }).await
    }

    async fn has_forward_control(&mut self) -> Result<bool> {
        self.call(SurfaceCommand::HasForwardControl).await
    }
}
