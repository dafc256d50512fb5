//! Stage pipeline: capture → transcribe → assemble.
//!
//! Each stage reads what the previous one left in the [`BookStore`], so the
//! stages can be run separately and resumed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use pagescribe_reader::{CaptureObserver, DoneReason, ReadingSurface, Traverser};
use pagescribe_shared::{
    CaptureConfig, PageCapture, PagescribeError, Result, TranscribeConfig, TranscriptChunk,
};
use pagescribe_store::BookStore;
use pagescribe_transcribe::{CancelFlag, Orchestrator, TranscribeObserver, TranscriptionBackend};

use crate::assembler::{self, AssembleConfig};
use crate::stitcher::stitch;

/// Result of the capture stage.
#[derive(Debug, Clone)]
pub struct CaptureSummary {
    pub book_id: String,
    pub reason: DoneReason,
    /// Captures stored for the book, including earlier runs.
    pub captures: usize,
    pub new_captures: usize,
    pub resumed_from: Option<u32>,
    pub last_content_page: u32,
    pub elapsed: Duration,
}

/// Result of the transcription stage.
#[derive(Debug, Clone)]
pub struct TranscribeSummary {
    pub book_id: String,
    pub chunks: usize,
    pub cached: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Result of the assembly stage.
#[derive(Debug, Clone)]
pub struct AssembleSummary {
    pub book_md: PathBuf,
    pub chapters_json: PathBuf,
    pub chapters: usize,
    pub dropped: usize,
    pub elapsed: Duration,
}

/// Completion report handed to [`ProgressReporter::done`].
#[derive(Debug, Clone)]
pub enum StageReport {
    Captured(CaptureSummary),
    Transcribed(TranscribeSummary),
    Assembled(AssembleSummary),
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after every stored capture.
    fn page_captured(&self, page: u32, last_content_page: u32, captures: usize);
    /// Called as transcripts complete (including cached ones).
    fn page_transcribed(&self, page: u32, done: usize, total: usize);
    /// Called when a stage completes successfully.
    fn done(&self, report: &StageReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn page_captured(&self, _page: u32, _last_content_page: u32, _captures: usize) {}
    fn page_transcribed(&self, _page: u32, _done: usize, _total: usize) {}
    fn done(&self, _report: &StageReport) {}
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Walk the reader and store one image per page.
#[instrument(skip_all, fields(book_id = %store.book_id()))]
pub async fn capture_book(
    surface: &mut dyn ReadingSurface,
    store: &BookStore,
    config: CaptureConfig,
    progress: &dyn ProgressReporter,
) -> Result<CaptureSummary> {
    let start = Instant::now();
    progress.phase("Capturing pages");

    let observer = ProgressAdapter { inner: progress };
    let outcome = Traverser::new(surface, store, config)
        .with_observer(&observer)
        .run()
        .await?;

    let summary = CaptureSummary {
        book_id: store.book_id().to_string(),
        reason: outcome.reason,
        captures: outcome.captures.len(),
        new_captures: outcome.new_captures,
        resumed_from: outcome.resumed_from,
        last_content_page: outcome.boundaries.total_content_pages,
        elapsed: start.elapsed(),
    };
    progress.done(&StageReport::Captured(summary.clone()));
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Transcribe
// ---------------------------------------------------------------------------

/// Transcribe every stored capture and write `content.json`.
///
/// Surviving chunks are written even when some pages fail; the first
/// per-page failure is then returned so the run exits non-zero.
#[instrument(skip_all, fields(book_id = %store.book_id(), backend = backend.name()))]
pub async fn transcribe_book(
    store: &BookStore,
    backend: Arc<dyn TranscriptionBackend>,
    config: TranscribeConfig,
    cancel: CancelFlag,
    progress: &dyn ProgressReporter,
) -> Result<TranscribeSummary> {
    let start = Instant::now();
    let metadata = store.require_metadata()?;
    if metadata.pages.is_empty() {
        return Err(PagescribeError::validation(
            "no captured pages to transcribe; run the capture stage first",
        ));
    }

    progress.phase("Transcribing pages");
    let observer = ProgressAdapter { inner: progress };
    let report = Orchestrator::new(backend, store.clone(), config)
        .with_cancel_flag(cancel)
        .run(&metadata.pages, &metadata.toc, &observer)
        .await?;

    store.save_content(&report.chunks)?;
    info!(chunks = report.chunks.len(), "wrote content.json");

    if report.cancelled {
        warn!(chunks = report.chunks.len(), "transcription cancelled");
        return Err(PagescribeError::Cancelled);
    }
    if let Some(first) = report.failures.into_iter().next() {
        error!(error = %first, "transcription incomplete");
        return Err(first);
    }

    let summary = TranscribeSummary {
        book_id: store.book_id().to_string(),
        chunks: report.chunks.len(),
        cached: report.cached,
        failed: 0,
        elapsed: start.elapsed(),
    };
    progress.done(&StageReport::Transcribed(summary.clone()));
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Assemble
// ---------------------------------------------------------------------------

/// Stitch `content.json` onto the TOC and write `book.md` / `chapters.json`.
#[instrument(skip_all, fields(book_id = %store.book_id()))]
pub fn assemble_book(
    store: &BookStore,
    config: &AssembleConfig,
    progress: &dyn ProgressReporter,
) -> Result<AssembleSummary> {
    let start = Instant::now();
    progress.phase("Assembling chapters");

    let metadata = store.require_metadata()?;
    let chunks = store.load_content()?;
    let book = stitch(&chunks, &metadata.toc);
    if book.last_content_chapter.is_none() {
        warn!("no chapter received any text");
    }
    let result = assembler::assemble(store, &metadata, &book, config)?;

    let summary = AssembleSummary {
        book_md: result.book_md,
        chapters_json: result.chapters_json,
        chapters: result.rendered,
        dropped: result.dropped,
        elapsed: start.elapsed(),
    };
    progress.done(&StageReport::Assembled(summary.clone()));
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Observer adapter
// ---------------------------------------------------------------------------

/// Adapts a `ProgressReporter` to the capture and transcription observers.
struct ProgressAdapter<'a> {
    inner: &'a dyn ProgressReporter,
}

impl CaptureObserver for ProgressAdapter<'_> {
    fn page_captured(&self, capture: &PageCapture, last_content_page: u32) {
        self.inner
            .page_captured(capture.page, last_content_page, capture.index + 1);
    }
}

impl TranscribeObserver for ProgressAdapter<'_> {
    fn page_transcribed(&self, chunk: &TranscriptChunk, done: usize, total: usize) {
        self.inner.page_transcribed(chunk.page, done, total);
    }
}
