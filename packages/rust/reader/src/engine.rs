//! Page traversal engine.
//!
//! Walks a [`ReadingSurface`] from the first content page to the end of the
//! main content, capturing every page as it goes. Each capture is persisted
//! immediately, so a crash loses at most the page in flight and a later run
//! resumes after the last stored capture.
//!
//! The state machine:
//!
//! ```text
//! Idle ──► AtPage(first) ──► Advancing ──► AtPage(n')  (render changed)
//!              ▲                 │
//!              └── unchanged ────┤
//!                                └──► Stuck ──► Failed (after max_retries rounds)
//! AtPage(n) ──► Done(reason)
//! ```

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use pagescribe_shared::{
    BookInfo, BookMetadata, CaptureConfig, LocationSample, PageCapture, PagescribeError, Result,
    TocEntry,
};
use pagescribe_store::BookStore;

use crate::advance::AdvanceLadder;
use crate::surface::ReadingSurface;
use crate::toc::{TocBoundaries, analyze_toc, collect_toc, poll_footer, read_sample};

const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Why a traversal stopped without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// Reached the last content page before the back matter.
    ContentEnd,
    /// The same page kept being captured.
    Stagnated,
    /// Hit the hard iteration cap.
    IterationCap,
    /// No forward control and no readable footer.
    EndOfBook,
}

impl DoneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContentEnd => "content-end",
            Self::Stagnated => "stagnated",
            Self::IterationCap => "iteration-cap",
            Self::EndOfBook => "end-of-book",
        }
    }
}

impl std::fmt::Display for DoneReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraversalPhase {
    #[default]
    Idle,
    AtPage(u32),
    Advancing(u32),
    Stuck(u32),
    Done(DoneReason),
    Failed,
}

/// Mutable loop state, reset at the start of every run.
#[derive(Debug, Clone, Default)]
pub struct TraversalState {
    pub last_captured_page: Option<u32>,
    /// Consecutive captures that repeated the previous page.
    pub stagnant_count: u32,
    /// Captures taken during this run.
    pub iteration_count: u32,
    /// Consecutive ladder rounds in which no strategy could be issued.
    pub stuck_rounds: u32,
    /// Captures stored for the book, including resumed ones.
    pub captures: usize,
    pub phase: TraversalPhase,
}

/// Result of a completed traversal.
#[derive(Debug, Clone)]
pub struct TraversalOutcome {
    pub reason: DoneReason,
    pub boundaries: TocBoundaries,
    /// Every capture stored for the book, in index order.
    pub captures: Vec<PageCapture>,
    pub new_captures: usize,
    /// Last page of a previous run this one continued from.
    pub resumed_from: Option<u32>,
}

/// Notified after every stored capture.
pub trait CaptureObserver: Send + Sync {
    fn page_captured(&self, capture: &PageCapture, last_content_page: u32);
}

/// No-op observer.
pub struct SilentObserver;

impl CaptureObserver for SilentObserver {
    fn page_captured(&self, _capture: &PageCapture, _last_content_page: u32) {}
}

/// What one advance attempt observed.
enum Step {
    Moved(Option<LocationSample>),
    Unchanged,
    Unavailable,
    EndOfBook,
}

// ---------------------------------------------------------------------------
// Traverser
// ---------------------------------------------------------------------------

/// Drives one capture run over a reading surface.
pub struct Traverser<'a> {
    surface: &'a mut dyn ReadingSurface,
    store: &'a BookStore,
    config: CaptureConfig,
    observer: &'a dyn CaptureObserver,
    state: TraversalState,
}

impl<'a> Traverser<'a> {
    pub fn new(surface: &'a mut dyn ReadingSurface, store: &'a BookStore, config: CaptureConfig) -> Self {
        Self {
            surface,
            store,
            config,
            observer: &SilentObserver,
            state: TraversalState::default(),
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn CaptureObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> &TraversalState {
        &self.state
    }

    /// Run the traversal to completion.
    ///
    /// The reader is returned to its starting position afterwards (success
    /// or failure) unless `restore_position` is off.
    #[instrument(skip_all, fields(book_id = %self.store.book_id()))]
    pub async fn run(&mut self) -> Result<TraversalOutcome> {
        self.state = TraversalState::default();
        let origin = read_sample(&mut *self.surface).await?;
        debug!(?origin, "recorded starting position");

        let result = match self.traverse().await {
            Ok(outcome) => {
                self.state.phase = TraversalPhase::Done(outcome.reason);
                info!(
                    reason = %outcome.reason,
                    captures = outcome.captures.len(),
                    new = outcome.new_captures,
                    "traversal done"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.state.phase = TraversalPhase::Failed;
                let e = self.diagnose(e);
                error!(error = %e, "traversal failed");
                Err(e)
            }
        };

        if self.config.restore_position {
            self.restore(origin).await;
        } else {
            debug!("position restore disabled");
        }
        result
    }

    async fn traverse(&mut self) -> Result<TraversalOutcome> {
        let info = self.surface.book_info().await?;
        let toc = collect_toc(&mut *self.surface, &self.config).await?;
        let boundaries = analyze_toc(&toc)?;
        info!(
            first = boundaries.first_content_position,
            last = boundaries.total_content_pages,
            total = boundaries.total,
            location_mode = boundaries.location_mode,
            "content boundaries"
        );

        let mut metadata = self.prepare_metadata(info, &toc, &boundaries)?;
        let resumed_from = metadata.pages.last().map(|c| c.page);
        let existing = metadata.pages.len();
        self.state.captures = existing;
        self.state.last_captured_page = resumed_from;

        let ladder = AdvanceLadder::new(boundaries.location_mode);
        let mut n = self.open_first_content(&boundaries).await?;

        if let Some(last) = resumed_from {
            if last >= boundaries.total_content_pages {
                info!(last, "capture already complete");
                return self.finish(metadata, boundaries, DoneReason::ContentEnd, existing, resumed_from);
            }
            info!(from = last + 1, captures = existing, "resuming capture");
            n = self.seek(&ladder, n, last + 1, &boundaries).await?;
        }

        let iteration_cap = boundaries.total_content_pages.saturating_mul(2).max(1);
        let reason = loop {
            self.state.phase = TraversalPhase::AtPage(n);
            self.capture(&mut metadata, n, boundaries.total_content_pages).await?;

            if n >= boundaries.total_content_pages {
                break DoneReason::ContentEnd;
            }
            if self.state.stagnant_count >= self.config.stagnation_limit {
                warn!(page = n, repeats = self.state.stagnant_count, "page is not advancing");
                break DoneReason::Stagnated;
            }
            if self.state.iteration_count >= iteration_cap {
                warn!(cap = iteration_cap, "iteration cap reached");
                break DoneReason::IterationCap;
            }

            self.state.phase = TraversalPhase::Advancing(n);
            match self.advance(&ladder, n).await? {
                Step::Moved(Some(sample)) => n = sample.position().unwrap_or(n + 1),
                Step::Moved(None) => {
                    if self.surface.has_forward_control().await? {
                        n += 1;
                    } else {
                        self.final_capture(&mut metadata, &boundaries).await;
                        break DoneReason::EndOfBook;
                    }
                }
                Step::Unchanged => debug!(page = n, "page did not turn, capturing again"),
                Step::EndOfBook | Step::Unavailable => {
                    self.final_capture(&mut metadata, &boundaries).await;
                    break DoneReason::EndOfBook;
                }
            }
        };

        let new_captures = metadata.pages.len() - existing;
        self.finish(metadata, boundaries, reason, new_captures, resumed_from)
    }

    fn finish(
        &mut self,
        mut metadata: BookMetadata,
        boundaries: TocBoundaries,
        reason: DoneReason,
        new_captures: usize,
        resumed_from: Option<u32>,
    ) -> Result<TraversalOutcome> {
        metadata.meta.done_reason = Some(reason.as_str().to_string());
        self.store.save_metadata(&metadata)?;
        Ok(TraversalOutcome {
            reason,
            boundaries,
            captures: metadata.pages,
            new_captures,
            resumed_from,
        })
    }

    /// Load or create `metadata.json` and record the TOC analysis in it.
    fn prepare_metadata(
        &self,
        info: BookInfo,
        toc: &[TocEntry],
        boundaries: &TocBoundaries,
    ) -> Result<BookMetadata> {
        let mut metadata = match self.store.load_metadata()? {
            Some(existing) if !self.config.force => existing,
            _ => BookMetadata::new(BookInfo::default(), TOOL_VERSION),
        };

        metadata.info = BookInfo {
            book_id: self.store.book_id().to_string(),
            ..info
        };
        metadata.toc = toc.to_vec();
        let meta = &mut metadata.meta;
        meta.total = boundaries.total;
        meta.first_content_page = Some(boundaries.first_content_position);
        meta.post_content_page = boundaries.post_content_position;
        meta.post_content_label = boundaries.first_post_content.map(|i| toc[i].label.clone());
        meta.done_reason = None;

        self.store.save_metadata(&metadata)?;
        Ok(metadata)
    }

    /// Idle → AtPage(first): select the first content entry in the TOC.
    async fn open_first_content(&mut self, boundaries: &TocBoundaries) -> Result<u32> {
        self.surface.open_table_of_contents().await?;
        let current = read_sample(&mut *self.surface)
            .await?
            .and_then(|s| s.position());
        let before = self.surface.render_identity().await?;
        self.surface.select_toc_entry(boundaries.first_content).await?;
        self.wait_for_change(&before, current).await?;

        let n = poll_footer(&mut *self.surface, &self.config)
            .await?
            .and_then(|s| s.position())
            .unwrap_or(boundaries.first_content_position);
        debug!(page = n, "at first content page");
        Ok(n)
    }

    /// Move forward to `target` without capturing (resume).
    async fn seek(
        &mut self,
        ladder: &AdvanceLadder,
        mut n: u32,
        target: u32,
        boundaries: &TocBoundaries,
    ) -> Result<u32> {
        if n >= target {
            return Ok(n);
        }

        if !boundaries.location_mode {
            let before = self.surface.render_identity().await?;
            if self.surface.jump_to_page(target).await? {
                if let Some(Some(p)) = self
                    .wait_for_change(&before, Some(n))
                    .await?
                    .map(|s| s.and_then(|s| s.position()))
                {
                    n = p;
                }
            }
            if n >= target {
                return Ok(n);
            }
        }

        let limit = boundaries.total_content_pages.saturating_mul(2).max(1);
        let mut steps = 0;
        while n < target {
            steps += 1;
            if steps > limit {
                return Err(self.navigation_error(format!(
                    "could not reach resume position {target} (stopped at {n})"
                )));
            }
            match self.advance(ladder, n).await? {
                Step::Moved(sample) => n = sample.and_then(|s| s.position()).unwrap_or(n + 1),
                Step::Unchanged => {}
                Step::EndOfBook | Step::Unavailable => {
                    return Err(self.navigation_error(format!(
                        "reached the end of the book before resume position {target}"
                    )));
                }
            }
        }
        Ok(n)
    }

    /// AtPage(n): capture, persist, update stagnation bookkeeping.
    async fn capture(&mut self, metadata: &mut BookMetadata, n: u32, last_content_page: u32) -> Result<()> {
        let bytes = self.surface.capture_page_image().await?;
        let index = metadata.pages.len();
        // An image no capture references is left over from a run that died
        // before saving metadata; it is safe to replace.
        let key = BookStore::image_key(index, n);
        let referenced = metadata.pages.iter().any(|c| c.image == key);
        if !referenced && self.store.path_of(&key).exists() {
            warn!(image = %key, "replacing image left by an interrupted capture");
        }
        let (image, image_hash) = self
            .store
            .write_page_image(index, n, &bytes, self.config.force || !referenced)?;

        let capture = PageCapture {
            index,
            page: n,
            image,
            image_hash,
            captured_at: Utc::now(),
        };
        metadata.pages.push(capture.clone());
        self.store.save_metadata(metadata)?;

        let state = &mut self.state;
        if state.last_captured_page == Some(n) {
            state.stagnant_count += 1;
        } else {
            state.stagnant_count = 0;
        }
        state.last_captured_page = Some(n);
        state.iteration_count += 1;
        state.captures = metadata.pages.len();

        debug!(index, page = n, "captured page");
        self.observer.page_captured(&capture, last_content_page);
        Ok(())
    }

    /// One best-effort capture after the end-of-book heuristic fired.
    async fn final_capture(&mut self, metadata: &mut BookMetadata, boundaries: &TocBoundaries) {
        let Some(last) = self.state.last_captured_page else {
            return;
        };
        if last == boundaries.total_content_pages {
            return;
        }
        let label = last.saturating_add(1).min(boundaries.total);
        match self.capture(metadata, label, boundaries.total_content_pages).await {
            Ok(()) => info!(page = label, "took final capture"),
            Err(e) => warn!(page = label, error = %e, "final capture failed"),
        }
    }

    /// Advancing: run ladder rounds until the page turns, stays put, or the
    /// stuck budget runs out.
    async fn advance(&mut self, ladder: &AdvanceLadder, n: u32) -> Result<Step> {
        loop {
            match self.ladder_round(ladder, n).await? {
                Step::Unavailable => {
                    if self.at_end_of_book().await? {
                        return Ok(Step::EndOfBook);
                    }
                    self.state.stuck_rounds += 1;
                    self.state.phase = TraversalPhase::Stuck(n);
                    if self.state.stuck_rounds >= self.config.max_retries.max(1) {
                        return Err(self.navigation_error(format!(
                            "no advance strategy could be issued in {} rounds ({})",
                            self.state.stuck_rounds,
                            ladder.names().join(", ")
                        )));
                    }
                    warn!(page = n, round = self.state.stuck_rounds, "stuck, retrying advance");
                    tokio::time::sleep(self.config.poll_interval * self.state.stuck_rounds).await;
                }
                step => {
                    self.state.stuck_rounds = 0;
                    return Ok(step);
                }
            }
        }
    }

    /// Try each strategy once, stopping at the first observed page turn.
    async fn ladder_round(&mut self, ladder: &AdvanceLadder, n: u32) -> Result<Step> {
        let before = self.surface.render_identity().await?;
        let mut issued = false;

        for strategy in ladder.iter() {
            if !strategy.issue(&mut *self.surface, n).await? {
                debug!(strategy = strategy.name(), "strategy unavailable");
                continue;
            }
            issued = true;
            if let Some(sample) = self.wait_for_change(&before, Some(n)).await? {
                debug!(strategy = strategy.name(), ?sample, "page turned");
                return Ok(Step::Moved(sample));
            }
            debug!(strategy = strategy.name(), "no render change");
        }

        Ok(if issued { Step::Unchanged } else { Step::Unavailable })
    }

    /// Poll until the render identity or reported position changes.
    ///
    /// Returns `None` on timeout, otherwise the footer sample after settling
    /// (which is itself `None` when the footer is unreadable).
    async fn wait_for_change(
        &mut self,
        before: &str,
        current: Option<u32>,
    ) -> Result<Option<Option<LocationSample>>> {
        let deadline = Instant::now() + self.config.poll_timeout;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let identity = self.surface.render_identity().await?;
            let sample = read_sample(&mut *self.surface).await?;
            let moved = sample
                .and_then(|s| s.position())
                .is_some_and(|p| Some(p) != current);

            if identity != before || moved {
                tokio::time::sleep(self.config.settle).await;
                let settled = read_sample(&mut *self.surface).await?.or(sample);
                return Ok(Some(settled));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn at_end_of_book(&mut self) -> Result<bool> {
        Ok(!self.surface.has_forward_control().await?
            && read_sample(&mut *self.surface).await?.is_none())
    }

    async fn restore(&mut self, origin: Option<LocationSample>) {
        let Some(sample) = origin else {
            debug!("no starting position to restore");
            return;
        };
        let Some(page) = sample.page else {
            debug!("starting position is a location, not restoring");
            return;
        };
        match self.surface.jump_to_page(page).await {
            Ok(true) => info!(page, "restored reading position"),
            Ok(false) => warn!(page, "could not restore reading position"),
            Err(e) => warn!(page, error = %e, "failed to restore reading position"),
        }
    }

    fn navigation_error(&self, message: String) -> PagescribeError {
        PagescribeError::Navigation {
            message,
            last_page: self.state.last_captured_page,
            captures: self.state.captures,
        }
    }

    /// Attach the last known position to unrecoverable surface errors.
    fn diagnose(&self, err: PagescribeError) -> PagescribeError {
        match err {
            PagescribeError::Surface(message) => self.navigation_error(message),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;

    /// Deterministic reader: pages `1..=pages`, then an end screen with no
    /// footer and no forward control.
    struct MockSurface {
        pages: u32,
        total: u32,
        current: u32,
        toc: Vec<(String, u32)>,
        hide_toc_positions: bool,
        frozen: bool,
        dead_controls: bool,
        fail_capture_at: Option<u32>,
        /// Report `Location N of M` instead of page numbers.
        location_mode: bool,
        /// Controls ignore this many advance attempts at `stall_at`.
        stall_at: Option<u32>,
        stall_rounds: u32,
        jumps: Vec<u32>,
    }

    impl MockSurface {
        fn new(pages: u32) -> Self {
            Self {
                pages,
                total: pages,
                current: 1,
                toc: vec![("Chapter 1".into(), 1)],
                hide_toc_positions: false,
                frozen: false,
                dead_controls: false,
                fail_capture_at: None,
                location_mode: false,
                stall_at: None,
                stall_rounds: 0,
                jumps: Vec::new(),
            }
        }

        fn on_page(&self, page: u32) -> bool {
            (1..=self.pages).contains(&page)
        }
    }

    #[async_trait]
    impl ReadingSurface for MockSurface {
        async fn book_info(&mut self) -> Result<BookInfo> {
            Ok(BookInfo {
                title: Some("Mock Book".into()),
                ..Default::default()
            })
        }

        async fn open_table_of_contents(&mut self) -> Result<()> {
            Ok(())
        }

        async fn list_toc_entries(&mut self) -> Result<Vec<TocEntry>> {
            Ok(self
                .toc
                .iter()
                .map(|(label, page)| {
                    let sample = (!self.hide_toc_positions).then(|| {
                        if self.location_mode {
                            LocationSample::location(*page, self.total)
                        } else {
                            LocationSample::page(*page, self.total)
                        }
                    });
                    TocEntry::new(label.clone(), sample, 0)
                })
                .collect())
        }

        async fn select_toc_entry(&mut self, position: usize) -> Result<()> {
            self.current = self.toc[position].1;
            Ok(())
        }

        async fn footer_text(&mut self) -> Result<Option<String>> {
            let unit = if self.location_mode { "Location" } else { "Page" };
            Ok(self
                .on_page(self.current)
                .then(|| format!("{unit} {} of {}", self.current, self.total)))
        }

        async fn capture_page_image(&mut self) -> Result<Vec<u8>> {
            if self.fail_capture_at == Some(self.current) {
                return Err(PagescribeError::Surface("renderer crashed".into()));
            }
            Ok(format!("png-{}", self.current).into_bytes())
        }

        async fn render_identity(&mut self) -> Result<String> {
            Ok(format!("render-{}", self.current))
        }

        async fn advance_page(&mut self) -> Result<bool> {
            if self.dead_controls || self.current > self.pages {
                return Ok(false);
            }
            if self.stall_at == Some(self.current) && self.stall_rounds > 0 {
                self.stall_rounds -= 1;
                return Ok(false);
            }
            if !self.frozen {
                self.current += 1;
            }
            Ok(true)
        }

        async fn jump_to_page(&mut self, page: u32) -> Result<bool> {
            if self.dead_controls || !self.on_page(page) {
                return Ok(false);
            }
            self.jumps.push(page);
            if !self.frozen {
                self.current = page;
            }
            Ok(true)
        }

        async fn has_forward_control(&mut self) -> Result<bool> {
            Ok(self.current <= self.pages)
        }
    }

    fn fast_config() -> CaptureConfig {
        CaptureConfig {
            max_retries: 3,
            stagnation_limit: 2,
            poll_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
            settle: Duration::ZERO,
            restore_position: true,
            force: false,
        }
    }

    fn scratch_store(tag: &str) -> (PathBuf, BookStore) {
        let dir = std::env::temp_dir().join(format!("pagescribe-engine-{tag}-{}", Uuid::now_v7()));
        let store = BookStore::open(&dir, "B00MOCK").expect("open store");
        (dir, store)
    }

    fn assert_sequential(captures: &[PageCapture]) {
        for (i, capture) in captures.iter().enumerate() {
            assert_eq!(capture.index, i);
        }
    }

    #[tokio::test]
    async fn captures_every_page_until_content_end() {
        let (dir, store) = scratch_store("content-end");
        let mut surface = MockSurface::new(10);

        let outcome = Traverser::new(&mut surface, &store, fast_config())
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.reason, DoneReason::ContentEnd);
        assert_eq!(outcome.captures.len(), 10);
        assert_sequential(&outcome.captures);
        let pages: Vec<u32> = outcome.captures.iter().map(|c| c.page).collect();
        assert_eq!(pages, (1..=10).collect::<Vec<_>>());

        let metadata = store.require_metadata().unwrap();
        assert_eq!(metadata.pages.len(), 10);
        assert_eq!(metadata.info.book_id, "B00MOCK");
        assert_eq!(metadata.meta.done_reason.as_deref(), Some("content-end"));
        assert_eq!(store.read_page_image(&metadata.pages[3].image).unwrap(), b"png-4");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn end_of_book_takes_one_final_capture() {
        let (dir, store) = scratch_store("end-of-book");
        // Footer claims 12 pages but the forward control disappears after 10.
        let mut surface = MockSurface::new(10);
        surface.total = 12;

        let outcome = Traverser::new(&mut surface, &store, fast_config())
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.reason, DoneReason::EndOfBook);
        assert_eq!(outcome.captures.len(), 11);
        assert_sequential(&outcome.captures);
        assert_eq!(outcome.captures.last().unwrap().page, 11);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn frozen_render_stagnates_instead_of_looping() {
        let (dir, store) = scratch_store("stagnation");
        let mut surface = MockSurface::new(10);
        surface.frozen = true;

        let mut traverser = Traverser::new(&mut surface, &store, fast_config());
        let outcome = traverser.run().await.unwrap();

        assert_eq!(outcome.reason, DoneReason::Stagnated);
        // One capture plus `stagnation_limit` repeats.
        assert_eq!(outcome.captures.len(), 3);
        assert!(outcome.captures.iter().all(|c| c.page == 1));
        assert_eq!(
            traverser.state().phase,
            TraversalPhase::Done(DoneReason::Stagnated)
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dead_controls_fail_with_diagnostics() {
        let (dir, store) = scratch_store("stuck");
        let mut surface = MockSurface::new(10);
        surface.dead_controls = true;

        let mut traverser = Traverser::new(&mut surface, &store, fast_config());
        let err = traverser.run().await.unwrap_err();

        match err {
            PagescribeError::Navigation {
                last_page, captures, ..
            } => {
                assert_eq!(last_page, Some(1));
                assert_eq!(captures, 1);
            }
            other => panic!("expected navigation error, got {other}"),
        }
        assert_eq!(traverser.state().phase, TraversalPhase::Failed);
        assert_eq!(traverser.state().stuck_rounds, 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn surface_errors_carry_last_known_page() {
        let (dir, store) = scratch_store("surface-error");
        let mut surface = MockSurface::new(10);
        surface.fail_capture_at = Some(5);

        let err = Traverser::new(&mut surface, &store, fast_config())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PagescribeError::Navigation {
                last_page: Some(4),
                captures: 4,
                ..
            }
        ));
        // Completed pages stay persisted.
        assert_eq!(store.require_metadata().unwrap().pages.len(), 4);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn resumes_after_last_stored_capture() {
        let (dir, store) = scratch_store("resume");
        stored_captures(&store, 1..=4);

        let mut surface = MockSurface::new(10);
        let outcome = Traverser::new(&mut surface, &store, fast_config())
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.resumed_from, Some(4));
        assert_eq!(outcome.new_captures, 6);
        assert_eq!(outcome.captures.len(), 10);
        assert_sequential(&outcome.captures);
        assert_eq!(outcome.captures[4].page, 5);
        assert_eq!(surface.jumps.first(), Some(&5));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn restores_starting_position() {
        let (dir, store) = scratch_store("restore");
        let mut surface = MockSurface::new(10);
        surface.current = 7;

        Traverser::new(&mut surface, &store, fast_config())
            .run()
            .await
            .unwrap();
        assert_eq!(surface.jumps.last(), Some(&7));
        assert_eq!(surface.current, 7);

        let (dir2, store2) = scratch_store("no-restore");
        let mut surface = MockSurface::new(10);
        surface.current = 7;
        let config = CaptureConfig {
            restore_position: false,
            ..fast_config()
        };
        Traverser::new(&mut surface, &store2, config).run().await.unwrap();
        assert_eq!(surface.current, 10);

        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::remove_dir_all(&dir2);
    }

    #[tokio::test]
    async fn back_matter_cuts_traversal_short() {
        let (dir, store) = scratch_store("boundary");
        let mut surface = MockSurface::new(20);
        surface.toc = vec![
            ("Title".into(), 1),
            ("Ch1".into(), 2),
            ("Copyright".into(), 19),
        ];

        let outcome = Traverser::new(&mut surface, &store, fast_config())
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.boundaries.total_content_pages, 18);
        assert_eq!(outcome.captures.last().unwrap().page, 18);
        let metadata = store.require_metadata().unwrap();
        assert_eq!(metadata.meta.post_content_label.as_deref(), Some("Copyright"));
        assert_eq!(metadata.meta.post_content_page, Some(19));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unresolved_toc_entries_are_visited() {
        let (dir, store) = scratch_store("toc-resolve");
        let mut surface = MockSurface::new(6);
        surface.hide_toc_positions = true;
        surface.toc = vec![("Part One".into(), 1), ("Part Two".into(), 4)];

        Traverser::new(&mut surface, &store, fast_config())
            .run()
            .await
            .unwrap();

        let metadata = store.require_metadata().unwrap();
        assert_eq!(metadata.toc[1].position(), Some(4));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn empty_toc_is_structural() {
        let (dir, store) = scratch_store("no-toc");
        let mut surface = MockSurface::new(5);
        surface.toc.clear();

        let err = Traverser::new(&mut surface, &store, fast_config())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, PagescribeError::Structural { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn observer_sees_every_capture() {
        struct Counter(AtomicUsize);
        impl CaptureObserver for Counter {
            fn page_captured(&self, _capture: &PageCapture, last_content_page: u32) {
                assert_eq!(last_content_page, 5);
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (dir, store) = scratch_store("observer");
        let mut surface = MockSurface::new(5);
        let counter = Counter(AtomicUsize::new(0));

        Traverser::new(&mut surface, &store, fast_config())
            .with_observer(&counter)
            .run()
            .await
            .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 5);
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn stored_captures(store: &BookStore, pages: std::ops::RangeInclusive<u32>) -> BookMetadata {
        let mut metadata = BookMetadata::new(BookInfo::default(), "0.0.0");
        for (index, page) in pages.enumerate() {
            let (image, image_hash) = store
                .write_page_image(index, page, format!("png-{page}").as_bytes(), false)
                .unwrap();
            metadata.pages.push(PageCapture {
                index,
                page,
                image,
                image_hash,
                captured_at: Utc::now(),
            });
        }
        store.save_metadata(&metadata).unwrap();
        metadata
    }

    #[tokio::test]
    async fn resume_replaces_image_orphaned_before_metadata_save() {
        let (dir, store) = scratch_store("orphan");
        stored_captures(&store, 1..=4);
        // The previous run wrote page 5's image and died before saving metadata.
        store.write_page_image(4, 5, b"half-written", false).unwrap();

        let mut surface = MockSurface::new(8);
        let outcome = Traverser::new(&mut surface, &store, fast_config())
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.reason, DoneReason::ContentEnd);
        assert_eq!(outcome.captures.len(), 8);
        assert_sequential(&outcome.captures);
        assert_eq!(outcome.captures[4].page, 5);
        assert_eq!(store.read_page_image(&outcome.captures[4].image).unwrap(), b"png-5");
        assert_eq!(outcome.captures[4].image_hash, pagescribe_store::hash_bytes(b"png-5"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn referenced_images_are_still_protected() {
        let (dir, store) = scratch_store("referenced");
        let metadata = stored_captures(&store, 1..=2);

        let err = store.write_page_image(1, 2, b"other", false).unwrap_err();
        assert!(matches!(err, PagescribeError::Storage(_)));
        assert_eq!(store.read_page_image(&metadata.pages[1].image).unwrap(), b"png-2");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn location_books_walk_without_jumping() {
        let (dir, store) = scratch_store("location");
        let mut surface = MockSurface::new(6);
        surface.location_mode = true;
        surface.current = 3;

        let outcome = Traverser::new(&mut surface, &store, fast_config())
            .run()
            .await
            .unwrap();

        assert!(outcome.boundaries.location_mode);
        assert_eq!(outcome.reason, DoneReason::ContentEnd);
        let positions: Vec<u32> = outcome.captures.iter().map(|c| c.page).collect();
        assert_eq!(positions, (1..=6).collect::<Vec<_>>());
        assert!(surface.jumps.is_empty());
        // A location origin is not restored.
        assert_eq!(surface.current, 6);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn location_books_resume_by_walking_forward() {
        let (dir, store) = scratch_store("location-resume");
        stored_captures(&store, 1..=3);
        let mut surface = MockSurface::new(7);
        surface.location_mode = true;

        let outcome = Traverser::new(&mut surface, &store, fast_config())
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.resumed_from, Some(3));
        assert_eq!(outcome.new_captures, 4);
        assert_sequential(&outcome.captures);
        assert_eq!(outcome.captures[3].page, 4);
        assert!(surface.jumps.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn stuck_rounds_reset_once_the_page_turns() {
        let (dir, store) = scratch_store("unstuck");
        let mut surface = MockSurface::new(6);
        surface.location_mode = true;
        surface.stall_at = Some(3);
        // One round short of the retry budget.
        surface.stall_rounds = 2;

        let mut traverser = Traverser::new(&mut surface, &store, fast_config());
        let outcome = traverser.run().await.unwrap();

        assert_eq!(outcome.reason, DoneReason::ContentEnd);
        assert_eq!(outcome.captures.len(), 6);
        assert_eq!(traverser.state().stuck_rounds, 0);
        assert_eq!(surface.stall_rounds, 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
