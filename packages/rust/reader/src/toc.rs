//! Table-of-contents collection and boundary analysis.
//!
//! [`collect_toc`] walks the reader's TOC panel; [`analyze_toc`] decides where
//! the main content starts and where back matter (acknowledgements, teasers,
//! "also by" lists) begins so the traversal can stop early.

use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use tracing::{debug, info, instrument};

use pagescribe_shared::{CaptureConfig, LocationSample, PagescribeError, Result, TocEntry};

use crate::location::parse_footer;
use crate::surface::ReadingSurface;

/// Back-matter entries only count once this far into the book.
pub const POST_CONTENT_RATIO: f64 = 0.9;

/// Labels that typically mark the start of back matter.
static BACK_MATTER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^acknowledge?ments?\b",
        r"(?i)\bdiscover more\b",
        r"(?i)^extras?\b",
        r"(?i)\b(about|meet) the authors?\b",
        r"(?i)^also by\b",
        r"(?i)^copyright\b",
        r"(?i)\b(teaser|preview)$",
        r"(?i)^excerpt(\s+from\b|\s*:)",
        r"(?i)\bcast of characters\b",
        r"(?i)^timeline\b",
        r"(?i)\bother (titles|books|works)\b",
        r"(?i)\bnewsletter\b",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

/// Whether a TOC label looks like back matter.
pub fn is_back_matter(label: &str) -> bool {
    let label = label.trim();
    BACK_MATTER_PATTERNS.iter().any(|re| re.is_match(label))
}

// ---------------------------------------------------------------------------
// Boundary analysis
// ---------------------------------------------------------------------------

/// Where the main content of a book begins and ends, derived from its TOC.
#[derive(Debug, Clone, PartialEq)]
pub struct TocBoundaries {
    /// Index (into the TOC) of the first entry with a resolvable position.
    pub first_content: usize,
    pub first_content_position: u32,
    /// Index of the first back-matter entry, if one was recognized.
    pub first_post_content: Option<usize>,
    pub post_content_position: Option<u32>,
    /// Total pages (or locations) of the book.
    pub total: u32,
    /// Last position worth capturing.
    pub total_content_pages: u32,
    /// Positions are abstract locations rather than page numbers.
    pub location_mode: bool,
}

/// Analyze an ordered TOC.
///
/// Fails with a structural error when no entry resolves to a position; a
/// missing back-matter boundary is not an error.
pub fn analyze_toc(entries: &[TocEntry]) -> Result<TocBoundaries> {
    let (first_content, sample) = entries
        .iter()
        .enumerate()
        .find_map(|(i, e)| resolvable(e).map(|s| (i, s)))
        .ok_or_else(|| {
            PagescribeError::structural(format!(
                "no table-of-contents entry resolves to a page or location ({} entries)",
                entries.len()
            ))
        })?;

    let total = sample.total;
    let first_content_position = sample.position().unwrap_or(1);

    let post = entries
        .iter()
        .enumerate()
        .skip(first_content + 1)
        .find_map(|(i, e)| {
            let position = e.position()?;
            let past_threshold = f64::from(position) / f64::from(total) >= POST_CONTENT_RATIO;
            (past_threshold && is_back_matter(&e.label)).then_some((i, position))
        });

    let total_content_pages = match post {
        Some((_, position)) => position.saturating_sub(1).max(first_content_position),
        None => total,
    };

    Ok(TocBoundaries {
        first_content,
        first_content_position,
        first_post_content: post.map(|(i, _)| i),
        post_content_position: post.map(|(_, p)| p),
        total,
        total_content_pages,
        location_mode: sample.is_location(),
    })
}

fn resolvable(entry: &TocEntry) -> Option<LocationSample> {
    entry
        .sample
        .filter(|s| s.total > 0 && s.position().is_some())
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Read the TOC from the surface, resolving entries the surface left
/// unpositioned by visiting each one and reading the footer.
#[instrument(skip_all)]
pub async fn collect_toc(
    surface: &mut dyn ReadingSurface,
    config: &CaptureConfig,
) -> Result<Vec<TocEntry>> {
    surface.open_table_of_contents().await?;
    let mut entries = surface.list_toc_entries().await?;
    if entries.is_empty() {
        return Err(PagescribeError::structural("table of contents is empty"));
    }

    let unresolved: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.sample.is_none())
        .map(|(i, _)| i)
        .collect();

    for i in unresolved {
        surface.open_table_of_contents().await?;
        surface.select_toc_entry(i).await?;
        tokio::time::sleep(config.settle).await;
        entries[i].sample = poll_footer(surface, config).await?;
        debug!(label = %entries[i].label, sample = ?entries[i].sample, "resolved toc entry");
    }

    info!(entries = entries.len(), "collected table of contents");
    Ok(entries)
}

/// Poll the footer until it parses or the poll timeout elapses.
pub(crate) async fn poll_footer(
    surface: &mut dyn ReadingSurface,
    config: &CaptureConfig,
) -> Result<Option<LocationSample>> {
    let deadline = Instant::now() + config.poll_timeout;
    loop {
        if let Some(sample) = read_sample(surface).await? {
            return Ok(Some(sample));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

/// Read and parse the footer once.
pub(crate) async fn read_sample(surface: &mut dyn ReadingSurface) -> Result<Option<LocationSample>> {
    Ok(surface
        .footer_text()
        .await?
        .as_deref()
        .and_then(parse_footer))
}
