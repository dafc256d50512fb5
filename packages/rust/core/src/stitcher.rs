//! Chapter stitcher: maps page-ordered transcript chunks onto the TOC.

use tracing::{debug, instrument};

use pagescribe_reader::analyze_toc;
use pagescribe_shared::{Chapter, TocEntry, TranscriptChunk};

/// Chapters derived from one book.
#[derive(Debug, Clone, PartialEq)]
pub struct StitchedBook {
    /// One chapter per positioned TOC entry, in TOC order.
    pub chapters: Vec<Chapter>,
    /// Position (in `chapters`) of the last chapter that has text.
    pub last_content_chapter: Option<usize>,
    /// TOC index of the first back-matter entry, if one was recognized.
    pub post_content: Option<usize>,
}

impl StitchedBook {
    /// Chapters before the back-matter boundary.
    pub fn main_chapters(&self) -> Vec<&Chapter> {
        self.chapters
            .iter()
            .filter(|c| self.post_content.is_none_or(|boundary| c.toc_index < boundary))
            .collect()
    }

    /// All chapters up to and including the last one with text.
    pub fn trimmed_chapters(&self) -> &[Chapter] {
        match self.last_content_chapter {
            Some(last) => &self.chapters[..=last],
            None => &[],
        }
    }
}

/// Stitch `chunks` (sorted by index) onto `toc`.
#[instrument(skip_all, fields(chunks = chunks.len(), entries = toc.len()))]
pub fn stitch(chunks: &[TranscriptChunk], toc: &[TocEntry]) -> StitchedBook {
    let post_content = analyze_toc(toc).ok().and_then(|b| b.first_post_content);
    let mut chapters = Vec::new();

    for (i, entry) in toc.iter().enumerate() {
        let Some(position) = entry.position() else {
            continue;
        };
        let current = first_at_or_after(chunks, position);
        let next = toc
            .get(i + 1)
            .and_then(TocEntry::position)
            .map_or(chunks.len(), |p| first_at_or_after(chunks, p));
        if next < current {
            debug!(label = %entry.label, current, next, "entry out of order, skipped");
            continue;
        }

        let span = &chunks[current..next];
        chapters.push(Chapter {
            label: entry.label.clone(),
            depth: entry.depth,
            text: reflow(&join_chunks(span)),
            toc_index: i,
            start_index: current,
            end_index: next,
            start_page: span.first().map(|c| c.page),
            end_page: span.last().map(|c| c.page),
        });
    }

    let last_content_chapter = chapters.iter().rposition(|c| !c.text.is_empty());
    debug!(
        chapters = chapters.len(),
        ?last_content_chapter,
        ?post_content,
        "stitched"
    );

    StitchedBook {
        chapters,
        last_content_chapter,
        post_content,
    }
}

fn first_at_or_after(chunks: &[TranscriptChunk], page: u32) -> usize {
    chunks
        .iter()
        .position(|c| c.page >= page)
        .unwrap_or(chunks.len())
}

fn join_chunks(chunks: &[TranscriptChunk]) -> String {
    chunks
        .iter()
        .map(|c| c.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turn every line break into a paragraph break and drop blank runs.
pub fn reflow(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
