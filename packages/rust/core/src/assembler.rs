//! Book assembler.
//!
//! Renders stitched chapters into `book.md` and writes the chapter list to
//! `chapters.json` inside the book's artifact folder.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use pagescribe_shared::{BookMetadata, CURRENT_SCHEMA_VERSION, Chapter, Result};
use pagescribe_store::BookStore;

use crate::stitcher::StitchedBook;

/// Options for rendering.
#[derive(Debug, Clone, Default)]
pub struct AssembleConfig {
    /// Keep chapters at or after the back-matter boundary.
    pub include_back_matter: bool,
}

/// The `chapters.json` structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaptersFile {
    pub schema_version: u32,
    pub book_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// TOC index of the first back-matter entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_content: Option<usize>,
    pub chapters: Vec<Chapter>,
}

/// Output from a successful assembly.
#[derive(Debug, Clone)]
pub struct AssembleResult {
    pub book_md: PathBuf,
    pub chapters_json: PathBuf,
    /// Chapters rendered into `book.md`.
    pub rendered: usize,
    /// Chapters dropped as back matter or trailing empties.
    pub dropped: usize,
}

/// Write `book.md` and `chapters.json` for a stitched book.
#[instrument(skip_all, fields(book_id = %store.book_id(), chapters = book.chapters.len()))]
pub fn assemble(
    store: &BookStore,
    metadata: &BookMetadata,
    book: &StitchedBook,
    config: &AssembleConfig,
) -> Result<AssembleResult> {
    let selected = select_chapters(book, config);
    let markdown = render_markdown(metadata, &selected);

    let book_md = store.write_artifact("book.md", markdown.as_bytes())?;
    let chapters_json = store.write_json_artifact(
        "chapters.json",
        &ChaptersFile {
            schema_version: CURRENT_SCHEMA_VERSION,
            book_id: metadata.info.book_id.clone(),
            title: metadata.info.title.clone(),
            post_content: book.post_content,
            chapters: selected.iter().map(|c| (*c).clone()).collect(),
        },
    )?;

    let result = AssembleResult {
        book_md,
        chapters_json,
        rendered: selected.len(),
        dropped: book.chapters.len() - selected.len(),
    };
    info!(
        rendered = result.rendered,
        dropped = result.dropped,
        path = %result.book_md.display(),
        "book assembled"
    );
    Ok(result)
}

/// Chapters that make it into the output: main content (unless back matter
/// is requested) without trailing empty chapters.
pub fn select_chapters<'a>(book: &'a StitchedBook, config: &AssembleConfig) -> Vec<&'a Chapter> {
    let mut selected: Vec<&Chapter> = if config.include_back_matter {
        book.trimmed_chapters().iter().collect()
    } else {
        book.main_chapters()
    };
    while selected.last().is_some_and(|c| c.text.is_empty()) {
        let dropped = selected.pop();
        debug!(label = ?dropped.map(|c| &c.label), "dropping trailing empty chapter");
    }
    selected
}

/// Render chapters as a single Markdown document.
pub fn render_markdown(metadata: &BookMetadata, chapters: &[&Chapter]) -> String {
    let mut out = String::new();
    let title = metadata
        .info
        .title
        .as_deref()
        .unwrap_or(&metadata.info.book_id);
    out.push_str(&format!("# {title}\n\n"));
    if !metadata.info.authors.is_empty() {
        out.push_str(&format!("*{}*\n\n", metadata.info.authors.join(", ")));
    }

    for chapter in chapters {
        let level = (chapter.depth as usize + 2).min(6);
        out.push_str(&format!("{} {}\n\n", "#".repeat(level), chapter.label.trim()));
        if !chapter.text.is_empty() {
            out.push_str(&chapter.text);
            out.push_str("\n\n");
        }
    }

    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    out.push('\n');
    out
}
