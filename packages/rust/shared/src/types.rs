//! Core domain types for captured books.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version for the `metadata.json` format.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one capture run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// LocationSample
// ---------------------------------------------------------------------------

/// A reading position parsed from the reader footer.
///
/// Exactly one of `page` / `location` is set for a successful parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<u32>,
    pub total: u32,
}

impl LocationSample {
    pub fn page(page: u32, total: u32) -> Self {
        Self {
            page: Some(page),
            location: None,
            total,
        }
    }

    pub fn location(location: u32, total: u32) -> Self {
        Self {
            page: None,
            location: Some(location),
            total,
        }
    }

    /// The position regardless of notation (page preferred).
    pub fn position(&self) -> Option<u32> {
        self.page.or(self.location)
    }

    /// Whether this sample was expressed in abstract locations rather than pages.
    pub fn is_location(&self) -> bool {
        self.page.is_none() && self.location.is_some()
    }
}

// ---------------------------------------------------------------------------
// TocEntry
// ---------------------------------------------------------------------------

/// A single table-of-contents entry, in document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    /// Display label as shown in the reader.
    pub label: String,
    /// Resolved reading position, if the entry could be resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<LocationSample>,
    /// Nesting depth (0 = top level).
    #[serde(default)]
    pub depth: u32,
}

impl TocEntry {
    pub fn new(label: impl Into<String>, sample: Option<LocationSample>, depth: u32) -> Self {
        Self {
            label: label.into(),
            sample,
            depth,
        }
    }

    /// Page (or location) this entry starts at.
    pub fn position(&self) -> Option<u32> {
        self.sample.and_then(|s| s.position())
    }
}

// ---------------------------------------------------------------------------
// PageCapture / TranscriptChunk / Chapter
// ---------------------------------------------------------------------------

/// One captured page render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCapture {
    /// Sequential capture index; never reused within a book.
    pub index: usize,
    /// Page (or location) reported when the capture was taken.
    pub page: u32,
    /// Store-relative path of the PNG.
    pub image: String,
    /// SHA-256 of the image bytes.
    pub image_hash: String,
    pub captured_at: DateTime<Utc>,
}

/// Transcribed text for one capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptChunk {
    pub index: usize,
    pub page: u32,
    pub text: String,
    pub image: String,
}

/// A chapter reassembled from transcript chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub label: String,
    pub depth: u32,
    pub text: String,
    /// Index of the originating TOC entry.
    pub toc_index: usize,
    /// Half-open range of chunk positions `[start_index, end_index)`.
    pub start_index: usize,
    pub end_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_page: Option<u32>,
}

impl Chapter {
    pub fn is_empty(&self) -> bool {
        self.start_index >= self.end_index
    }
}

// ---------------------------------------------------------------------------
// BookMetadata (`metadata.json`)
// ---------------------------------------------------------------------------

/// Descriptive information about the book being captured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookInfo {
    pub book_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
}

/// Bookkeeping for the capture run that produced the artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub schema_version: u32,
    pub run_id: RunId,
    pub tool_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Total pages (or locations) reported by the reader.
    #[serde(default)]
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_content_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_content_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_content_label: Option<String>,
    /// Why the last traversal stopped (`content-end`, `stagnated`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
}

impl RunMeta {
    pub fn new(tool_version: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id: RunId::new(),
            tool_version: tool_version.into(),
            created_at: now,
            updated_at: now,
            total: 0,
            first_content_page: None,
            post_content_page: None,
            post_content_label: None,
            done_reason: None,
        }
    }
}

/// The `metadata.json` structure: the hand-off between capture and later stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookMetadata {
    pub info: BookInfo,
    pub meta: RunMeta,
    #[serde(default)]
    pub toc: Vec<TocEntry>,
    #[serde(default)]
    pub pages: Vec<PageCapture>,
}

impl BookMetadata {
    pub fn new(info: BookInfo, tool_version: impl Into<String>) -> Self {
        Self {
            info,
            meta: RunMeta::new(tool_version),
            toc: Vec::new(),
            pages: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn location_sample_position_prefers_page() {
        let page = LocationSample::page(12, 300);
        assert_eq!(page.position(), Some(12));
        assert!(!page.is_location());

        let loc = LocationSample::location(1450, 5200);
        assert_eq!(loc.position(), Some(1450));
        assert!(loc.is_location());
    }

    #[test]
    fn location_sample_omits_unset_fields() {
        let json = serde_json::to_string(&LocationSample::page(3, 20)).expect("serialize");
        assert_eq!(json, r#"{"page":3,"total":20}"#);
    }

    #[test]
    fn metadata_serialization() {
        let mut metadata = BookMetadata::new(
            BookInfo {
                book_id: "B00TEST".into(),
                title: Some("A Book".into()),
                authors: vec!["Someone".into()],
            },
            "0.1.0",
        );
        metadata.toc.push(TocEntry::new(
            "Chapter 1",
            Some(LocationSample::page(2, 20)),
            0,
        ));

        let json = serde_json::to_string_pretty(&metadata).expect("serialize");
        let parsed: BookMetadata = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.meta.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(parsed.info.book_id, "B00TEST");
        assert_eq!(parsed.toc[0].position(), Some(2));
        assert!(parsed.pages.is_empty());
    }

    #[test]
    fn chapter_is_empty_for_degenerate_range() {
        let chapter = Chapter {
            label: "Notes".into(),
            depth: 1,
            text: String::new(),
            toc_index: 7,
            start_index: 10,
            end_index: 10,
            start_page: None,
            end_page: None,
        };
        assert!(chapter.is_empty());
    }
}
