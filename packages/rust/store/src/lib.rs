//! On-disk artifact store for one book.
//!
//! Layout under `<output_dir>/<book_id>/`:
//!
//! ```text
//! metadata.json            info, run meta, toc, page captures
//! pages/0000-0001.png      one image per capture (<index>-<page>)
//! transcripts/0000-0001.json
//! content.json             all transcript chunks, ordered by index
//! chapters.json, book.md   assembled output
//! ```
//!
//! Every write goes to a temp file in the same directory and is renamed into
//! place, so a crash never leaves a half-written artifact. Concurrent writers
//! only ever touch distinct keys, so no locking is needed.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use pagescribe_shared::{
    BookMetadata, CURRENT_SCHEMA_VERSION, PagescribeError, Result, TranscriptChunk,
};

const METADATA_FILE: &str = "metadata.json";
const CONTENT_FILE: &str = "content.json";
const PAGES_DIR: &str = "pages";
const TRANSCRIPTS_DIR: &str = "transcripts";

/// Handle to one book's artifact directory.
#[derive(Debug, Clone)]
pub struct BookStore {
    book_id: String,
    root: PathBuf,
}

impl BookStore {
    /// Open (creating if needed) the artifact directory for `book_id`.
    pub fn open(output_dir: &Path, book_id: &str) -> Result<Self> {
        validate_book_id(book_id)?;
        let root = output_dir.join(book_id);
        for dir in [root.join(PAGES_DIR), root.join(TRANSCRIPTS_DIR)] {
            std::fs::create_dir_all(&dir).map_err(|e| PagescribeError::io(&dir, e))?;
        }
        debug!(path = %root.display(), "opened book store");
        Ok(Self {
            book_id: book_id.to_string(),
            root,
        })
    }

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a store-relative artifact path.
    pub fn path_of(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    // -----------------------------------------------------------------------
    // metadata.json
    // -----------------------------------------------------------------------

    /// Load `metadata.json`, or `None` if no capture has run yet.
    pub fn load_metadata(&self) -> Result<Option<BookMetadata>> {
        let path = self.root.join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let metadata: BookMetadata = read_json(&path)?;
        if metadata.meta.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(PagescribeError::validation(format!(
                "unsupported schema_version: {} (expected {})",
                metadata.meta.schema_version, CURRENT_SCHEMA_VERSION
            )));
        }
        Ok(Some(metadata))
    }

    /// Load `metadata.json`, failing if it is missing.
    pub fn require_metadata(&self) -> Result<BookMetadata> {
        self.load_metadata()?.ok_or_else(|| {
            PagescribeError::Storage(format!(
                "no {METADATA_FILE} in {}; run the capture stage first",
                self.root.display()
            ))
        })
    }

    pub fn save_metadata(&self, metadata: &BookMetadata) -> Result<()> {
        let mut metadata = metadata.clone();
        metadata.meta.updated_at = Utc::now();
        write_json(&self.root.join(METADATA_FILE), &metadata)
    }

    // -----------------------------------------------------------------------
    // Page images
    // -----------------------------------------------------------------------

    /// Store-relative path of the image for a capture.
    pub fn image_key(index: usize, page: u32) -> String {
        format!("{PAGES_DIR}/{}.png", capture_key(index, page))
    }

    /// Persist a page image. Returns `(relative_path, sha256)`.
    ///
    /// Refuses to replace an existing capture unless `force` is set.
    pub fn write_page_image(
        &self,
        index: usize,
        page: u32,
        bytes: &[u8],
        force: bool,
    ) -> Result<(String, String)> {
        let key = Self::image_key(index, page);
        let path = self.root.join(&key);
        if path.exists() && !force {
            return Err(PagescribeError::Storage(format!(
                "capture {key} already exists (use --force to overwrite)"
            )));
        }
        write_atomic(&path, bytes)?;
        Ok((key, hash_bytes(bytes)))
    }

    pub fn read_page_image(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.root.join(relative);
        std::fs::read(&path).map_err(|e| PagescribeError::io(&path, e))
    }

    // -----------------------------------------------------------------------
    // Transcripts
    // -----------------------------------------------------------------------

    fn transcript_path(&self, index: usize, page: u32) -> PathBuf {
        self.root
            .join(TRANSCRIPTS_DIR)
            .join(format!("{}.json", capture_key(index, page)))
    }

    pub fn has_transcript(&self, index: usize, page: u32) -> bool {
        self.transcript_path(index, page).exists()
    }

    pub fn load_transcript(&self, index: usize, page: u32) -> Result<Option<TranscriptChunk>> {
        let path = self.transcript_path(index, page);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn save_transcript(&self, chunk: &TranscriptChunk) -> Result<()> {
        write_json(&self.transcript_path(chunk.index, chunk.page), chunk)
    }

    // -----------------------------------------------------------------------
    // content.json and assembled artifacts
    // -----------------------------------------------------------------------

    pub fn save_content(&self, chunks: &[TranscriptChunk]) -> Result<()> {
        write_json(&self.root.join(CONTENT_FILE), &chunks)?;
        info!(chunks = chunks.len(), "wrote {CONTENT_FILE}");
        Ok(())
    }

    /// Load `content.json`, sorted by capture index.
    pub fn load_content(&self) -> Result<Vec<TranscriptChunk>> {
        let path = self.root.join(CONTENT_FILE);
        if !path.exists() {
            return Err(PagescribeError::Storage(format!(
                "no {CONTENT_FILE} in {}; run the transcribe stage first",
                self.root.display()
            )));
        }
        let mut chunks: Vec<TranscriptChunk> = read_json(&path)?;
        chunks.sort_by_key(|c| c.index);
        Ok(chunks)
    }

    /// Write an arbitrary artifact (e.g. `book.md`) at the store root.
    pub fn write_artifact(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.root.join(name);
        write_atomic(&path, content)?;
        Ok(path)
    }

    pub fn write_json_artifact<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.root.join(name);
        write_json(&path, value)?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `<index>-<page>` with zero padding so directory listings sort in capture order.
fn capture_key(index: usize, page: u32) -> String {
    format!("{index:04}-{page:04}")
}

/// Book ids become directory names; keep them to a safe character set.
fn validate_book_id(book_id: &str) -> Result<()> {
    let ok = !book_id.is_empty()
        && book_id != "."
        && book_id != ".."
        && book_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(PagescribeError::validation(format!(
            "invalid book id '{book_id}': use letters, digits, '-', '_' or '.'"
        )))
    }
}

/// Compute SHA-256 hash of content.
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| {
        PagescribeError::Storage(format!("failed to serialize {}: {e}", path.display()))
    })?;
    write_atomic(path, json.as_bytes())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| PagescribeError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| PagescribeError::parse(format!("invalid {}: {e}", path.display())))
}

/// Write to a temp sibling, then rename over the target.
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| PagescribeError::Storage(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| PagescribeError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp = parent.join(format!(".{file_name}.{}.tmp", Uuid::now_v7()));

    std::fs::write(&temp, content).map_err(|e| PagescribeError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        PagescribeError::io(path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagescribe_shared::{BookInfo, LocationSample, TocEntry};

    fn scratch_store(tag: &str) -> (PathBuf, BookStore) {
        let dir = std::env::temp_dir().join(format!("pagescribe-{tag}-{}", Uuid::now_v7()));
        let store = BookStore::open(&dir, "B00TEST").expect("open store");
        (dir, store)
    }

    fn chunk(index: usize, page: u32, text: &str) -> TranscriptChunk {
        TranscriptChunk {
            index,
            page,
            text: text.into(),
            image: BookStore::image_key(index, page),
        }
    }

    #[test]
    fn open_creates_layout() {
        let (dir, store) = scratch_store("layout");
        assert!(store.root().join("pages").is_dir());
        assert!(store.root().join("transcripts").is_dir());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_path_like_book_ids() {
        let dir = std::env::temp_dir();
        assert!(BookStore::open(&dir, "../escape").is_err());
        assert!(BookStore::open(&dir, "").is_err());
        assert!(BookStore::open(&dir, "a/b").is_err());
    }

    #[test]
    fn metadata_roundtrip_and_missing() {
        let (dir, store) = scratch_store("meta");
        assert!(store.load_metadata().unwrap().is_none());
        assert!(store.require_metadata().is_err());

        let mut metadata = BookMetadata::new(
            BookInfo {
                book_id: "B00TEST".into(),
                ..Default::default()
            },
            "0.1.0",
        );
        metadata
            .toc
            .push(TocEntry::new("Ch1", Some(LocationSample::page(2, 20)), 0));
        store.save_metadata(&metadata).unwrap();

        let loaded = store.require_metadata().unwrap();
        assert_eq!(loaded.toc.len(), 1);
        assert_eq!(loaded.info.book_id, "B00TEST");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn metadata_with_unknown_schema_is_rejected() {
        let (dir, store) = scratch_store("schema");
        let mut metadata = BookMetadata::new(BookInfo::default(), "0.1.0");
        metadata.meta.schema_version = 99;
        store.save_metadata(&metadata).unwrap();
        let err = store.load_metadata().unwrap_err();
        assert!(err.to_string().contains("schema_version"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn page_images_are_not_overwritten_without_force() {
        let (dir, store) = scratch_store("images");
        let (key, hash) = store.write_page_image(0, 1, b"first", false).unwrap();
        assert_eq!(key, "pages/0000-0001.png");
        assert_eq!(hash, hash_bytes(b"first"));

        assert!(store.write_page_image(0, 1, b"second", false).is_err());
        assert_eq!(store.read_page_image(&key).unwrap(), b"first");

        store.write_page_image(0, 1, b"second", true).unwrap();
        assert_eq!(store.read_page_image(&key).unwrap(), b"second");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn transcripts_are_keyed_by_index_and_page() {
        let (dir, store) = scratch_store("transcripts");
        assert!(!store.has_transcript(3, 7));
        store.save_transcript(&chunk(3, 7, "hello")).unwrap();
        assert!(store.has_transcript(3, 7));
        assert!(!store.has_transcript(3, 8));
        let loaded = store.load_transcript(3, 7).unwrap().unwrap();
        assert_eq!(loaded.text, "hello");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn content_is_loaded_in_index_order() {
        let (dir, store) = scratch_store("content");
        store
            .save_content(&[chunk(2, 3, "c"), chunk(0, 1, "a"), chunk(1, 2, "b")])
            .unwrap();
        let loaded = store.load_content().unwrap();
        let indices: Vec<usize> = loaded.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let (dir, store) = scratch_store("atomic");
        store.write_artifact("book.md", b"# Title\n").unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_hash_bytes() {
        let hash = hash_bytes(b"hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
