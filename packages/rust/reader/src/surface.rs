//! The reading surface: the external paginated renderer being traversed.
//!
//! Everything the traversal engine knows about the reader goes through
//! [`ReadingSurface`], so the engine can run against a deterministic mock in
//! tests and against a browser-automation driver ([`crate::BridgeSurface`])
//! in production.

use async_trait::async_trait;

use pagescribe_shared::{BookInfo, Result, TocEntry};

/// Navigation and capture primitives exposed by a reader session.
///
/// Methods returning `bool` report whether the command could be *issued*
/// (the control existed and accepted the input), not whether the page
/// actually changed; the engine verifies the change itself by polling
/// [`render_identity`](ReadingSurface::render_identity) and the footer.
///
/// An `Err` from any method is treated as unrecoverable for the run.
#[async_trait]
pub trait ReadingSurface: Send {
    /// Descriptive information about the open book.
    async fn book_info(&mut self) -> Result<BookInfo> {
        Ok(BookInfo::default())
    }

    /// Reveal the table of contents panel.
    async fn open_table_of_contents(&mut self) -> Result<()>;

    /// List TOC entries in document order. Entries the surface cannot
    /// position carry `sample = None`.
    async fn list_toc_entries(&mut self) -> Result<Vec<TocEntry>>;

    /// Navigate to the TOC entry at `position` (index into the listed entries).
    async fn select_toc_entry(&mut self, position: usize) -> Result<()>;

    /// Raw footer text, or `None` if the footer is hidden or absent.
    async fn footer_text(&mut self) -> Result<Option<String>>;

    /// PNG bytes of the current render.
    async fn capture_page_image(&mut self) -> Result<Vec<u8>>;

    /// Opaque token that changes whenever the rendered page changes.
    async fn render_identity(&mut self) -> Result<String>;

    /// Activate the primary "next page" control.
    async fn advance_page(&mut self) -> Result<bool>;

    /// Send the paging key (arrow / page-down).
    async fn press_paging_key(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Click inside the forward reading zone of the page.
    async fn click_forward_zone(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Jump directly to page `page` via the reader's go-to control.
    async fn jump_to_page(&mut self, page: u32) -> Result<bool>;

    /// Whether any forward navigation control is currently detectable.
    async fn has_forward_control(&mut self) -> Result<bool>;
}
