//! Page-advance strategies and the fallback ladder.
//!
//! The reader UI auto-hides its controls and occasionally ignores input, so
//! advancing is attempted through several strategies in priority order. A
//! strategy only *issues* a command; the engine decides whether the page
//! actually turned.

use async_trait::async_trait;

use pagescribe_shared::Result;

use crate::surface::ReadingSurface;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One way of moving the reader forward by a page.
#[async_trait]
pub trait AdvanceStrategy: Send + Sync {
    /// Issue the command. Returns `false` when it could not be issued
    /// (control missing, input rejected).
    async fn issue(&self, surface: &mut dyn ReadingSurface, current: u32) -> Result<bool>;

    /// Human-readable strategy name for tracing.
    fn name(&self) -> &str;
}

/// Primary "next page" control.
pub struct NextControl;

#[async_trait]
impl AdvanceStrategy for NextControl {
    async fn issue(&self, surface: &mut dyn ReadingSurface, _current: u32) -> Result<bool> {
        surface.advance_page().await
    }

    fn name(&self) -> &str {
        "next-control"
    }
}

/// Keyboard paging.
pub struct PagingKeys;

#[async_trait]
impl AdvanceStrategy for PagingKeys {
    async fn issue(&self, surface: &mut dyn ReadingSurface, _current: u32) -> Result<bool> {
        surface.press_paging_key().await
    }

    fn name(&self) -> &str {
        "paging-keys"
    }
}

/// Click in the forward reading zone.
pub struct ForwardZoneClick;

#[async_trait]
impl AdvanceStrategy for ForwardZoneClick {
    async fn issue(&self, surface: &mut dyn ReadingSurface, _current: u32) -> Result<bool> {
        surface.click_forward_zone().await
    }

    fn name(&self) -> &str {
        "forward-zone-click"
    }
}

/// Go-to-page jump to `current + 1`. Page mode only.
pub struct JumpToPage;

#[async_trait]
impl AdvanceStrategy for JumpToPage {
    async fn issue(&self, surface: &mut dyn ReadingSurface, current: u32) -> Result<bool> {
        surface.jump_to_page(current.saturating_add(1)).await
    }

    fn name(&self) -> &str {
        "jump-to-page"
    }
}

// ---------------------------------------------------------------------------
// Ladder
// ---------------------------------------------------------------------------

/// Advance strategies in priority order.
pub struct AdvanceLadder {
    strategies: Vec<Box<dyn AdvanceStrategy>>,
}

impl AdvanceLadder {
    /// Build the ladder for a book. Location-only books have no page numbers
    /// to jump to, so the jump fallback is left out.
    pub fn new(location_mode: bool) -> Self {
        let mut strategies: Vec<Box<dyn AdvanceStrategy>> = vec![
            Box::new(NextControl),
            Box::new(PagingKeys),
            Box::new(ForwardZoneClick),
        ];
        if !location_mode {
            strategies.push(Box::new(JumpToPage));
        }
        Self { strategies }
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn AdvanceStrategy> {
        self.strategies.iter().map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}
