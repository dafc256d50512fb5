//! Reading-surface traversal for pagescribe.
//!
//! Parses footer positions, analyzes the table of contents, and walks the
//! reader page by page, storing one image per page.

pub mod advance;
pub mod bridge;
pub mod engine;
pub mod location;
pub mod surface;
pub mod toc;

pub use advance::{AdvanceLadder, AdvanceStrategy};
pub use bridge::BridgeSurface;
pub use engine::{
    CaptureObserver, DoneReason, SilentObserver, TraversalOutcome, TraversalPhase, TraversalState,
    Traverser,
};
pub use location::{deromanize, parse_footer};
pub use surface::ReadingSurface;
pub use toc::{TocBoundaries, analyze_toc, collect_toc, is_back_matter};
