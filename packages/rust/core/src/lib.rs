//! Stage orchestration and chapter assembly for pagescribe.
//!
//! Ties the reader, transcription and store crates together into the
//! capture → transcribe → assemble workflow.

pub mod assembler;
pub mod pipeline;
pub mod stitcher;

pub use assembler::{AssembleConfig, AssembleResult, ChaptersFile};
pub use pipeline::{
    AssembleSummary, CaptureSummary, ProgressReporter, SilentProgress, StageReport,
    TranscribeSummary, assemble_book, capture_book, transcribe_book,
};
pub use stitcher::{StitchedBook, reflow, stitch};
