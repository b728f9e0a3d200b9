//! dmacam-pipeline: binds a capture stream to a GPU importer and drives the
//! per-frame reclaim/rebind/release/render cycle.

pub mod capture_loop;
pub mod session;

pub use capture_loop::{CaptureLoop, FrameOutcome, LoopStats};
pub use session::Session;
