//! Progress reporting for extraction.
//!
//! The extractor counts pages against a [`ProgressCallback`] so the CLI can
//! draw a bar while tests and scheduled runs use [`NullProgress`].

/// Receives page-level progress from long-running operations.
pub trait ProgressCallback: Send + Sync {
    /// Total units of work, once known.
    fn set_total(&self, total: u64);

    /// Advance by `delta` units.
    fn inc(&self, delta: u64);

    fn set_message(&self, msg: String);

    /// Mark progress complete with a final message.
    fn finish(&self, msg: String);
}

/// Ignores all progress updates.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

