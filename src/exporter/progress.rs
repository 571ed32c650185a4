//! Observational progress reporting.

/// Phase of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Started,
    Completed,
}

/// Observational sink for export progress.
///
/// Implementations should return quickly; the exporter calls this inline
/// between blob copies.
pub trait ProgressSink: Send + Sync {
    /// Report that the step identified by `id` started or completed.
    fn status(&self, id: &str, state: ProgressState);
}

/// A progress sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn status(&self, _id: &str, _state: ProgressState) {}
}
