/// Cooperative cancellation and status/progress notifications
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared abort flag checked between stars and between groups.
///
/// Cloning shares the underlying flag, so a UI thread (or a progress
/// callback) can request an abort while a long loop is running.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that running loops stop at their next yield point
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear a previous request before starting a new run
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// How a long-running loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunOutcome {
    Completed,
    /// Stopped early on request after `processed` items
    Aborted { processed: usize },
}

impl RunOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, RunOutcome::Aborted { .. })
    }
}

/// Fire-and-forget status and progress notifications.
///
/// Progress updates are also the loops' yield points: a sink may request
/// an abort from inside `on_progress_update`.
pub trait StatusSink {
    fn on_status_update(&self, _status: &str) {}

    /// `total == 0` means indeterminate progress
    fn on_progress_update(&self, _current: usize, _total: usize) {}
}

/// Default sink: status lines go to the log, progress is dropped
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn on_status_update(&self, status: &str) {
        tracing::info!("Status: {}", status);
    }

    fn on_progress_update(&self, current: usize, total: usize) {
        if total > 0 {
            tracing::trace!("Progress: {}/{}", current, total);
        }
    }
}
