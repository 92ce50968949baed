use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives build progress at coarse granularity.
///
/// `primitives` is the number of primitives in a subtree that has just been handed to a serial task.
/// Across a completed build the reported counts add up to the input size. Returning `false` aborts the build.
pub trait ProgressMonitor: Sync {
    fn progress(&self, primitives: usize) -> bool;
}

impl<F> ProgressMonitor for F
where
    F: Fn(usize) -> bool + Sync,
{
    #[inline]
    fn progress(&self, primitives: usize) -> bool {
        self(primitives)
    }
}

/// Monitor that never aborts.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressMonitor for NoProgress {
    #[inline]
    fn progress(&self, _primitives: usize) -> bool {
        true
    }
}

/// Shared flag that requests an in-flight build to stop.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl PartialEq for CancellationToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
