//! Cooperative cancellation of migration runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cloneable handle used to request that a run stop.
///
/// The request is checked at phase transitions and between backfill
/// batches. A request arriving while the swap is in progress is only acted
/// upon once the swap has committed.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    requested: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Creates a handle with no pending request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that the run stop.
    pub fn abort(&self) {
        log::info!("Abort requested");
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Whether an abort has been requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_request() {
        let handle = AbortHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_requested());
        handle.abort();
        assert!(clone.is_requested());
    }
}
