//! Cooperative cancellation shared between async callers and blocking decode work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use truvlm::Stage;

use crate::error::{Result, VideoError};

/// Cancellation flag checked at frame and backend-call boundaries.
///
/// A child flag observes its ancestors, so cancelling a request also
/// cancels every decode attempt spawned for it, while a timed-out attempt
/// can be cancelled without touching the request.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.ancestors.iter().any(|a| a.load(Ordering::SeqCst))
    }

    pub fn child(&self) -> CancelFlag {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.flag));
        CancelFlag {
            flag: Arc::new(AtomicBool::new(false)),
            ancestors,
        }
    }

    pub fn check(&self, stage: Stage) -> Result<()> {
        if self.is_cancelled() {
            Err(VideoError::Cancelled(stage))
        } else {
            Ok(())
        }
    }
}
