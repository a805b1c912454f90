//! Session sequence numbers for cooperative cancellation.
//!
//! Multi-step operations take a [`SessionToken`] at entry and check it after
//! every await. Anything that changes the active room, call or peer bumps the
//! counter, so older operations notice they are stale and drop their results.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default)]
pub struct SessionCounter {
    current: Arc<AtomicU64>,
}

impl SessionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate every outstanding token and return a fresh one.
    pub fn advance(&self) -> SessionToken {
        let epoch = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        SessionToken {
            epoch,
            current: self.current.clone(),
        }
    }

    /// A token for the current epoch.
    pub fn token(&self) -> SessionToken {
        SessionToken {
            epoch: self.current.load(Ordering::SeqCst),
            current: self.current.clone(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SessionToken {
    epoch: u64,
    current: Arc<AtomicU64>,
}

impl SessionToken {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.epoch
    }

    pub fn is_stale(&self) -> bool {
        !self.is_current()
    }
}
