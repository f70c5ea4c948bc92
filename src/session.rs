//! Board session epochs.
//!
//! Every `connect`/`disconnect` advances the epoch. Work that started under
//! one epoch (a poll, a mutation round-trip) checks its token before touching
//! shared state and drops its result if the session it belonged to is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct SessionEpoch(AtomicU64);

impl SessionEpoch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Start a new epoch, invalidating every outstanding token.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn token(self: &Arc<Self>) -> EpochToken {
        EpochToken {
            epoch: Arc::clone(self),
            value: self.current(),
        }
    }
}

/// Snapshot of the epoch at the time some work started.
#[derive(Debug, Clone)]
pub struct EpochToken {
    epoch: Arc<SessionEpoch>,
    value: u64,
}

impl EpochToken {
    pub fn is_current(&self) -> bool {
        self.epoch.current() == self.value
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_invalidated_by_advance() {
        let epoch = SessionEpoch::new();
        let token = epoch.token();
        assert!(token.is_current());
        assert_eq!(epoch.advance(), 1);
        assert!(!token.is_current());
        assert!(epoch.token().is_current());
    }
}
