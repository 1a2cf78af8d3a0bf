// Copyright James Carl (C) 2020
// AGPL-3.0-or-later

//! Cooperative cancellation for slow jobs.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Handed to every slow job when it starts. Long running jobs should check it every so often and
/// return early once it has been cancelled. Nothing forces them to.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Ask the job holding this token to stop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once [`CancelToken::cancel`] has been called on this token or any of its clones.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test_cancel {
    use super::*;

    #[test]
    fn clones_share_the_signal() {
        let token = CancelToken::new();
        let copy = token.clone();
        assert!(!copy.is_cancelled());

        token.cancel();
        assert!(copy.is_cancelled());
        assert!(token.is_cancelled());
    }
}
