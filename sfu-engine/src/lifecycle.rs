//! Closed-state bookkeeping shared by every entity

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Closed flag with a lock-free fast path and a serialized transition.
///
/// `transition` returns true for exactly one caller, whichever close entry
/// point gets there first.
#[derive(Default)]
pub(crate) struct ClosedFlag {
    closed: AtomicBool,
    lock: Mutex<()>,
}

impl ClosedFlag {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn transition(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let _guard = self.lock.lock();
        if self.is_closed() {
            return false;
        }
        self.closed.store(true, Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_single_transition_under_contention() {
        let flag = Arc::new(ClosedFlag::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flag = Arc::clone(&flag);
                std::thread::spawn(move || flag.transition())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(flag.is_closed());
    }
}
