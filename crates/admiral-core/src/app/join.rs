//! Shared join primitives for fanned-out work.
//!
//! Both are compare-and-set based; whichever branch observes the winning
//! transition acts, every other branch does nothing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Countdown over N branches. `arrive` is true for exactly one caller: the
/// one that brings the count to zero.
#[derive(Debug)]
pub struct FanIn {
    remaining: AtomicUsize,
}

impl FanIn {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
        }
    }

    pub fn arrive(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok_and(|previous| previous == 1)
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Failure latch. `trip` is true only for the first caller.
#[derive(Debug, Default)]
pub struct FailOnce {
    failed: AtomicBool,
}

impl FailOnce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) -> bool {
        self.failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}
