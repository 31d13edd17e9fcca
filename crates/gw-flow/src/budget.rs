//! Lock-free admission token budget

use std::sync::atomic::{AtomicI64, Ordering};

/// Counter of available admission permits, bounded by `capacity`.
///
/// Both admissions and refills are compare-and-swap updates, so `available`
/// stays within `0..=capacity` at every instant, including while refills
/// race admissions.
#[derive(Debug)]
pub struct TokenBudget {
    available: AtomicI64,
    capacity: i64,
}

impl TokenBudget {
    /// Create a full budget
    pub fn new(capacity: i64) -> Self {
        let capacity = capacity.max(0);
        Self {
            available: AtomicI64::new(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn available(&self) -> i64 {
        self.available.load(Ordering::Acquire)
    }

    /// Take one token. Returns false (leaving the budget unchanged) when empty.
    pub fn try_acquire(&self) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |curr| {
                (curr > 0).then(|| curr - 1)
            })
            .is_ok()
    }

    /// Add up to `max_step` tokens without exceeding capacity.
    /// Returns the number of tokens actually added.
    pub fn refill(&self, max_step: i64) -> i64 {
        let max_step = max_step.max(0);
        loop {
            let curr = self.available.load(Ordering::Acquire);
            let step = (self.capacity - curr).clamp(0, max_step);
            if self
                .available
                .compare_exchange(curr, curr + step, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return step;
            }
        }
    }
}
