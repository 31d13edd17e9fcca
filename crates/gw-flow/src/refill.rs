//! Periodic top-up of the admission token budget

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use gw_config::MAX_TICKS_PER_SECOND;
use crate::budget::TokenBudget;
use crate::metrics;

/// Refills a [`TokenBudget`] toward capacity in `ticks_per_second` equal
/// slices, so the budget recovers smoothly instead of in one burst per second.
pub struct RefillScheduler {
    budget: Arc<TokenBudget>,
    ticks_per_second: u32,
    step: i64,
}

impl RefillScheduler {
    pub fn new(budget: Arc<TokenBudget>, ticks_per_second: u32) -> Self {
        let ticks_per_second = ticks_per_second.clamp(1, MAX_TICKS_PER_SECOND);
        let step = budget.capacity() / i64::from(ticks_per_second);
        Self {
            budget,
            ticks_per_second,
            step,
        }
    }

    /// Tokens added per tick at most
    pub fn step(&self) -> i64 {
        self.step
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.ticks_per_second
    }

    /// Apply one tick. Returns the number of tokens added.
    pub fn tick(&self) -> i64 {
        let added = self.budget.refill(self.step);
        if added > 0 {
            metrics::record_tokens_refilled(added);
        }
        added
    }

    /// Run until the token is cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of an interval completes immediately
        ticker.tick().await;

        info!(
            ticks_per_second = self.ticks_per_second,
            step = self.step,
            capacity = self.budget.capacity(),
            "Token refill started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        debug!("Token refill stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
