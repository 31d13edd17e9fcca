//! Request admission: token budget layered with an overload oracle

use std::sync::Arc;

use tokio::time::Instant;

use gw_config::{AdmissionConfig, MAX_TICKS_PER_SECOND};
use crate::budget::TokenBudget;
use crate::error::{AdmissionError, FlowError};
use crate::metrics;
use crate::oracle::{AdaptiveOracle, AlwaysAdmit, Completion, CompletionFn, Outcome, OverloadOracle};
use crate::refill::RefillScheduler;
use crate::Result;

/// Gate in front of inbound request handling.
///
/// `allow` first takes a token from the budget; only when one was available
/// is the oracle consulted. Tokens are not returned when work completes, the
/// refill scheduler is the only source of new tokens.
pub struct AdmissionController {
    budget: Arc<TokenBudget>,
    oracle: Arc<dyn OverloadOracle>,
    ticks_per_second: u32,
}

impl AdmissionController {
    pub fn new(
        requests_per_second: u64,
        ticks_per_second: u32,
        oracle: Arc<dyn OverloadOracle>,
    ) -> Result<Self> {
        if ticks_per_second == 0 || ticks_per_second > MAX_TICKS_PER_SECOND {
            return Err(FlowError::Config(format!(
                "ticks_per_second must be between 1 and {}",
                MAX_TICKS_PER_SECOND
            )));
        }
        if requests_per_second < u64::from(ticks_per_second) {
            return Err(FlowError::Config(format!(
                "requests_per_second must not be less than {}",
                ticks_per_second
            )));
        }
        let capacity = i64::try_from(requests_per_second).map_err(|_| {
            FlowError::Config(format!("requests_per_second {} is too large", requests_per_second))
        })?;

        Ok(Self {
            budget: Arc::new(TokenBudget::new(capacity)),
            oracle,
            ticks_per_second,
        })
    }

    /// Build from configuration, choosing the oracle by `admission.oracle`
    pub fn from_config(config: &AdmissionConfig) -> Result<Self> {
        let oracle: Arc<dyn OverloadOracle> = match config.oracle.as_str() {
            "adaptive" => Arc::new(AdaptiveOracle::new(config.adaptive.clone())),
            "none" => Arc::new(AlwaysAdmit),
            other => {
                return Err(FlowError::Config(format!("unknown overload oracle '{}'", other)));
            }
        };
        Self::new(config.requests_per_second, config.ticks_per_second, oracle)
    }

    /// Decide whether one request may proceed. Never blocks.
    pub fn allow(&self) -> std::result::Result<Permit, AdmissionError> {
        if !self.budget.try_acquire() {
            metrics::record_admission(AdmissionError::QuotaExhausted.reason());
            return Err(AdmissionError::QuotaExhausted);
        }

        match self.oracle.try_admit() {
            Ok(completion) => {
                metrics::record_admission("admitted");
                Ok(Permit {
                    completion: Some(completion),
                    started: Instant::now(),
                })
            }
            Err(e) => {
                metrics::record_admission(e.reason());
                Err(e)
            }
        }
    }

    /// Scheduler that keeps this controller's budget topped up
    pub fn refill_scheduler(&self) -> RefillScheduler {
        RefillScheduler::new(Arc::clone(&self.budget), self.ticks_per_second)
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn oracle_name(&self) -> &'static str {
        self.oracle.name()
    }
}

/// Grant for one admitted request.
///
/// Must be completed with the request's outcome; a permit dropped without
/// `complete` reports [`Outcome::Cancelled`].
pub struct Permit {
    completion: Option<CompletionFn>,
    started: Instant,
}

impl Permit {
    pub fn complete(mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Outcome) {
        if let Some(completion) = self.completion.take() {
            completion(Completion {
                outcome,
                latency: self.started.elapsed(),
            });
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.finish(Outcome::Cancelled);
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("completed", &self.completion.is_none())
            .field("started", &self.started)
            .finish()
    }
}
