//! Overload oracles
//!
//! An oracle decides whether the process can take on one more unit of work
//! and learns from how each admitted unit finished. Two implementations:
//!
//! - [`AlwaysAdmit`]: never rejects; used when overload protection is off
//! - [`AdaptiveOracle`]: AIMD concurrency limit driven by observed latency
//!   and failures

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use gw_config::AdaptiveOracleConfig;
use crate::error::AdmissionError;
use crate::metrics;

/// How an admitted unit of work ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Abandoned before it produced a result (e.g. client went away)
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// Report delivered to the oracle once per admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub outcome: Outcome,
    pub latency: Duration,
}

/// Called exactly once with the result of an admitted unit of work
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send>;

pub trait OverloadOracle: Send + Sync {
    /// Admit one unit of work or reject it with `OverloadRejected`
    fn try_admit(&self) -> Result<CompletionFn, AdmissionError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Oracle that admits everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAdmit;

impl OverloadOracle for AlwaysAdmit {
    fn try_admit(&self) -> Result<CompletionFn, AdmissionError> {
        Ok(Box::new(|_| {}))
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Latencies at or below this never count as overload
const LATENCY_FLOOR: Duration = Duration::from_millis(1);

struct AimdState {
    limit: f64,
    /// EWMA of successful request latency, in seconds
    baseline: Option<f64>,
}

struct AdaptiveInner {
    config: AdaptiveOracleConfig,
    in_flight: AtomicU64,
    /// Mirror of `state.limit` for the lock-free admission path
    limit: AtomicU64,
    state: Mutex<AimdState>,
}

/// Concurrency limiter with additive increase and multiplicative decrease.
///
/// Admission succeeds while in-flight work is below the current limit. Each
/// successful completion whose latency stays within `latency_tolerance` of
/// the smoothed baseline raises the limit by one; a failure or a slow
/// completion multiplies it by `backoff_ratio`. The limit always stays in
/// `[min_limit, max_limit]`.
#[derive(Clone)]
pub struct AdaptiveOracle {
    inner: Arc<AdaptiveInner>,
}

impl AdaptiveOracle {
    pub fn new(config: AdaptiveOracleConfig) -> Self {
        let min = config.min_limit.max(1);
        let max = config.max_limit.max(min);
        let initial = config.initial_limit.clamp(min, max);
        let config = AdaptiveOracleConfig {
            min_limit: min,
            max_limit: max,
            initial_limit: initial,
            ..config
        };

        metrics::set_oracle_limit(initial);

        Self {
            inner: Arc::new(AdaptiveInner {
                config,
                in_flight: AtomicU64::new(0),
                limit: AtomicU64::new(initial),
                state: Mutex::new(AimdState {
                    limit: initial as f64,
                    baseline: None,
                }),
            }),
        }
    }

    pub fn limit(&self) -> u64 {
        self.inner.limit.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> u64 {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Smoothed latency of healthy completions, once one was observed
    pub fn baseline(&self) -> Option<Duration> {
        self.inner.state.lock().baseline.map(Duration::from_secs_f64)
    }
}

impl AdaptiveInner {
    fn complete(&self, completion: Completion) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        let mut state = self.state.lock();
        let previous = state.limit;

        match completion.outcome {
            Outcome::Cancelled => return,
            Outcome::Failure => {
                state.limit *= self.config.backoff_ratio;
            }
            Outcome::Success => {
                let latency = completion.latency.as_secs_f64();
                let overloaded = match state.baseline {
                    Some(baseline) => {
                        completion.latency > LATENCY_FLOOR
                            && latency > baseline * self.config.latency_tolerance
                    }
                    None => false,
                };

                let smoothing = self.config.smoothing.clamp(0.0, 1.0);
                state.baseline = Some(match state.baseline {
                    Some(baseline) => baseline + smoothing * (latency - baseline),
                    None => latency,
                });

                if overloaded {
                    state.limit *= self.config.backoff_ratio;
                } else {
                    state.limit += 1.0;
                }
            }
        }

        state.limit = state
            .limit
            .clamp(self.config.min_limit as f64, self.config.max_limit as f64);
        let limit = state.limit.floor() as u64;
        self.limit.store(limit, Ordering::Release);

        if state.limit < previous {
            debug!(
                previous = previous.floor() as u64,
                limit,
                outcome = completion.outcome.as_str(),
                latency_ms = completion.latency.as_millis() as u64,
                "Overload oracle backed off"
            );
        }
        metrics::set_oracle_limit(limit);
    }
}

impl OverloadOracle for AdaptiveOracle {
    fn try_admit(&self) -> Result<CompletionFn, AdmissionError> {
        let inner = &self.inner;
        let mut current = inner.in_flight.load(Ordering::Acquire);
        loop {
            if current >= inner.limit.load(Ordering::Acquire) {
                return Err(AdmissionError::OverloadRejected);
            }
            match inner.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let inner = Arc::clone(&self.inner);
        Ok(Box::new(move |completion| inner.complete(completion)))
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}
