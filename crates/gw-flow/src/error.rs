use std::time::Duration;

use thiserror::Error;

/// Why a request was not admitted
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// The per-process token budget is empty
    #[error("request quota exhausted")]
    QuotaExhausted,

    /// The overload oracle judged the process saturated
    #[error("request rejected by overload protection")]
    OverloadRejected,
}

impl AdmissionError {
    /// Stable machine-readable reason, used in 429 bodies and metric labels
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::QuotaExhausted => "quota_exhausted",
            AdmissionError::OverloadRejected => "overload_rejected",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("no worker became free within {0:?}")]
    SubmitTimeout(Duration),

    #[error("dispatch pool is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No handler registered for consumed topic '{0}'")]
    MissingHandler(String),

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Queue error: {0}")]
    Queue(#[from] gw_queue::QueueError),
}

impl From<gw_config::ConfigError> for FlowError {
    fn from(e: gw_config::ConfigError) -> Self {
        FlowError::Config(e.to_string())
    }
}
