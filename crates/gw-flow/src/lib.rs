//! Gateway Flow Control
//!
//! Gates how much concurrent work enters the process:
//! - AdmissionController: token budget plus overload oracle for inbound requests
//! - RefillScheduler: smoothed periodic top-up of the token budget
//! - ConsumptionEngine: broker poll loop feeding a bounded DispatchPool
//! - AckCoordinator: per-topic commit-before / commit-after ordering
//! - API: HTTP routes with admission middleware, health checks and metrics

pub mod ack;
pub mod admission;
pub mod api;
pub mod budget;
pub mod engine;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod oracle;
pub mod pool;
pub mod refill;

pub use ack::AckCoordinator;
pub use admission::{AdmissionController, Permit};
pub use budget::TokenBudget;
pub use engine::ConsumptionEngine;
pub use error::{AdmissionError, FlowError, PoolError};
pub use handler::{AckPolicy, FnHandler, Handler, HandlerTable, LoggingHandler, RecordHandler};
pub use oracle::{AdaptiveOracle, AlwaysAdmit, Completion, CompletionFn, Outcome, OverloadOracle};
pub use pool::{DispatchPool, FatalSignal};
pub use refill::RefillScheduler;

pub type Result<T> = std::result::Result<T, FlowError>;
