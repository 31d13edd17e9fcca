//! Offset commit ordering around handler execution

use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use gw_common::Record;
use gw_queue::BrokerClient;
use crate::handler::{AckPolicy, Handler};
use crate::metrics;

/// Runs a handler and commits the record's offset before or after it,
/// according to the handler's [`AckPolicy`].
///
/// Commit failures are logged and counted, never retried. A panicking
/// handler unwinds through `process`, so an after-processing commit is
/// skipped and the record stays uncommitted.
pub struct AckCoordinator {
    broker: Arc<dyn BrokerClient>,
    commit_failures: AtomicU64,
}

impl AckCoordinator {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            commit_failures: AtomicU64::new(0),
        }
    }

    pub async fn process(&self, record: Record, handler: &Handler) {
        match handler.ack_policy {
            AckPolicy::BeforeProcessing => {
                self.commit(&record).await;
                self.run(&record, handler).await;
            }
            AckPolicy::AfterProcessing => {
                self.run(&record, handler).await;
                self.commit(&record).await;
            }
        }
    }

    /// Number of commits that failed since creation
    pub fn commit_failures(&self) -> u64 {
        self.commit_failures.load(Ordering::Relaxed)
    }

    async fn run(&self, record: &Record, handler: &Handler) {
        let start = Instant::now();
        handler.handler.handle(record).await;
        metrics::record_record_handled(&record.topic, start.elapsed());
    }

    async fn commit(&self, record: &Record) {
        match self.broker.commit_records(slice::from_ref(record)).await {
            Ok(()) => debug!(position = %record.position(), "Record committed"),
            Err(e) => {
                self.commit_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_commit_failure(&record.topic);
                error!(
                    position = %record.position(),
                    broker = %self.broker.identifier(),
                    error = %e,
                    "Error occurred when committing record"
                );
            }
        }
    }
}
