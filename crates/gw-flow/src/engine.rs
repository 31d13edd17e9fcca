//! Consumption engine: poll loop feeding the dispatch pool

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gw_config::ConsumerConfig;
use gw_queue::{BrokerClient, Fetches};
use crate::ack::AckCoordinator;
use crate::error::{FlowError, PoolError};
use crate::handler::HandlerTable;
use crate::metrics;
use crate::pool::DispatchPool;
use crate::Result;

/// Polls the broker until cancelled and hands each record to a pool worker,
/// which commits and handles it per the topic's ack policy.
pub struct ConsumptionEngine {
    broker: Arc<dyn BrokerClient>,
    handlers: Arc<HandlerTable>,
    coordinator: Arc<AckCoordinator>,
    pool: DispatchPool,
}

impl ConsumptionEngine {
    /// Fails with `MissingHandler` when a consumed topic has no handler
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        handlers: HandlerTable,
        pool: DispatchPool,
    ) -> Result<Self> {
        if let Some(topic) = broker.topics().iter().find(|t| !handlers.contains(t)) {
            return Err(FlowError::MissingHandler(topic.clone()));
        }

        Ok(Self {
            coordinator: Arc::new(AckCoordinator::new(Arc::clone(&broker))),
            broker,
            handlers: Arc::new(handlers),
            pool,
        })
    }

    pub fn from_config(
        broker: Arc<dyn BrokerClient>,
        handlers: HandlerTable,
        config: &ConsumerConfig,
    ) -> Result<Self> {
        let pool = DispatchPool::new(broker.identifier().to_string(), config.effective_max_workers())
            .with_submit_timeout(config.submit_timeout_ms.map(Duration::from_millis));
        Self::new(broker, handlers, pool)
    }

    pub fn pool(&self) -> &DispatchPool {
        &self.pool
    }

    pub fn coordinator(&self) -> &AckCoordinator {
        &self.coordinator
    }

    /// Run the poll loop until `cancel` fires or a worker panics, then
    /// release the pool. Returns `WorkerPanicked` in the latter case.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.broker.topics().is_empty() {
            info!(broker = %self.broker.identifier(), "No topics configured, consumption disabled");
            return Ok(());
        }

        info!(
            broker = %self.broker.identifier(),
            topics = ?self.broker.topics(),
            max_workers = self.pool.max_workers(),
            "Consumption engine started"
        );

        let fatal = self.pool.fatal_signal().clone();
        loop {
            let fetches = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = fatal.tripped() => break,
                fetches = self.broker.poll_fetches() => fetches,
            };
            self.dispatch(fetches).await;
        }

        self.pool.release().await;

        if let Some(message) = fatal.message() {
            error!(broker = %self.broker.identifier(), panic = %message, "Consumption stopped by worker panic");
            return Err(FlowError::WorkerPanicked(message));
        }

        info!(broker = %self.broker.identifier(), "Consumption engine stopped");
        Ok(())
    }

    async fn dispatch(&self, fetches: Fetches) {
        if !fetches.errors().is_empty() {
            for e in fetches.errors() {
                metrics::record_fetch_error();
                error!(broker = %self.broker.identifier(), error = %e, "Error occurred when polling fetches");
            }
            return;
        }

        let records = fetches.into_records();
        if records.is_empty() {
            return;
        }
        debug!(count = records.len(), "Dispatching fetched records");

        for record in records {
            if self.pool.fatal_signal().is_tripped() {
                break;
            }

            let Some(handler) = self.handlers.get(&record.topic).cloned() else {
                warn!(position = %record.position(), "No handler for record topic, skipping");
                continue;
            };

            let topic = record.topic.clone();
            let coordinator = Arc::clone(&self.coordinator);
            let job = async move { coordinator.process(record, &handler).await };

            match self.pool.submit(job).await {
                Ok(()) => metrics::record_record_dispatched(&topic),
                Err(e) => {
                    metrics::record_submit_error(match e {
                        PoolError::SubmitTimeout(_) => "timeout",
                        PoolError::Closed => "closed",
                    });
                    error!(topic = %topic, error = %e, "Error occurred when invoking a dispatch worker");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, LoggingHandler};
    use gw_queue::MemoryBroker;

    #[test]
    fn test_missing_handler_is_rejected() {
        let broker = Arc::new(MemoryBroker::new(["audit", "clicks"]));
        let handlers = HandlerTable::builder()
            .register("audit", Handler::ack_after(Arc::new(LoggingHandler)))
            .build();

        let err = ConsumptionEngine::new(broker, handlers, DispatchPool::new("test", 1))
            .err()
            .unwrap();
        assert!(matches!(err, FlowError::MissingHandler(topic) if topic == "clicks"));
    }

    #[tokio::test]
    async fn test_no_topics_returns_immediately() {
        let broker = Arc::new(MemoryBroker::new(Vec::<String>::new()));
        let engine =
            ConsumptionEngine::new(broker, HandlerTable::default(), DispatchPool::new("test", 1))
                .unwrap();

        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(1), engine.run(cancel))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_from_config_applies_worker_cap() {
        let broker = Arc::new(MemoryBroker::new(["audit"]));
        let handlers = HandlerTable::builder()
            .register("audit", Handler::ack_after(Arc::new(LoggingHandler)))
            .build();
        let config = ConsumerConfig {
            max_workers: 7,
            ..Default::default()
        };

        let engine =
            ConsumptionEngine::from_config(broker.clone(), handlers.clone(), &config).unwrap();
        assert_eq!(engine.pool().max_workers(), 7);

        let engine =
            ConsumptionEngine::from_config(broker, handlers, &ConsumerConfig::default()).unwrap();
        assert_eq!(engine.pool().max_workers(), gw_config::DEFAULT_MAX_WORKERS);
    }
}
