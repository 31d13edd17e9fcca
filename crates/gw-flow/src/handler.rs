//! Record handlers and the per-topic registration table

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use gw_common::Record;
use gw_config::AckMode;

/// Processes one consumed record. A panic is treated as a programming
/// defect and stops the consumer.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &Record);
}

/// When the offset is committed relative to running the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// At-most-once for this topic: a crash mid-handler loses the record
    BeforeProcessing,
    /// At-least-once: the record is redelivered unless the handler finished
    AfterProcessing,
}

impl From<AckMode> for AckPolicy {
    fn from(mode: AckMode) -> Self {
        match mode {
            AckMode::Before => AckPolicy::BeforeProcessing,
            AckMode::After => AckPolicy::AfterProcessing,
        }
    }
}

#[derive(Clone)]
pub struct Handler {
    pub handler: Arc<dyn RecordHandler>,
    pub ack_policy: AckPolicy,
}

impl Handler {
    pub fn new(handler: Arc<dyn RecordHandler>, ack_policy: AckPolicy) -> Self {
        Self { handler, ack_policy }
    }

    pub fn ack_before(handler: Arc<dyn RecordHandler>) -> Self {
        Self::new(handler, AckPolicy::BeforeProcessing)
    }

    pub fn ack_after(handler: Arc<dyn RecordHandler>) -> Self {
        Self::new(handler, AckPolicy::AfterProcessing)
    }
}

/// Topic to handler map, immutable once built
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    pub fn get(&self, topic: &str) -> Option<&Handler> {
        self.handlers.get(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl FromIterator<(String, Handler)> for HandlerTable {
    fn from_iter<I: IntoIterator<Item = (String, Handler)>>(iter: I) -> Self {
        Self {
            handlers: iter.into_iter().collect(),
        }
    }
}

#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<String, Handler>,
}

impl HandlerTableBuilder {
    /// Register a handler; a later registration for the same topic wins
    pub fn register(mut self, topic: impl Into<String>, handler: Handler) -> Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            handlers: self.handlers,
        }
    }
}

/// Adapter turning an async closure over an owned record into a handler
pub struct FnHandler<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> RecordHandler for FnHandler<F, Fut>
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, record: &Record) {
        (self.func)(record.clone()).await
    }
}

/// Handler that only logs what it receives
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl RecordHandler for LoggingHandler {
    async fn handle(&self, record: &Record) {
        info!(
            position = %record.position(),
            bytes = record.value.len(),
            "Record received"
        );
    }
}
