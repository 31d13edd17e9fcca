//! Kafka broker client backed by librdkafka.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use gw_common::Record;
use gw_config::BrokerConfig;
use crate::{next_offsets, BrokerClient, Fetches, QueueError, RecordProducer, Result};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer-group member with manual commits plus a producer sharing the
/// same broker settings
pub struct KafkaBroker {
    identifier: String,
    topics: Vec<String>,
    max_poll_records: usize,
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
}

impl KafkaBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let addrs: Vec<&str> = config
            .addrs
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect();
        if addrs.is_empty() {
            return Err(QueueError::Config("empty broker address list".to_string()));
        }

        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", addrs.join(","));
        if !config.user.is_empty() {
            client_config
                .set("security.protocol", "SASL_PLAINTEXT")
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", &config.user)
                .set("sasl.password", &config.password);
        }

        let consumer: StreamConsumer = client_config
            .clone()
            .set("group.id", &config.group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", (config.session_timeout_secs * 1000).to_string())
            .set("fetch.min.bytes", config.fetch_min_bytes.to_string())
            .set("fetch.max.bytes", config.fetch_max_bytes.to_string())
            .set("fetch.wait.max.ms", config.fetch_max_wait_ms.to_string())
            .create()?;

        if !config.topics.is_empty() {
            let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
            consumer.subscribe(&topics)?;
        }

        let producer: FutureProducer = client_config
            .set("message.timeout.ms", PRODUCE_TIMEOUT.as_millis().to_string())
            .create()?;

        info!(
            brokers = %addrs.join(","),
            group = %config.group,
            topics = ?config.topics,
            "Kafka broker client created"
        );

        Ok(Self {
            identifier: format!("kafka:{}", config.group),
            topics: config.topics.clone(),
            max_poll_records: config.max_poll_records.max(1),
            consumer: Arc::new(consumer),
            producer,
        })
    }

    fn to_record<M: Message>(msg: &M) -> Record {
        Record {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(Bytes::copy_from_slice),
            value: msg.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
            timestamp_ms: msg.timestamp().to_millis(),
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn topics(&self) -> &[String] {
        &self.topics
    }

    async fn poll_fetches(&self) -> Fetches {
        let mut records = Vec::new();
        let mut errors = Vec::new();

        // Wait for the first message, then drain whatever is already buffered
        let mut wait = POLL_TIMEOUT;
        while records.len() < self.max_poll_records {
            match tokio::time::timeout(wait, self.consumer.recv()).await {
                Ok(Ok(msg)) => records.push(Self::to_record(&msg)),
                Ok(Err(e)) => {
                    errors.push(QueueError::Kafka(e.to_string()));
                    break;
                }
                Err(_) => break,
            }
            wait = Duration::ZERO;
        }

        Fetches::new(records, errors)
    }

    async fn commit_records(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in next_offsets(records) {
            tpl.add_partition_offset(&topic, partition, Offset::Offset(offset))?;
        }
        let partitions = tpl.count();

        // Synchronous so broker-side rejections (rebalance, stale generation)
        // surface here instead of being dropped by librdkafka
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| QueueError::Commit(format!("commit task failed: {}", e)))?
            .map_err(|e| QueueError::Commit(e.to_string()))?;

        debug!(partitions, "Committed offsets");
        Ok(())
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
        if let Err(e) = rdkafka::producer::Producer::flush(&self.producer, Timeout::After(PRODUCE_TIMEOUT)) {
            warn!(error = %e, "Failed to flush producer on close");
        }
        info!(identifier = %self.identifier, "Kafka broker client closed");
    }
}

#[async_trait]
impl RecordProducer for KafkaBroker {
    async fn produce(&self, topic: &str, key: Option<Bytes>, value: Bytes) -> Result<(i32, i64)> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic).payload(value.as_ref());
        if let Some(key) = key.as_deref() {
            record = record.key(key);
        }

        self.producer
            .send(record, Timeout::After(PRODUCE_TIMEOUT))
            .await
            .map_err(|(e, _)| QueueError::Produce(e.to_string()))
    }
}
