//! In-process broker for development mode and tests.
//!
//! Keeps an append-only log per topic partition, a read cursor per
//! partition, and the committed offset per partition. Faults can be
//! injected into the next fetch or the next commits.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use gw_common::Record;
use crate::{next_offsets, BrokerClient, Fetches, QueueError, RecordProducer, Result};

type PartitionKey = (String, i32);

#[derive(Default)]
struct BrokerState {
    logs: BTreeMap<PartitionKey, Vec<Record>>,
    /// Next offset the consumer will read per partition
    cursors: BTreeMap<PartitionKey, i64>,
    /// Next offset to resume from after a restart
    committed: BTreeMap<PartitionKey, i64>,
    pending_fetch_errors: VecDeque<QueueError>,
    failing_commits: usize,
    closed: bool,
}

/// In-memory broker implementing both the consumer and producer sides
pub struct MemoryBroker {
    identifier: String,
    topics: Vec<String>,
    partitions: i32,
    fetch_wait: Duration,
    max_poll_records: usize,
    state: Mutex<BrokerState>,
    data_ready: Notify,
    round_robin: AtomicU64,
    total_commits: AtomicU64,
}

impl MemoryBroker {
    pub const DEFAULT_FETCH_WAIT: Duration = Duration::from_millis(100);
    pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;

    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identifier: "memory".to_string(),
            topics: topics.into_iter().map(Into::into).collect(),
            partitions: 1,
            fetch_wait: Self::DEFAULT_FETCH_WAIT,
            max_poll_records: Self::DEFAULT_MAX_POLL_RECORDS,
            state: Mutex::new(BrokerState::default()),
            data_ready: Notify::new(),
            round_robin: AtomicU64::new(0),
            total_commits: AtomicU64::new(0),
        }
    }

    pub fn with_partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn with_fetch_wait(mut self, fetch_wait: Duration) -> Self {
        self.fetch_wait = fetch_wait;
        self
    }

    pub fn with_max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.max_poll_records = max_poll_records.max(1);
        self
    }

    /// Append a record. Keyed records hash to a stable partition, unkeyed
    /// records are spread round-robin.
    pub fn publish(&self, topic: &str, key: Option<Bytes>, value: impl Into<Bytes>) -> Record {
        let partition = match &key {
            Some(k) => (fnv1a(k) % self.partitions as u64) as i32,
            None => (self.round_robin.fetch_add(1, Ordering::Relaxed) % self.partitions as u64) as i32,
        };

        let record = {
            let mut state = self.state.lock();
            let log = state.logs.entry((topic.to_string(), partition)).or_default();
            let record = Record {
                topic: topic.to_string(),
                partition,
                offset: log.len() as i64,
                key,
                value: value.into(),
                timestamp_ms: None,
            };
            log.push(record.clone());
            record
        };

        self.data_ready.notify_one();
        record
    }

    /// Make the next poll fail with the given error
    pub fn inject_fetch_error(&self, topic: &str, partition: i32, message: &str) {
        self.state.lock().pending_fetch_errors.push_back(QueueError::Fetch {
            topic: topic.to_string(),
            partition,
            message: message.to_string(),
        });
        self.data_ready.notify_one();
    }

    /// Make the next `count` commit calls fail
    pub fn fail_next_commits(&self, count: usize) {
        self.state.lock().failing_commits = count;
    }

    /// Committed resume offset for a partition, if anything was committed
    pub fn committed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state.lock().committed.get(&(topic.to_string(), partition)).copied()
    }

    /// Number of successful commit calls
    pub fn total_commits(&self) -> u64 {
        self.total_commits.load(Ordering::SeqCst)
    }

    /// Records appended but not yet handed out by a poll
    pub fn pending_records(&self) -> usize {
        let state = self.state.lock();
        state
            .logs
            .iter()
            .map(|(key, log)| {
                let cursor = state.cursors.get(key).copied().unwrap_or(0);
                log.len().saturating_sub(cursor as usize)
            })
            .sum()
    }

    /// Simulate a consumer restart: resume every partition from its
    /// committed offset, redelivering anything fetched but not committed.
    pub fn rewind_to_committed(&self) {
        let mut state = self.state.lock();
        let keys: Vec<PartitionKey> = state.logs.keys().cloned().collect();
        for key in keys {
            let committed = state.committed.get(&key).copied().unwrap_or(0);
            state.cursors.insert(key, committed);
        }
        drop(state);
        self.data_ready.notify_one();
    }

    fn take_batch(&self) -> Option<Fetches> {
        let mut state = self.state.lock();

        if let Some(error) = state.pending_fetch_errors.pop_front() {
            return Some(Fetches::from_error(error));
        }
        if state.closed {
            return Some(Fetches::from_error(QueueError::Closed));
        }

        let mut records = Vec::new();
        let keys: Vec<PartitionKey> = state
            .logs
            .keys()
            .filter(|(topic, _)| self.topics.iter().any(|t| t == topic))
            .cloned()
            .collect();

        for key in keys {
            if records.len() >= self.max_poll_records {
                break;
            }
            let cursor = state.cursors.get(&key).copied().unwrap_or(0);
            let available = match state.logs.get(&key) {
                Some(log) => &log[(cursor as usize).min(log.len())..],
                None => continue,
            };
            let take = available.len().min(self.max_poll_records - records.len());
            records.extend_from_slice(&available[..take]);
            state.cursors.insert(key, cursor + take as i64);
        }

        if records.is_empty() {
            None
        } else {
            Some(Fetches::from_records(records))
        }
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn topics(&self) -> &[String] {
        &self.topics
    }

    async fn poll_fetches(&self) -> Fetches {
        if let Some(fetches) = self.take_batch() {
            return fetches;
        }

        let _ = tokio::time::timeout(self.fetch_wait, self.data_ready.notified()).await;
        self.take_batch().unwrap_or_default()
    }

    async fn commit_records(&self, records: &[Record]) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(QueueError::Commit("injected commit failure".to_string()));
        }

        for ((topic, partition), next) in next_offsets(records) {
            debug!(topic = %topic, partition, offset = next, "Committed offset");
            state.committed.insert((topic, partition), next);
        }
        self.total_commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
        self.data_ready.notify_one();
    }
}

#[async_trait]
impl RecordProducer for MemoryBroker {
    async fn produce(&self, topic: &str, key: Option<Bytes>, value: Bytes) -> Result<(i32, i64)> {
        if self.state.lock().closed {
            return Err(QueueError::Closed);
        }
        let record = self.publish(topic, key, value);
        Ok((record.partition, record.offset))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_returns_published_records_in_order() {
        let broker = MemoryBroker::new(["audit"]);
        broker.publish("audit", None, "a");
        broker.publish("audit", None, "b");

        let fetches = broker.poll_fetches().await;
        assert!(fetches.errors().is_empty());
        let offsets: Vec<i64> = fetches.records().iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1]);
        assert_eq!(broker.pending_records(), 0);
    }

    #[tokio::test]
    async fn test_idle_poll_wakes_on_publish() {
        let broker = MemoryBroker::new(["audit"]).with_fetch_wait(Duration::from_secs(30));
        let mut poll = tokio_test::task::spawn(broker.poll_fetches());
        tokio_test::assert_pending!(poll.poll());

        broker.publish("audit", None, "a");
        assert!(poll.is_woken());
        let fetches = tokio_test::assert_ready!(poll.poll());
        assert_eq!(fetches.records().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_topics_are_not_fetched() {
        let broker = MemoryBroker::new(["audit"]).with_fetch_wait(Duration::from_millis(5));
        broker.publish("other", None, "x");

        let fetches = broker.poll_fetches().await;
        assert!(fetches.is_empty());
    }

    #[tokio::test]
    async fn test_commit_overwrites_previous_offset() {
        let broker = MemoryBroker::new(["audit"]);
        let first = broker.publish("audit", None, "a");
        let second = broker.publish("audit", None, "b");

        broker.commit_records(&[first.clone(), second.clone()]).await.unwrap();
        assert_eq!(broker.committed_offset("audit", 0), Some(2));

        // An out-of-order ack moves the committed offset back
        broker.commit_records(&[second]).await.unwrap();
        broker.commit_records(&[first]).await.unwrap();
        assert_eq!(broker.committed_offset("audit", 0), Some(1));
        assert_eq!(broker.total_commits(), 3);

        broker.rewind_to_committed();
        let redelivered = broker.poll_fetches().await.into_records();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].offset, 1);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let broker = MemoryBroker::new(["audit"]);
        let record = broker.publish("audit", None, "a");

        broker.inject_fetch_error("audit", 0, "leader not available");
        let fetches = broker.poll_fetches().await;
        assert_eq!(fetches.errors().len(), 1);
        assert!(fetches.records().is_empty());

        broker.fail_next_commits(1);
        assert!(broker.commit_records(&[record.clone()]).await.is_err());
        assert!(broker.commit_records(&[record]).await.is_ok());
    }

    #[tokio::test]
    async fn test_rewind_redelivers_uncommitted_records() {
        let broker = MemoryBroker::new(["audit"]);
        broker.publish("audit", None, "a");
        broker.publish("audit", None, "b");

        let fetched = broker.poll_fetches().await.into_records();
        broker.commit_records(&fetched[..1]).await.unwrap();
        broker.rewind_to_committed();

        let redelivered = broker.poll_fetches().await.into_records();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].offset, 1);
    }

    #[tokio::test]
    async fn test_keyed_records_stick_to_one_partition() {
        let broker = MemoryBroker::new(["audit"]).with_partitions(4);
        let a = broker.publish("audit", Some(Bytes::from_static(b"user-1")), "a");
        let b = broker.publish("audit", Some(Bytes::from_static(b"user-1")), "b");
        assert_eq!(a.partition, b.partition);
        assert_eq!(b.offset, a.offset + 1);
    }
}
