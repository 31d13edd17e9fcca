use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use gw_common::Record;

pub mod error;
pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use error::QueueError;
pub use memory::MemoryBroker;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Result of one poll: the records fetched plus any per-partition errors.
///
/// A fetch carrying errors is treated as failed as a whole by the consumer.
#[derive(Debug, Default)]
pub struct Fetches {
    records: Vec<Record>,
    errors: Vec<QueueError>,
}

impl Fetches {
    pub fn new(records: Vec<Record>, errors: Vec<QueueError>) -> Self {
        Self { records, errors }
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        Self { records, errors: Vec::new() }
    }

    pub fn from_error(error: QueueError) -> Self {
        Self { records: Vec::new(), errors: vec![error] }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty()
    }

    pub fn errors(&self) -> &[QueueError] {
        &self.errors
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// Consumer side of a message broker
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Identifier for logs and metrics
    fn identifier(&self) -> &str;

    /// Topics this client is subscribed to
    fn topics(&self) -> &[String];

    /// Fetch the next batch. Waits up to the client's fetch wait when
    /// nothing is available, then returns an empty fetch.
    async fn poll_fetches(&self) -> Fetches;

    /// Commit the given records' offsets (next offset to read = offset + 1).
    ///
    /// Per partition the highest offset in `records` is committed and
    /// replaces whatever was committed before, even a higher one. Records
    /// acked out of order can therefore move a partition's committed offset
    /// backwards; that only causes redelivery, never loss.
    async fn commit_records(&self, records: &[Record]) -> Result<()>;

    /// Leave the group and release broker resources
    async fn close(&self) {}
}

/// Producer side of a message broker
#[async_trait]
pub trait RecordProducer: Send + Sync {
    /// Produce a record and wait for the broker to accept it.
    /// Returns the partition and offset it was written to.
    async fn produce(&self, topic: &str, key: Option<Bytes>, value: Bytes) -> Result<(i32, i64)>;
}

/// Next offset to commit per topic/partition: the highest `offset + 1`
/// among `records`
pub fn next_offsets(records: &[Record]) -> BTreeMap<(String, i32), i64> {
    let mut next = BTreeMap::new();
    for record in records {
        let entry = next
            .entry((record.topic.clone(), record.partition))
            .or_insert(record.offset + 1);
        *entry = (*entry).max(record.offset + 1);
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_offsets_takes_highest_per_partition() {
        let records = vec![
            Record::new("audit", 0, 7, "a"),
            Record::new("audit", 0, 3, "b"),
            Record::new("audit", 1, 0, "c"),
            Record::new("clicks", 0, 41, "d"),
        ];

        let next = next_offsets(&records);
        assert_eq!(next.len(), 3);
        assert_eq!(next[&("audit".to_string(), 0)], 8);
        assert_eq!(next[&("audit".to_string(), 1)], 1);
        assert_eq!(next[&("clicks".to_string(), 0)], 42);
    }
}
