use bytes::Bytes;
use serde::Serialize;

pub mod logging;

// ============================================================================
// Stream Records
// ============================================================================

/// A record fetched from the message broker.
///
/// Owned by the poller until it is submitted for dispatch, then moved into
/// the worker that runs the topic handler and commits the offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Broker timestamp in milliseconds since the epoch, when known
    pub timestamp_ms: Option<i64>,
}

impl Record {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: value.into(),
            timestamp_ms: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Position of this record, for logging and commit bookkeeping
    pub fn position(&self) -> RecordPosition {
        RecordPosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Topic/partition/offset triple identifying a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl std::fmt::Display for RecordPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

// ============================================================================
// Health
// ============================================================================

/// Coarse health state reported by the health endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_position_display() {
        let record = Record::new("orders", 3, 42, "payload").with_key("k1");
        assert_eq!(record.position().to_string(), "orders[3]@42");
        assert_eq!(record.key.as_deref(), Some(&b"k1"[..]));
    }
}
