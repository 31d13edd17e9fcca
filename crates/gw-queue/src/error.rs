use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Fetch failed for {topic}[{partition}]: {message}")]
    Fetch {
        topic: String,
        partition: i32,
        message: String,
    },

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Produce failed: {0}")]
    Produce(String),

    #[error("Broker client is closed")]
    Closed,

    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for QueueError {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        QueueError::Kafka(e.to_string())
    }
}
