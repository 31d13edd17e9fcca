//! Gateway Configuration System
//!
//! TOML-based configuration with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Worker cap used when `consumer.max_workers` is left at 0
pub const DEFAULT_MAX_WORKERS: usize = 10_000;

/// Highest accepted refill tick frequency
pub const MAX_TICKS_PER_SECOND: u32 = 1000;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub admission: AdmissionConfig,
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub metrics: MetricsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address (`host:port`)
    pub addr: String,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            request_timeout_ms: 1000,
        }
    }
}

/// Inbound request admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub enabled: bool,
    /// Steady-state admitted requests per second (also the burst capacity)
    pub requests_per_second: u64,
    /// Refill ticks per second; each tick adds at most rps / ticks tokens
    pub ticks_per_second: u32,
    /// Overload oracle: "adaptive" or "none"
    pub oracle: String,
    pub adaptive: AdaptiveOracleConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 50,
            ticks_per_second: 10,
            oracle: "adaptive".to_string(),
            adaptive: AdaptiveOracleConfig::default(),
        }
    }
}

/// Tuning for the adaptive (AIMD) overload oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveOracleConfig {
    pub initial_limit: u64,
    pub min_limit: u64,
    pub max_limit: u64,
    /// Latency above baseline * tolerance counts as overload
    pub latency_tolerance: f64,
    /// Multiplier applied to the limit on overload (0..1)
    pub backoff_ratio: f64,
    /// EWMA weight of new latency samples (0..1)
    pub smoothing: f64,
}

impl Default for AdaptiveOracleConfig {
    fn default() -> Self {
        Self {
            initial_limit: 1000,
            min_limit: 10,
            max_limit: 10_000,
            latency_tolerance: 2.0,
            backoff_ratio: 0.9,
            smoothing: 0.1,
        }
    }
}

/// Message broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker implementation: "memory" or "kafka"
    pub kind: String,
    /// Seed broker addresses
    pub addrs: Vec<String>,
    /// Topics to consume
    pub topics: Vec<String>,
    pub group: String,
    pub user: String,
    pub password: String,
    pub session_timeout_secs: u64,
    pub fetch_min_bytes: u32,
    pub fetch_max_bytes: u32,
    pub fetch_max_wait_ms: u64,
    /// Upper bound on records returned by a single fetch
    pub max_poll_records: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            addrs: Vec::new(),
            topics: Vec::new(),
            group: String::new(),
            user: String::new(),
            password: String::new(),
            session_timeout_secs: 30,
            fetch_min_bytes: 1 << 10,
            fetch_max_bytes: 4 << 20,
            fetch_max_wait_ms: 1,
            max_poll_records: 500,
        }
    }
}

/// Acknowledgment ordering for a consumed topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Commit the offset before running the handler
    Before,
    /// Run the handler, then commit the offset
    After,
}

/// Stream consumption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Maximum in-flight handler workers; 0 selects DEFAULT_MAX_WORKERS
    pub max_workers: usize,
    /// Give up on a blocked submission after this many milliseconds
    pub submit_timeout_ms: Option<u64>,
    /// Ack mode per topic handled by this process
    pub handlers: BTreeMap<String, AckMode>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            submit_timeout_ms: None,
            handlers: BTreeMap::new(),
        }
    }
}

impl ConsumerConfig {
    /// Effective worker cap
    pub fn effective_max_workers(&self) -> usize {
        if self.max_workers == 0 {
            DEFAULT_MAX_WORKERS
        } else {
            self.max_workers
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub requests_counter_name: String,
    pub seconds_histogram_name: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_counter_name: "server_requests_total".to_string(),
            seconds_histogram_name: "server_request_duration_seconds".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Check settings that would leave the process half-configured
    pub fn validate(&self) -> Result<(), ConfigError> {
        let admission = &self.admission;
        if admission.enabled {
            if admission.ticks_per_second == 0 || admission.ticks_per_second > MAX_TICKS_PER_SECOND {
                return Err(ConfigError::ValidationError(format!(
                    "admission.ticks_per_second must be between 1 and {}",
                    MAX_TICKS_PER_SECOND
                )));
            }
            if admission.requests_per_second < u64::from(admission.ticks_per_second) {
                return Err(ConfigError::ValidationError(format!(
                    "admission.requests_per_second must not be less than {}",
                    admission.ticks_per_second
                )));
            }
            match admission.oracle.as_str() {
                "adaptive" | "none" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "unknown admission.oracle '{}' (expected adaptive or none)",
                        other
                    )));
                }
            }
        }

        match self.broker.kind.as_str() {
            "memory" => {}
            "kafka" => {
                if self.broker.addrs.iter().all(|a| a.trim().is_empty()) {
                    return Err(ConfigError::ValidationError(
                        "broker.addrs must contain at least one address".to_string(),
                    ));
                }
                if self.broker.group.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "broker.group must not be empty".to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown broker.kind '{}' (expected memory or kafka)",
                    other
                )));
            }
        }

        if self.broker.max_poll_records == 0 {
            return Err(ConfigError::ValidationError(
                "broker.max_poll_records must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Gateway Configuration
# Environment variables override these settings

[http]
addr = "0.0.0.0:8080"
request_timeout_ms = 1000

[admission]
enabled = true
requests_per_second = 50
ticks_per_second = 10
oracle = "adaptive"  # adaptive or none

[admission.adaptive]
initial_limit = 1000
min_limit = 10
max_limit = 10000
latency_tolerance = 2.0
backoff_ratio = 0.9
smoothing = 0.1

[broker]
kind = "memory"  # memory or kafka
addrs = ["localhost:9092"]
topics = []
group = "gateway"
user = ""
password = ""
session_timeout_secs = 30
fetch_min_bytes = 1024
fetch_max_bytes = 4194304
fetch_max_wait_ms = 1
max_poll_records = 500

[consumer]
max_workers = 0  # 0 = 10000

[consumer.handlers]
# audit = "after"   # commit after the handler ran
# clicks = "before" # commit before the handler runs

[metrics]
enabled = true
requests_counter_name = "server_requests_total"
seconds_histogram_name = "server_request_duration_seconds"
"#
        .to_string()
    }
}
