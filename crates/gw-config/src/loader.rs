//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "gateway.toml",
    "config.toml",
    "./config/gateway.toml",
    "/etc/gateway/gateway.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate it.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |key| env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("GATEWAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply overrides from a variable lookup (the process environment in
/// production). List-valued variables hold JSON arrays and fail loudly when
/// malformed.
pub(crate) fn apply_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // HTTP
    if let Some(val) = lookup("HTTP_ADDR") {
        config.http.addr = normalize_addr(&val);
    }
    if let Some(val) = lookup("HTTP_TIMEOUT_MS") {
        config.http.request_timeout_ms = parse_number("HTTP_TIMEOUT_MS", &val)?;
    }

    // Admission
    if let Some(val) = lookup("GATEWAY_ADMISSION_ENABLED") {
        config.admission.enabled = val.parse().unwrap_or(true);
    }
    if let Some(val) = lookup("GATEWAY_RATE_LIMIT") {
        config.admission.requests_per_second = parse_number("GATEWAY_RATE_LIMIT", &val)?;
    }
    if let Some(val) = lookup("GATEWAY_OVERLOAD_ORACLE") {
        config.admission.oracle = val;
    }

    // Broker
    if let Some(val) = lookup("BROKER_KIND") {
        config.broker.kind = val;
    }
    if let Some(val) = lookup("KAFKA_ADDRS") {
        config.broker.addrs = parse_json_list("KAFKA_ADDRS", &val)?;
    }
    if let Some(val) = lookup("KAFKA_TOPICS") {
        config.broker.topics = parse_json_list("KAFKA_TOPICS", &val)?;
    }
    if let Some(val) = lookup("KAFKA_GROUP") {
        config.broker.group = val;
    }
    if let Some(val) = lookup("KAFKA_USER") {
        config.broker.user = val;
    }
    if let Some(val) = lookup("KAFKA_PASSWORD") {
        config.broker.password = val;
    }

    // Consumer
    if let Some(val) = lookup("CONSUMER_MAX_WORKERS") {
        config.consumer.max_workers = parse_number("CONSUMER_MAX_WORKERS", &val)?;
    }

    // Metrics
    if let Some(val) = lookup("METRICS_ENABLED") {
        config.metrics.enabled = val.parse().unwrap_or(true);
    }
    if let Some(val) = lookup("METRICS_REQUESTS_COUNTER_NAME") {
        config.metrics.requests_counter_name = val;
    }
    if let Some(val) = lookup("METRICS_SECONDS_HISTOGRAM_NAME") {
        config.metrics.seconds_histogram_name = val;
    }

    Ok(())
}

/// Accept bare ":8080" listen addresses
fn normalize_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, val: &str) -> Result<T, ConfigError> {
    val.trim()
        .parse()
        .map_err(|_| ConfigError::EnvError(format!("{} is not a valid number: '{}'", key, val)))
}

fn parse_json_list(key: &str, val: &str) -> Result<Vec<String>, ConfigError> {
    serde_json::from_str::<Vec<String>>(val)
        .map_err(|e| ConfigError::EnvError(format!("error occurred when unmarshalling {}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_kafka_env_overrides() {
        let mut config = AppConfig::default();
        apply_overrides(
            &mut config,
            lookup_from(&[
                ("KAFKA_ADDRS", r#"["broker-1:9092","broker-2:9092"]"#),
                ("KAFKA_TOPICS", r#"["audit"]"#),
                ("KAFKA_GROUP", "gateway"),
                ("HTTP_ADDR", ":9000"),
            ]),
        )
        .unwrap();

        assert_eq!(config.broker.addrs, vec!["broker-1:9092", "broker-2:9092"]);
        assert_eq!(config.broker.topics, vec!["audit"]);
        assert_eq!(config.broker.group, "gateway");
        assert_eq!(config.http.addr, "0.0.0.0:9000");
    }

    #[test]
    fn test_malformed_address_list_is_an_error() {
        let mut config = AppConfig::default();
        let err = apply_overrides(&mut config, lookup_from(&[("KAFKA_ADDRS", "broker-1:9092")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EnvError(_)));
        assert!(err.to_string().contains("KAFKA_ADDRS"));
    }

    #[test]
    fn test_bad_number_is_an_error() {
        let mut config = AppConfig::default();
        let err = apply_overrides(&mut config, lookup_from(&[("GATEWAY_RATE_LIMIT", "fast")]))
            .unwrap_err();
        assert!(err.to_string().contains("GATEWAY_RATE_LIMIT"));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [admission]
            requests_per_second = 200
            ticks_per_second = 20

            [consumer]
            max_workers = 16
            "#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.admission.requests_per_second, 200);
        assert_eq!(config.admission.ticks_per_second, 20);
        assert_eq!(config.consumer.max_workers, 16);
        assert_eq!(config.http.request_timeout_ms, 1000);
    }
}
