//! Gateway
//!
//! HTTP gateway with admission control plus an at-least-once stream consumer.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GATEWAY_CONFIG` | - | Path to a TOML config file |
//! | `HTTP_ADDR` | `0.0.0.0:8080` | Listen address (`:port` accepted) |
//! | `GATEWAY_RATE_LIMIT` | `50` | Admitted requests per second |
//! | `GATEWAY_OVERLOAD_ORACLE` | `adaptive` | `adaptive` or `none` |
//! | `BROKER_KIND` | `memory` | `memory` or `kafka` |
//! | `KAFKA_ADDRS` | - | JSON array of seed brokers |
//! | `KAFKA_TOPICS` | - | JSON array of topics to consume |
//! | `KAFKA_GROUP` | - | Consumer group |
//! | `CONSUMER_MAX_WORKERS` | `0` | Handler worker cap (0 = 10000) |
//! | `RUST_LOG` | `info` | Log level |
//! | `LOG_FORMAT` | `text` | `json` for structured output |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gw_config::{AppConfig, BrokerConfig, ConfigLoader, ConsumerConfig};
use gw_flow::api::{create_router, ApiState};
use gw_flow::metrics::PrometheusHandle;
use gw_flow::{AdmissionController, ConsumptionEngine, Handler, HandlerTable, LoggingHandler};
use gw_queue::{BrokerClient, MemoryBroker};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    gw_common::logging::init_logging("gw-gateway");

    info!("Starting Gateway");

    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;

    let shutdown = CancellationToken::new();

    // 1. Metrics
    let prometheus = if config.metrics.enabled {
        match gw_flow::metrics::install_prometheus_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Failed to install Prometheus recorder, metrics disabled");
                None
            }
        }
    } else {
        None
    };

    // 2. Admission control
    let admission = if config.admission.enabled {
        let controller = AdmissionController::from_config(&config.admission)
            .context("invalid admission configuration")?;
        info!(
            requests_per_second = config.admission.requests_per_second,
            oracle = controller.oracle_name(),
            "Admission control enabled"
        );
        Some(Arc::new(controller))
    } else {
        info!("Admission control disabled");
        None
    };
    let refill_handle = admission
        .as_ref()
        .map(|a| a.refill_scheduler().spawn(shutdown.clone()));

    // 3. Broker and consumption engine
    let broker = create_broker(&config.broker)?;
    let handlers = build_handler_table(&config.consumer);
    let engine = ConsumptionEngine::from_config(broker.clone(), handlers, &config.consumer)
        .context("failed to create consumption engine")?;

    let engine_handle = {
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let result = engine.run(cancel.clone()).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        })
    };

    // 4. HTTP server
    let app = create_router(
        api_state(&config, shutdown.clone(), admission, prometheus),
        Duration::from_millis(config.http.request_timeout_ms),
    );
    let listener = TcpListener::bind(&config.http.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http.addr))?;
    info!(addr = %config.http.addr, "HTTP server listening");

    let server_handle = {
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        })
    };

    info!("Gateway started");

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received..."),
        _ = shutdown.cancelled() => warn!("Internal failure, shutting down"),
    }
    shutdown.cancel();

    let engine_result = match tokio::time::timeout(SHUTDOWN_GRACE, engine_handle).await {
        Ok(joined) => engine_outcome(joined),
        Err(_) => {
            warn!("Consumption engine did not stop within the grace period");
            Ok(())
        }
    };

    if let Ok(Ok(Err(e))) = tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await {
        error!(error = %e, "HTTP server error");
    }
    if let Some(handle) = refill_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Token refill task failed");
        }
    }
    broker.close().await;

    engine_result?;

    info!("Gateway shutdown complete");
    Ok(())
}

/// Exit status of the consumption task. A worker panic and a panic of the
/// engine task itself both fail the process.
fn engine_outcome(joined: std::result::Result<gw_flow::Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result.context("consumption engine stopped with an error"),
        Err(e) => {
            error!(error = %e, "Consumption task failed");
            Err(anyhow::Error::new(e).context("consumption task failed"))
        }
    }
}

fn api_state(
    config: &AppConfig,
    shutdown: CancellationToken,
    admission: Option<Arc<AdmissionController>>,
    prometheus: Option<PrometheusHandle>,
) -> ApiState {
    let mut state = ApiState::new(shutdown);
    if let Some(admission) = admission {
        state = state.with_admission(admission);
    }
    if let Some(handle) = prometheus {
        state = state
            .with_prometheus(handle)
            .with_http_metrics(config.metrics.clone());
    }
    state
}

fn create_broker(config: &BrokerConfig) -> Result<Arc<dyn BrokerClient>> {
    match config.kind.as_str() {
        "memory" => {
            info!(topics = ?config.topics, "Using in-memory broker");
            Ok(Arc::new(
                MemoryBroker::new(config.topics.clone())
                    .with_max_poll_records(config.max_poll_records),
            ))
        }
        #[cfg(feature = "kafka")]
        "kafka" => {
            let broker = gw_queue::kafka::KafkaBroker::new(config)
                .context("error occurred when creating a kafka client")?;
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "kafka"))]
        "kafka" => anyhow::bail!("broker kind 'kafka' requires building with the `kafka` feature"),
        other => anyhow::bail!("unknown broker kind '{}'", other),
    }
}

/// Every configured topic gets a logging handler with its ack mode
fn build_handler_table(config: &ConsumerConfig) -> HandlerTable {
    config
        .handlers
        .iter()
        .map(|(topic, mode)| {
            (
                topic.clone(),
                Handler::new(Arc::new(LoggingHandler), (*mode).into()),
            )
        })
        .collect()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
