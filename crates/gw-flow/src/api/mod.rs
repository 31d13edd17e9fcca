//! Gateway HTTP API
//!
//! - `POST /echo` behind admission control
//! - Health and Kubernetes liveness/readiness checks
//! - Prometheus metrics
//!
//! Health checks and metrics bypass admission so a saturated gateway still
//! reports its state.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use gw_common::HealthStatus;
use gw_config::MetricsConfig;
use crate::admission::AdmissionController;

pub mod middleware;
pub mod model;

pub use middleware::{admission_middleware, http_metrics_middleware};
use model::{CheckResponse, EchoRequest, EchoResponse, ErrorResponse, HealthResponse};

/// Application state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// `None` disables admission control
    pub admission: Option<Arc<AdmissionController>>,
    pub prometheus: Option<PrometheusHandle>,
    /// Metric names for request counting; `None` disables it
    pub http_metrics: Option<Arc<MetricsConfig>>,
    /// Cancelled once the process starts shutting down
    pub shutdown: CancellationToken,
}

impl ApiState {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            admission: None,
            prometheus: None,
            http_metrics: None,
            shutdown,
        }
    }

    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn with_http_metrics(mut self, config: MetricsConfig) -> Self {
        self.http_metrics = Some(Arc::new(config));
        self
    }

    fn health_status(&self) -> HealthStatus {
        if self.shutdown.is_cancelled() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Build the full router. Every request is bounded by `request_timeout`.
pub fn create_router(state: ApiState, request_timeout: Duration) -> Router {
    let admitted = Router::new()
        .route("/echo", post(echo_handler))
        .layer(CatchPanicLayer::new())
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            admission_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_check))
        .route("/health/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .merge(admitted)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            http_metrics_middleware,
        ))
        .layer(request_timeout_layer(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Requests still running after `timeout` are answered with 408
pub fn request_timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}

async fn echo_handler(payload: Result<Json<EchoRequest>, JsonRejection>) -> Response {
    match payload {
        Ok(Json(request)) => Json(EchoResponse {
            message: request.message,
        })
        .into_response(),
        Err(rejection) => {
            debug!(error = %rejection.body_text(), "Rejected malformed echo request");
            let status = StatusCode::BAD_REQUEST;
            (
                status,
                Json(ErrorResponse::new(status, "bad_request", rejection.body_text())),
            )
                .into_response()
        }
    }
}

async fn health_handler(State(state): State<ApiState>) -> Json<HealthResponse> {
    let status = match state.health_status() {
        HealthStatus::Healthy => "UP",
        HealthStatus::Degraded => "DEGRADED",
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Kubernetes liveness check - 200 while the process is running
async fn liveness_check() -> Json<CheckResponse> {
    Json(CheckResponse { status: "LIVE".to_string() })
}

/// Kubernetes readiness check - 503 once shutdown has begun
async fn readiness_check(State(state): State<ApiState>) -> Response {
    match state.health_status() {
        HealthStatus::Healthy => {
            (StatusCode::OK, Json(CheckResponse { status: "READY".to_string() })).into_response()
        }
        HealthStatus::Degraded => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(CheckResponse { status: "NOT_READY".to_string() }),
        )
            .into_response(),
    }
}

async fn metrics_handler(State(state): State<ApiState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => {
            let status = StatusCode::NOT_FOUND;
            (
                status,
                Json(ErrorResponse::new(status, "metrics_disabled", "metrics are disabled")),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::AlwaysAdmit;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(rps: u64) -> (Router, Arc<AdmissionController>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let admission = Arc::new(AdmissionController::new(rps, 10, Arc::new(AlwaysAdmit)).unwrap());
        let state = ApiState::new(shutdown.clone()).with_admission(admission.clone());
        (create_router(state, Duration::from_secs(1)), admission, shutdown)
    }

    fn echo(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/echo")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_echo_returns_message() {
        let (app, _, _) = app(50);
        let response = app.oneshot(echo(r#"{"message":"hello"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: EchoResponse = body_json(response).await;
        assert_eq!(body.message, "hello");
    }

    #[tokio::test]
    async fn test_malformed_echo_is_bad_request() {
        let (app, _, _) = app(50);
        let response = app.clone().oneshot(echo("not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.reason, "bad_request");

        let response = app.oneshot(echo(r#"{"other":1}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_exhausted_quota_returns_429_with_reason() {
        let (app, admission, _) = app(10);
        while admission.budget().available() > 0 {
            let _ = admission.allow();
        }

        let response = app.oneshot(echo(r#"{"message":"hi"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.code, 429);
        assert_eq!(body.reason, "quota_exhausted");
    }

    #[tokio::test]
    async fn test_health_checks_bypass_admission() {
        let (app, admission, _) = app(10);
        while admission.budget().available() > 0 {
            let _ = admission.allow();
        }

        for uri in ["/health", "/health/live", "/health/ready"] {
            let response = app.clone().oneshot(get_request(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_readiness_fails_after_shutdown_begins() {
        let (app, _, shutdown) = app(10);
        shutdown.cancel();

        let response = app.clone().oneshot(get_request("/health/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app.oneshot(get_request("/health")).await.unwrap();
        let body: HealthResponse = body_json(response).await;
        assert_eq!(body.status, "DEGRADED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_request_times_out_with_408() {
        let app: Router = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    StatusCode::OK
                }),
            )
            .layer(request_timeout_layer(Duration::from_secs(1)));

        let response = app.oneshot(get_request("/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder_is_not_found() {
        let (app, _, _) = app(10);
        let response = app.oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
