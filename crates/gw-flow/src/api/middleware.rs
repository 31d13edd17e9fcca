//! Admission and request-metrics middleware

use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::ApiState;
use crate::oracle::Outcome;

/// Ask the admission controller before running the handler, then report
/// how the request went. A 5xx response counts as a failure; a request
/// dropped mid-flight (e.g. timed out) reports cancelled via the permit.
pub async fn admission_middleware(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(admission) = state.admission.as_ref() else {
        return next.run(request).await;
    };

    let permit = match admission.allow() {
        Ok(permit) => permit,
        Err(e) => {
            debug!(path = %request.uri().path(), reason = e.reason(), "Request rejected by admission control");
            return e.into_response();
        }
    };

    let response = next.run(request).await;
    let outcome = if response.status().is_server_error() {
        Outcome::Failure
    } else {
        Outcome::Success
    };
    permit.complete(outcome);

    response
}

/// Count requests and observe their latency under the configured names
pub async fn http_metrics_middleware(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(names) = state.http_metrics.clone() else {
        return next.run(request).await;
    };

    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let start = Instant::now();
    let response = next.run(request).await;

    crate::metrics::record_http_request(
        &names.requests_counter_name,
        &names.seconds_histogram_name,
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed(),
    );

    response
}
