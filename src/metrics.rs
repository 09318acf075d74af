//! Gather metrics about gateway operation and expose a metrics endpoint.
//!
//! Everything shares one flat naming scheme: `gateway_*` for the http
//! surface, and per-stage counters (`alerts_received_total`, `sends_total`,
//! `dedup_suppressed_total`, `graph_failures_total`) for the delivery
//! pipeline itself. Latencies are labeled by matched route, so `/webhook`
//! timings (which include the whole downstream fan-out) stay separate from
//! the cheap probe endpoints.
//!
//! # Configuration
//!
//! None, this module is used directly by [`crate::web`]
//!
//! # Usage
//!
//! Point your favourite prometheus-compatible metrics consumer at the
//! gateway's `/metrics` endpoint. Ad-hoc calls can also be useful in
//! development.
//!
//! ```text
//! ❯ curl --silent http://gateway:6543/metrics | grep '^sends'
//! sends_total{channel="chat_default",outcome="ok"} 17
//! ```

use crate::prelude::*;

use axum::{
    extract::{MatchedPath, Request},
    http::StatusCode,
    middleware::Next,
    response::IntoResponse,
};

use prometheus::{HistogramVec, IntCounter, IntCounterVec, TextEncoder};
use prometheus::{opts, register_histogram_vec, register_int_counter, register_int_counter_vec};

/// Requests served, grouped by matched route and response status.
pub static GATEWAY_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!("gateway_requests_total", "Requests served by the gateway."),
        &["path", "status"]
    )
    .unwrap()
});

/// Request handling time by matched route. The upper buckets exist because a
/// `/webhook` request blocks on the full downstream fan-out, channel
/// timeouts included.
pub static GATEWAY_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "gateway_request_duration_seconds",
        "Request handling time by route, downstream sends included.",
        &["path"],
        vec![0.005, 0.05, 0.25, 1.0, 5.0, 15.0]
    )
    .unwrap()
});

/// Alerts extracted from accepted envelopes, grouped by producer.
pub static ALERTS_RECEIVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!("alerts_received_total", "Alerts extracted from webhooks."),
        &["source"]
    )
    .unwrap()
});

/// Delivery attempts, grouped by channel and outcome.
pub static SENDS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!("sends_total", "Per-channel delivery attempts."),
        &["channel", "outcome"]
    )
    .unwrap()
});

/// Build-system alerts dropped by the dedup window.
pub static DEDUP_SUPPRESSED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "dedup_suppressed_total",
        "Alerts suppressed by the build-system dedup window."
    )
    .unwrap()
});

/// Trend graphs that could not be produced, grouped by failure reason.
pub static GRAPH_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!("graph_failures_total", "Trend graphs that fell back to text."),
        &["reason"]
    )
    .unwrap()
});

/// Exposes metrics gathered by the gateway.
///
/// # Errors
/// Will return error if encoding metrics to text fails.
pub async fn serve_metrics() -> Result<String, (StatusCode, &'static str)> {
    let mut body = String::new();
    TextEncoder::new()
        .encode_utf8(&prometheus::gather(), &mut body)
        .map_err(|err| {
            error!("failed encoding metrics as text: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed encoding metrics as text",
            )
        })?;
    Ok(body)
}

/// Middleware layer recording per-route request counts and latencies.
///
/// The route label comes from the matched route template, so `/webhook`
/// stays one series regardless of payload; requests that matched no route
/// fall back to the raw path.
pub async fn track_metrics(req: Request, next: Next) -> impl IntoResponse {
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path().s(), |matched| matched.as_str().s());
    let timer = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16().s();
    GATEWAY_REQUESTS
        .with_label_values(&[path.as_str(), status.as_str()])
        .inc();
    GATEWAY_LATENCY
        .with_label_values(&[path.as_str()])
        .observe(timer.elapsed().as_secs_f64());
    response
}
