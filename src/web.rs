//! Gateway web surface.
//!
//! Exposes the webhook intake plus a few operational endpoints.
//!
//! # Configuration
//! ```toml
//! [server]
//! # String; required; address:port pair for the listener to bind to
//! listen_address = "0.0.0.0:6543"
//! # String; optional; bearer token producers must present on /webhook
//! # auth_token = "…"
//! ```
//!
//! # Usage
//!
//! Urls the gateway will handle:
//! * `POST /webhook` - webhook intake for both producers; 200 with the
//!   per-channel outcome list, 400 for unrecognized payloads.
//! * `GET /alerts` - currently-firing alerts per producer.
//! * `GET /healthz` - liveness probe.
//! * `GET /metrics` - prometheus metrics, see [`crate::metrics`].

use crate::prelude::*;

use crate::metrics::{serve_metrics, track_metrics};
use crate::service::AlertService;

use axum::{
    Router,
    extract::{Json, State},
    http::{StatusCode, header, request::Parts},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::{Duration as TokioDuration, sleep};
use tower_http::trace::TraceLayer;

/// Application state object
#[derive(Clone)]
pub struct WebAppState {
    /// Shared alert service
    pub service: Arc<AlertService>,
    auth_token: Option<String>,
}

/// Bearer token extractor. Absent or non-bearer authorization headers
/// extract as `None`; the handler decides whether that is acceptable.
pub struct AuthBearer(pub Option<String>);

impl<S> axum::extract::FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_owned);
        Ok(Self(token))
    }
}

/// Whether a presented token satisfies the configured one.
#[must_use]
pub fn authorized(expected: Option<&str>, presented: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => presented == Some(expected),
    }
}

/// Handles incoming webhooks from both producers.
///
/// The response enumerates per-channel outcomes and is 200 whenever the
/// envelope parsed, regardless of individual send failures.
#[axum::debug_handler]
pub async fn receive_webhook(
    State(state): State<WebAppState>,
    AuthBearer(token): AuthBearer,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    if !authorized(state.auth_token.as_deref(), token.as_deref()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "unknown token"})),
        )
            .into_response();
    }

    match state.service.process(&payload).await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))).into_response(),
        Err(e) => {
            info!("rejecting envelope: {e}");
            (StatusCode::BAD_REQUEST, Json(json!({"error": e.s()}))).into_response()
        }
    }
}

/// Lists currently-firing alerts, grouped by producer.
pub async fn list_alerts(State(state): State<WebAppState>) -> impl IntoResponse {
    Json(json!(state.service.firing_alerts()))
}

async fn healthz() -> &'static str {
    "ok"
}

/// Run the web surface until shutdown.
///
/// # Errors
/// Will return error when serving fails; binding is retried with a growing
/// delay instead.
pub async fn serve(service: Arc<AlertService>, config: &Config) -> anyhow::Result<()> {
    let state = WebAppState {
        service,
        auth_token: config.server.auth_token.clone(),
    };

    let app = Router::new()
        .route("/webhook", post(receive_webhook))
        .route("/alerts", get(list_alerts))
        .route("/healthz", get(healthz))
        .route("/metrics", get(serve_metrics))
        .layer(TraceLayer::new_for_http())
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(state);

    let listen_address = config.server.listen_address.clone();
    let mut delay = 1;
    let listener: TcpListener;

    loop {
        let maybe_listener = TcpListener::bind(listen_address.clone()).await;
        match maybe_listener {
            Ok(l) => {
                listener = l;
                break;
            }
            Err(e) => {
                error!("failed setting up tcp listener: {e}; retrying in {delay}s");
                sleep(TokioDuration::from_secs(delay)).await;
                delay += 2;
            }
        };
    }

    info!("listening on {listen_address}");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => futures::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_gateway_accepts_anything() {
        assert!(authorized(None, None));
        assert!(authorized(None, Some("whatever")));
    }

    #[test]
    fn token_gateway_requires_the_exact_token() {
        assert!(authorized(Some("secret"), Some("secret")));
        assert!(!authorized(Some("secret"), Some("wrong")));
        assert!(!authorized(Some("secret"), None));
    }
}
