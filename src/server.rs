//! Local debug listener.
//!
//! A small HTTP surface bound to loopback by default: liveness, the stats
//! snapshot, and an injection endpoint that feeds a synthetic message
//! through the dispatch stage as the privileged `dev` sender. Disabled
//! unless configured on.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::info;
use ulid::Ulid;

use crate::chat::ConnectionState;
use crate::chat::message::InboundMessage;
use crate::commands::DEV_SENDER_ID;
use crate::config::ServerConfig;
use crate::relay::dispatch::Dispatcher;
use crate::relay::queue::DeliveryQueue;
use crate::relay::stats::RelayStats;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub stats: Arc<RelayStats>,
    pub connection: watch::Receiver<ConnectionState>,
    pub queue: Arc<DeliveryQueue>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn build_app(state: AppState, request_timeout_secs: u64) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .route("/inject", post(inject))
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_secs),
        ))
}

pub async fn serve(
    config: &ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = build_app(state, config.request_timeout_seconds);
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(host = %config.host, port = config.port, "Debug listener up");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let connection = *state.connection.borrow();
    let depth = state.queue.depth().await;
    Json(json!({
        "status": "ok",
        "connection": connection,
        "queue_depth": depth,
        "uptime_seconds": state.stats.snapshot().uptime_seconds,
    }))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.stats.snapshot()))
}

/// Feed a raw line through the dispatch stage, bypassing the socket.
///
/// The synthetic sender id is privileged, so admin commands can be tested
/// locally without touching the live room.
async fn inject(State(state): State<AppState>, body: String) -> StatusCode {
    let msg = InboundMessage {
        id: Ulid::new().to_string(),
        sequence_number: 0,
        room_id: String::new(),
        sender_id: DEV_SENDER_ID.to_string(),
        sender_name: "developer".to_string(),
        text: body,
        received_at: Utc::now(),
    };
    state.dispatcher.dispatch(msg).await;
    StatusCode::ACCEPTED
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::dispatch::tests::dispatcher_with_sink;
    use tokio::sync::Mutex;

    fn test_state() -> (AppState, Arc<crate::relay::dispatch::tests::RecordingSink>) {
        let stats = Arc::new(RelayStats::new());
        let dedup = Arc::new(Mutex::new(crate::relay::dedup::DedupCache::new(10)));
        let queue = Arc::new(DeliveryQueue::new(dedup, stats.clone(), false));
        let (dispatcher, sink) = dispatcher_with_sink();
        let (_tx, rx) = watch::channel(ConnectionState::Idle);
        (
            AppState {
                stats,
                connection: rx,
                queue,
                dispatcher: Arc::new(dispatcher),
            },
            sink,
        )
    }

    #[tokio::test]
    async fn test_inject_reaches_dispatch() {
        let (state, sink) = test_state();
        let code = inject(State(state), "hello from the console".to_string()).await;
        assert_eq!(code, StatusCode::ACCEPTED);
        assert_eq!(sink.sent().len(), 1);
        assert!(sink.sent()[0].contains("hello from the console"));
    }

    #[tokio::test]
    async fn test_healthz_reports_connection_and_depth() {
        let (state, _) = test_state();
        let Json(body) = healthz(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connection"], "idle");
        assert_eq!(body["queue_depth"], 0);
    }
}
