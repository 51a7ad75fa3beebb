// mulewatch/src/api.rs
//
// Thin HTTP + WebSocket surface over the pipeline.
//
//   POST /transaction        synchronous scoring (worker path minus ACK)
//   GET  /dashboard/stats    aggregate counters
//   GET  /viz/fraud-network  point-in-time collusion snapshot
//   GET  /viz/device-sharing shared-device view
//   GET  /analytics/status   analyzer introspection
//   GET  /db/counts          store entity counts
//   GET  /health             liveness
//   GET  /metrics            Prometheus text
//   WS   /ws/alerts          scored records at or above the medium threshold
//
// Readers never block workers: everything here is snapshot loads, atomic
// counter reads, and the same score_transaction call the workers run.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::events::{ScoredRecord, TxRecord};
use crate::worker::Pipeline;

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/transaction", post(score_transaction))
        .route("/dashboard/stats", get(dashboard_stats))
        .route("/viz/fraud-network", get(fraud_network))
        .route("/viz/device-sharing", get(device_sharing))
        .route("/analytics/status", get(analytics_status))
        .route("/db/counts", get(db_counts))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/ws/alerts", get(ws_alerts))
        .layer(CorsLayer::permissive())
        .with_state(pipeline)
}

pub async fn serve(pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    let addr = pipeline.cfg.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("api listening on {addr}");
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

// ── Error mapping ─────────────────────────────────────────────────────────────

struct ApiError(EngineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidInput(_)         => StatusCode::BAD_REQUEST,
            EngineError::TransientStore { .. }   => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::DeadlineExceeded(_)     => StatusCode::GATEWAY_TIMEOUT,
            _                                    => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let kind = match &self.0 {
            EngineError::InvalidInput(_)       => "invalid_input",
            EngineError::TransientStore { .. } => "transient_store_error",
            EngineError::Store(_)              => "store_error",
            EngineError::Extractor { .. }      => "extractor_error",
            EngineError::DeadlineExceeded(_)   => "deadline_exceeded",
            EngineError::Subscriber(_)         => "subscriber_error",
            EngineError::Analyzer(_)           => "analyzer_error",
        };
        (status, Json(json!({ "error": kind, "detail": self.0.to_string() }))).into_response()
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// Synchronous scoring. Identical to the worker path minus the ACK; the
/// soft deadline applies here too so a caller never waits unboundedly.
async fn score_transaction(
    State(p): State<Arc<Pipeline>>,
    Json(rec): Json<TxRecord>,
) -> Result<Json<ScoredRecord>, ApiError> {
    let deadline = Duration::from_millis(p.cfg.record_deadline_ms);
    let scored = tokio::time::timeout(deadline, p.score_transaction(&rec))
        .await
        .map_err(|_| ApiError(EngineError::DeadlineExceeded(p.cfg.record_deadline_ms)))?
        .map_err(ApiError)?;
    Ok(Json((*scored).clone()))
}

#[derive(Serialize)]
struct DashboardStats {
    uptime_secs:      f64,
    subscribers:      usize,
    stream_pending:   usize,
    #[serde(flatten)]
    counters:         crate::metrics::MetricsSnapshot,
}

async fn dashboard_stats(State(p): State<Arc<Pipeline>>) -> Json<DashboardStats> {
    Json(DashboardStats {
        uptime_secs:    p.uptime_secs(),
        subscribers:    p.broadcaster.subscriber_count(),
        stream_pending: p.stream.pending_count(&p.cfg.consumer_group),
        counters:       p.metrics.snapshot(),
    })
}

async fn fraud_network(State(p): State<Arc<Pipeline>>) -> Json<serde_json::Value> {
    let snap = p.snapshot.load_full();
    let mut accounts: Vec<serde_json::Value> = snap.patterns.iter()
        .map(|(account, patterns)| json!({
            "account":  account,
            "cluster":  snap.cluster_of(account),
            "patterns": patterns,
        }))
        .collect();
    accounts.sort_by_key(|v| v["account"].as_str().map(str::to_string));
    let mut clusters: Vec<_> = snap.clusters.values().cloned().collect();
    clusters.sort_by_key(|c| c.id);

    Json(json!({
        "snapshot_seq": snap.seq,
        "generated_at": snap.generated_at,
        "clusters":     clusters,
        "accounts":     accounts,
    }))
}

async fn device_sharing(State(p): State<Arc<Pipeline>>) -> Json<serde_json::Value> {
    Json(json!({
        "devices": p.store.shared_devices(2),
    }))
}

async fn analytics_status(State(p): State<Arc<Pipeline>>) -> Json<serde_json::Value> {
    let snap = p.snapshot.load_full();
    let m = p.metrics.snapshot();
    Json(json!({
        "snapshot_seq":      snap.seq,
        "generated_at":      snap.generated_at,
        "analyzer_cycles":   m.analyzer_cycles,
        "analyzer_failures": m.analyzer_failures,
        "interval_secs":     p.cfg.analyzer_interval_secs,
        "asn_db_loaded":     p.resolver.has_db(),
    }))
}

async fn db_counts(State(p): State<Arc<Pipeline>>) -> Json<serde_json::Value> {
    Json(json!({
        "graph":      p.store.counts(),
        "stream_len": p.stream.len(),
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics_text(State(p): State<Arc<Pipeline>>) -> Response {
    let body = p.metrics.prometheus_text(
        p.store.n_accounts(),
        p.stream.pending_count(&p.cfg.consumer_group),
    );
    ([("content-type", "text/plain; version=0.0.4")], body).into_response()
}

// ── WebSocket alert fan-out ───────────────────────────────────────────────────

async fn ws_alerts(ws: WebSocketUpgrade, State(p): State<Arc<Pipeline>>) -> Response {
    ws.on_upgrade(move |socket| alert_socket(socket, p))
}

async fn alert_socket(socket: WebSocket, p: Arc<Pipeline>) {
    let (id, mut rx) = p.broadcaster.subscribe("ws-alerts");
    let (mut sink, mut source) = socket.split();
    loop {
        tokio::select! {
            alert = rx.recv() => {
                let Some(alert) = alert else { break };
                let Ok(text) = serde_json::to_string(&*alert) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                // clients only ever close or ping; any error ends the session
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    p.broadcaster.unsubscribe(id);
    debug!("ws subscriber {id} detached");
}
