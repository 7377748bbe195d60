use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bridge::{Bridge, CatchupError, SUBSCRIBER_BUFFER};
use crate::config::{IngestSettings, SettingsHandle};
use crate::metrics::Metrics;
use crate::models::{BridgeMessage, BridgeMessageType};
use crate::scheduler::Scheduler;
use crate::store::TickStore;
use crate::upstream::RateGovernor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
}

/// Shared health flag set by the dependency watchdog.
#[derive(Default)]
pub struct HealthFlag(AtomicU8);

impl HealthFlag {
    pub fn set(&self, status: HealthStatus) {
        self.0.store(status as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> HealthStatus {
        match self.0.load(Ordering::Relaxed) {
            0 => HealthStatus::Ok,
            1 => HealthStatus::Degraded,
            _ => HealthStatus::Down,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TickStore>,
    pub metrics: Arc<Metrics>,
    pub governor: RateGovernor,
    pub settings: SettingsHandle,
    pub scheduler: Arc<Scheduler>,
    pub bridge: Arc<Bridge>,
    pub health: Arc<HealthFlag>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:name", patch(update_job))
        .route("/api/settings/ingest", get(get_settings).patch(patch_settings))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: HealthStatus,
    store_pool: PoolStatus,
    rate_budget: crate::upstream::RateBudget,
    queues: HashMap<String, usize>,
    subscribers: usize,
    ingestion_lag_ms: LagPercentiles,
    frames_lag_seconds: i64,
    counters: crate::metrics::MetricsSnapshot,
}

#[derive(Serialize)]
struct PoolStatus {
    size: usize,
    in_use: usize,
    utilization_pct: u32,
}

#[derive(Serialize)]
struct LagPercentiles {
    p50: Option<u64>,
    p95: Option<u64>,
    p99: Option<u64>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.metrics.snapshot();
    Json(HealthResponse {
        status: state.health.get(),
        store_pool: PoolStatus {
            size: 1,
            in_use: usize::from(state.store.is_busy()),
            utilization_pct: (state.store.pool_utilization() * 100.0).round() as u32,
        },
        rate_budget: state.governor.budget(),
        queues: state
            .scheduler
            .queue_depths()
            .into_iter()
            .map(|(name, depth)| (name.to_string(), depth))
            .collect(),
        subscribers: state.bridge.connection_count(),
        ingestion_lag_ms: LagPercentiles {
            p50: snapshot.pull_latency_p50_ms,
            p95: snapshot.pull_latency_p95_ms,
            p99: snapshot.pull_latency_p99_ms,
        },
        frames_lag_seconds: snapshot.frames_lag_seconds,
        counters: snapshot,
    })
}

async fn list_jobs(State(state): State<AppState>) -> Response {
    match state.store.list_jobs() {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => storage_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct JobPatch {
    enabled: Option<bool>,
    kind: Option<String>,
    spec: Option<String>,
}

async fn update_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<JobPatch>,
) -> Response {
    let kind_and_spec = match (&patch.kind, &patch.spec) {
        (Some(kind), Some(spec)) => Some((kind.as_str(), spec.as_str())),
        (None, None) => None,
        _ => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({"error": "kind and spec must be set together"})),
            )
                .into_response()
        }
    };
    match state.store.update_job(&name, patch.enabled, kind_and_spec) {
        Ok(true) => Json(serde_json::json!({"status": "updated", "job": name})).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "unknown job", "job": name})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn get_settings(State(state): State<AppState>) -> Json<IngestSettings> {
    Json((*state.settings.load()).clone())
}

async fn patch_settings(
    State(state): State<AppState>,
    Json(settings): Json<IngestSettings>,
) -> Response {
    // Persist first so a restart comes back with the same snapshot.
    let raw = match serde_json::to_string(&settings) {
        Ok(raw) => raw,
        Err(e) => return storage_error(e.into()),
    };
    if let Err(e) = state.store.config_set("ingest_settings", &raw) {
        return storage_error(e);
    }
    state.settings.store(settings);
    Json(serde_json::json!({"status": "updated"})).into_response()
}

fn storage_error(e: anyhow::Error) -> Response {
    warn!(error = %e, "operator request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}

// -- subscriber channel -----------------------------------------------------

#[derive(Debug, Deserialize)]
struct ClientAction {
    action: String,
    fixture_id: i64,
    #[serde(default)]
    from_seq: Option<u64>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::channel::<BridgeMessage>(SUBSCRIBER_BUFFER);
    let connection_id = state.bridge.register(tx);
    // Highest seq already sent per (fixture, type), so catch-up replays and
    // live deliveries never duplicate or regress.
    let mut last_sent: HashMap<(i64, BridgeMessageType), u64> = HashMap::new();

    loop {
        tokio::select! {
            delivered = rx.recv() => {
                match delivered {
                    Some(msg) => {
                        if !send_message(&mut socket, &mut last_sent, &msg).await {
                            break;
                        }
                    }
                    // The bridge dropped us (slow consumer).
                    None => {
                        let _ = socket
                            .send(Message::Text(
                                serde_json::json!({
                                    "type": "error",
                                    "error": "slow_consumer",
                                    "detail": "send buffer full, reconnect and catch up"
                                })
                                .to_string(),
                            ))
                            .await;
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        let action: ClientAction = match serde_json::from_str(&text) {
                            Ok(action) => action,
                            Err(_) => {
                                let _ = socket
                                    .send(Message::Text(
                                        serde_json::json!({
                                            "type": "error",
                                            "error": "invalid_action"
                                        })
                                        .to_string(),
                                    ))
                                    .await;
                                continue;
                            }
                        };
                        if !handle_action(
                            &mut socket,
                            &state,
                            connection_id,
                            &mut last_sent,
                            action,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.bridge.drop_connection(connection_id);
    debug!(connection_id, "subscriber disconnected");
}

async fn handle_action(
    socket: &mut WebSocket,
    state: &AppState,
    connection_id: u64,
    last_sent: &mut HashMap<(i64, BridgeMessageType), u64>,
    action: ClientAction,
) -> bool {
    match action.action.as_str() {
        "subscribe" => {
            state.bridge.subscribe(connection_id, action.fixture_id);
            send_ack(socket, "subscribed", action.fixture_id).await
        }
        "unsubscribe" => {
            state.bridge.unsubscribe(connection_id, action.fixture_id);
            send_ack(socket, "unsubscribed", action.fixture_id).await
        }
        "catchup" => {
            // Subscribe before reading so nothing falls between the replay
            // and the live stream; duplicates are filtered by last_sent.
            state.bridge.subscribe(connection_id, action.fixture_id);
            let from_seq = action.from_seq.unwrap_or(0);
            match state.bridge.catchup(action.fixture_id, from_seq) {
                Ok(missed) => {
                    for msg in missed {
                        if !send_message(socket, last_sent, &msg).await {
                            return false;
                        }
                    }
                    true
                }
                Err(CatchupError::Unavailable) => {
                    let _ = socket
                        .send(Message::Text(
                            serde_json::json!({
                                "type": "error",
                                "error": "catchup_unavailable",
                                "fixture_id": action.fixture_id,
                                "from_seq": from_seq
                            })
                            .to_string(),
                        ))
                        .await;
                    true
                }
            }
        }
        other => {
            let _ = socket
                .send(Message::Text(
                    serde_json::json!({
                        "type": "error",
                        "error": "unknown_action",
                        "action": other
                    })
                    .to_string(),
                ))
                .await;
            true
        }
    }
}

async fn send_ack(socket: &mut WebSocket, status: &str, fixture_id: i64) -> bool {
    socket
        .send(Message::Text(
            serde_json::json!({
                "type": "ack",
                "status": status,
                "fixture_id": fixture_id
            })
            .to_string(),
        ))
        .await
        .is_ok()
}

async fn send_message(
    socket: &mut WebSocket,
    last_sent: &mut HashMap<(i64, BridgeMessageType), u64>,
    msg: &BridgeMessage,
) -> bool {
    let key = (msg.fixture_id, msg.msg_type);
    if last_sent.get(&key).is_some_and(|&sent| msg.seq <= sent) {
        return true;
    }
    let raw = match serde_json::to_string(msg) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "failed to serialize bridge message");
            return true;
        }
    };
    if socket.send(Message::Text(raw)).await.is_err() {
        return false;
    }
    last_sent.insert(key, msg.seq);
    true
}
