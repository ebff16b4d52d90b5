//! Control surface: REST endpoints and the `/ws` fan-out socket.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error};
use uuid::Uuid;

use crate::broadcaster::{run_sender, Broadcaster, CloseReason};
use crate::config::RelayConfig;
use crate::ingest::{publish_status_events, IngestContext};
use crate::recorder::{self, MetaCache, RecorderError, RecorderHandle};
use crate::state::{now_ms, RelayCounters};
use crate::subscriber::SubscriberHandle;

pub struct AppContext {
    pub config: RelayConfig,
    pub ingest: Arc<IngestContext>,
    pub broadcaster: Arc<Broadcaster>,
    pub recorder: RecorderHandle,
    pub counters: Arc<RelayCounters>,
    pub position_sub: SubscriberHandle,
    pub gate_sub: SubscriberHandle,
    pub meta_cache: MetaCache,
    pub started_at: Instant,
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/health", get(health))
        .route("/api/athletes", get(list_athletes).put(replace_athletes))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/start", post(start_session))
        .route("/api/sessions/stop", post(stop_session))
        .route("/api/sessions/{id}", get(session_meta))
        .route("/api/sessions/{id}/messages", get(session_messages))
        .route("/api/sessions/{id}/export", get(session_export))
        .route("/api/start-signal", post(set_start_signal).delete(clear_start_signal))
        .with_state(ctx)
        .layer(cors)
}

// ── Error helpers ─────────────────────────────────────────────────────────────

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Unexpected faults get an opaque id for log correlation; no internal
/// error text reaches clients.
fn internal_error(err: impl std::fmt::Display) -> Response {
    let id = Uuid::new_v4();
    error!("[{id}] internal error: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error", "id": id.to_string() })),
    )
        .into_response()
}

// ── Health ────────────────────────────────────────────────────────────────────

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime_s": ctx.started_at.elapsed().as_secs(),
        "zmq_position_connected": ctx.position_sub.is_connected(),
        "zmq_gate_connected": ctx.gate_sub.is_connected(),
        "ws_clients": ctx.broadcaster.client_count(),
        "athletes_registered": ctx.ingest.registry.count().await,
        "athletes_tracked": ctx.ingest.table.count().await,
        "recording": ctx.recorder.is_recording(),
        "session_id": ctx.ingest.fabricator.session_id(),
        "start_signal_ts_ms": ctx.ingest.classifier.lock().await.start_signal_ts_ms(),
        "gate_sign_flip": ctx.config.gate_sign_flip,
        "queue_depths": {
            "position_inbound": ctx.position_sub.queue.len(),
            "gate_inbound": ctx.gate_sub.queue.len(),
            "recorder": ctx.recorder.data_queue.len(),
            "clients": ctx.broadcaster.queue_depths(),
        },
        "queue_drops": {
            "position_inbound": ctx.position_sub.queue.dropped(),
            "gate_inbound": ctx.gate_sub.queue.dropped(),
            "recorder": ctx.recorder.data_queue.dropped(),
        },
        "reconnects": {
            "position": ctx.position_sub.reconnects.load(std::sync::atomic::Ordering::Relaxed),
            "gate": ctx.gate_sub.reconnects.load(std::sync::atomic::Ordering::Relaxed),
        },
        "counters": ctx.counters.snapshot(),
        "parser_counters": ctx.ingest.parser_counters.snapshot(),
    }))
}

// ── Athlete registry ──────────────────────────────────────────────────────────

async fn list_athletes(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({ "athletes": ctx.ingest.registry.all().await }))
}

#[derive(Deserialize)]
struct RegistryReplace {
    athletes: Vec<crate::registry::AthleteRecord>,
}

async fn replace_athletes(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<RegistryReplace>,
) -> Response {
    let count = body.athletes.len();
    ctx.ingest.registry.replace(body.athletes).await;
    Json(json!({ "status": "replaced", "athletes": count })).into_response()
}

// ── Sessions ──────────────────────────────────────────────────────────────────

async fn list_sessions(State(ctx): State<Arc<AppContext>>) -> Response {
    match recorder::list_sessions(&ctx.config.session_dir, &ctx.meta_cache).await {
        Ok(sessions) => Json(json!({ "sessions": sessions })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn session_meta(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Response {
    match recorder::session_meta(&ctx.config.session_dir, &id, &ctx.meta_cache).await {
        Ok(Some(meta)) => Json(meta).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => internal_error(e),
    }
}

async fn session_messages(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Response {
    let Some(path) = existing_pack(&ctx, &id).await else {
        return json_error(StatusCode::NOT_FOUND, "session not found");
    };
    let stream = recorder::pack_lines(path).map_ok(Bytes::from);
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

#[derive(Deserialize)]
struct ExportParams {
    format: Option<String>,
}

async fn session_export(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(params): Query<ExportParams>,
) -> Response {
    let Some(path) = existing_pack(&ctx, &id).await else {
        return json_error(StatusCode::NOT_FOUND, "session not found");
    };
    match params.format.as_deref().unwrap_or("json") {
        "csv" => {
            let stream = recorder::pack_csv(path).map_ok(Bytes::from);
            (
                [
                    (header::CONTENT_TYPE, "text/csv".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{id}.csv\""),
                    ),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
        "json" => {
            let stream = recorder::pack_lines(path).map_ok(Bytes::from);
            (
                [
                    (header::CONTENT_TYPE, "application/x-ndjson".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{id}.json\""),
                    ),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
        other => json_error(
            StatusCode::BAD_REQUEST,
            &format!("unsupported export format: {other}"),
        ),
    }
}

async fn existing_pack(ctx: &AppContext, id: &str) -> Option<std::path::PathBuf> {
    if !recorder::valid_session_id(id) {
        return None;
    }
    let path = recorder::pack_path(&ctx.config.session_dir, id);
    tokio::fs::try_exists(&path).await.ok()?.then_some(path)
}

#[derive(Deserialize)]
struct StartSessionParams {
    session_id: Option<String>,
}

async fn start_session(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<StartSessionParams>,
) -> Response {
    match ctx.recorder.start(params.session_id).await {
        Ok(session_id) => {
            // A new session starts from a clean slate: latches and one-shot
            // event markers are released.
            ctx.ingest.classifier.lock().await.reset_latches();
            Json(json!({ "status": "recording", "session_id": session_id })).into_response()
        }
        Err(RecorderError::AlreadyRecording) => {
            json_error(StatusCode::CONFLICT, "already recording")
        }
        Err(RecorderError::InvalidSessionId) => {
            json_error(StatusCode::BAD_REQUEST, "invalid session id")
        }
        Err(e) => internal_error(e),
    }
}

async fn stop_session(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.recorder.stop().await {
        Ok(meta) => {
            let mut body = json!({ "status": "stopped" });
            if let (Value::Object(target), Ok(Value::Object(meta_obj))) =
                (&mut body, serde_json::to_value(&meta))
            {
                target.extend(meta_obj);
            }
            Json(body).into_response()
        }
        Err(RecorderError::NotRecording) => json_error(StatusCode::CONFLICT, "not recording"),
        Err(e) => internal_error(e),
    }
}

// ── Start signal ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StartSignalParams {
    ts_ms: Option<i64>,
}

async fn set_start_signal(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<StartSignalParams>,
) -> Response {
    let now = now_ms();
    let ts_ms = params.ts_ms.unwrap_or(now);
    let upgrades = {
        let mut classifier = ctx.ingest.classifier.lock().await;
        classifier.set_start_signal(ts_ms)
    };

    let mut details = serde_json::Map::new();
    details.insert("start_signal_ts_ms".into(), Value::from(ts_ms));
    ctx.ingest.fabricator.emit(coach_types::Payload::Event(coach_types::EventPayload {
        event_kind: coach_types::EventKind::StartSignal,
        athlete_id: None,
        name: None,
        details,
    }));

    publish_status_events(&ctx.ingest, &upgrades, None, now).await;
    Json(json!({ "status": "start_signal_set", "ts_ms": ts_ms })).into_response()
}

async fn clear_start_signal(State(ctx): State<Arc<AppContext>>) -> Response {
    ctx.ingest.classifier.lock().await.clear_start_signal();
    Json(json!({ "status": "start_signal_cleared" })).into_response()
}

// ── WebSocket ─────────────────────────────────────────────────────────────────

async fn ws_upgrade(ws: WebSocketUpgrade, State(ctx): State<Arc<AppContext>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: Arc<AppContext>) {
    let (sink, mut stream) = socket.split();
    let client = ctx.broadcaster.register();
    let client_id = client.id;

    let mut send_task = tokio::spawn(run_sender(
        client.clone(),
        sink,
        ctx.broadcaster.send_timeout,
    ));

    loop {
        tokio::select! {
            biased;

            // Sender finished: timeout, peer gone, or slow-consumer close.
            _ = &mut send_task => break,

            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(Message::Text(text))) => {
                    // Clients talk through REST; socket input is ignored.
                    debug!("Client {client_id} sent {} bytes", text.len());
                }
                Some(Ok(_)) => {}
            },
        }
    }

    ctx.broadcaster.unregister(&client_id);
    client.close(CloseReason::Shutdown);
    send_task.abort();
}
