//! Relay entry point: wires the subscribers, ingest pipeline, fabricator,
//! broadcaster, recorder and watchdog together and serves the control
//! surface.

mod broadcaster;
mod classifier;
mod config;
mod fabricator;
mod handlers;
mod heartbeat;
mod ingest;
mod kinematics;
mod parser;
mod queue;
mod recorder;
mod registry;
mod start_line;
mod state;
mod subscriber;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::{watch, Mutex};
use tracing::info;

use broadcaster::Broadcaster;
use classifier::{ClassifierThresholds, StatusClassifier};
use config::RelayConfig;
use fabricator::Fabricator;
use handlers::AppContext;
use heartbeat::{run_watchdog, WatchdogConfig};
use ingest::{run_gate_ingest, run_position_ingest, IngestContext};
use parser::ParserCounters;
use recorder::{spawn_recorder, RecorderHandle};
use registry::AthleteRegistry;
use start_line::StartLineTracker;
use state::{AthleteTable, RelayCounters};
use subscriber::{spawn_subscriber, SubscriberConfig, SubscriberHandle};

/// Bounded-resource sizing.
const SUBSCRIBER_QUEUE: usize = 256;
const RECORDER_QUEUE: usize = 1024;
const CLIENT_QUEUE: usize = 64;
const CLIENT_OVERFLOW_GRACE: Duration = Duration::from_secs(2);
const CLIENT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
const GEOMETRY_CHANGE_THRESHOLD_M: f64 = 0.5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=info".into()),
        )
        .init();

    info!("⛵ Coach monitor relay starting...");

    let config = RelayConfig::from_env()?;

    // Configuration faults are fatal: no registry, no relay.
    let registry = Arc::new(AthleteRegistry::new());
    registry
        .load(&config.athletes_config)
        .await
        .context("athlete registry unavailable")?;

    let counters = Arc::new(RelayCounters::default());
    let parser_counters = Arc::new(ParserCounters::default());
    let broadcaster = Arc::new(Broadcaster::new(
        CLIENT_QUEUE,
        CLIENT_OVERFLOW_GRACE,
        CLIENT_SEND_TIMEOUT,
        counters.clone(),
    ));

    let (recorder_handle, recorder_spawner) =
        spawn_recorder(config.session_dir.clone(), RECORDER_QUEUE);
    let fabricator = Arc::new(Fabricator::new(
        broadcaster.clone(),
        recorder_handle.data_queue.clone(),
        recorder_handle.recording.clone(),
        counters.clone(),
    ));
    recorder_spawner.spawn(fabricator.clone());

    let ingest_ctx = Arc::new(IngestContext {
        registry: registry.clone(),
        table: Arc::new(AthleteTable::new()),
        classifier: Arc::new(Mutex::new(StatusClassifier::new(ClassifierThresholds {
            distance_m: config.threshold_distance_m,
            eta_s: config.threshold_time_s,
            stale_s: config.threshold_stale_s,
        }))),
        start_line: Arc::new(Mutex::new(StartLineTracker::new(
            config.anchor_left_device_id,
            config.anchor_right_device_id,
            GEOMETRY_CHANGE_THRESHOLD_M,
        ))),
        fabricator: fabricator.clone(),
        parser_counters: parser_counters.clone(),
        gate_sign_flip: config.gate_sign_flip,
    });

    // Subscribers stop first on shutdown; pipeline tasks stop after the
    // inbound queues drain.
    let (sub_shutdown_tx, sub_shutdown_rx) = watch::channel(false);
    let (task_shutdown_tx, task_shutdown_rx) = watch::channel(false);

    let position_sub = spawn_subscriber(
        SubscriberConfig {
            name: "position-sub",
            endpoint: config.position_endpoint.clone(),
            topic: config.position_topic.clone(),
            reconnect_min_s: config.reconnect_min_s,
            reconnect_max_s: config.reconnect_max_s,
            queue_capacity: SUBSCRIBER_QUEUE,
        },
        sub_shutdown_rx.clone(),
    );
    let gate_sub = spawn_subscriber(
        SubscriberConfig {
            name: "gate-sub",
            endpoint: config.gate_endpoint.clone(),
            topic: config.gate_topic.clone(),
            reconnect_min_s: config.reconnect_min_s,
            reconnect_max_s: config.reconnect_max_s,
            queue_capacity: SUBSCRIBER_QUEUE,
        },
        sub_shutdown_rx.clone(),
    );

    tokio::spawn(run_position_ingest(
        ingest_ctx.clone(),
        position_sub.queue.clone(),
        task_shutdown_rx.clone(),
    ));
    tokio::spawn(run_gate_ingest(
        ingest_ctx.clone(),
        gate_sub.queue.clone(),
        task_shutdown_rx.clone(),
    ));
    tokio::spawn(run_watchdog(
        ingest_ctx.clone(),
        position_sub.clone(),
        gate_sub.clone(),
        broadcaster.clone(),
        WatchdogConfig {
            heartbeat_interval_s: config.heartbeat_interval_s,
            stale_threshold_s: config.threshold_stale_s,
        },
        task_shutdown_rx.clone(),
    ));

    let addr = format!("{}:{}", config.host, config.port);
    let app_ctx = Arc::new(AppContext {
        config,
        ingest: ingest_ctx,
        broadcaster: broadcaster.clone(),
        recorder: recorder_handle.clone(),
        counters,
        position_sub: position_sub.clone(),
        gate_sub: gate_sub.clone(),
        meta_cache: recorder::MetaCache::default(),
        started_at: Instant::now(),
    });
    let app = handlers::router(app_ctx);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("🚀 Relay listening on {addr} (WebSocket at /ws)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_sequence(
            sub_shutdown_tx,
            task_shutdown_tx,
            position_sub,
            gate_sub,
            broadcaster,
            recorder_handle,
        ))
        .await?;

    info!("Relay stopped");
    Ok(())
}

/// Ordered shutdown: stop subscribers, drain the ingest queues, close all
/// clients, stop the recorder with a final flush.
async fn shutdown_sequence(
    sub_shutdown: watch::Sender<bool>,
    task_shutdown: watch::Sender<bool>,
    position_sub: SubscriberHandle,
    gate_sub: SubscriberHandle,
    broadcaster: Arc<Broadcaster>,
    recorder: RecorderHandle,
) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown requested");

    let _ = sub_shutdown.send(true);
    for _ in 0..40 {
        if position_sub.queue.is_empty() && gate_sub.queue.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let _ = task_shutdown.send(true);

    broadcaster.close_all();
    if recorder.is_recording() {
        let _ = recorder.stop().await;
    }
    // Let close frames and the final flush settle.
    tokio::time::sleep(Duration::from_millis(200)).await;
}
