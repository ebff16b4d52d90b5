//! Ingest tasks: one per upstream stream.
//!
//! Each task pulls raw frames from its subscriber queue and runs the
//! parse → enrich → classify → fabricate flow synchronously per frame, which
//! preserves per-device ordering end to end.

use std::sync::Arc;

use coach_types::{
    EventPayload, GateAlert, GateMetricEntry, Payload, PositionEntry, PositionUpdatePayload,
    GateMetricsPayload,
};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::warn;

use crate::classifier::{MetricSnapshot, StatusClassifier, StatusEvent};
use crate::fabricator::Fabricator;
use crate::kinematics::KinematicsTracker;
use crate::parser::{self, ParserCounters};
use crate::queue::BoundedQueue;
use crate::registry::AthleteRegistry;
use crate::start_line::StartLineTracker;
use crate::state::{now_ms, AthleteTable};

/// Everything the ingest tasks (and the control surface's start-signal
/// injection) need to push data through the pipeline.
pub struct IngestContext {
    pub registry: Arc<AthleteRegistry>,
    pub table: Arc<AthleteTable>,
    pub classifier: Arc<Mutex<StatusClassifier>>,
    pub start_line: Arc<Mutex<StartLineTracker>>,
    pub fabricator: Arc<Fabricator>,
    pub parser_counters: Arc<ParserCounters>,
    pub gate_sign_flip: bool,
}

/// Resolve identities for committed status transitions and emit the
/// corresponding `event` envelopes. Shared by the ingest paths, the
/// watchdog and start-signal injection.
pub async fn publish_status_events(
    ctx: &IngestContext,
    events: &[StatusEvent],
    base_details: Option<&serde_json::Map<String, Value>>,
    now: i64,
) {
    for event in events {
        ctx.table.set_status(event.device_id, event.new, now).await;
        let athlete = ctx.registry.get_or_default(event.device_id).await;

        let mut details = base_details.cloned().unwrap_or_default();
        details.insert("old_status".into(), status_value(event.old));
        details.insert("new_status".into(), status_value(event.new));

        ctx.fabricator.emit(Payload::Event(EventPayload {
            event_kind: event.kind,
            athlete_id: Some(athlete.athlete_id),
            name: Some(athlete.name),
            details,
        }));
    }
}

fn status_value(status: coach_types::AthleteStatus) -> Value {
    serde_json::to_value(status).unwrap_or(Value::Null)
}

// ── Position stream ───────────────────────────────────────────────────────────

pub async fn run_position_ingest(
    ctx: Arc<IngestContext>,
    queue: Arc<BoundedQueue<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    // The position ingest task is the only writer of the kinematics history.
    let mut kinematics = KinematicsTracker::new(32, 2.0);

    loop {
        let frame = tokio::select! {
            frame = queue.pop() => frame,
            _ = shutdown.changed() => break,
        };
        process_position_frame(&ctx, &mut kinematics, &frame).await;
    }
}

async fn process_position_frame(
    ctx: &IngestContext,
    kinematics: &mut KinematicsTracker,
    frame: &str,
) {
    let batch = parser::parse_position_batch(frame, &ctx.parser_counters);
    let now = now_ms();
    let mut positions: Vec<PositionEntry> = Vec::with_capacity(batch.positions.len());

    for raw in batch.positions {
        // Anchors feed the start-line tracker, not the athlete table.
        if (101..=199).contains(&raw.device_id) {
            let definition = {
                let mut tracker = ctx.start_line.lock().await;
                tracker.update_anchor(raw.device_id, raw.latitude, raw.longitude, now)
            };
            if let Some(payload) = definition {
                ctx.fabricator.emit(Payload::StartLineDefinition(payload));
            }
            continue;
        }

        let athlete = ctx.registry.get_or_default(raw.device_id).await;
        let velocity = kinematics.update(
            raw.device_id,
            raw.latitude,
            raw.longitude,
            raw.device_timestamp_us,
        );

        let recovered = {
            let mut classifier = ctx.classifier.lock().await;
            classifier.touch(raw.device_id, now)
        };
        if !recovered.is_empty() {
            publish_status_events(ctx, &recovered, None, now).await;
        }

        let device_ts_ms = raw.device_timestamp_us / 1000;
        let entry = PositionEntry {
            athlete_id: athlete.athlete_id,
            device_id: raw.device_id,
            name: athlete.name,
            team: athlete.team,
            lat: raw.latitude,
            lon: raw.longitude,
            alt_m: raw.altitude,
            sog_kn: velocity.map(|v| v.sog_kn),
            cog_deg: velocity.map(|v| v.cog_deg),
            source_mask: raw.source_mask,
            device_ts_ms,
            data_age_ms: (now - device_ts_ms).max(0),
        };
        ctx.table.apply_position(raw.device_id, entry.clone(), now).await;
        positions.push(entry);
    }

    if !positions.is_empty() {
        ctx.fabricator
            .emit(Payload::PositionUpdate(PositionUpdatePayload { positions }));
    }
}

// ── Gate stream ───────────────────────────────────────────────────────────────

pub async fn run_gate_ingest(
    ctx: Arc<IngestContext>,
    queue: Arc<BoundedQueue<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = queue.pop() => frame,
            _ = shutdown.changed() => break,
        };
        process_gate_frame(&ctx, &frame).await;
    }
}

async fn process_gate_frame(ctx: &IngestContext, frame: &str) {
    let Some(batch) = parser::parse_gate_batch(frame, &ctx.parser_counters) else {
        return;
    };
    let now = now_ms();
    let mut metrics: Vec<GateMetricEntry> = Vec::with_capacity(batch.metrics.len());
    let mut pending_events: Vec<(Vec<StatusEvent>, serde_json::Map<String, Value>)> = Vec::new();

    for raw in batch.metrics {
        let Some(device_id) = parser::tag_id_to_device_id(&raw.tag_id) else {
            warn!("Unmappable tag id in gate metric: {}", raw.tag_id);
            continue;
        };
        let athlete = ctx.registry.get_or_default(device_id).await;

        let d_perp = if ctx.gate_sign_flip {
            -raw.d_perp_signed_m
        } else {
            raw.d_perp_signed_m
        };
        let speed_to_line = raw.speed_to_line_mps.unwrap_or(0.0);

        let snapshot = MetricSnapshot {
            d_perp_signed_m: d_perp,
            speed_to_line_mps: speed_to_line,
            eta_to_line_s: raw.time_to_line_s,
            crossing_event: raw.crossing_event,
            crossing_time_us: raw.crossing_time_us,
        };
        let (status, events) = {
            let mut classifier = ctx.classifier.lock().await;
            classifier.classify(device_id, &snapshot, now)
        };

        let entry = GateMetricEntry {
            athlete_id: athlete.athlete_id,
            device_id,
            name: athlete.name,
            dist_to_line_m: d_perp,
            s_along: raw.s_along,
            eta_to_line_s: raw.time_to_line_s,
            speed_to_line_mps: speed_to_line,
            gate_length_m: raw.gate_length_m,
            status,
            crossing_event: raw.crossing_event,
            crossing_confidence: raw.crossing_confidence,
            position_quality: raw.position_quality,
        };
        ctx.table.apply_gate(device_id, entry.clone(), now).await;
        metrics.push(entry);

        if !events.is_empty() {
            let mut details = serde_json::Map::new();
            details.insert("dist_to_line_m".into(), Value::from(d_perp));
            details.insert("speed_to_line_mps".into(), Value::from(speed_to_line));
            if let Some(eta) = raw.time_to_line_s {
                details.insert("eta_to_line_s".into(), Value::from(eta));
            }
            if let Ok(event_value) = serde_json::to_value(raw.crossing_event) {
                details.insert("crossing_event".into(), event_value);
            }
            pending_events.push((events, details));
        }
    }

    let mut alerts: Vec<GateAlert> = Vec::with_capacity(batch.alerts.len());
    for raw in batch.alerts {
        let Some(device_id) = parser::tag_id_to_device_id(&raw.tag_id) else {
            continue;
        };
        let athlete = ctx.registry.get_or_default(device_id).await;
        alerts.push(GateAlert {
            athlete_id: athlete.athlete_id,
            name: athlete.name,
            event: raw.event,
            crossing_ts_ms: raw.crossing_time_us / 1000,
            confidence: raw.confidence,
        });
    }

    if !metrics.is_empty() || !alerts.is_empty() {
        ctx.fabricator
            .emit(Payload::GateMetrics(GateMetricsPayload { metrics, alerts }));
    }

    for (events, details) in pending_events {
        publish_status_events(ctx, &events, Some(&details), now).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::Broadcaster;
    use crate::classifier::ClassifierThresholds;
    use crate::queue::BoundedQueue;
    use crate::state::RelayCounters;
    use coach_types::{AthleteStatus, Envelope, MessageType};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Pipeline context whose recorder queue doubles as an envelope sink.
    fn context() -> (Arc<IngestContext>, Arc<BoundedQueue<Envelope>>) {
        let counters = Arc::new(RelayCounters::default());
        let broadcaster = Arc::new(Broadcaster::new(
            64,
            Duration::from_secs(2),
            Duration::from_secs(5),
            counters.clone(),
        ));
        let sink = Arc::new(BoundedQueue::new(256));
        let recording = Arc::new(AtomicBool::new(true));
        recording.store(true, Ordering::Relaxed);
        let fabricator = Arc::new(Fabricator::new(
            broadcaster,
            sink.clone(),
            recording,
            counters,
        ));
        let ctx = Arc::new(IngestContext {
            registry: Arc::new(AthleteRegistry::new()),
            table: Arc::new(AthleteTable::new()),
            classifier: Arc::new(Mutex::new(StatusClassifier::new(ClassifierThresholds {
                distance_m: 50.0,
                eta_s: 5.0,
                stale_s: 3.0,
            }))),
            start_line: Arc::new(Mutex::new(StartLineTracker::new(101, 102, 0.5))),
            fabricator,
            parser_counters: Arc::new(ParserCounters::default()),
            gate_sign_flip: false,
        });
        (ctx, sink)
    }

    fn position_frame(now_us: i64) -> String {
        format!(
            "SERVER_TS:{now_us}\nCOUNT:3\nPOS:1:22.2960:114.1680:0.3:1:{now_us}\nPOS:101:22.1200:114.1200:0.0:1:{now_us}\nPOS:102:22.1210:114.1250:0.0:1:{now_us}\n"
        )
    }

    #[tokio::test]
    async fn position_frame_yields_update_and_line_definition() {
        let (ctx, sink) = context();
        let mut kinematics = KinematicsTracker::new(32, 2.0);
        let now_us = now_ms() * 1000;
        process_position_frame(&ctx, &mut kinematics, &position_frame(now_us)).await;

        let mut kinds = Vec::new();
        while !sink.is_empty() {
            kinds.push(sink.pop().await.kind);
        }
        // One athlete position batch and one line definition (anchors
        // complete on the second anchor fix).
        assert!(kinds.contains(&MessageType::PositionUpdate));
        assert!(kinds.contains(&MessageType::StartLineDefinition));

        let snap = ctx.table.snapshot().await;
        assert_eq!(snap.len(), 1, "anchors must not enter the athlete table");
        assert_eq!(snap[0].0, 1);
    }

    fn gate_frame(tag: &str, d_perp: f64, crossing: bool) -> String {
        let crossing_event = if crossing { "CROSSING_LEFT" } else { "NO_CROSSING" };
        format!(
            r#"{{"server_timestamp_us": 1, "metrics": [{{
                "tag_id": "{tag}",
                "d_perp_signed_m": {d_perp},
                "s_along": 0.5,
                "gate_length_m": 523.0,
                "crossing_event": "{crossing_event}",
                "crossing_confidence": 0.9,
                "tag_position_quality": 0.9,
                "time_to_line_s": 2.0,
                "speed_to_line_mps": 3.0
            }}], "alerts": []}}"#
        )
    }

    #[tokio::test]
    async fn crossing_metric_latches_and_emits_event() {
        let (ctx, sink) = context();
        process_gate_frame(&ctx, &gate_frame("T0", 0.2, true)).await;

        let mut saw_gate_batch = false;
        let mut saw_crossing_event = false;
        while !sink.is_empty() {
            let env = sink.pop().await;
            match env.kind {
                MessageType::GateMetrics => {
                    saw_gate_batch = true;
                    if let coach_types::Payload::GateMetrics(p) = &env.payload {
                        assert_eq!(p.metrics[0].device_id, 1);
                        assert_eq!(p.metrics[0].status, AthleteStatus::Crossed);
                    }
                }
                MessageType::Event => saw_crossing_event = true,
                _ => {}
            }
        }
        assert!(saw_gate_batch);
        assert!(saw_crossing_event);

        // The same frame again is idempotent: batch yes, new event no.
        process_gate_frame(&ctx, &gate_frame("T0", 0.2, true)).await;
        let mut events_second_round = 0;
        while !sink.is_empty() {
            if sink.pop().await.kind == MessageType::Event {
                events_second_round += 1;
            }
        }
        assert_eq!(events_second_round, 0);
    }

    #[tokio::test]
    async fn sign_flip_negates_distance() {
        let (ctx, sink) = context();
        let ctx = Arc::new(IngestContext {
            gate_sign_flip: true,
            registry: ctx.registry.clone(),
            table: ctx.table.clone(),
            classifier: ctx.classifier.clone(),
            start_line: ctx.start_line.clone(),
            fabricator: ctx.fabricator.clone(),
            parser_counters: ctx.parser_counters.clone(),
        });
        process_gate_frame(&ctx, &gate_frame("T0", -42.0, false)).await;
        while !sink.is_empty() {
            let env = sink.pop().await;
            if let coach_types::Payload::GateMetrics(p) = &env.payload {
                assert_eq!(p.metrics[0].dist_to_line_m, 42.0);
            }
        }
    }
}
