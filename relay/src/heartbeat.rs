//! Heartbeat and device watchdog.
//!
//! One timer task: every second it sweeps for stale devices (statuses,
//! online/offline transitions, start-line quality drift) and on the
//! configured cadence it emits the `heartbeat` envelope. The watchdog is the
//! sole writer of `DEVICE_OFFLINE`/`DEVICE_ONLINE` events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use coach_types::{
    DeviceHealthPayload, DeviceType, EventKind, EventPayload, HeartbeatPayload, Payload,
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use crate::broadcaster::Broadcaster;
use crate::ingest::{publish_status_events, IngestContext};
use crate::state::now_ms;
use crate::subscriber::SubscriberHandle;

pub struct WatchdogConfig {
    pub heartbeat_interval_s: f64,
    pub stale_threshold_s: f64,
}

/// An observed device with its last update time.
type Observation = (u32, i64, DeviceType);

/// A device whose online state flipped.
#[derive(Debug, PartialEq)]
struct OnlineTransition {
    device_id: u32,
    device_type: DeviceType,
    online: bool,
    last_seen_ms: i64,
}

/// Compare observations against the previously known online states.
fn online_transitions(
    known: &mut HashMap<u32, bool>,
    observed: &[Observation],
    now_ms: i64,
    stale_ms: i64,
) -> Vec<OnlineTransition> {
    let mut out = Vec::new();
    for &(device_id, last_seen_ms, device_type) in observed {
        let online = now_ms - last_seen_ms <= stale_ms;
        let previous = known.insert(device_id, online);
        // The first sighting of a live device is not a transition; a device
        // first seen already stale is.
        let changed = match previous {
            Some(prev) => prev != online,
            None => !online,
        };
        if changed {
            out.push(OnlineTransition {
                device_id,
                device_type,
                online,
                last_seen_ms,
            });
        }
    }
    out
}

pub async fn run_watchdog(
    ctx: Arc<IngestContext>,
    position_sub: SubscriberHandle,
    gate_sub: SubscriberHandle,
    broadcaster: Arc<Broadcaster>,
    cfg: WatchdogConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let stale_ms = (cfg.stale_threshold_s * 1000.0) as i64;
    let heartbeat_every = cfg.heartbeat_interval_s.round().max(1.0) as u64;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut known_online: HashMap<u32, bool> = HashMap::new();
    let mut ticks: u64 = 0;

    info!("Watchdog running (heartbeat every {heartbeat_every}s, stale after {stale_ms}ms)");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        ticks += 1;
        let now = now_ms();

        // 1. Stale statuses flow through the classifier as ordinary
        //    transitions.
        let stale_events = {
            let mut classifier = ctx.classifier.lock().await;
            classifier.sweep_stale(now)
        };
        if !stale_events.is_empty() {
            publish_status_events(&ctx, &stale_events, None, now).await;
        }

        // 2. Online/offline transitions for tags and the line anchors.
        let mut observed: Vec<Observation> = Vec::new();
        for (device_id, state) in ctx.table.snapshot().await {
            observed.push((device_id, state.last_update_ms, DeviceType::Tag));
        }
        {
            let tracker = ctx.start_line.lock().await;
            for (device_id, updated_ms) in tracker.anchor_fixes() {
                observed.push((device_id, updated_ms, DeviceType::Anchor));
            }
        }
        for transition in online_transitions(&mut known_online, &observed, now, stale_ms) {
            emit_device_transition(&ctx, &transition).await;
        }

        // 3. Start-line quality may have drifted with an anchor outage.
        let refreshed = {
            let mut tracker = ctx.start_line.lock().await;
            tracker.refresh_quality(now)
        };
        if let Some(payload) = refreshed {
            ctx.fabricator.emit(Payload::StartLineDefinition(payload));
        }

        // 4. Heartbeat on its own cadence.
        if ticks % heartbeat_every == 0 {
            let payload = HeartbeatPayload {
                uptime_s: started.elapsed().as_secs() as i64,
                connected_clients: broadcaster.client_count() as u32,
                zmq_position_connected: position_sub.is_connected(),
                zmq_gate_connected: gate_sub.is_connected(),
                athletes_tracked: ctx.table.count().await as u32,
                messages_relayed: ctx.fabricator.messages_relayed(),
            };
            ctx.fabricator.emit(Payload::Heartbeat(payload));
        }
    }
}

async fn emit_device_transition(ctx: &IngestContext, transition: &OnlineTransition) {
    ctx.table.set_online(transition.device_id, transition.online).await;

    ctx.fabricator.emit(Payload::DeviceHealth(DeviceHealthPayload {
        device_id: transition.device_id.to_string(),
        device_type: transition.device_type,
        online: transition.online,
        last_seen_ms: transition.last_seen_ms,
        battery_pct: None,
        packet_loss_pct: None,
        rssi_dbm: None,
        time_sync_offset_ms: None,
    }));

    let kind = if transition.online {
        EventKind::DeviceOnline
    } else {
        EventKind::DeviceOffline
    };
    let (athlete_id, name) = if transition.device_type == DeviceType::Tag {
        let athlete = ctx.registry.get_or_default(transition.device_id).await;
        (Some(athlete.athlete_id), Some(athlete.name))
    } else {
        (None, None)
    };
    let mut details = serde_json::Map::new();
    details.insert("device_id".into(), Value::from(transition.device_id));
    details.insert("last_seen_ms".into(), Value::from(transition.last_seen_ms));

    ctx.fabricator.emit(Payload::Event(EventPayload {
        event_kind: kind,
        athlete_id,
        name,
        details,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_device_first_sighting_is_silent() {
        let mut known = HashMap::new();
        let transitions = online_transitions(&mut known, &[(1, 900, DeviceType::Tag)], 1_000, 3_000);
        assert!(transitions.is_empty());
    }

    #[test]
    fn offline_then_online_round_trip() {
        let mut known = HashMap::new();
        online_transitions(&mut known, &[(102, 0, DeviceType::Anchor)], 1_000, 3_000);

        // Device 102 goes silent past the threshold.
        let down = online_transitions(&mut known, &[(102, 0, DeviceType::Anchor)], 5_000, 3_000);
        assert_eq!(down.len(), 1);
        assert!(!down[0].online);

        // Still offline: no repeat event.
        let still = online_transitions(&mut known, &[(102, 0, DeviceType::Anchor)], 6_000, 3_000);
        assert!(still.is_empty());

        // It publishes again: one online transition.
        let up = online_transitions(&mut known, &[(102, 5_900, DeviceType::Anchor)], 6_500, 3_000);
        assert_eq!(up.len(), 1);
        assert!(up[0].online);
    }
}
