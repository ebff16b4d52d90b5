//! Shared runtime state: the per-athlete merged view and relay counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use coach_types::{AthleteStatus, GateMetricEntry, PositionEntry};
use tokio::sync::RwLock;

/// Wall clock as Unix epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ── Athlete state table ───────────────────────────────────────────────────────

/// Merged view of one athlete: latest position, latest gate metric, derived
/// kinematics, status, and update timing.
#[derive(Debug, Clone, Default)]
pub struct AthleteState {
    pub athlete_id: String,
    pub name: String,
    pub team: String,
    pub last_position: Option<PositionEntry>,
    pub last_gate: Option<GateMetricEntry>,
    pub status: AthleteStatus,
    pub status_since_ms: i64,
    pub last_update_ms: i64,
    pub online: bool,
}

/// Keyed map `device_id → AthleteState`. Mutated only by the ingestion path
/// and the watchdog; readers get consistent snapshots under the read lock.
#[derive(Default)]
pub struct AthleteTable {
    inner: RwLock<HashMap<u32, AthleteState>>,
}

impl AthleteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply_position(&self, device_id: u32, entry: PositionEntry, now_ms: i64) {
        let mut table = self.inner.write().await;
        let state = table.entry(device_id).or_default();
        state.athlete_id = entry.athlete_id.clone();
        state.name = entry.name.clone();
        state.team = entry.team.clone();
        state.last_position = Some(entry);
        state.last_update_ms = now_ms;
        state.online = true;
    }

    pub async fn apply_gate(&self, device_id: u32, entry: GateMetricEntry, now_ms: i64) {
        let mut table = self.inner.write().await;
        let state = table.entry(device_id).or_default();
        state.athlete_id = entry.athlete_id.clone();
        state.name = entry.name.clone();
        if state.status != entry.status {
            state.status_since_ms = now_ms;
        }
        state.status = entry.status;
        state.last_gate = Some(entry);
        state.last_update_ms = now_ms;
        state.online = true;
    }

    pub async fn set_status(&self, device_id: u32, status: AthleteStatus, now_ms: i64) {
        let mut table = self.inner.write().await;
        if let Some(state) = table.get_mut(&device_id) {
            if state.status != status {
                state.status_since_ms = now_ms;
            }
            state.status = status;
        }
    }

    pub async fn set_online(&self, device_id: u32, online: bool) {
        let mut table = self.inner.write().await;
        if let Some(state) = table.get_mut(&device_id) {
            state.online = online;
        }
    }

    pub async fn snapshot(&self) -> Vec<(u32, AthleteState)> {
        let table = self.inner.read().await;
        let mut out: Vec<_> = table.iter().map(|(k, v)| (*k, v.clone())).collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}

// ── Relay counters (visible via /api/health) ──────────────────────────────────

/// Counters owned by the fan-out path. Queue displacement and upstream
/// reconnects are counted by the queues and subscriber handles themselves;
/// the health endpoint stitches everything together.
#[derive(Debug, Default)]
pub struct RelayCounters {
    /// Messages dropped from client queues by the backpressure policy.
    pub client_drops: AtomicU64,
    /// Clients disconnected as slow consumers.
    pub slow_consumer_disconnects: AtomicU64,
    /// Total outbound envelopes fabricated.
    pub messages_relayed: AtomicU64,
}

impl RelayCounters {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "client_drops": self.client_drops.load(Ordering::Relaxed),
            "slow_consumer_disconnects": self.slow_consumer_disconnects.load(Ordering::Relaxed),
            "messages_relayed": self.messages_relayed.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(athlete_id: &str) -> PositionEntry {
        PositionEntry {
            athlete_id: athlete_id.into(),
            device_id: 1,
            name: "CHAN SIU MING".into(),
            team: "HKG".into(),
            lat: 22.296,
            lon: 114.168,
            alt_m: 0.3,
            sog_kn: Some(8.0),
            cog_deg: Some(185.0),
            source_mask: 1,
            device_ts_ms: 1_000,
            data_age_ms: 50,
        }
    }

    #[tokio::test]
    async fn position_then_gate_merge_into_one_state() {
        let table = AthleteTable::new();
        table.apply_position(1, position("T1"), 1_000).await;
        table
            .apply_gate(
                1,
                GateMetricEntry {
                    athlete_id: "T1".into(),
                    device_id: 1,
                    name: "CHAN SIU MING".into(),
                    dist_to_line_m: -20.0,
                    s_along: 0.5,
                    eta_to_line_s: Some(4.0),
                    speed_to_line_mps: 2.0,
                    gate_length_m: 523.0,
                    status: AthleteStatus::Approaching,
                    crossing_event: Default::default(),
                    crossing_confidence: 0.0,
                    position_quality: 0.9,
                },
                1_100,
            )
            .await;

        let snap = table.snapshot().await;
        assert_eq!(snap.len(), 1);
        let (_, state) = &snap[0];
        assert!(state.last_position.is_some());
        assert!(state.last_gate.is_some());
        assert_eq!(state.status, AthleteStatus::Approaching);
        assert_eq!(state.status_since_ms, 1_100);
        assert_eq!(state.last_update_ms, 1_100);
    }

    #[tokio::test]
    async fn status_since_only_moves_on_change() {
        let table = AthleteTable::new();
        table.apply_position(1, position("T1"), 1_000).await;
        table.set_status(1, AthleteStatus::Stale, 2_000).await;
        table.set_status(1, AthleteStatus::Stale, 3_000).await;
        let (_, state) = table.snapshot().await.into_iter().next().unwrap();
        assert_eq!(state.status_since_ms, 2_000);
    }
}
