//! Coaching status classification.
//!
//! Maps gate metrics and timing onto the status enum with hysteresis,
//! latching and one-shot transition events.
//!
//! Rules, first match wins:
//! 1. no update within the stale threshold → `STALE` (enforced by the
//!    watchdog sweep; any classified metric is itself an update)
//! 2. crossing observed (or previously latched) → `CROSSED`, or `OCS` when
//!    the crossing predates a known start signal
//! 3. start signal known, ETA at or under threshold, moving toward the line
//!    → `RISK`
//! 4. within the distance threshold and moving toward the line →
//!    `APPROACHING`
//! 5. otherwise `SAFE`
//!
//! A candidate state must hold for the hysteresis window before it commits,
//! except transitions into `CROSSED`/`OCS`/`STALE`, which are immediate.
//! `CROSSED`/`OCS` are latched until an explicit reset; the latch survives a
//! `STALE` detour.

use std::collections::HashMap;

use coach_types::{AthleteStatus, CrossingEvent, EventKind};
use tracing::info;

/// Dwell time a candidate state needs before committing.
const HYSTERESIS_MS: i64 = 300;

#[derive(Debug, Clone, Copy)]
pub struct ClassifierThresholds {
    pub distance_m: f64,
    pub eta_s: f64,
    pub stale_s: f64,
}

/// One gate metric, after sign mapping, as the classifier sees it.
#[derive(Debug, Clone, Copy)]
pub struct MetricSnapshot {
    pub d_perp_signed_m: f64,
    pub speed_to_line_mps: f64,
    pub eta_to_line_s: Option<f64>,
    pub crossing_event: CrossingEvent,
    pub crossing_time_us: Option<i64>,
}

/// A committed status transition, to be fabricated into an `event` envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusEvent {
    pub device_id: u32,
    pub kind: EventKind,
    pub old: AthleteStatus,
    pub new: AthleteStatus,
}

#[derive(Debug, Default)]
struct DeviceTrack {
    committed: AthleteStatus,
    candidate: Option<(AthleteStatus, i64)>,
    last_seen_ms: i64,
    /// CROSSED/OCS latch; survives STALE periods.
    latched: Option<AthleteStatus>,
    crossing_ts_ms: Option<i64>,
    crossing_announced: bool,
    ocs_announced: bool,
}

pub struct StatusClassifier {
    thresholds: ClassifierThresholds,
    start_signal_ts_ms: Option<i64>,
    tracks: HashMap<u32, DeviceTrack>,
}

impl StatusClassifier {
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self {
            thresholds,
            start_signal_ts_ms: None,
            tracks: HashMap::new(),
        }
    }

    pub fn start_signal_ts_ms(&self) -> Option<i64> {
        self.start_signal_ts_ms
    }

    /// Record the start signal. Latched crossings that happened before the
    /// signal retroactively become OCS.
    pub fn set_start_signal(&mut self, ts_ms: i64) -> Vec<StatusEvent> {
        info!("Start signal recorded at {ts_ms} ms");
        self.start_signal_ts_ms = Some(ts_ms);

        let mut events = Vec::new();
        for (&device_id, track) in &mut self.tracks {
            let was_early = track
                .crossing_ts_ms
                .is_some_and(|crossing| crossing < ts_ms);
            if track.latched == Some(AthleteStatus::Crossed) && was_early {
                track.latched = Some(AthleteStatus::Ocs);
                if track.committed == AthleteStatus::Crossed {
                    let old = track.committed;
                    track.committed = AthleteStatus::Ocs;
                    track.candidate = None;
                    if !track.ocs_announced {
                        track.ocs_announced = true;
                        events.push(StatusEvent {
                            device_id,
                            kind: EventKind::Ocs,
                            old,
                            new: AthleteStatus::Ocs,
                        });
                    }
                }
            }
        }
        events
    }

    /// Clear the start signal (new race) and release all latches.
    pub fn clear_start_signal(&mut self) {
        self.start_signal_ts_ms = None;
        self.reset_latches();
    }

    /// Release latches and one-shot event markers. Called when a new
    /// recording session starts or the operator resets the race.
    pub fn reset_latches(&mut self) {
        for track in self.tracks.values_mut() {
            track.latched = None;
            track.candidate = None;
            track.crossing_ts_ms = None;
            track.crossing_announced = false;
            track.ocs_announced = false;
        }
    }

    /// Note a non-gate update (position path). Recovers a STALE device.
    pub fn touch(&mut self, device_id: u32, now_ms: i64) -> Vec<StatusEvent> {
        let track = self.tracks.entry(device_id).or_default();
        track.last_seen_ms = now_ms;

        if track.committed == AthleteStatus::Stale {
            let old = track.committed;
            let new = track.latched.unwrap_or(AthleteStatus::Safe);
            track.committed = new;
            track.candidate = None;
            return vec![StatusEvent {
                device_id,
                kind: event_kind_for(new, track),
                old,
                new,
            }];
        }
        Vec::new()
    }

    /// Classify one device from its latest gate metric. Returns the
    /// committed status and any transition events.
    pub fn classify(
        &mut self,
        device_id: u32,
        metric: &MetricSnapshot,
        now_ms: i64,
    ) -> (AthleteStatus, Vec<StatusEvent>) {
        let start_signal = self.start_signal_ts_ms;
        let track = self.tracks.entry(device_id).or_default();

        // Rule 1 (staleness) can never hold here: the metric being
        // classified is itself an update. The watchdog sweep owns it.
        track.last_seen_ms = now_ms;

        // Remember the first observed crossing time for the OCS comparison.
        if metric.crossing_event != CrossingEvent::NoCrossing && track.crossing_ts_ms.is_none() {
            track.crossing_ts_ms = Some(metric.crossing_time_us.map(|us| us / 1000).unwrap_or(now_ms));
        }

        let target = if metric.crossing_event != CrossingEvent::NoCrossing || track.latched.is_some() {
            let crossed_early = match (start_signal, track.crossing_ts_ms) {
                (Some(start), Some(crossing)) => crossing < start,
                _ => false,
            };
            if crossed_early || track.latched == Some(AthleteStatus::Ocs) {
                AthleteStatus::Ocs
            } else {
                AthleteStatus::Crossed
            }
        } else if start_signal.is_some()
            && metric.eta_to_line_s.is_some_and(|eta| eta <= self.thresholds.eta_s)
            && metric.speed_to_line_mps > 0.0
        {
            AthleteStatus::Risk
        } else if metric.d_perp_signed_m.abs() <= self.thresholds.distance_m
            && metric.speed_to_line_mps > 0.0
        {
            AthleteStatus::Approaching
        } else {
            AthleteStatus::Safe
        };

        let mut events = Vec::new();
        let status = Self::commit_with_hysteresis(device_id, track, target, now_ms, &mut events);
        (status, events)
    }

    fn commit_with_hysteresis(
        device_id: u32,
        track: &mut DeviceTrack,
        target: AthleteStatus,
        now_ms: i64,
        events: &mut Vec<StatusEvent>,
    ) -> AthleteStatus {
        if target == track.committed {
            track.candidate = None;
            return track.committed;
        }

        let immediate = matches!(
            target,
            AthleteStatus::Crossed | AthleteStatus::Ocs | AthleteStatus::Stale
        );
        let dwelled = matches!(track.candidate, Some((cand, since))
            if cand == target && now_ms - since >= HYSTERESIS_MS);

        if immediate || dwelled {
            let old = track.committed;
            track.committed = target;
            track.candidate = None;
            if target.is_latched() {
                track.latched = Some(target);
            }
            events.push(StatusEvent {
                device_id,
                kind: event_kind_for(target, track),
                old,
                new: target,
            });
            target
        } else {
            match track.candidate {
                Some((cand, _)) if cand == target => {}
                _ => track.candidate = Some((target, now_ms)),
            }
            track.committed
        }
    }

    /// Sweep all devices for staleness; commits STALE transitions. Driven by
    /// the watchdog so devices that stop sending still turn stale.
    pub fn sweep_stale(&mut self, now_ms: i64) -> Vec<StatusEvent> {
        let stale_ms = (self.thresholds.stale_s * 1000.0) as i64;
        let mut events = Vec::new();
        for (&device_id, track) in &mut self.tracks {
            if track.last_seen_ms > 0
                && now_ms - track.last_seen_ms > stale_ms
                && track.committed != AthleteStatus::Stale
            {
                Self::commit_with_hysteresis(device_id, track, AthleteStatus::Stale, now_ms, &mut events);
            }
        }
        events
    }

    pub fn status_of(&self, device_id: u32) -> Option<AthleteStatus> {
        self.tracks.get(&device_id).map(|t| t.committed)
    }
}

/// Which event kind announces a commit into `status`. CROSSING and OCS fire
/// once per latch; later re-entries (e.g. back from STALE) are plain status
/// changes.
fn event_kind_for(status: AthleteStatus, track: &mut DeviceTrack) -> EventKind {
    match status {
        AthleteStatus::Crossed if !track.crossing_announced => {
            track.crossing_announced = true;
            EventKind::Crossing
        }
        AthleteStatus::Ocs if !track.ocs_announced => {
            track.ocs_announced = true;
            EventKind::Ocs
        }
        AthleteStatus::Risk => EventKind::RiskAlert,
        _ => EventKind::StatusChange,
    }
}
