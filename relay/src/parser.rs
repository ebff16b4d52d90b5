//! Parsers for the two upstream frame formats.
//!
//! Port 5000 (positions): custom text framing. Port 5001 (gate metrics):
//! JSON. Both parsers are pure: no I/O, no shared state beyond diagnostic
//! counters. A malformed line or metric is dropped and counted; the rest of
//! the batch still yields valid records. A malformed frame never crosses the
//! parser boundary.

use std::sync::atomic::{AtomicU64, Ordering};

use coach_types::CrossingEvent;
use serde::Deserialize;
use tracing::{debug, warn};

// ── Diagnostic counters ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ParserCounters {
    pub position_batches: AtomicU64,
    pub position_lines: AtomicU64,
    pub position_errors: AtomicU64,
    pub gate_batches: AtomicU64,
    pub gate_metric_errors: AtomicU64,
    pub gate_errors: AtomicU64,
}

impl ParserCounters {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "position_batches": self.position_batches.load(Ordering::Relaxed),
            "position_lines": self.position_lines.load(Ordering::Relaxed),
            "position_errors": self.position_errors.load(Ordering::Relaxed),
            "gate_batches": self.gate_batches.load(Ordering::Relaxed),
            "gate_metric_errors": self.gate_metric_errors.load(Ordering::Relaxed),
            "gate_errors": self.gate_errors.load(Ordering::Relaxed),
        })
    }
}

// ── Position batch (custom text format) ───────────────────────────────────────

/// A single position line parsed from the upstream text format.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPosition {
    pub device_id: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub source_mask: u32,
    pub device_timestamp_us: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RawPositionBatch {
    pub server_timestamp_us: i64,
    pub positions: Vec<RawPosition>,
}

/// Parse a position batch:
///
/// ```text
/// SERVER_TS:<server_timestamp_us>
/// COUNT:<num_positions>
/// POS:<device_id>:<lat>:<lon>:<alt>:<source_mask>:<device_timestamp_us>
/// ```
///
/// `COUNT` is informational; positions are counted from `POS` lines. Unknown
/// prefixes, blank lines and trailing whitespace are tolerated.
pub fn parse_position_batch(raw: &str, counters: &ParserCounters) -> RawPositionBatch {
    let mut batch = RawPositionBatch::default();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(ts) = line.strip_prefix("SERVER_TS:") {
            match ts.trim().parse::<i64>() {
                Ok(v) => batch.server_timestamp_us = v,
                Err(_) => {
                    warn!("Malformed SERVER_TS line: {line}");
                    counters.position_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else if line.starts_with("COUNT:") {
            // informational only
        } else if line.starts_with("POS:") {
            match parse_pos_line(line) {
                Some(pos) => {
                    batch.positions.push(pos);
                    counters.position_lines.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    warn!("Malformed POS line: {line}");
                    counters.position_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else {
            debug!("Ignoring unknown line prefix: {}", line.get(..30).unwrap_or(line));
        }
    }

    counters.position_batches.fetch_add(1, Ordering::Relaxed);
    batch
}

fn parse_pos_line(line: &str) -> Option<RawPosition> {
    let mut parts = line.split(':');
    parts.next(); // "POS"
    Some(RawPosition {
        device_id: parts.next()?.trim().parse().ok()?,
        latitude: parts.next()?.trim().parse().ok()?,
        longitude: parts.next()?.trim().parse().ok()?,
        altitude: parts.next()?.trim().parse().ok()?,
        source_mask: parts.next()?.trim().parse().ok()?,
        device_timestamp_us: parts.next()?.trim().parse().ok()?,
    })
}

// ── Gate metrics batch (JSON) ─────────────────────────────────────────────────

/// A single gate metric from the upstream JSON output. Tags are identified
/// by string id (`"T0"`, `"T1"`, …); the ingest path maps them to numeric
/// device ids.
#[derive(Debug, Clone, Deserialize)]
pub struct RawGateMetric {
    pub tag_id: String,
    pub d_perp_signed_m: f64,
    pub s_along: f64,
    pub gate_length_m: f64,
    pub crossing_event: CrossingEvent,
    pub crossing_confidence: f64,
    #[serde(rename = "tag_position_quality")]
    pub position_quality: f64,
    #[serde(default)]
    pub crossing_time_us: Option<i64>,
    #[serde(default)]
    pub time_to_line_s: Option<f64>,
    #[serde(default)]
    pub speed_to_line_mps: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawGateAlert {
    pub tag_id: String,
    pub event: CrossingEvent,
    #[serde(default)]
    pub crossing_time_us: i64,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RawGateMetricsBatch {
    pub server_timestamp_us: i64,
    pub metrics: Vec<RawGateMetric>,
    pub alerts: Vec<RawGateAlert>,
}

/// Parse a gate metrics batch. The batch envelope must be valid JSON;
/// individual metrics or alerts with missing/invalid required fields are
/// dropped one by one. Unknown fields are ignored.
pub fn parse_gate_batch(raw: &str, counters: &ParserCounters) -> Option<RawGateMetricsBatch> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!("Failed to parse gate metrics batch: {e}");
            counters.gate_errors.fetch_add(1, Ordering::Relaxed);
            return None;
        }
    };

    let mut batch = RawGateMetricsBatch {
        server_timestamp_us: value
            .get("server_timestamp_us")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        ..Default::default()
    };

    if let Some(metrics) = value.get("metrics").and_then(|v| v.as_array()) {
        for m in metrics {
            match serde_json::from_value::<RawGateMetric>(m.clone()) {
                Ok(metric) => batch.metrics.push(metric),
                Err(e) => {
                    warn!("Dropping malformed gate metric: {e}");
                    counters.gate_metric_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    if let Some(alerts) = value.get("alerts").and_then(|v| v.as_array()) {
        for a in alerts {
            match serde_json::from_value::<RawGateAlert>(a.clone()) {
                Ok(alert) => batch.alerts.push(alert),
                Err(e) => {
                    warn!("Dropping malformed gate alert: {e}");
                    counters.gate_metric_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    counters.gate_batches.fetch_add(1, Ordering::Relaxed);
    Some(batch)
}

/// Map a tag string like `"T0"` to its numeric device id (T0=1, T1=2, …).
pub fn tag_id_to_device_id(tag_id: &str) -> Option<u32> {
    let idx: u32 = tag_id.strip_prefix('T')?.parse().ok()?;
    Some(idx + 1)
}
