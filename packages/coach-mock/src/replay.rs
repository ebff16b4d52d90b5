//! Session-pack replay.
//!
//! Reads a recorded `.jsonl` pack and re-publishes the upstream frames that
//! would have produced it, paced by the pack's session-relative timestamps.
//! Driving a relay instance with a replayed pack reproduces the recorded
//! run end to end.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use coach_types::{Envelope, Payload, PositionUpdatePayload, StartLineDefinitionPayload};
use tracing::{info, warn};

use crate::publisher::UpstreamPublisher;

/// Last-known anchor fix, re-sent with every replayed position frame.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AnchorFix {
    device_id: u32,
    lat: f64,
    lon: f64,
}

pub struct PackReplayer {
    envelopes: Vec<Envelope>,
}

impl PackReplayer {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading session pack {}", path.display()))?;

        let mut envelopes = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: serde_json::Value =
                serde_json::from_str(line).context("malformed pack line")?;
            if value.get("_meta").and_then(|v| v.as_bool()).unwrap_or(false) {
                continue;
            }
            match serde_json::from_value::<Envelope>(value) {
                Ok(env) => envelopes.push(env),
                Err(e) => warn!("skipping unreadable envelope: {e}"),
            }
        }
        if envelopes.is_empty() {
            bail!("session pack {} holds no envelopes", path.display());
        }
        info!("Loaded session pack: {} ({} envelopes)", path.display(), envelopes.len());
        Ok(Self { envelopes })
    }

    /// Replay at the original cadence. Only the message kinds that originate
    /// upstream are re-published; heartbeats and events are relay-owned and
    /// regenerate on their own.
    ///
    /// Recorded packs carry anchor fixes only inside `start_line_definition`
    /// envelopes (the ingest path keeps anchors out of position batches), so
    /// the last-known fixes ride along with every replayed position frame.
    /// Otherwise the driven relay would age the anchors out and degrade the
    /// line quality mid-replay, which the recorded run never did.
    pub async fn run(&self, publisher: &mut UpstreamPublisher) {
        let base_ts = self.envelopes[0].ts_ms;
        let started = Instant::now();
        let mut anchors: Vec<AnchorFix> = Vec::new();

        for env in &self.envelopes {
            let offset = Duration::from_millis((env.ts_ms - base_ts).max(0) as u64);
            if let Some(wait) = offset.checked_sub(started.elapsed()) {
                tokio::time::sleep(wait).await;
            }
            let now_us = wall_now_us();

            match &env.payload {
                Payload::PositionUpdate(p) => {
                    let frame = position_frame(p, &anchors, now_us);
                    publisher.send_positions(&frame).await;
                }
                Payload::GateMetrics(p) => {
                    let metrics: Vec<_> = p
                        .metrics
                        .iter()
                        .map(|m| {
                            serde_json::json!({
                                "tag_id": format!("T{}", m.device_id.saturating_sub(1)),
                                "d_perp_signed_m": m.dist_to_line_m,
                                "s_along": m.s_along,
                                "gate_length_m": m.gate_length_m,
                                "crossing_event": m.crossing_event,
                                "crossing_confidence": m.crossing_confidence,
                                "tag_position_quality": m.position_quality,
                                "time_to_line_s": m.eta_to_line_s,
                                "speed_to_line_mps": m.speed_to_line_mps,
                            })
                        })
                        .collect();
                    let alerts: Vec<_> = p
                        .alerts
                        .iter()
                        .map(|a| {
                            serde_json::json!({
                                "tag_id": format!("T{}", athlete_tag_index(&a.athlete_id)),
                                "event": a.event,
                                "crossing_time_us": a.crossing_ts_ms * 1000,
                                "confidence": a.confidence,
                            })
                        })
                        .collect();
                    let frame = serde_json::json!({
                        "server_timestamp_us": now_us,
                        "metrics": metrics,
                        "alerts": alerts,
                    });
                    publisher.send_gate(&frame.to_string()).await;
                }
                Payload::StartLineDefinition(p) => {
                    // The line re-enters the pipeline as anchor positions.
                    update_anchors(&mut anchors, p);
                    let frame = position_frame(
                        &PositionUpdatePayload { positions: Vec::new() },
                        &anchors,
                        now_us,
                    );
                    publisher.send_positions(&frame).await;
                }
                _ => {}
            }
        }
        info!("Session pack replay complete");
    }
}

fn update_anchors(anchors: &mut Vec<AnchorFix>, line: &StartLineDefinitionPayload) {
    anchors.clear();
    for anchor in [&line.anchor_left, &line.anchor_right] {
        anchors.push(AnchorFix {
            device_id: anchor.device_id,
            lat: anchor.lat,
            lon: anchor.lon,
        });
    }
}

/// Build one position-text frame from recorded athlete positions plus the
/// current anchor fixes.
fn position_frame(p: &PositionUpdatePayload, anchors: &[AnchorFix], now_us: i64) -> String {
    let mut frame = format!("SERVER_TS:{now_us}\n");
    frame.push_str(&format!("COUNT:{}\n", p.positions.len() + anchors.len()));
    for pos in &p.positions {
        frame.push_str(&format!(
            "POS:{}:{:.8}:{:.8}:{:.2}:{}:{}\n",
            pos.device_id,
            pos.lat,
            pos.lon,
            pos.alt_m,
            pos.source_mask,
            now_us,
        ));
    }
    for anchor in anchors {
        frame.push_str(&format!(
            "POS:{}:{:.8}:{:.8}:0.00:1:{now_us}\n",
            anchor.device_id, anchor.lat, anchor.lon,
        ));
    }
    frame
}

fn wall_now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

/// `"T07"` → `7`; falls back to 0 for unrecognized ids.
fn athlete_tag_index(athlete_id: &str) -> u32 {
    athlete_id
        .strip_prefix('T')
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coach_types::{AnchorPoint, GateQuality, PositionEntry};

    #[test]
    fn tag_index_parsing() {
        assert_eq!(athlete_tag_index("T07"), 7);
        assert_eq!(athlete_tag_index("T0"), 0);
        assert_eq!(athlete_tag_index("DEV3"), 0);
    }

    fn line_definition() -> StartLineDefinitionPayload {
        StartLineDefinitionPayload {
            anchor_left: AnchorPoint {
                device_id: 101,
                anchor_id: "A0".into(),
                lat: 22.296,
                lon: 114.168,
            },
            anchor_right: AnchorPoint {
                device_id: 102,
                anchor_id: "A1".into(),
                lat: 22.2962,
                lon: 114.1685,
            },
            gate_length_m: 56.0,
            quality: GateQuality::Good,
        }
    }

    #[test]
    fn anchors_ride_along_with_every_position_frame() {
        let mut anchors = Vec::new();
        update_anchors(&mut anchors, &line_definition());

        let payload = PositionUpdatePayload {
            positions: vec![PositionEntry {
                athlete_id: "T1".into(),
                device_id: 1,
                name: "CHAN SIU MING".into(),
                team: "HKG".into(),
                lat: 22.2958,
                lon: 114.1681,
                alt_m: 0.3,
                sog_kn: Some(9.0),
                cog_deg: Some(10.0),
                source_mask: 1,
                device_ts_ms: 1_000,
                data_age_ms: 100,
            }],
        };
        let frame = position_frame(&payload, &anchors, 2_000_000);
        assert!(frame.contains("COUNT:3\n"));
        assert!(frame.contains("POS:1:"));
        assert!(frame.contains("POS:101:"));
        assert!(frame.contains("POS:102:"));
    }

    #[test]
    fn no_anchor_lines_before_the_first_definition() {
        let payload = PositionUpdatePayload { positions: Vec::new() };
        let frame = position_frame(&payload, &[], 1_000_000);
        assert!(frame.contains("COUNT:0\n"));
        assert!(!frame.contains("POS:"));
    }
}
