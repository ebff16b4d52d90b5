//! # coach-types
//!
//! Shared WebSocket wire-contract types for the coach monitor relay.
//!
//! These types are used by:
//! - `relay`: fabricating and broadcasting outbound envelopes
//! - `coach-mock`: decoding recorded session packs for replay
//!
//! ## Wire Conventions
//!
//! - One WebSocket frame = one JSON envelope (UTF-8)
//! - All timestamps on the wire are milliseconds since Unix epoch
//! - Speeds: knots for SOG, m/s for speed-to-line; distances in meters;
//!   angles in degrees, [0, 360)
//! - `seq` is monotonically increasing per relay process, starting at 1

use serde::{Deserialize, Serialize};

/// Wire schema version stamped into every envelope and pack header.
pub const SCHEMA_VERSION: &str = "1.0";

// ── Enums ─────────────────────────────────────────────────────────────────────

/// Outbound message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    PositionUpdate,
    GateMetrics,
    StartLineDefinition,
    DeviceHealth,
    Event,
    Heartbeat,
}

/// Coaching status classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AthleteStatus {
    #[default]
    Safe,
    Approaching,
    Risk,
    Crossed,
    Ocs,
    Stale,
}

impl AthleteStatus {
    /// CROSSED and OCS are latched: later samples never regress them.
    pub fn is_latched(self) -> bool {
        matches!(self, AthleteStatus::Crossed | AthleteStatus::Ocs)
    }
}

/// Crossing event reported by the upstream gate engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrossingEvent {
    #[default]
    NoCrossing,
    CrossingLeft,
    CrossingRight,
}

/// Discrete event kinds carried in `event` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Crossing,
    Ocs,
    RiskAlert,
    StatusChange,
    StartSignal,
    DeviceOffline,
    DeviceOnline,
    SystemError,
}

/// Device categories for device-health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Anchor,
    Tag,
    Gateway,
}

/// Start-line quality assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateQuality {
    Good,
    Degraded,
    #[default]
    Unknown,
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// A single athlete position within a `position_update` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEntry {
    pub athlete_id: String,
    pub device_id: u32,
    pub name: String,
    pub team: String,
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f64,
    pub sog_kn: Option<f64>,
    pub cog_deg: Option<f64>,
    pub source_mask: u32,
    pub device_ts_ms: i64,
    pub data_age_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdatePayload {
    pub positions: Vec<PositionEntry>,
}

/// A single athlete's gate metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateMetricEntry {
    pub athlete_id: String,
    pub device_id: u32,
    pub name: String,
    pub dist_to_line_m: f64,
    pub s_along: f64,
    pub eta_to_line_s: Option<f64>,
    pub speed_to_line_mps: f64,
    pub gate_length_m: f64,
    pub status: AthleteStatus,
    #[serde(default)]
    pub crossing_event: CrossingEvent,
    #[serde(default)]
    pub crossing_confidence: f64,
    #[serde(default)]
    pub position_quality: f64,
}

/// A crossing alert forwarded from the upstream gate engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateAlert {
    pub athlete_id: String,
    pub name: String,
    pub event: CrossingEvent,
    pub crossing_ts_ms: i64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateMetricsPayload {
    pub metrics: Vec<GateMetricEntry>,
    #[serde(default)]
    pub alerts: Vec<GateAlert>,
}

/// An anchor endpoint of the start line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorPoint {
    pub device_id: u32,
    pub anchor_id: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartLineDefinitionPayload {
    pub anchor_left: AnchorPoint,
    pub anchor_right: AnchorPoint,
    pub gate_length_m: f64,
    #[serde(default)]
    pub quality: GateQuality,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHealthPayload {
    pub device_id: String,
    pub device_type: DeviceType,
    pub online: bool,
    pub last_seen_ms: i64,
    pub battery_pct: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    pub rssi_dbm: Option<f64>,
    pub time_sync_offset_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_kind: EventKind,
    pub athlete_id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub uptime_s: i64,
    pub connected_clients: u32,
    pub zmq_position_connected: bool,
    pub zmq_gate_connected: bool,
    pub athletes_tracked: u32,
    pub messages_relayed: u64,
}

/// Envelope payload. Untagged: the field sets of the variants are disjoint,
/// so pack replay can round-trip without consulting the envelope `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    PositionUpdate(PositionUpdatePayload),
    GateMetrics(GateMetricsPayload),
    StartLineDefinition(StartLineDefinitionPayload),
    DeviceHealth(DeviceHealthPayload),
    Event(EventPayload),
    Heartbeat(HeartbeatPayload),
}

impl Payload {
    /// The envelope `type` this payload belongs under.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::PositionUpdate(_) => MessageType::PositionUpdate,
            Payload::GateMetrics(_) => MessageType::GateMetrics,
            Payload::StartLineDefinition(_) => MessageType::StartLineDefinition,
            Payload::DeviceHealth(_) => MessageType::DeviceHealth,
            Payload::Event(_) => MessageType::Event,
            Payload::Heartbeat(_) => MessageType::Heartbeat,
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Common outbound message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub schema_version: String,
    pub seq: u64,
    pub ts_ms: i64,
    pub session_id: Option<String>,
    pub payload: Payload,
}

impl Envelope {
    /// Serialize for WebSocket transmission. Envelopes are built from
    /// in-memory types, so serialization cannot fail in practice.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: Payload) -> Envelope {
        Envelope {
            kind: payload.message_type(),
            schema_version: SCHEMA_VERSION.to_string(),
            seq: 1,
            ts_ms: 1_700_000_000_000,
            session_id: Some("S2026-08-02-1".to_string()),
            payload,
        }
    }

    fn roundtrip(env: &Envelope) -> Envelope {
        serde_json::from_str(&env.to_json()).expect("envelope must round-trip")
    }

    #[test]
    fn enum_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageType::PositionUpdate).unwrap(),
            "\"position_update\""
        );
        assert_eq!(serde_json::to_string(&AthleteStatus::Ocs).unwrap(), "\"OCS\"");
        assert_eq!(
            serde_json::to_string(&CrossingEvent::CrossingLeft).unwrap(),
            "\"CROSSING_LEFT\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::RiskAlert).unwrap(),
            "\"RISK_ALERT\""
        );
        assert_eq!(serde_json::to_string(&GateQuality::Degraded).unwrap(), "\"DEGRADED\"");
    }

    #[test]
    fn position_update_roundtrip() {
        let env = envelope(Payload::PositionUpdate(PositionUpdatePayload {
            positions: vec![PositionEntry {
                athlete_id: "T1".into(),
                device_id: 1,
                name: "CHAN SIU MING".into(),
                team: "HKG".into(),
                lat: 22.296,
                lon: 114.168,
                alt_m: 0.3,
                sog_kn: Some(9.4),
                cog_deg: Some(187.0),
                source_mask: 1,
                device_ts_ms: 1_700_000_000_000,
                data_age_ms: 120,
            }],
        }));
        let back = roundtrip(&env);
        assert_eq!(back.kind, MessageType::PositionUpdate);
        assert!(matches!(back.payload, Payload::PositionUpdate(p) if p.positions.len() == 1));
    }

    #[test]
    fn gate_metrics_roundtrip_keeps_alerts() {
        let env = envelope(Payload::GateMetrics(GateMetricsPayload {
            metrics: vec![GateMetricEntry {
                athlete_id: "T1".into(),
                device_id: 1,
                name: "CHAN SIU MING".into(),
                dist_to_line_m: -5.2,
                s_along: 0.4,
                eta_to_line_s: Some(2.1),
                speed_to_line_mps: 2.5,
                gate_length_m: 523.0,
                status: AthleteStatus::Risk,
                crossing_event: CrossingEvent::NoCrossing,
                crossing_confidence: 0.0,
                position_quality: 0.95,
            }],
            alerts: vec![GateAlert {
                athlete_id: "T2".into(),
                name: "WONG KA HO".into(),
                event: CrossingEvent::CrossingLeft,
                crossing_ts_ms: 1_700_000_000_500,
                confidence: 0.92,
            }],
        }));
        let back = roundtrip(&env);
        match back.payload {
            Payload::GateMetrics(p) => {
                assert_eq!(p.metrics[0].status, AthleteStatus::Risk);
                assert_eq!(p.alerts.len(), 1);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn untagged_payload_discriminates_all_variants() {
        let payloads = vec![
            Payload::StartLineDefinition(StartLineDefinitionPayload {
                anchor_left: AnchorPoint {
                    device_id: 101,
                    anchor_id: "A0".into(),
                    lat: 22.12,
                    lon: 114.12,
                },
                anchor_right: AnchorPoint {
                    device_id: 102,
                    anchor_id: "A1".into(),
                    lat: 22.121,
                    lon: 114.125,
                },
                gate_length_m: 523.0,
                quality: GateQuality::Good,
            }),
            Payload::DeviceHealth(DeviceHealthPayload {
                device_id: "102".into(),
                device_type: DeviceType::Anchor,
                online: false,
                last_seen_ms: 1_700_000_000_000,
                battery_pct: None,
                packet_loss_pct: None,
                rssi_dbm: None,
                time_sync_offset_ms: None,
            }),
            Payload::Event(EventPayload {
                event_kind: EventKind::DeviceOffline,
                athlete_id: None,
                name: None,
                details: serde_json::Map::new(),
            }),
            Payload::Heartbeat(HeartbeatPayload {
                uptime_s: 42,
                connected_clients: 3,
                zmq_position_connected: true,
                zmq_gate_connected: true,
                athletes_tracked: 25,
                messages_relayed: 1234,
            }),
        ];
        for payload in payloads {
            let expected = payload.message_type();
            let back = roundtrip(&envelope(payload));
            assert_eq!(back.payload.message_type(), expected);
        }
    }

    #[test]
    fn session_id_serializes_as_null_when_absent() {
        let mut env = envelope(Payload::Heartbeat(HeartbeatPayload {
            uptime_s: 0,
            connected_clients: 0,
            zmq_position_connected: false,
            zmq_gate_connected: false,
            athletes_tracked: 0,
            messages_relayed: 0,
        }));
        env.session_id = None;
        let json: serde_json::Value = serde_json::from_str(&env.to_json()).unwrap();
        assert!(json.get("session_id").unwrap().is_null());
        assert_eq!(json.get("schema_version").unwrap(), "1.0");
    }
}
