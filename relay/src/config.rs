//! Relay configuration, loaded from `RELAY_*` environment variables.
//!
//! Every knob has a default suitable for a local deployment next to the
//! positioning engine. Invalid values (unparseable numbers, identical anchor
//! ids) are startup failures: the relay refuses to run on a configuration
//! that would produce incorrect data.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream positions endpoint (ZMQ PUB, custom text framing).
    pub position_endpoint: String,
    /// Upstream gate-metrics endpoint (ZMQ PUB, JSON).
    pub gate_endpoint: String,
    /// Topic prefix filters for the two subscriptions.
    pub position_topic: String,
    pub gate_topic: String,

    /// HTTP/WebSocket bind address.
    pub host: String,
    pub port: u16,

    /// APPROACHING radius (meters).
    pub threshold_distance_m: f64,
    /// RISK ETA (seconds).
    pub threshold_time_s: f64,
    /// STALE age (seconds).
    pub threshold_stale_s: f64,

    /// Heartbeat cadence (seconds).
    pub heartbeat_interval_s: f64,

    /// Negate `d_perp_signed_m` on ingress so positive = pre-start side.
    pub gate_sign_flip: bool,

    /// Which anchor devices form the start line.
    pub anchor_left_device_id: u32,
    pub anchor_right_device_id: u32,

    /// Session-pack directory.
    pub session_dir: PathBuf,
    /// Athlete registry path.
    pub athletes_config: PathBuf,

    /// Upstream reconnect backoff bounds (seconds).
    pub reconnect_min_s: f64,
    pub reconnect_max_s: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            position_endpoint: "tcp://localhost:5000".to_string(),
            gate_endpoint: "tcp://localhost:5001".to_string(),
            position_topic: "position".to_string(),
            gate_topic: "gate".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            threshold_distance_m: 50.0,
            threshold_time_s: 5.0,
            threshold_stale_s: 3.0,
            heartbeat_interval_s: 5.0,
            gate_sign_flip: false,
            anchor_left_device_id: 101,
            anchor_right_device_id: 102,
            session_dir: PathBuf::from("./data/session_packs"),
            athletes_config: PathBuf::from("./data/athletes.json"),
            reconnect_min_s: 1.0,
            reconnect_max_s: 30.0,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("invalid {key}={other}: expected a boolean"),
        },
        Err(_) => Ok(default),
    }
}

impl RelayConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            position_endpoint: env_string("RELAY_POSITION_ENDPOINT", &d.position_endpoint),
            gate_endpoint: env_string("RELAY_GATE_ENDPOINT", &d.gate_endpoint),
            position_topic: env_string("RELAY_POSITION_TOPIC", &d.position_topic),
            gate_topic: env_string("RELAY_GATE_TOPIC", &d.gate_topic),
            host: env_string("RELAY_HOST", &d.host),
            port: env_parse("RELAY_PORT", d.port)?,
            threshold_distance_m: env_parse("RELAY_THRESHOLD_DISTANCE_M", d.threshold_distance_m)?,
            threshold_time_s: env_parse("RELAY_THRESHOLD_TIME_S", d.threshold_time_s)?,
            threshold_stale_s: env_parse("RELAY_THRESHOLD_STALE_S", d.threshold_stale_s)?,
            heartbeat_interval_s: env_parse("RELAY_HEARTBEAT_INTERVAL_S", d.heartbeat_interval_s)?,
            gate_sign_flip: env_bool("RELAY_GATE_SIGN_FLIP", d.gate_sign_flip)?,
            anchor_left_device_id: env_parse("RELAY_ANCHOR_LEFT_DEVICE_ID", d.anchor_left_device_id)?,
            anchor_right_device_id: env_parse(
                "RELAY_ANCHOR_RIGHT_DEVICE_ID",
                d.anchor_right_device_id,
            )?,
            session_dir: PathBuf::from(env_string(
                "RELAY_SESSION_DIR",
                &d.session_dir.to_string_lossy(),
            )),
            athletes_config: PathBuf::from(env_string(
                "RELAY_ATHLETES_CONFIG",
                &d.athletes_config.to_string_lossy(),
            )),
            reconnect_min_s: env_parse("RELAY_RECONNECT_MIN_S", d.reconnect_min_s)?,
            reconnect_max_s: env_parse("RELAY_RECONNECT_MAX_S", d.reconnect_max_s)?,
        };
        cfg.validate().context("configuration rejected")?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.anchor_left_device_id == self.anchor_right_device_id {
            bail!(
                "anchor_left_device_id and anchor_right_device_id must differ (both {})",
                self.anchor_left_device_id
            );
        }
        for (name, v) in [
            ("threshold_distance_m", self.threshold_distance_m),
            ("threshold_time_s", self.threshold_time_s),
            ("threshold_stale_s", self.threshold_stale_s),
            ("heartbeat_interval_s", self.heartbeat_interval_s),
            ("reconnect_min_s", self.reconnect_min_s),
            ("reconnect_max_s", self.reconnect_max_s),
        ] {
            if !v.is_finite() || v <= 0.0 {
                bail!("{name} must be a positive number, got {v}");
            }
        }
        if self.reconnect_max_s < self.reconnect_min_s {
            bail!("reconnect_max_s must be >= reconnect_min_s");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = RelayConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.anchor_left_device_id, 101);
    }

    #[test]
    fn identical_anchors_rejected() {
        let cfg = RelayConfig {
            anchor_right_device_id: 101,
            ..RelayConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_threshold_rejected() {
        let cfg = RelayConfig {
            threshold_stale_s: -1.0,
            ..RelayConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
