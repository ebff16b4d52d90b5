//! Synthetic fleet simulation.
//!
//! N athletes approach the start line from spread-out bearings at plausible
//! dinghy speeds. Anchors 101/102 hold the line. Each tick advances the
//! approach and renders the two upstream frame formats.

use std::f64::consts::TAU;

use rand::Rng;
use rand_distr::{Distribution, Uniform};

/// Start-line anchors (Hong Kong waters).
pub const ANCHOR_LEFT: (u32, f64, f64) = (101, 22.29600, 114.16800);
pub const ANCHOR_RIGHT: (u32, f64, f64) = (102, 22.29620, 114.16850);

const METERS_PER_DEG_LAT: f64 = 111_320.0;
const KNOTS_TO_MPS: f64 = 1.0 / 1.94384;

/// Boats ease off inside this distance of the line, holding position until
/// the last approach.
const TACTICAL_SLOWDOWN_DISTANCE_M: f64 = 30.0;
const TACTICAL_SLOWDOWN_FACTOR: f64 = 0.6;

/// Fleet roster; device ids are 1-based, tags are `T{i}`.
const NAMES: [&str; 25] = [
    "CHAN SIU MING", "WONG KA HO", "LEE SONGHA", "LAM HOI YAN",
    "CHEUNG WAI KIT", "NG CHI FUNG", "TSANG YIK HEI", "HO MAN WAI",
    "YIP CHUN HIM", "FUNG KA LONG", "LEUNG PAK YIN", "CHENG WING YAN",
    "TANG SZE WING", "LUI TSZ CHING", "MAK YEE TING", "KWOK HIN WAH",
    "AU YEUNG TSZ KIN", "SIN KA YAN", "POON SZE MAN", "LAU WING TUNG",
    "CHOW HOI CHING", "IP KA MAN", "SO TSZ YIN", "YUEN WING LAM",
    "CHAN TSZ HIN",
];

/// Registry document for the fleet, in the relay's `athletes.json` shape.
/// Lets an operator bootstrap a matching registry with `--write-registry`.
pub fn roster_json(n: usize) -> serde_json::Value {
    let athletes: Vec<_> = (0..n)
        .map(|i| {
            serde_json::json!({
                "device_id": i + 1,
                "athlete_id": format!("T{i:02}"),
                "name": NAMES[i % NAMES.len()],
                "team": "HKG",
            })
        })
        .collect();
    serde_json::json!({ "athletes": athletes })
}

struct AthleteSim {
    device_id: u32,
    tag_id: String,
    /// Approach bearing from the line midpoint.
    angle_rad: f64,
    /// Signed distance to the line; positive while on the pre-start side.
    dist_m: f64,
    /// Nominal speed for this boat.
    base_speed_mps: f64,
    /// Current speed, lagging toward the tactical target.
    speed_mps: f64,
    crossed: bool,
    /// Crossing pending announcement in the next gate frame.
    crossing_at_us: Option<i64>,
}

pub struct Fleet {
    athletes: Vec<AthleteSim>,
    gate_length_m: f64,
}

impl Fleet {
    /// Build a fleet of `n` athletes. With `ocs`, the first two start close
    /// enough to cross within a few seconds.
    pub fn new(n: usize, ocs: bool) -> Self {
        let mut rng = rand::thread_rng();
        let speed_kn = Uniform::new(5.0, 12.0);
        let start_dist = Uniform::new(80.0, 200.0);

        let athletes = (0..n)
            .map(|i| {
                let early = ocs && i < 2;
                let base_speed_mps = speed_kn.sample(&mut rng) * KNOTS_TO_MPS;
                AthleteSim {
                    device_id: i as u32 + 1,
                    tag_id: format!("T{i}"),
                    angle_rad: (TAU * i as f64) / n as f64 + rng.gen_range(-0.3..0.3),
                    dist_m: if early {
                        rng.gen_range(15.0..25.0)
                    } else {
                        start_dist.sample(&mut rng)
                    },
                    base_speed_mps,
                    speed_mps: base_speed_mps,
                    crossed: false,
                    crossing_at_us: None,
                }
            })
            .collect();

        let gate_length_m = {
            let dlat = (ANCHOR_RIGHT.1 - ANCHOR_LEFT.1) * METERS_PER_DEG_LAT;
            let dlon = (ANCHOR_RIGHT.2 - ANCHOR_LEFT.2)
                * METERS_PER_DEG_LAT
                * ANCHOR_LEFT.1.to_radians().cos();
            dlat.hypot(dlon)
        };
        Self { athletes, gate_length_m }
    }

    pub fn athlete_count(&self) -> usize {
        self.athletes.len()
    }

    /// Advance the approach by `dt` seconds. Boats inside the tactical zone
    /// target a reduced speed; the current speed lags toward the target with
    /// a first-order response.
    pub fn tick(&mut self, dt: f64, now_us: i64) {
        for a in &mut self.athletes {
            let target = if !a.crossed && a.dist_m < TACTICAL_SLOWDOWN_DISTANCE_M {
                a.base_speed_mps * TACTICAL_SLOWDOWN_FACTOR
            } else {
                a.base_speed_mps
            };
            a.speed_mps += (target - a.speed_mps) * (dt * 2.0).min(1.0);

            a.dist_m -= a.speed_mps * dt;
            if a.dist_m <= 0.0 && !a.crossed {
                a.crossed = true;
                a.crossing_at_us = Some(now_us);
            }
        }
    }

    fn latlon(&self, a: &AthleteSim) -> (f64, f64) {
        let mid_lat = (ANCHOR_LEFT.1 + ANCHOR_RIGHT.1) / 2.0;
        let mid_lon = (ANCHOR_LEFT.2 + ANCHOR_RIGHT.2) / 2.0;
        let dist = a.dist_m.max(0.5);
        let mut rng = rand::thread_rng();
        let lat = mid_lat + dist * a.angle_rad.cos() / METERS_PER_DEG_LAT
            + rng.gen_range(-5e-6..5e-6);
        let lon = mid_lon
            + dist * a.angle_rad.sin() / (METERS_PER_DEG_LAT * mid_lat.to_radians().cos())
            + rng.gen_range(-5e-6..5e-6);
        (lat, lon)
    }

    /// Render the position-text frame: athletes plus both anchors.
    pub fn position_frame(&self, now_us: i64) -> String {
        let mut rng = rand::thread_rng();
        let mut out = format!("SERVER_TS:{now_us}\n");
        out.push_str(&format!("COUNT:{}\n", self.athletes.len() + 2));

        for a in &self.athletes {
            let (lat, lon) = self.latlon(a);
            let alt = 0.3 + rng.gen_range(-0.1..0.1);
            let device_ts = now_us - rng.gen_range(50_000..200_000);
            out.push_str(&format!(
                "POS:{}:{lat:.8}:{lon:.8}:{alt:.2}:1:{device_ts}\n",
                a.device_id
            ));
        }
        for (dev, lat, lon) in [ANCHOR_LEFT, ANCHOR_RIGHT] {
            out.push_str(&format!("POS:{dev}:{lat:.8}:{lon:.8}:0.00:1:{now_us}\n"));
        }
        out
    }

    /// Render the gate-metrics JSON frame. A crossing is announced exactly
    /// once, in both the metric and the alerts list.
    pub fn gate_frame(&mut self, now_us: i64) -> String {
        let mut rng = rand::thread_rng();
        let mut metrics = Vec::with_capacity(self.athletes.len());
        let mut alerts = Vec::new();

        for a in &mut self.athletes {
            let crossing_at = a.crossing_at_us.take();
            let crossing_event = if crossing_at.is_some() {
                "CROSSING_LEFT"
            } else {
                "NO_CROSSING"
            };
            if let Some(at_us) = crossing_at {
                alerts.push(serde_json::json!({
                    "tag_id": a.tag_id,
                    "event": "CROSSING_LEFT",
                    "crossing_time_us": at_us,
                    "confidence": rng.gen_range(0.80..0.98),
                }));
            }

            let eta = (a.speed_mps > 0.1 && !a.crossed).then(|| a.dist_m.abs() / a.speed_mps);
            metrics.push(serde_json::json!({
                "tag_id": a.tag_id,
                "d_perp_signed_m": a.dist_m,
                "s_along": rng.gen_range(0.1..0.9),
                "gate_length_m": self.gate_length_m,
                "crossing_event": crossing_event,
                "crossing_time_us": crossing_at,
                "crossing_confidence": if crossing_at.is_some() { 0.9 } else { 0.0 },
                "tag_position_quality": rng.gen_range(0.7..0.99),
                "time_to_line_s": eta,
                "speed_to_line_mps": if a.crossed { 0.0 } else { a.speed_mps },
            }));
        }

        serde_json::json!({
            "server_timestamp_us": now_us,
            "metrics": metrics,
            "alerts": alerts,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_covers_the_fleet() {
        let roster = roster_json(25);
        assert_eq!(roster["athletes"].as_array().unwrap().len(), 25);
        assert_eq!(roster["athletes"][0]["athlete_id"], "T00");

        let fleet = Fleet::new(25, false);
        assert_eq!(fleet.athlete_count(), 25);
    }

    #[test]
    fn position_frame_has_anchors_and_count() {
        let fleet = Fleet::new(3, false);
        let frame = fleet.position_frame(1_000_000);
        assert!(frame.starts_with("SERVER_TS:1000000\n"));
        assert!(frame.contains("COUNT:5\n"));
        assert!(frame.contains("POS:101:"));
        assert!(frame.contains("POS:102:"));
        assert_eq!(frame.matches("POS:").count(), 5);
    }

    #[test]
    fn approach_eases_off_inside_the_tactical_zone() {
        let mut fleet = Fleet::new(1, false);
        fleet.athletes[0].dist_m = 200.0;
        fleet.athletes[0].base_speed_mps = 5.0;
        fleet.athletes[0].speed_mps = 5.0;

        // Far from the line: full speed.
        fleet.tick(0.1, 1_000_000);
        assert!((fleet.athletes[0].speed_mps - 5.0).abs() < 1e-9);

        // Inside the zone the speed lags down toward the reduced target.
        fleet.athletes[0].dist_m = 10.0;
        for i in 0..5 {
            fleet.tick(0.1, 1_100_000 + i);
        }
        let eased = fleet.athletes[0].speed_mps;
        assert!(eased < 4.0, "speed {eased}");
        assert!(eased >= 5.0 * TACTICAL_SLOWDOWN_FACTOR - 1e-9, "speed {eased}");
        assert!(!fleet.athletes[0].crossed);
    }

    #[test]
    fn crossing_announced_exactly_once() {
        let mut fleet = Fleet::new(1, false);
        fleet.athletes[0].dist_m = 0.5;
        fleet.athletes[0].base_speed_mps = 5.0;
        fleet.athletes[0].speed_mps = 5.0;

        fleet.tick(1.0, 2_000_000);
        let first: serde_json::Value = serde_json::from_str(&fleet.gate_frame(2_000_000)).unwrap();
        assert_eq!(first["alerts"].as_array().unwrap().len(), 1);
        assert_eq!(first["metrics"][0]["crossing_event"], "CROSSING_LEFT");

        fleet.tick(0.1, 2_100_000);
        let second: serde_json::Value = serde_json::from_str(&fleet.gate_frame(2_100_000)).unwrap();
        assert!(second["alerts"].as_array().unwrap().is_empty());
        assert_eq!(second["metrics"][0]["crossing_event"], "NO_CROSSING");
    }

    #[test]
    fn ocs_preset_puts_leaders_near_the_line() {
        let fleet = Fleet::new(5, true);
        assert!(fleet.athletes[0].dist_m < 30.0);
        assert!(fleet.athletes[1].dist_m < 30.0);
    }
}
