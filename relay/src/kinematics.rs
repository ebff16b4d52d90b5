//! Speed-over-ground / course-over-ground derivation and geodesic helpers.
//!
//! SOG/COG come from finite differences over a short per-device position
//! history kept in the upstream device time base. Wall clock never enters
//! these computations.

use std::collections::HashMap;
use std::collections::VecDeque;

/// m/s → knots.
pub const MPS_TO_KNOTS: f64 = 1.94384;

/// Mean Earth radius (meters).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Sample gaps below this are treated as timing jitter.
const MIN_DT_S: f64 = 0.05;
/// Sample gaps above this are treated as a data gap.
const MAX_DT_S: f64 = 2.0;

/// Derived velocity for one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kinematics {
    /// Speed over ground, knots.
    pub sog_kn: f64,
    /// Course over ground, degrees [0, 360).
    pub cog_deg: f64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    lat: f64,
    lon: f64,
    ts_s: f64,
}

/// Per-device sliding position history.
pub struct KinematicsTracker {
    max_samples: usize,
    max_age_s: f64,
    histories: HashMap<u32, VecDeque<Sample>>,
}

impl KinematicsTracker {
    pub fn new(max_samples: usize, max_age_s: f64) -> Self {
        Self {
            max_samples,
            max_age_s,
            histories: HashMap::new(),
        }
    }

    /// Record a position sample (device time, microseconds) and return the
    /// latest velocity estimate, or `None` when the history cannot support
    /// one (fewer than two fresh samples, jitter, or a gap).
    pub fn update(&mut self, device_id: u32, lat: f64, lon: f64, device_ts_us: i64) -> Option<Kinematics> {
        let ts_s = device_ts_us as f64 / 1_000_000.0;
        let history = self.histories.entry(device_id).or_default();

        history.push_back(Sample { lat, lon, ts_s });
        while history.len() > self.max_samples {
            history.pop_front();
        }
        // Age is measured against the newest sample: both clocks are device
        // time, wall clock stays out of it.
        while let Some(front) = history.front() {
            if ts_s - front.ts_s > self.max_age_s && history.len() > 1 {
                history.pop_front();
            } else {
                break;
            }
        }

        if history.len() < 2 {
            return None;
        }
        let p1 = history[history.len() - 1];
        let p0 = history[history.len() - 2];

        let dt = p1.ts_s - p0.ts_s;
        if dt < MIN_DT_S || dt > MAX_DT_S {
            return None;
        }

        // Equirectangular projection around the previous point.
        let lat0_rad = p0.lat.to_radians();
        let d_east = lat0_rad.cos() * (p1.lon - p0.lon).to_radians() * EARTH_RADIUS_M;
        let d_north = (p1.lat - p0.lat).to_radians() * EARTH_RADIUS_M;

        let speed_mps = d_east.hypot(d_north) / dt;
        let sog_kn = speed_mps * MPS_TO_KNOTS;
        let cog_deg = (d_east.atan2(d_north).to_degrees() + 360.0) % 360.0;

        Some(Kinematics {
            sog_kn: (sog_kn * 10.0).round() / 10.0,
            cog_deg: (cog_deg * 10.0).round() / 10.0,
        })
    }

    /// Drop a device's history (e.g. after a long offline period).
    pub fn forget(&mut self, device_id: u32) {
        self.histories.remove(&device_id);
    }
}

// ── Geodesic helpers ─────────────────────────────────────────────────────────

/// Great-circle distance between two lat/lon points, meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Initial great-circle bearing from point 1 to point 2, degrees [0, 360).
pub fn initial_bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const US: i64 = 1_000_000;

    #[test]
    fn single_sample_yields_nothing() {
        let mut tr = KinematicsTracker::new(32, 2.0);
        assert!(tr.update(1, 22.296, 114.168, 0).is_none());
    }

    #[test]
    fn northward_run_gives_zero_cog_and_expected_sog() {
        let mut tr = KinematicsTracker::new(32, 2.0);
        tr.update(1, 22.29600, 114.16800, 0);
        // ~1.113 m north in 0.1 s → ~11.13 m/s ≈ 21.6 kn
        let k = tr.update(1, 22.29601, 114.16800, 100_000).unwrap();
        assert!((k.cog_deg - 0.0).abs() < 0.5, "cog {}", k.cog_deg);
        assert!((k.sog_kn - 21.6).abs() < 0.5, "sog {}", k.sog_kn);
    }

    #[test]
    fn eastward_run_gives_ninety_cog() {
        let mut tr = KinematicsTracker::new(32, 2.0);
        tr.update(1, 22.296, 114.16800, 0);
        let k = tr.update(1, 22.296, 114.16810, 500_000).unwrap();
        assert!((k.cog_deg - 90.0).abs() < 0.5, "cog {}", k.cog_deg);
    }

    #[test]
    fn jitter_gap_and_stale_history_yield_null() {
        let mut tr = KinematicsTracker::new(32, 2.0);
        tr.update(1, 22.296, 114.168, 0);
        // 10 ms gap: jitter
        assert!(tr.update(1, 22.2961, 114.168, 10_000).is_none());
        // 3 s gap: data gap
        assert!(tr.update(1, 22.2962, 114.168, 3 * US + 10_000).is_none());
    }

    #[test]
    fn history_is_bounded() {
        let mut tr = KinematicsTracker::new(4, 60.0);
        for i in 0..20 {
            tr.update(1, 22.296 + i as f64 * 1e-5, 114.168, i * US / 10);
        }
        assert!(tr.histories.get(&1).unwrap().len() <= 4);
    }

    #[test]
    fn haversine_known_distance() {
        // Reference geometry: anchors ~527 m apart.
        let d = haversine_m(22.1200, 114.1200, 22.1210, 114.1250);
        assert!((d - 526.9).abs() < 1.0, "distance {d}");
    }

    #[test]
    fn bearing_cardinal_directions() {
        assert!((initial_bearing_deg(22.0, 114.0, 23.0, 114.0) - 0.0).abs() < 0.1);
        let east = initial_bearing_deg(22.0, 114.0, 22.0, 115.0);
        assert!((east - 90.0).abs() < 1.0, "east {east}");
    }
}
