//! Start-line geometry tracking.
//!
//! Anchors report positions on the position stream; the tracker keeps the
//! configured left/right pair, recomputes gate length, and decides when the
//! geometry has moved enough to republish a `start_line_definition`.

use coach_types::{AnchorPoint, GateQuality, StartLineDefinitionPayload};

use crate::kinematics::haversine_m;

/// Anchor fixes older than this no longer count as recent.
const FRESH_FIX_MS: i64 = 2_000;

/// Plausible gate length band for a GOOD line.
const MIN_GATE_LENGTH_M: f64 = 1.0;
const MAX_GATE_LENGTH_M: f64 = 1_000.0;

#[derive(Debug, Clone, Copy)]
struct AnchorFix {
    lat: f64,
    lon: f64,
    updated_ms: i64,
}

pub struct StartLineTracker {
    left_id: u32,
    right_id: u32,
    /// An anchor must move this far before the line is republished.
    geometry_threshold_m: f64,
    left: Option<AnchorFix>,
    right: Option<AnchorFix>,
    announced_left: Option<(f64, f64)>,
    announced_right: Option<(f64, f64)>,
    announced_quality: Option<GateQuality>,
}

impl StartLineTracker {
    pub fn new(left_id: u32, right_id: u32, geometry_threshold_m: f64) -> Self {
        Self {
            left_id,
            right_id,
            geometry_threshold_m,
            left: None,
            right: None,
            announced_left: None,
            announced_right: None,
            announced_quality: None,
        }
    }

    pub fn is_anchor(&self, device_id: u32) -> bool {
        (101..=199).contains(&device_id)
    }

    /// Record an anchor position. Returns a definition payload when the line
    /// first becomes complete or an anchor moved beyond the geometry
    /// threshold since the last announcement.
    pub fn update_anchor(
        &mut self,
        device_id: u32,
        lat: f64,
        lon: f64,
        now_ms: i64,
    ) -> Option<StartLineDefinitionPayload> {
        let fix = AnchorFix { lat, lon, updated_ms: now_ms };
        if device_id == self.left_id {
            self.left = Some(fix);
        } else if device_id == self.right_id {
            self.right = Some(fix);
        } else {
            // Spare anchors are tracked for health only, not line geometry.
            return None;
        }

        let (left, right) = (self.left?, self.right?);
        let moved = self.moved_since_announcement(left, right);
        if self.announced_left.is_none() || moved > self.geometry_threshold_m {
            return Some(self.announce(left, right, now_ms));
        }
        None
    }

    fn moved_since_announcement(&self, left: AnchorFix, right: AnchorFix) -> f64 {
        let moved_left = self
            .announced_left
            .map(|(lat, lon)| haversine_m(lat, lon, left.lat, left.lon))
            .unwrap_or(f64::INFINITY);
        let moved_right = self
            .announced_right
            .map(|(lat, lon)| haversine_m(lat, lon, right.lat, right.lon))
            .unwrap_or(f64::INFINITY);
        moved_left.max(moved_right)
    }

    fn announce(&mut self, left: AnchorFix, right: AnchorFix, now_ms: i64) -> StartLineDefinitionPayload {
        self.announced_left = Some((left.lat, left.lon));
        self.announced_right = Some((right.lat, right.lon));
        let quality = self.quality(now_ms);
        self.announced_quality = Some(quality);
        StartLineDefinitionPayload {
            anchor_left: AnchorPoint {
                device_id: self.left_id,
                anchor_id: "A0".to_string(),
                lat: left.lat,
                lon: left.lon,
            },
            anchor_right: AnchorPoint {
                device_id: self.right_id,
                anchor_id: "A1".to_string(),
                lat: right.lat,
                lon: right.lon,
            },
            gate_length_m: haversine_m(left.lat, left.lon, right.lat, right.lon),
            quality,
        }
    }

    /// Current quality: GOOD needs two recent fixes and a plausible length,
    /// DEGRADED means the line exists but one side is stale or the length is
    /// implausible, UNKNOWN means the line was never complete.
    pub fn quality(&self, now_ms: i64) -> GateQuality {
        let (left, right) = match (self.left, self.right) {
            (Some(l), Some(r)) => (l, r),
            _ => return GateQuality::Unknown,
        };
        let fresh = now_ms - left.updated_ms <= FRESH_FIX_MS && now_ms - right.updated_ms <= FRESH_FIX_MS;
        let length = haversine_m(left.lat, left.lon, right.lat, right.lon);
        if fresh && (MIN_GATE_LENGTH_M..=MAX_GATE_LENGTH_M).contains(&length) {
            GateQuality::Good
        } else {
            GateQuality::Degraded
        }
    }

    /// Re-announce when quality drifted since the last announcement (e.g. an
    /// anchor went silent). Driven by the watchdog.
    pub fn refresh_quality(&mut self, now_ms: i64) -> Option<StartLineDefinitionPayload> {
        let (left, right) = (self.left?, self.right?);
        let quality = self.quality(now_ms);
        if self.announced_quality.is_some() && self.announced_quality != Some(quality) {
            return Some(self.announce(left, right, now_ms));
        }
        None
    }

    /// Last-seen timestamps of the configured anchors, for health scans.
    pub fn anchor_fixes(&self) -> Vec<(u32, i64)> {
        let mut out = Vec::new();
        if let Some(l) = self.left {
            out.push((self.left_id, l.updated_ms));
        }
        if let Some(r) = self.right {
            out.push((self.right_id, r.updated_ms));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAT_L: f64 = 22.1200;
    const LON_L: f64 = 114.1200;
    const LAT_R: f64 = 22.1210;
    const LON_R: f64 = 114.1250;

    fn tracker() -> StartLineTracker {
        StartLineTracker::new(101, 102, 0.5)
    }

    #[test]
    fn first_complete_pair_announces() {
        let mut t = tracker();
        assert!(t.update_anchor(101, LAT_L, LON_L, 0).is_none());
        let def = t.update_anchor(102, LAT_R, LON_R, 100).unwrap();
        assert!((def.gate_length_m - 526.9).abs() < 1.0, "length {}", def.gate_length_m);
        assert_eq!(def.quality, GateQuality::Good);
        assert_eq!(def.anchor_left.anchor_id, "A0");
    }

    #[test]
    fn sub_threshold_wobble_is_silent() {
        let mut t = tracker();
        t.update_anchor(101, LAT_L, LON_L, 0);
        t.update_anchor(102, LAT_R, LON_R, 0);
        // ~0.1 m of latitude wobble.
        assert!(t.update_anchor(101, LAT_L + 1e-6, LON_L, 100).is_none());
        // ~5.5 m move republishes.
        assert!(t.update_anchor(101, LAT_L + 5e-5, LON_L, 200).is_some());
    }

    #[test]
    fn non_line_anchor_ignored_for_geometry() {
        let mut t = tracker();
        t.update_anchor(101, LAT_L, LON_L, 0);
        assert!(t.update_anchor(103, LAT_R, LON_R, 0).is_none());
        assert_eq!(t.quality(0), GateQuality::Unknown);
    }

    #[test]
    fn quality_degrades_when_one_anchor_goes_silent() {
        let mut t = tracker();
        t.update_anchor(101, LAT_L, LON_L, 0);
        t.update_anchor(102, LAT_R, LON_R, 0);
        assert_eq!(t.quality(1_000), GateQuality::Good);
        assert_eq!(t.quality(10_000), GateQuality::Degraded);

        // Watchdog notices the drift exactly once per change.
        let def = t.refresh_quality(10_000).unwrap();
        assert_eq!(def.quality, GateQuality::Degraded);
        assert!(t.refresh_quality(10_500).is_none());
    }
}
