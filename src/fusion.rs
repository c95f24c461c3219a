// fusion.rs - Position fusion with short-horizon dead reckoning
//
// Good location fixes are taken as-is. When the fix is missing or poor, the
// position is projected forward from the last known position using the
// sensor's incremental distance and the last known bearing. Projection stops
// once the accumulated dead-reckoned distance would pass the configured cap.

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::config::FusionConfig;
use crate::types::{FixOrigin, LocationFix, PositionFix};

// ─── Geodesy ─────────────────────────────────────────────────────────────────

/// Mean Earth radius
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle destination from a start point, initial bearing and distance.
/// Returns (latitude, longitude) in degrees, longitude normalised to [-180, 180).
pub fn destination_point(
    lat: f64,
    lon: f64,
    bearing_deg: f64,
    distance_m: f64,
    radius_m: f64,
) -> (f64, f64) {
    let phi1 = lat.to_radians();
    let lambda1 = lon.to_radians();
    let theta = bearing_deg.to_radians();
    let delta = distance_m / radius_m;

    let sin_phi2 = phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos();
    let phi2 = sin_phi2.clamp(-1.0, 1.0).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    let lon2 = (lambda2.to_degrees() + 540.0).rem_euclid(360.0) - 180.0;
    (phi2.to_degrees(), lon2)
}

pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64, radius_m: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    radius_m * c
}

/// Initial bearing from point 1 to point 2, degrees in [0, 360).
pub fn initial_bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let y = d_lon.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lon.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

// ─── Engine ──────────────────────────────────────────────────────────────────

const MIN_COURSE_DISTANCE_M: f64 = 5.0;

/// Result of [`PositionFusion::resolve`]
#[derive(Debug, Clone, PartialEq)]
pub enum FusionOutcome {
    /// Good candidate accepted
    Direct(PositionFix),
    /// Dead-reckoned from the last position
    Interpolated(PositionFix),
    /// Poor candidate used because interpolation was not possible
    PoorFix(PositionFix),
    Unavailable,
}

impl FusionOutcome {
    pub fn fix(&self) -> Option<&PositionFix> {
        match self {
            FusionOutcome::Direct(fix)
            | FusionOutcome::Interpolated(fix)
            | FusionOutcome::PoorFix(fix) => Some(fix),
            FusionOutcome::Unavailable => None,
        }
    }

    pub fn into_fix(self) -> Option<PositionFix> {
        match self {
            FusionOutcome::Direct(fix)
            | FusionOutcome::Interpolated(fix)
            | FusionOutcome::PoorFix(fix) => Some(fix),
            FusionOutcome::Unavailable => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FusionOutcome::Direct(_) => "direct",
            FusionOutcome::Interpolated(_) => "interpolated",
            FusionOutcome::PoorFix(_) => "poor",
            FusionOutcome::Unavailable => "unavailable",
        }
    }
}

pub struct PositionFusion {
    config: FusionConfig,
    last_position: Option<PositionFix>,
    last_bearing: Option<f64>,
    interpolated_total_m: f64,
    direct_count: u64,
    interpolated_count: u64,
}

impl PositionFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            last_position: None,
            last_bearing: None,
            interpolated_total_m: 0.0,
            direct_count: 0,
            interpolated_count: 0,
        }
    }

    /// Whether a raw fix is accurate and fresh enough to accept directly.
    pub fn is_good(&self, fix: &LocationFix, now: DateTime<Utc>) -> bool {
        let age_ms = (now - fix.captured_at).num_milliseconds();
        fix.accuracy_m.is_finite()
            && fix.accuracy_m < self.config.good_accuracy_m
            && age_ms < self.config.max_fix_age_ms as i64
    }

    /// Accept a fix if it is good. Resets the dead-reckoning budget.
    pub fn update_good_fix(&mut self, fix: &LocationFix, now: DateTime<Utc>) -> bool {
        if !self.is_good(fix, now) {
            debug!(
                "[fusion] rejected fix: accuracy {:.1} m, age {} ms",
                fix.accuracy_m,
                (now - fix.captured_at).num_milliseconds()
            );
            return false;
        }

        match fix.bearing_deg.filter(|b| *b != 0.0 && b.is_finite()) {
            Some(bearing) => self.last_bearing = Some(bearing.rem_euclid(360.0)),
            None => {
                if let Some(course) = self.course_from_last(fix) {
                    self.last_bearing = Some(course);
                }
            }
        }

        if self.interpolated_total_m > 0.0 {
            info!(
                "[fusion] good fix after {:.1} m of dead reckoning",
                self.interpolated_total_m
            );
        }

        self.interpolated_total_m = 0.0;
        self.last_position = Some(PositionFix::direct(fix));
        self.direct_count += 1;
        true
    }

    // Course over ground between two direct fixes, once they are far enough apart.
    fn course_from_last(&self, fix: &LocationFix) -> Option<f64> {
        let last = self
            .last_position
            .as_ref()
            .filter(|p| p.origin == FixOrigin::Direct)?;
        let moved = haversine_distance(
            last.latitude,
            last.longitude,
            fix.latitude,
            fix.longitude,
            self.config.earth_radius_m,
        );
        (moved >= MIN_COURSE_DISTANCE_M)
            .then(|| initial_bearing(last.latitude, last.longitude, fix.latitude, fix.longitude))
    }

    /// Project the last position forward by `distance_m`.
    ///
    /// Returns `None` without a prior position, without any bearing, or when the
    /// accumulated dead-reckoned distance would pass `max_interpolation_m`.
    pub fn interpolate(&mut self, distance_m: f64, bearing: Option<f64>) -> Option<PositionFix> {
        let base = self.last_position.as_ref()?;
        let distance_m = if distance_m.is_finite() { distance_m.max(0.0) } else { 0.0 };

        let projected_total = self.interpolated_total_m + distance_m;
        if projected_total > self.config.max_interpolation_m {
            debug!(
                "[fusion] interpolation cap reached ({:.1} + {:.1} > {:.1} m)",
                self.interpolated_total_m, distance_m, self.config.max_interpolation_m
            );
            return None;
        }

        let bearing = bearing
            .filter(|b| b.is_finite())
            .map(|b| b.rem_euclid(360.0))
            .or(self.last_bearing);

        let (latitude, longitude) = match bearing {
            Some(b) => destination_point(
                base.latitude,
                base.longitude,
                b,
                distance_m,
                self.config.earth_radius_m,
            ),
            None if distance_m == 0.0 => (base.latitude, base.longitude),
            None => return None,
        };

        self.interpolated_total_m = projected_total;
        self.interpolated_count += 1;

        let fix = PositionFix {
            latitude,
            longitude,
            altitude: base.altitude,
            accuracy_m: self.config.interpolated_accuracy_m,
            bearing_deg: bearing,
            captured_at: base.captured_at,
            origin: FixOrigin::Interpolated,
            confidence: self.confidence(),
        };
        self.last_position = Some(fix.clone());
        Some(fix)
    }

    /// Pick the best position for a reading.
    pub fn resolve(
        &mut self,
        distance_delta_m: f64,
        candidate: Option<&LocationFix>,
        bearing: Option<f64>,
        now: DateTime<Utc>,
    ) -> FusionOutcome {
        match candidate {
            Some(fix) if self.update_good_fix(fix, now) => match &self.last_position {
                Some(position) => FusionOutcome::Direct(position.clone()),
                None => FusionOutcome::Unavailable,
            },
            Some(fix) => match self.interpolate(distance_delta_m, bearing) {
                Some(position) => FusionOutcome::Interpolated(position),
                None => {
                    let mut poor = PositionFix::direct(fix);
                    poor.confidence = 0.0;
                    FusionOutcome::PoorFix(poor)
                }
            },
            None => match self.interpolate(distance_delta_m, bearing) {
                Some(position) => FusionOutcome::Interpolated(position),
                None => FusionOutcome::Unavailable,
            },
        }
    }

    /// `1 − interpolated / max`, clamped; exactly 1.0 with nothing interpolated.
    pub fn confidence(&self) -> f64 {
        if self.interpolated_total_m <= 0.0 {
            return 1.0;
        }
        (1.0 - self.interpolated_total_m / self.config.max_interpolation_m).clamp(0.0, 1.0)
    }

    pub fn interpolated_distance(&self) -> f64 {
        self.interpolated_total_m
    }

    pub fn last_position(&self) -> Option<&PositionFix> {
        self.last_position.as_ref()
    }

    pub fn last_bearing(&self) -> Option<f64> {
        self.last_bearing
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.direct_count, self.interpolated_count)
    }

    /// Forget everything; call at survey start.
    pub fn reset(&mut self) {
        self.last_position = None;
        self.last_bearing = None;
        self.interpolated_total_m = 0.0;
        self.direct_count = 0;
        self.interpolated_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;
    use proptest::prelude::*;


    fn engine() -> PositionFusion {
        PositionFusion::new(FusionConfig::default())
    }

    fn good_fix(now: DateTime<Utc>) -> LocationFix {
        LocationFix::new(48.8566, 2.3522, 5.0, now).with_bearing(90.0)
    }

    #[test]
    fn test_destination_point_north() {
        let (lat, lon) = destination_point(0.0, 0.0, 0.0, 111_195.0, EARTH_RADIUS_M);
        assert_relative_eq!(lat, 1.0, epsilon = 1e-3);
        assert_relative_eq!(lon, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_destination_round_trips_with_haversine() {
        let (lat, lon) = destination_point(48.8566, 2.3522, 37.0, 250.0, EARTH_RADIUS_M);
        let d = haversine_distance(48.8566, 2.3522, lat, lon, EARTH_RADIUS_M);
        assert_relative_eq!(d, 250.0, epsilon = 1e-3);
        let bearing = initial_bearing(48.8566, 2.3522, lat, lon);
        assert_relative_eq!(bearing, 37.0, epsilon = 1e-3);
    }

    #[test]
    fn test_destination_wraps_antimeridian() {
        let (_, lon) = destination_point(0.0, 179.9999, 90.0, 1_000.0, EARTH_RADIUS_M);
        assert!(lon < -179.0);
    }

    #[test]
    fn test_rejects_inaccurate_and_stale_fixes() {
        let now = Utc::now();
        let mut fusion = engine();

        let inaccurate = LocationFix::new(1.0, 1.0, 20.0, now);
        assert!(!fusion.update_good_fix(&inaccurate, now));

        let stale = LocationFix::new(1.0, 1.0, 5.0, now - Duration::seconds(6));
        assert!(!fusion.update_good_fix(&stale, now));

        assert!(fusion.last_position().is_none());
        assert!(fusion.update_good_fix(&good_fix(now), now));
        assert!(fusion.last_position().is_some());
    }

    #[test]
    fn test_zero_bearing_is_not_stored() {
        let now = Utc::now();
        let mut fusion = engine();
        fusion.update_good_fix(&good_fix(now), now);
        let north = LocationFix::new(48.8566, 2.3522, 5.0, now).with_bearing(0.0);
        fusion.update_good_fix(&north, now);
        assert_eq!(fusion.last_bearing(), Some(90.0));
    }

    #[test]
    fn test_course_derived_from_consecutive_fixes() {
        let now = Utc::now();
        let mut fusion = engine();
        fusion.update_good_fix(&LocationFix::new(10.0, 10.0, 5.0, now), now);
        assert_eq!(fusion.last_bearing(), None);

        // 2 m of jitter is not a course
        let (lat, lon) = destination_point(10.0, 10.0, 300.0, 2.0, EARTH_RADIUS_M);
        fusion.update_good_fix(&LocationFix::new(lat, lon, 5.0, now), now);
        assert_eq!(fusion.last_bearing(), None);

        let (lat2, lon2) = destination_point(lat, lon, 180.0, 40.0, EARTH_RADIUS_M);
        fusion.update_good_fix(&LocationFix::new(lat2, lon2, 5.0, now), now);
        assert_relative_eq!(fusion.last_bearing().unwrap(), 180.0, epsilon = 1e-3);
    }

    #[test]
    fn test_interpolate_without_fix_returns_none() {
        let mut fusion = engine();
        assert!(fusion.interpolate(10.0, Some(45.0)).is_none());
    }

    #[test]
    fn test_interpolate_without_bearing_returns_none() {
        let now = Utc::now();
        let mut fusion = engine();
        fusion.update_good_fix(&LocationFix::new(10.0, 10.0, 5.0, now), now);
        assert!(fusion.interpolate(10.0, None).is_none());
        assert_eq!(fusion.interpolated_distance(), 0.0);
        assert!(fusion.interpolate(10.0, Some(180.0)).is_some());
    }

    #[test]
    fn test_interpolation_moves_along_bearing() {
        let now = Utc::now();
        let mut fusion = engine();
        fusion.update_good_fix(&good_fix(now), now);

        let fix = fusion.interpolate(100.0, None).unwrap();
        assert_eq!(fix.origin, FixOrigin::Interpolated);
        assert_eq!(fix.accuracy_m, 50.0);
        assert!(fix.longitude > 2.3522);
        assert_relative_eq!(fix.latitude, 48.8566, epsilon = 1e-4);
        let moved = haversine_distance(48.8566, 2.3522, fix.latitude, fix.longitude, EARTH_RADIUS_M);
        assert_relative_eq!(moved, 100.0, epsilon = 1e-3);
        assert_relative_eq!(fix.confidence, 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_interpolation_cap() {
        let now = Utc::now();
        let mut fusion = engine();
        fusion.update_good_fix(&good_fix(now), now);

        for _ in 0..4 {
            assert!(fusion.interpolate(120.0, None).is_some());
        }
        assert_relative_eq!(fusion.interpolated_distance(), 480.0);

        // 480 + 30 crosses 500
        assert!(fusion.interpolate(30.0, None).is_none());
        assert_relative_eq!(fusion.interpolated_distance(), 480.0);

        // landing exactly on the cap is still allowed
        let last = fusion.interpolate(20.0, None).unwrap();
        assert_eq!(last.confidence, 0.0);
        assert!(fusion.interpolate(0.5, None).is_none());
    }

    #[test]
    fn test_confidence_resets_on_direct_fix() {
        let now = Utc::now();
        let mut fusion = engine();
        fusion.update_good_fix(&good_fix(now), now);
        fusion.interpolate(250.0, None);
        assert_relative_eq!(fusion.confidence(), 0.5);

        fusion.update_good_fix(&good_fix(now), now);
        assert_eq!(fusion.confidence(), 1.0);
        assert_eq!(fusion.interpolated_distance(), 0.0);
    }

    #[test]
    fn test_resolve_policy() {
        let now = Utc::now();
        let mut fusion = engine();

        // no fix, no history
        assert_eq!(fusion.resolve(5.0, None, None, now), FusionOutcome::Unavailable);

        // poor candidate with no history falls back to the candidate
        let poor = LocationFix::new(1.0, 1.0, 80.0, now);
        match fusion.resolve(5.0, Some(&poor), None, now) {
            FusionOutcome::PoorFix(fix) => assert_eq!(fix.accuracy_m, 80.0),
            other => panic!("expected poor fix, got {:?}", other),
        }

        // good candidate
        assert!(matches!(
            fusion.resolve(5.0, Some(&good_fix(now)), None, now),
            FusionOutcome::Direct(_)
        ));

        // poor candidate with history interpolates instead
        assert!(matches!(
            fusion.resolve(5.0, Some(&poor), None, now),
            FusionOutcome::Interpolated(_)
        ));

        // no candidate interpolates
        assert!(matches!(
            fusion.resolve(5.0, None, None, now),
            FusionOutcome::Interpolated(_)
        ));
    }

    #[test]
    fn test_reset_clears_history() {
        let now = Utc::now();
        let mut fusion = engine();
        fusion.update_good_fix(&good_fix(now), now);
        fusion.interpolate(10.0, None);
        fusion.reset();
        assert!(fusion.last_position().is_none());
        assert!(fusion.last_bearing().is_none());
        assert_eq!(fusion.confidence(), 1.0);
        assert_eq!(fusion.resolve(5.0, None, Some(90.0), now), FusionOutcome::Unavailable);
    }

    proptest! {
        /// Confidence never increases while dead reckoning and returns to 1.0 on a direct fix.
        #[test]
        fn prop_confidence_non_increasing(steps in proptest::collection::vec(0.0f64..60.0, 1..40)) {
            let now = Utc::now();
            let mut fusion = engine();
            fusion.update_good_fix(&good_fix(now), now);
            let mut previous = fusion.confidence();
            prop_assert_eq!(previous, 1.0);

            for step in steps {
                if let Some(fix) = fusion.interpolate(step, None) {
                    prop_assert!(fix.confidence <= previous);
                    prop_assert!((0.0..=1.0).contains(&fix.confidence));
                    previous = fix.confidence;
                }
                prop_assert!(fusion.interpolated_distance() <= 500.0);
            }

            fusion.update_good_fix(&good_fix(now), now);
            prop_assert_eq!(fusion.confidence(), 1.0);
        }
    }
}
