use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::movement::MovementPattern;
use crate::types::FixOrigin;

use super::record::QualityTier;

/// Status published to observers, at most once per status interval
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub survey: String,
    pub session_id: Option<String>,
    pub records_ingested: u64,
    pub records_flushed: u64,
    pub buffered: usize,
    pub discarded_inactive: u64,
    pub guard_violations: u64,
    pub flush_failures: u64,
    pub dropped_overflow: u64,
    pub speed_kmh: f64,
    pub cumulative_distance_m: f64,
    pub position_origin: Option<FixOrigin>,
    pub position_confidence: Option<f64>,
    pub last_tier: Option<QualityTier>,
    /// Rolling movement pattern over the validator window
    pub movement_pattern: Option<MovementPattern>,
}

impl StatusReport {
    /// One-line summary for logs and notifications
    pub fn message(&self) -> String {
        let gps = match (self.position_origin, self.position_confidence) {
            (Some(FixOrigin::Direct), _) => "gps ok".to_string(),
            (Some(FixOrigin::Interpolated), Some(c)) => format!("dead reckoning {:.0}%", c * 100.0),
            _ => "no position".to_string(),
        };
        let tier = self.last_tier.map_or("-", |t| t.as_str());
        let movement = self.movement_pattern.map_or("-", |p| p.as_str());
        format!(
            "{} | {:.1} km/h | {:.0} m | {} recorded, {} saved, {} buffered | {} | quality {} | movement {}",
            self.survey,
            self.speed_kmh,
            self.cumulative_distance_m,
            self.records_ingested,
            self.records_flushed,
            self.buffered,
            gps,
            tier,
            movement
        )
    }
}

/// Lets one notification through per interval, whatever the packet rate.
#[derive(Debug)]
pub struct StatusThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl StatusThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
