use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MovementConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShakeSeverity {
    Low,
    Medium,
    High,
    Extreme,
}

impl ShakeSeverity {
    /// Bucket a vertical acceleration magnitude (g) already above the shake threshold.
    pub fn from_magnitude(accel_g: f64) -> Self {
        let magnitude = accel_g.abs();
        if magnitude <= 7.0 {
            ShakeSeverity::Low
        } else if magnitude <= 10.0 {
            ShakeSeverity::Medium
        } else if magnitude <= 15.0 {
            ShakeSeverity::High
        } else {
            ShakeSeverity::Extreme
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuspiciousReason {
    /// Moving, but vibration is above the normal ceiling
    HighVibrationWhileMoving,
    /// Between the stopped and moving thresholds
    TransitionalSpeed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MovementValidation {
    ValidMoving { confidence: f64 },
    WarningStopped,
    InvalidShake { severity: ShakeSeverity },
    InvalidNoMovement,
    SuspiciousPattern { reason: SuspiciousReason },
}

impl MovementValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, MovementValidation::ValidMoving { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            MovementValidation::InvalidShake { .. } | MovementValidation::InvalidNoMovement
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            MovementValidation::ValidMoving { .. } => "valid",
            MovementValidation::WarningStopped => "stopped",
            MovementValidation::InvalidShake { .. } => "shake",
            MovementValidation::InvalidNoMovement => "no_movement",
            MovementValidation::SuspiciousPattern { .. } => "suspicious",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementPattern {
    InsufficientData,
    Consistent,
    Intermittent,
    PoorQuality,
    Unstable,
}

impl MovementPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementPattern::InsufficientData => "insufficient data",
            MovementPattern::Consistent => "consistent",
            MovementPattern::Intermittent => "intermittent",
            MovementPattern::PoorQuality => "poor quality",
            MovementPattern::Unstable => "unstable",
        }
    }
}

/// Classifies (vertical acceleration, speed) pairs and keeps a short history
/// for pattern diagnostics.
pub struct MovementValidator {
    config: MovementConfig,
    window: VecDeque<(DateTime<Utc>, MovementValidation)>,
}

impl MovementValidator {
    pub fn new(config: MovementConfig) -> Self {
        MovementValidator {
            config,
            window: VecDeque::with_capacity(64),
        }
    }

    /// Pure classification, no history update.
    pub fn classify(&self, accel_g: f64, speed_kmh: f64) -> MovementValidation {
        let c = &self.config;
        let accel = accel_g.abs();

        if accel > c.shake_accel_g {
            return MovementValidation::InvalidShake {
                severity: ShakeSeverity::from_magnitude(accel),
            };
        }

        if speed_kmh < c.stopped_speed_kmh {
            if accel < c.flat_accel_g {
                return MovementValidation::InvalidNoMovement;
            }
            return MovementValidation::WarningStopped;
        }

        if speed_kmh >= c.moving_speed_kmh {
            if accel < c.normal_accel_g {
                return MovementValidation::ValidMoving {
                    confidence: self.moving_confidence(accel, speed_kmh),
                };
            }
            return MovementValidation::SuspiciousPattern {
                reason: SuspiciousReason::HighVibrationWhileMoving,
            };
        }

        MovementValidation::SuspiciousPattern {
            reason: SuspiciousReason::TransitionalSpeed,
        }
    }

    // 0.5 at the moving threshold rising to 1.0 at twice it, times
    // 1.0 at zero vibration falling to 0.5 at the normal ceiling.
    fn moving_confidence(&self, accel: f64, speed_kmh: f64) -> f64 {
        let c = &self.config;
        let speed_margin = ((speed_kmh - c.moving_speed_kmh) / c.moving_speed_kmh).clamp(0.0, 1.0);
        let speed_factor = 0.5 + 0.5 * speed_margin;
        let accel_ratio = (accel / c.normal_accel_g).clamp(0.0, 1.0);
        let accel_factor = 1.0 - 0.5 * accel_ratio * accel_ratio;
        (speed_factor * accel_factor).clamp(0.0, 1.0)
    }

    /// Classify and append to the rolling window.
    pub fn validate(&mut self, accel_g: f64, speed_kmh: f64, at: DateTime<Utc>) -> MovementValidation {
        let validation = self.classify(accel_g, speed_kmh);
        self.window.push_back((at, validation));

        let horizon = at - Duration::milliseconds(self.config.window_ms as i64);
        while let Some((oldest, _)) = self.window.front() {
            if *oldest < horizon {
                self.window.pop_front();
            } else {
                break;
            }
        }

        validation
    }

    pub fn analyze_recent_pattern(&self) -> MovementPattern {
        let total = self.window.len();
        if total < self.config.min_pattern_samples.max(1) {
            return MovementPattern::InsufficientData;
        }

        let valid = self.window.iter().filter(|(_, v)| v.is_valid()).count();
        let invalid = self.window.iter().filter(|(_, v)| v.is_invalid()).count();
        let valid_fraction = valid as f64 / total as f64;
        let invalid_fraction = invalid as f64 / total as f64;

        if valid_fraction > 0.8 {
            MovementPattern::Consistent
        } else if valid_fraction > 0.5 {
            MovementPattern::Intermittent
        } else if invalid_fraction > 0.5 {
            MovementPattern::PoorQuality
        } else {
            MovementPattern::Unstable
        }
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}
