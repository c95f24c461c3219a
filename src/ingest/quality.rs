// quality.rs - Quality flags, score and tier for a telemetry record
//
// Score starts at 100 and loses points per sensor problem. GPS problems do not
// touch the score; they cap the tier instead.

use std::collections::BTreeSet;

use crate::config::{MovementConfig, QualityConfig};
use crate::fusion::FusionOutcome;
use crate::movement::MovementValidation;
use crate::types::SensorReading;

use super::record::{QualityAssessment, QualityFlag, QualityTier};

const PENALTY_VIBRATION_EXTREME: u32 = 30;
const PENALTY_VIBRATION_SPIKE: u32 = 15;
const PENALTY_STOPPED: u32 = 20;
const PENALTY_SPEED: u32 = 10;
const PENALTY_BATTERY_CRITICAL: u32 = 20;
const PENALTY_BATTERY_LOW: u32 = 10;
const PENALTY_BATTERY_WARNING: u32 = 5;
const PENALTY_PER_CRC_ERROR: u32 = 2;
const MAX_CRC_PENALTY: u32 = 20;
const PENALTY_SUSPICIOUS: u32 = 10;

pub struct QualityBuilder {
    quality: QualityConfig,
    movement: MovementConfig,
}

impl QualityBuilder {
    pub fn new(quality: QualityConfig, movement: MovementConfig) -> Self {
        Self { quality, movement }
    }

    pub fn flags(&self, reading: &SensorReading, outcome: &FusionOutcome) -> BTreeSet<QualityFlag> {
        let q = &self.quality;
        let m = &self.movement;
        let mut flags = BTreeSet::new();

        match outcome {
            FusionOutcome::Unavailable => {
                flags.insert(QualityFlag::GpsUnavailable);
            }
            FusionOutcome::PoorFix(_) => {
                flags.insert(QualityFlag::GpsPoorAccuracy);
            }
            FusionOutcome::Direct(_) | FusionOutcome::Interpolated(_) => {}
        }

        if reading.speed_kmh < m.stopped_speed_kmh {
            flags.insert(QualityFlag::VehicleStopped);
        }
        if reading.speed_kmh > q.speed_too_high_kmh {
            flags.insert(QualityFlag::SpeedTooHigh);
        }

        let accel = reading.vertical_accel_g.abs();
        if accel > m.shake_accel_g {
            flags.insert(QualityFlag::VibrationExtreme);
        } else if accel > m.normal_accel_g {
            flags.insert(QualityFlag::VibrationSpike);
        }

        // most severe battery level only
        if let Some(volts) = reading.battery_voltage {
            if volts < q.battery_critical_v {
                flags.insert(QualityFlag::BatteryCritical);
            } else if volts < q.battery_low_v {
                flags.insert(QualityFlag::BatteryLow);
            } else if volts < q.battery_warning_v {
                flags.insert(QualityFlag::BatteryWarning);
            }
        }

        if reading.error_count.unwrap_or(0) > 0 {
            flags.insert(QualityFlag::CrcErrors);
        }

        flags
    }

    pub fn score(
        &self,
        flags: &BTreeSet<QualityFlag>,
        reading: &SensorReading,
        movement: &MovementValidation,
    ) -> u8 {
        let mut penalty = 0u32;
        for flag in flags {
            penalty += match flag {
                QualityFlag::VibrationExtreme => PENALTY_VIBRATION_EXTREME,
                QualityFlag::VibrationSpike => PENALTY_VIBRATION_SPIKE,
                QualityFlag::VehicleStopped => PENALTY_STOPPED,
                QualityFlag::SpeedTooHigh => PENALTY_SPEED,
                QualityFlag::BatteryCritical => PENALTY_BATTERY_CRITICAL,
                QualityFlag::BatteryLow => PENALTY_BATTERY_LOW,
                QualityFlag::BatteryWarning => PENALTY_BATTERY_WARNING,
                QualityFlag::CrcErrors => (reading.error_count.unwrap_or(0) * PENALTY_PER_CRC_ERROR)
                    .min(MAX_CRC_PENALTY),
                QualityFlag::GpsUnavailable | QualityFlag::GpsPoorAccuracy => 0,
            };
        }
        if matches!(movement, MovementValidation::SuspiciousPattern { .. }) {
            penalty += PENALTY_SUSPICIOUS;
        }
        100u32.saturating_sub(penalty) as u8
    }

    pub fn tier(&self, score: u8, outcome: &FusionOutcome) -> QualityTier {
        let q = &self.quality;
        let gps_good = matches!(outcome, FusionOutcome::Direct(_));
        let gps_usable = match outcome {
            FusionOutcome::Direct(fix) | FusionOutcome::Interpolated(fix) => {
                fix.confidence >= q.medium_tier_min_confidence
            }
            FusionOutcome::PoorFix(_) => true,
            FusionOutcome::Unavailable => false,
        };

        if score >= q.high_tier_min_score && gps_good {
            QualityTier::High
        } else if score >= q.medium_tier_min_score && gps_usable {
            QualityTier::Medium
        } else {
            QualityTier::Low
        }
    }

    pub fn assess(
        &self,
        reading: &SensorReading,
        movement: &MovementValidation,
        outcome: &FusionOutcome,
    ) -> QualityAssessment {
        let flags = self.flags(reading, outcome);
        let score = self.score(&flags, reading, movement);
        let tier = self.tier(score, outcome);
        QualityAssessment { flags, score, tier }
    }
}

impl Default for QualityBuilder {
    fn default() -> Self {
        Self::new(QualityConfig::default(), MovementConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::{ShakeSeverity, SuspiciousReason};
    use crate::types::{LocationFix, PositionFix};
    use chrono::Utc;

    fn reading(speed: f64, accel: f64) -> SensorReading {
        SensorReading::new(1, Utc::now(), 10.0, speed, accel)
    }

    fn direct() -> FusionOutcome {
        FusionOutcome::Direct(PositionFix::direct(&LocationFix::new(1.0, 2.0, 5.0, Utc::now())))
    }

    fn interpolated(confidence: f64) -> FusionOutcome {
        let mut fix = PositionFix::direct(&LocationFix::new(1.0, 2.0, 50.0, Utc::now()));
        fix.origin = crate::types::FixOrigin::Interpolated;
        fix.confidence = confidence;
        FusionOutcome::Interpolated(fix)
    }

    const VALID: MovementValidation = MovementValidation::ValidMoving { confidence: 0.9 };

    #[test]
    fn test_clean_reading_is_high() {
        let builder = QualityBuilder::default();
        let assessment = builder.assess(&reading(30.0, 0.3).with_battery(4.0), &VALID, &direct());
        assert!(assessment.flags.is_empty());
        assert_eq!(assessment.score, 100);
        assert_eq!(assessment.tier, QualityTier::High);
    }

    #[test]
    fn test_gps_flags() {
        let builder = QualityBuilder::default();
        let r = reading(30.0, 0.3);
        assert!(builder
            .flags(&r, &FusionOutcome::Unavailable)
            .contains(&QualityFlag::GpsUnavailable));

        let poor = PositionFix::direct(&LocationFix::new(1.0, 2.0, 80.0, Utc::now()));
        assert!(builder
            .flags(&r, &FusionOutcome::PoorFix(poor))
            .contains(&QualityFlag::GpsPoorAccuracy));
        assert!(builder.flags(&r, &interpolated(0.9)).is_empty());
    }

    #[test]
    fn test_vibration_and_speed_flags() {
        let builder = QualityBuilder::default();
        let spike = builder.flags(&reading(30.0, 3.0), &direct());
        assert!(spike.contains(&QualityFlag::VibrationSpike));
        assert!(!spike.contains(&QualityFlag::VibrationExtreme));

        let extreme = builder.flags(&reading(30.0, -6.0), &direct());
        assert!(extreme.contains(&QualityFlag::VibrationExtreme));
        assert!(!extreme.contains(&QualityFlag::VibrationSpike));

        assert!(builder
            .flags(&reading(0.5, 1.0), &direct())
            .contains(&QualityFlag::VehicleStopped));
        assert!(builder
            .flags(&reading(140.0, 0.2), &direct())
            .contains(&QualityFlag::SpeedTooHigh));
    }

    #[test]
    fn test_only_most_severe_battery_flag() {
        let builder = QualityBuilder::default();
        let flags = builder.flags(&reading(30.0, 0.2).with_battery(3.2), &direct());
        assert!(flags.contains(&QualityFlag::BatteryCritical));
        assert!(!flags.contains(&QualityFlag::BatteryLow));
        assert!(!flags.contains(&QualityFlag::BatteryWarning));

        let flags = builder.flags(&reading(30.0, 0.2).with_battery(3.6), &direct());
        assert_eq!(flags.into_iter().collect::<Vec<_>>(), vec![QualityFlag::BatteryWarning]);
    }

    #[test]
    fn test_crc_penalty_is_capped() {
        let builder = QualityBuilder::default();
        let r = reading(30.0, 0.2).with_error_count(3);
        let flags = builder.flags(&r, &direct());
        assert_eq!(builder.score(&flags, &r, &VALID), 94);

        let r = reading(30.0, 0.2).with_error_count(50);
        let flags = builder.flags(&r, &direct());
        assert_eq!(builder.score(&flags, &r, &VALID), 80);
    }

    #[test]
    fn test_score_saturates_at_zero() {
        let builder = QualityBuilder::default();
        let r = reading(150.0, 9.0).with_battery(3.0).with_error_count(40);
        let shake = MovementValidation::InvalidShake { severity: ShakeSeverity::Medium };
        let flags = builder.flags(&r, &direct());
        // 30 + 10 + 20 + 20 = 80
        assert_eq!(builder.score(&flags, &r, &shake), 20);

        let r = reading(0.2, 9.0).with_battery(3.0).with_error_count(40);
        let suspicious = MovementValidation::SuspiciousPattern {
            reason: SuspiciousReason::TransitionalSpeed,
        };
        let mut flags = builder.flags(&r, &direct());
        flags.insert(QualityFlag::SpeedTooHigh);
        assert_eq!(builder.score(&flags, &r, &suspicious), 0);
    }

    #[test]
    fn test_tiers() {
        let builder = QualityBuilder::default();
        assert_eq!(builder.tier(100, &direct()), QualityTier::High);
        assert_eq!(builder.tier(70, &direct()), QualityTier::Medium);
        assert_eq!(builder.tier(100, &interpolated(0.8)), QualityTier::Medium);
        assert_eq!(builder.tier(100, &interpolated(0.3)), QualityTier::Low);
        assert_eq!(builder.tier(100, &FusionOutcome::Unavailable), QualityTier::Low);
        assert_eq!(builder.tier(40, &direct()), QualityTier::Low);
    }
}
