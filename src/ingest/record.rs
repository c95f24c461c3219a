use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::movement::MovementValidation;
use crate::types::{ActiveSession, PositionFix, SensorReading, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityFlag {
    GpsUnavailable,
    GpsPoorAccuracy,
    VehicleStopped,
    SpeedTooHigh,
    VibrationSpike,
    VibrationExtreme,
    BatteryCritical,
    BatteryLow,
    BatteryWarning,
    CrcErrors,
}

impl QualityFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityFlag::GpsUnavailable => "gps_unavailable",
            QualityFlag::GpsPoorAccuracy => "gps_poor_accuracy",
            QualityFlag::VehicleStopped => "vehicle_stopped",
            QualityFlag::SpeedTooHigh => "speed_too_high",
            QualityFlag::VibrationSpike => "vibration_spike",
            QualityFlag::VibrationExtreme => "vibration_extreme",
            QualityFlag::BatteryCritical => "battery_critical",
            QualityFlag::BatteryLow => "battery_low",
            QualityFlag::BatteryWarning => "battery_warning",
            QualityFlag::CrcErrors => "crc_errors",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityTier {
    High,
    Medium,
    Low,
}

impl QualityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::High => "high",
            QualityTier::Medium => "medium",
            QualityTier::Low => "low",
        }
    }
}

/// Output of the quality builder for one reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub flags: BTreeSet<QualityFlag>,
    pub score: u8,
    pub tier: QualityTier,
}

/// One persisted telemetry row.
///
/// The session id is a [`SessionId`], never optional, and [`TelemetryRecord::assemble`]
/// needs an [`ActiveSession`] to build one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub session_id: SessionId,
    pub survey_record_id: u64,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub device_millis: u64,
    pub cumulative_distance_m: f64,
    pub distance_delta_m: f64,
    pub speed_kmh: f64,
    pub vertical_accel_g: f64,
    pub battery_voltage: Option<f64>,
    pub temperature_c: Option<f64>,
    pub error_count: Option<u32>,
    pub heading_deg: Option<f64>,
    pub position: Option<PositionFix>,
    pub movement: MovementValidation,
    pub quality_flags: BTreeSet<QualityFlag>,
    pub quality_score: u8,
    pub quality_tier: QualityTier,
}

impl TelemetryRecord {
    pub fn assemble(
        session: &ActiveSession,
        reading: &SensorReading,
        distance_delta_m: f64,
        position: Option<PositionFix>,
        movement: MovementValidation,
        quality: QualityAssessment,
    ) -> Self {
        Self {
            session_id: session.session_id.clone(),
            survey_record_id: session.survey_record_id,
            timestamp: reading.timestamp,
            sequence: reading.sequence,
            device_millis: reading.device_millis,
            cumulative_distance_m: reading.cumulative_distance_m,
            distance_delta_m,
            speed_kmh: reading.speed_kmh,
            vertical_accel_g: reading.vertical_accel_g,
            battery_voltage: reading.battery_voltage,
            temperature_c: reading.temperature_c,
            error_count: reading.error_count,
            heading_deg: reading.heading_deg,
            position,
            movement,
            quality_flags: quality.flags,
            quality_score: quality.score,
            quality_tier: quality.tier,
        }
    }

    pub fn has_flag(&self, flag: QualityFlag) -> bool {
        self.quality_flags.contains(&flag)
    }
}
