use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One decoded line from the sensor device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sequence: u64,
    /// Device clock, milliseconds since power-on
    pub device_millis: u64,
    /// Host receive time
    pub timestamp: DateTime<Utc>,
    /// Odometer since session start, monotonic unless the device resets
    pub cumulative_distance_m: f64,
    pub speed_kmh: f64,
    pub vertical_accel_g: f64,
    pub battery_voltage: Option<f64>,
    pub temperature_c: Option<f64>,
    pub error_count: Option<u32>,
    pub heading_deg: Option<f64>,
}

impl SensorReading {
    pub fn new(
        sequence: u64,
        timestamp: DateTime<Utc>,
        cumulative_distance_m: f64,
        speed_kmh: f64,
        vertical_accel_g: f64,
    ) -> Self {
        Self {
            sequence,
            device_millis: 0,
            timestamp,
            cumulative_distance_m,
            speed_kmh,
            vertical_accel_g,
            battery_voltage: None,
            temperature_c: None,
            error_count: None,
            heading_deg: None,
        }
    }

    pub fn with_device_millis(mut self, device_millis: u64) -> Self {
        self.device_millis = device_millis;
        self
    }

    pub fn with_battery(mut self, voltage: f64) -> Self {
        self.battery_voltage = Some(voltage);
        self
    }

    pub fn with_temperature(mut self, celsius: f64) -> Self {
        self.temperature_c = Some(celsius);
        self
    }

    pub fn with_error_count(mut self, errors: u32) -> Self {
        self.error_count = Some(errors);
        self
    }

    pub fn with_heading(mut self, heading_deg: f64) -> Self {
        self.heading_deg = Some(heading_deg);
        self
    }
}

/// Raw fix from the location service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy_m: f64,
    pub bearing_deg: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            accuracy_m,
            bearing_deg: None,
            captured_at,
        }
    }

    pub fn with_bearing(mut self, bearing_deg: f64) -> Self {
        self.bearing_deg = Some(bearing_deg);
        self
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixOrigin {
    /// Accepted unmodified from the location source
    Direct,
    /// Dead-reckoned from the last position
    Interpolated,
}

/// Position attached to a telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy_m: f64,
    pub bearing_deg: Option<f64>,
    pub captured_at: DateTime<Utc>,
    pub origin: FixOrigin,
    pub confidence: f64,
}

impl PositionFix {
    pub fn direct(fix: &LocationFix) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            altitude: fix.altitude,
            accuracy_m: fix.accuracy_m,
            bearing_deg: fix.bearing_deg,
            captured_at: fix.captured_at,
            origin: FixOrigin::Direct,
            confidence: 1.0,
        }
    }
}

/// Identifier of a survey session. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SessionId::new(value).ok_or_else(|| "session id must not be empty".to_string())
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The session a running survey writes into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_id: SessionId,
    pub survey_record_id: u64,
    pub started_at: DateTime<Utc>,
}
