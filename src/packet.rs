//! Packet decoder for the device's line protocol.
//!
//! Data lines:
//!
//! ```text
//! DATA,<seq>,<device_ms>,<distance_m>,<speed_kmh>,<accel_g>[,<battery_v>,<temp_c>,<errors>[,<heading_deg>]]
//! ```
//!
//! Optional trailing fields may be empty (`DATA,7,700,3.5,12.0,0.3,,,`).
//! Replies to commands start with `ACK:`, `ERR:` or `STATUS:`.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::types::SensorReading;

const DATA_PREFIX: &str = "DATA";

/// A non-data line sent by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceReply {
    Ack(String),
    Error(String),
    Status(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Reading(SensorReading),
    Reply(DeviceReply),
}

/// Decode one line (without the trailing newline).
pub fn decode_line(line: &str, received_at: DateTime<Utc>) -> Result<Frame, DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DecodeError::Empty);
    }

    if let Some(rest) = line.strip_prefix("ACK:") {
        return Ok(Frame::Reply(DeviceReply::Ack(rest.trim().to_string())));
    }
    if let Some(rest) = line.strip_prefix("ERR:") {
        return Ok(Frame::Reply(DeviceReply::Error(rest.trim().to_string())));
    }
    if let Some(rest) = line.strip_prefix("STATUS:") {
        return Ok(Frame::Reply(DeviceReply::Status(rest.trim().to_string())));
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields[0] != DATA_PREFIX {
        let prefix: String = fields[0].chars().take(16).collect();
        return Err(DecodeError::UnknownPrefix(prefix));
    }
    if !matches!(fields.len(), 6 | 9 | 10) {
        return Err(DecodeError::FieldCount(fields.len()));
    }

    let sequence = parse_int::<u64>("sequence", fields[1])?;
    let device_millis = parse_int::<u64>("device_ms", fields[2])?;
    let distance = parse_float("distance_m", fields[3])?;
    let speed = parse_float("speed_kmh", fields[4])?;
    let accel = parse_float("accel_g", fields[5])?;

    if distance < 0.0 {
        return Err(invalid("distance_m", fields[3]));
    }
    if speed < 0.0 {
        return Err(invalid("speed_kmh", fields[4]));
    }

    let mut reading = SensorReading::new(sequence, received_at, distance, speed, accel)
        .with_device_millis(device_millis);

    if fields.len() >= 9 {
        reading.battery_voltage = parse_optional_float("battery_v", fields[6])?;
        reading.temperature_c = parse_optional_float("temp_c", fields[7])?;
        reading.error_count = match fields[8] {
            "" => None,
            raw => Some(parse_int::<u32>("errors", raw)?),
        };
    }
    if fields.len() == 10 {
        reading.heading_deg = parse_optional_float("heading_deg", fields[9])?;
        if let Some(heading) = reading.heading_deg {
            if !(0.0..360.0).contains(&heading) {
                return Err(invalid("heading_deg", fields[9]));
            }
        }
    }

    Ok(Frame::Reading(reading))
}

fn invalid(field: &'static str, value: &str) -> DecodeError {
    DecodeError::InvalidField {
        field,
        value: value.chars().take(32).collect(),
    }
}

fn parse_int<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, DecodeError> {
    raw.parse::<T>().map_err(|_| invalid(field, raw))
}

fn parse_float(field: &'static str, raw: &str) -> Result<f64, DecodeError> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(invalid(field, raw)),
    }
}

fn parse_optional_float(field: &'static str, raw: &str) -> Result<Option<f64>, DecodeError> {
    if raw.is_empty() {
        Ok(None)
    } else {
        parse_float(field, raw).map(Some)
    }
}

/// Snapshot of decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderStats {
    pub readings: u64,
    pub replies: u64,
    pub malformed: u64,
}

/// Counting front-end over [`decode_line`]. Malformed lines are logged and
/// counted, never propagated.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    readings: AtomicU64,
    replies: AtomicU64,
    malformed: AtomicU64,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&self, line: &str, received_at: DateTime<Utc>) -> Option<SensorReading> {
        match decode_line(line, received_at) {
            Ok(Frame::Reading(reading)) => {
                self.readings.fetch_add(1, Ordering::Relaxed);
                Some(reading)
            }
            Ok(Frame::Reply(reply)) => {
                self.replies.fetch_add(1, Ordering::Relaxed);
                debug!("[packet] device reply: {:?}", reply);
                None
            }
            Err(err) => {
                self.record_malformed();
                debug!("[packet] dropping malformed line: {}", err);
                None
            }
        }
    }

    /// Count a line rejected before decoding (e.g. oversized by the framer).
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            readings: self.readings.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}
