use std::fmt;

use crate::session::WheelCalibration;

/// Outbound device commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    Start,
    Stop,
    Pause,
    Resume,
    Status,
    Calibrate(WheelCalibration),
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::Start => f.write_str("CMD:START"),
            DeviceCommand::Stop => f.write_str("CMD:STOP"),
            DeviceCommand::Pause => f.write_str("CMD:PAUSE"),
            DeviceCommand::Resume => f.write_str("CMD:RESUME"),
            DeviceCommand::Status => f.write_str("CMD:STATUS"),
            DeviceCommand::Calibrate(cal) => write!(
                f,
                "CMD:CAL,DIAM={},PULSE={}",
                cal.wheel_diameter_cm, cal.pulses_per_rotation
            ),
        }
    }
}
