//! Simulated survey device.
//!
//! Produces valid `DATA` lines for a vehicle at roughly constant speed with
//! mild road vibration, and speaks the command protocol over TCP so the full
//! stack can run without hardware.

use std::f64::consts::PI;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::fusion::{destination_point, EARTH_RADIUS_M};
use crate::types::LocationFix;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub speed_kmh: f64,
    /// Amplitude of the slow speed wobble; 0 gives exactly constant speed
    pub speed_variation_kmh: f64,
    pub vibration_g: f64,
    pub interval_ms: u64,
    /// Reported heading; `None` sends 9-field lines
    pub heading_deg: Option<f64>,
    pub battery_voltage: f64,
    /// Stop emitting after this many readings
    pub max_readings: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            speed_kmh: 40.0,
            speed_variation_kmh: 5.0,
            vibration_g: 0.3,
            interval_ms: 100,
            heading_deg: Some(90.0),
            battery_voltage: 3.9,
            max_readings: None,
        }
    }
}

impl SimulatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Device-side state: odometer, sequence counter and recording flag
#[derive(Debug)]
pub struct DeviceSimulator {
    config: SimulatorConfig,
    sequence: u64,
    device_millis: u64,
    distance_m: f64,
    recording: bool,
}

impl DeviceSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            sequence: 0,
            device_millis: 0,
            distance_m: 0.0,
            recording: false,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn emitted(&self) -> u64 {
        self.sequence
    }

    pub fn distance_m(&self) -> f64 {
        self.distance_m
    }

    pub fn exhausted(&self) -> bool {
        self.config.max_readings.is_some_and(|max| self.sequence >= max)
    }

    /// Apply one command line and return the reply, if any.
    pub fn handle_command(&mut self, line: &str) -> Option<String> {
        let command = line.trim().strip_prefix("CMD:")?;
        let reply = match command {
            "START" => {
                self.recording = true;
                self.distance_m = 0.0;
                "ACK:START".to_string()
            }
            "STOP" => {
                self.recording = false;
                "ACK:STOP".to_string()
            }
            "PAUSE" => {
                self.recording = false;
                "ACK:PAUSE".to_string()
            }
            "RESUME" => {
                self.recording = true;
                "ACK:RESUME".to_string()
            }
            "STATUS" => format!(
                "STATUS:{},SEQ={},DIST={:.2}",
                if self.recording { "RECORDING" } else { "IDLE" },
                self.sequence,
                self.distance_m
            ),
            cal if cal.starts_with("CAL,") => "ACK:CAL".to_string(),
            other => format!("ERR:UNKNOWN {}", other),
        };
        Some(reply)
    }

    /// Next reading line while recording.
    pub fn next_line(&mut self) -> Option<String> {
        if !self.recording || self.exhausted() {
            return None;
        }

        let t = self.sequence as f64 * self.config.interval_ms as f64 / 1000.0;
        let speed = (self.config.speed_kmh + (t * 0.5).sin() * self.config.speed_variation_kmh).max(0.0);
        self.distance_m += speed / 3.6 * self.config.interval_ms as f64 / 1000.0;
        self.device_millis += self.config.interval_ms;

        let accel = (t * 2.0 * PI * 1.3).sin() * self.config.vibration_g
            + (t * PI * 7.0).cos() * self.config.vibration_g * 0.2;
        let battery = self.config.battery_voltage - self.sequence as f64 * 1e-5;
        let temperature = 24.0 + (t * 0.01).sin();

        let mut line = format!(
            "DATA,{},{},{:.2},{:.1},{:.3},{:.2},{:.1},0",
            self.sequence, self.device_millis, self.distance_m, speed, accel, battery, temperature
        );
        if let Some(heading) = self.config.heading_deg {
            line.push_str(&format!(",{:.1}", heading));
        }
        self.sequence += 1;
        Some(line)
    }
}

/// Straight-line track matching the simulator's odometer, for synthetic GPS
#[derive(Debug, Clone, Copy)]
pub struct SimulatedTrack {
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub heading_deg: f64,
    pub accuracy_m: f64,
}

impl SimulatedTrack {
    pub fn fix_at(&self, distance_m: f64, captured_at: DateTime<Utc>) -> LocationFix {
        let (lat, lon) = destination_point(
            self.origin_lat,
            self.origin_lon,
            self.heading_deg,
            distance_m,
            EARTH_RADIUS_M,
        );
        LocationFix::new(lat, lon, self.accuracy_m, captured_at).with_bearing(self.heading_deg)
    }
}

impl Default for SimulatedTrack {
    fn default() -> Self {
        Self {
            origin_lat: 45.0703,
            origin_lon: 7.6869,
            heading_deg: 90.0,
            accuracy_m: 4.0,
        }
    }
}

/// Accept clients one at a time and stream readings to each until
/// cancelled. The odometer carries over between connections.
pub async fn serve(
    listener: TcpListener,
    config: SimulatorConfig,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut device = DeviceSimulator::new(config);
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        info!("[sim] client connected from {}", peer);
        match serve_client(stream, &mut device, &cancel).await {
            Ok(()) => info!("[sim] client {} done after {} readings", peer, device.emitted()),
            Err(e) => warn!("[sim] client {} dropped: {}", peer, e),
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    device: &mut DeviceSimulator,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut commands = BufReader::new(read).lines();
    let mut tick = tokio::time::interval(device.config().interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = commands.next_line() => match line? {
                Some(line) => {
                    debug!("[sim] <- {}", line);
                    if let Some(reply) = device.handle_command(&line) {
                        write.write_all(format!("{}\n", reply).as_bytes()).await?;
                    }
                }
                None => return Ok(()),
            },
            _ = tick.tick() => {
                if let Some(line) = device.next_line() {
                    write.write_all(format!("{}\n", line).as_bytes()).await?;
                }
            }
        }
    }
}
