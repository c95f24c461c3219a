use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ─── Top level ───────────────────────────────────────────────────────────────

/// Complete runtime configuration. Every section falls back to its defaults,
/// so a config file only needs the values it overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyConfig {
    pub link: LinkConfig,
    pub fusion: FusionConfig,
    pub movement: MovementConfig,
    pub quality: QualityConfig,
    pub ingest: IngestConfig,
}

impl SurveyConfig {
    /// Load from a JSON file and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SurveyConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.validate()?;
        self.fusion.validate()?;
        self.movement.validate()?;
        self.ingest.validate()?;
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("must be a positive number, got {value}"),
        })
    }
}

fn nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        })
    }
}

// ─── Device link ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 16_000,
            max_attempts: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub backoff: BackoffConfig,
    pub connect_timeout_ms: u64,
    /// Treat the link as lost after this much silence. `None` disables the watchdog.
    pub silence_timeout_ms: Option<u64>,
    pub max_line_bytes: usize,
    pub reading_channel_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            connect_timeout_ms: 10_000,
            silence_timeout_ms: Some(15_000),
            max_line_bytes: 512,
            reading_channel_capacity: 1_024,
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn silence_timeout(&self) -> Option<Duration> {
        self.silence_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        nonzero("link.backoff.base_delay_ms", self.backoff.base_delay_ms)?;
        nonzero("link.backoff.max_attempts", self.backoff.max_attempts as u64)?;
        if !(self.backoff.multiplier.is_finite() && self.backoff.multiplier >= 1.0) {
            return Err(ConfigError::Invalid {
                field: "link.backoff.multiplier",
                reason: format!("must be >= 1.0, got {}", self.backoff.multiplier),
            });
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(ConfigError::Invalid {
                field: "link.backoff.max_delay_ms",
                reason: "must not be below base_delay_ms".to_string(),
            });
        }
        nonzero("link.connect_timeout_ms", self.connect_timeout_ms)?;
        if let Some(silence) = self.silence_timeout_ms {
            nonzero("link.silence_timeout_ms", silence)?;
        }
        nonzero("link.max_line_bytes", self.max_line_bytes as u64)?;
        nonzero(
            "link.reading_channel_capacity",
            self.reading_channel_capacity as u64,
        )?;
        Ok(())
    }
}

// ─── Position fusion ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Fixes must be strictly more accurate than this to count as good.
    pub good_accuracy_m: f64,
    pub max_fix_age_ms: u64,
    pub max_interpolation_m: f64,
    /// Accuracy reported on dead-reckoned fixes.
    pub interpolated_accuracy_m: f64,
    pub earth_radius_m: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            good_accuracy_m: 20.0,
            max_fix_age_ms: 5_000,
            max_interpolation_m: 500.0,
            interpolated_accuracy_m: 50.0,
            earth_radius_m: crate::fusion::EARTH_RADIUS_M,
        }
    }
}

impl FusionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        positive("fusion.good_accuracy_m", self.good_accuracy_m)?;
        nonzero("fusion.max_fix_age_ms", self.max_fix_age_ms)?;
        positive("fusion.max_interpolation_m", self.max_interpolation_m)?;
        positive("fusion.interpolated_accuracy_m", self.interpolated_accuracy_m)?;
        positive("fusion.earth_radius_m", self.earth_radius_m)?;
        Ok(())
    }
}

// ─── Movement validation ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    pub moving_speed_kmh: f64,
    pub stopped_speed_kmh: f64,
    pub normal_accel_g: f64,
    pub shake_accel_g: f64,
    pub flat_accel_g: f64,
    pub window_ms: u64,
    pub min_pattern_samples: usize,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            moving_speed_kmh: 5.0,
            stopped_speed_kmh: 1.0,
            normal_accel_g: 2.0,
            shake_accel_g: 5.0,
            flat_accel_g: 0.1,
            window_ms: 5_000,
            min_pattern_samples: 5,
        }
    }
}

impl MovementConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        positive("movement.moving_speed_kmh", self.moving_speed_kmh)?;
        positive("movement.stopped_speed_kmh", self.stopped_speed_kmh)?;
        positive("movement.normal_accel_g", self.normal_accel_g)?;
        positive("movement.shake_accel_g", self.shake_accel_g)?;
        positive("movement.flat_accel_g", self.flat_accel_g)?;
        nonzero("movement.window_ms", self.window_ms)?;
        if self.stopped_speed_kmh > self.moving_speed_kmh {
            return Err(ConfigError::Invalid {
                field: "movement.stopped_speed_kmh",
                reason: "must not exceed moving_speed_kmh".to_string(),
            });
        }
        if !(self.flat_accel_g < self.normal_accel_g && self.normal_accel_g < self.shake_accel_g) {
            return Err(ConfigError::Invalid {
                field: "movement.normal_accel_g",
                reason: "expected flat < normal < shake".to_string(),
            });
        }
        Ok(())
    }
}

// ─── Quality flags ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub speed_too_high_kmh: f64,
    pub battery_critical_v: f64,
    pub battery_low_v: f64,
    pub battery_warning_v: f64,
    pub high_tier_min_score: u8,
    pub medium_tier_min_score: u8,
    /// Interpolated fixes below this confidence cannot lift a record above Low.
    pub medium_tier_min_confidence: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            speed_too_high_kmh: 130.0,
            battery_critical_v: 3.3,
            battery_low_v: 3.5,
            battery_warning_v: 3.7,
            high_tier_min_score: 80,
            medium_tier_min_score: 50,
            medium_tier_min_confidence: 0.5,
        }
    }
}

// ─── Ingestion ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub status_interval_ms: u64,
    pub final_flush_timeout_ms: u64,
    pub max_buffered_records: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_ms: 5_000,
            status_interval_ms: 3_000,
            final_flush_timeout_ms: 2_000,
            max_buffered_records: 20_000,
        }
    }
}

impl IngestConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn final_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.final_flush_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        nonzero("ingest.batch_size", self.batch_size as u64)?;
        nonzero("ingest.flush_interval_ms", self.flush_interval_ms)?;
        nonzero("ingest.status_interval_ms", self.status_interval_ms)?;
        nonzero("ingest.final_flush_timeout_ms", self.final_flush_timeout_ms)?;
        if self.max_buffered_records < self.batch_size {
            return Err(ConfigError::Invalid {
                field: "ingest.max_buffered_records",
                reason: "must be at least batch_size".to_string(),
            });
        }
        Ok(())
    }
}
