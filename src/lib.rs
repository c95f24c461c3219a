// Road Survey Telemetry
// Device link, position fusion and batched ingestion for wheel-odometer road surveys

pub mod config;
pub mod error;
pub mod fusion;
pub mod ingest;
pub mod link;
pub mod location;
pub mod movement;
pub mod packet;
pub mod service;
pub mod session;
pub mod sim;
pub mod storage;
pub mod survey;
pub mod types;

pub use config::SurveyConfig;
pub use error::{ConfigError, DecodeError, LinkError, LinkErrorKind, StorageError, SurveyError};
pub use ingest::{IngestPipeline, QualityFlag, QualityTier, StatusReport, TelemetryRecord};
pub use link::{ConnectionState, DeviceCommand, DeviceLink, TcpTransport, Transport};
pub use location::LocationFeed;
pub use service::{SurveyService, SurveySummary};
pub use session::{MemorySessionRepository, SessionRepository, SessionRequest, WheelCalibration};
pub use storage::{JsonLinesStore, MemoryStore, TelemetryStore};
pub use survey::{SurveyController, SurveySnapshot, SurveyState};
pub use types::{FixOrigin, LocationFix, PositionFix, SensorReading, SessionId};
