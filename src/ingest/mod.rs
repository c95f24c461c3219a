//! Ingestion: turns decoded readings into flagged telemetry records and
//! batches them into the store.

pub mod buffer;
pub mod pipeline;
pub mod quality;
pub mod record;
pub mod status;

pub use buffer::RecordBuffer;
pub use pipeline::{IngestPipeline, IngestStats, Processed, ReadingProcessor};
pub use quality::QualityBuilder;
pub use record::{QualityAssessment, QualityFlag, QualityTier, TelemetryRecord};
pub use status::{StatusReport, StatusThrottle};
