use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories for the device link.
///
/// The first three require user action (enable the adapter, pair the
/// device) and never start the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkErrorKind {
    LinkUnavailable,
    LinkDisabled,
    DeviceNotFound,
    ConnectTimeout,
    ConnectionLost,
    MaxRetryReached,
}

impl LinkErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            LinkErrorKind::ConnectTimeout | LinkErrorKind::ConnectionLost
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkErrorKind::LinkUnavailable => "link_unavailable",
            LinkErrorKind::LinkDisabled => "link_disabled",
            LinkErrorKind::DeviceNotFound => "device_not_found",
            LinkErrorKind::ConnectTimeout => "connect_timeout",
            LinkErrorKind::ConnectionLost => "connection_lost",
            LinkErrorKind::MaxRetryReached => "max_retry_reached",
        }
    }
}

/// Device link error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Link adapter not available: {0}")]
    Unavailable(String),

    #[error("Link adapter disabled: {0}")]
    Disabled(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Connect timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Gave up after {0} reconnect attempts")]
    MaxRetryReached(u32),
}

impl LinkError {
    pub fn kind(&self) -> LinkErrorKind {
        match self {
            LinkError::Unavailable(_) => LinkErrorKind::LinkUnavailable,
            LinkError::Disabled(_) => LinkErrorKind::LinkDisabled,
            LinkError::DeviceNotFound(_) => LinkErrorKind::DeviceNotFound,
            LinkError::ConnectTimeout(_) => LinkErrorKind::ConnectTimeout,
            LinkError::ConnectionLost(_) => LinkErrorKind::ConnectionLost,
            LinkError::MaxRetryReached(_) => LinkErrorKind::MaxRetryReached,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Map an I/O failure from `open()` onto the link taxonomy.
    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::TimedOut => LinkError::ConnectTimeout(0),
            ErrorKind::NotFound | ErrorKind::AddrNotAvailable => {
                LinkError::DeviceNotFound(error.to_string())
            }
            _ => LinkError::ConnectionLost(error.to_string()),
        }
    }
}

/// A line that could not be decoded into a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Empty line")]
    Empty,

    #[error("Unknown line prefix: {0}")]
    UnknownPrefix(String),

    #[error("Expected 6, 9 or 10 fields, got {0}")]
    FieldCount(usize),

    #[error("Invalid value for {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("Line exceeds {0} bytes")]
    Oversized(usize),
}

/// Storage collaborator failure
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage I/O failed: {0}")]
    Io(String),

    #[error("Record serialization failed: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        StorageError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        StorageError::Serialization(error.to_string())
    }
}

/// Survey lifecycle error
#[derive(Error, Debug, Clone)]
pub enum SurveyError {
    #[error("Survey already active")]
    AlreadyActive,

    #[error("No active survey")]
    NotActive,

    #[error("Invalid survey state: {0}")]
    InvalidState(String),

    #[error("Session setup failed: {0}")]
    SessionSetup(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Configuration error
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
