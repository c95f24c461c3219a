//! Session and calibration repository seam.
//!
//! The pipeline only reads calibration and creates/updates session metadata;
//! calibration editing and the persistent schema live elsewhere.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::types::{ActiveSession, SessionId};

/// Wheel calibration sent to the device before a survey
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelCalibration {
    pub wheel_diameter_cm: f64,
    pub pulses_per_rotation: u32,
}

impl WheelCalibration {
    pub fn circumference_m(&self) -> f64 {
        std::f64::consts::PI * self.wheel_diameter_cm / 100.0
    }

    pub fn is_valid(&self) -> bool {
        self.wheel_diameter_cm.is_finite() && self.wheel_diameter_cm > 0.0 && self.pulses_per_rotation > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Recording,
    Paused,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionRequest {
    pub name: String,
    pub operator: Option<String>,
    pub notes: Option<String>,
}

impl SessionRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Session metadata as stored by the repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    pub survey_record_id: u64,
    pub name: String,
    pub operator: Option<String>,
    pub notes: Option<String>,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub calibration: Option<WheelCalibration>,
}

impl SessionMetadata {
    pub fn active_session(&self) -> ActiveSession {
        ActiveSession {
            session_id: self.session_id.clone(),
            survey_record_id: self.survey_record_id,
            started_at: self.started_at,
        }
    }
}

pub trait SessionRepository: Send + Sync {
    fn active_calibration(
        &self,
    ) -> impl Future<Output = Result<Option<WheelCalibration>, StorageError>> + Send;

    fn create_session(
        &self,
        request: SessionRequest,
    ) -> impl Future<Output = Result<SessionMetadata, StorageError>> + Send;

    fn update_session_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// In-process repository
pub struct MemorySessionRepository {
    calibration: Mutex<Option<WheelCalibration>>,
    sessions: Mutex<HashMap<SessionId, SessionMetadata>>,
    next_record_id: AtomicU64,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self {
            calibration: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            next_record_id: AtomicU64::new(1),
        }
    }

    pub fn with_calibration(calibration: WheelCalibration) -> Self {
        let repo = Self::new();
        repo.set_calibration(Some(calibration));
        repo
    }

    pub fn set_calibration(&self, calibration: Option<WheelCalibration>) {
        *self.calibration.lock().unwrap_or_else(|e| e.into_inner()) = calibration;
    }

    pub fn session(&self, session_id: &SessionId) -> Option<SessionMetadata> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }
}

impl Default for MemorySessionRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRepository for MemorySessionRepository {
    async fn active_calibration(&self) -> Result<Option<WheelCalibration>, StorageError> {
        Ok(*self.calibration.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn create_session(&self, request: SessionRequest) -> Result<SessionMetadata, StorageError> {
        let started_at = Utc::now();
        let survey_record_id = self.next_record_id.fetch_add(1, Ordering::Relaxed);
        let session_id = SessionId::new(format!(
            "session_{}_{}",
            started_at.timestamp_millis(),
            survey_record_id
        ))
        .ok_or_else(|| StorageError::Unavailable("generated empty session id".to_string()))?;

        let calibration = *self.calibration.lock().unwrap_or_else(|e| e.into_inner());
        let metadata = SessionMetadata {
            session_id: session_id.clone(),
            survey_record_id,
            name: request.name,
            operator: request.operator,
            notes: request.notes,
            started_at,
            status: SessionStatus::Recording,
            calibration,
        };

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, metadata.clone());
        Ok(metadata)
    }

    async fn update_session_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), StorageError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(session_id) {
            Some(meta) => {
                meta.status = status;
                Ok(())
            }
            None => Err(StorageError::Unavailable(format!(
                "unknown session {}",
                session_id
            ))),
        }
    }
}
