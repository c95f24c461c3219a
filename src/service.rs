//! Composition root: wires the device link, survey controller, location feed
//! and ingestion pipeline together and drives the device commands that go
//! with each lifecycle change.

use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SurveyConfig;
use crate::error::{LinkError, SurveyError};
use crate::ingest::{IngestPipeline, IngestStats, StatusReport, TelemetryRecord};
use crate::link::{ConnectionState, DeviceCommand, DeviceLink, LinkStats, Transport};
use crate::location::LocationFeed;
use crate::session::{SessionMetadata, SessionRepository, SessionRequest, SessionStatus};
use crate::storage::TelemetryStore;
use crate::survey::{SurveyController, SurveySnapshot, SurveyState};
use crate::types::{ActiveSession, PositionFix, SessionId};

/// What a finished survey left behind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveySummary {
    pub session: ActiveSession,
    pub records: u64,
    pub latest: Option<TelemetryRecord>,
    pub ingest: IngestStats,
    pub link: LinkStats,
}

struct PipelineTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SurveyService<T: Transport, S: TelemetryStore, R: SessionRepository> {
    link: DeviceLink<T>,
    controller: SurveyController,
    location: LocationFeed,
    pipeline: Arc<IngestPipeline<S>>,
    repository: R,
    task: Mutex<Option<PipelineTask>>,
}

impl<T: Transport, S: TelemetryStore, R: SessionRepository> SurveyService<T, S, R> {
    pub fn new(config: &SurveyConfig, transport: T, store: Arc<S>, repository: R) -> Self {
        let link = DeviceLink::new(transport, config.link.clone());
        let controller = SurveyController::new();
        let location = LocationFeed::new();
        let pipeline = Arc::new(IngestPipeline::new(
            config,
            store,
            controller.subscribe(),
            location.subscribe(),
        ));
        Self {
            link,
            controller,
            location,
            pipeline,
            repository,
            task: Mutex::new(None),
        }
    }

    pub fn link(&self) -> &DeviceLink<T> {
        &self.link
    }

    pub fn location(&self) -> &LocationFeed {
        &self.location
    }

    pub fn pipeline(&self) -> &Arc<IngestPipeline<S>> {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<S> {
        self.pipeline.store()
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn survey(&self) -> SurveySnapshot {
        self.controller.snapshot()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.link.subscribe_state()
    }

    pub fn subscribe_survey(&self) -> watch::Receiver<SurveySnapshot> {
        self.controller.subscribe()
    }

    pub fn subscribe_position(&self) -> watch::Receiver<Option<PositionFix>> {
        self.pipeline.subscribe_position()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusReport> {
        self.pipeline.subscribe_status()
    }

    /// Spawn the pipeline and connect with auto-reconnect on.
    ///
    /// A failed connect is returned for reporting only; the service stays
    /// usable and a retryable failure is retried in the background.
    pub async fn start(&self) -> Result<(), LinkError> {
        {
            let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
            if task.is_none() {
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(
                    Arc::clone(&self.pipeline).run(self.link.subscribe_readings(), cancel.clone()),
                );
                *task = Some(PipelineTask { cancel, handle });
            }
        }

        self.link.start_auto_reconnect();
        match self.link.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_retryable() && self.link.retry_in_background() {
                    warn!("[service] initial connect failed ({}), retrying in background", e);
                } else {
                    warn!("[service] initial connect failed: {}", e);
                }
                Err(e)
            }
        }
    }

    /// Calibrate and start the device, then open a new session.
    ///
    /// A previous survey left in Stopped is reset first.
    pub async fn start_survey(&self, request: SessionRequest) -> Result<SessionMetadata, SurveyError> {
        if matches!(self.controller.snapshot().state, SurveyState::Stopped(_)) {
            self.controller.reset();
        }
        let claim = self.controller.claim_start()?;

        match self.repository.active_calibration().await? {
            Some(calibration) if calibration.is_valid() => {
                if !self.link.send(DeviceCommand::Calibrate(calibration)).await {
                    warn!("[service] device not connected, calibration not sent");
                }
            }
            Some(calibration) => warn!("[service] ignoring invalid calibration {:?}", calibration),
            None => info!("[service] no active calibration, using device defaults"),
        }
        if !self.link.send(DeviceCommand::Start).await {
            warn!("[service] device not connected, recording starts when it is");
        }

        self.controller
            .start_claimed(claim, &self.repository, request)
            .await
    }

    pub async fn pause_survey(&self) -> bool {
        if !self.controller.pause_survey() {
            return false;
        }
        self.link.send(DeviceCommand::Pause).await;
        self.mark_session(SessionStatus::Paused).await;
        true
    }

    pub async fn resume_survey(&self) -> bool {
        if !self.controller.resume_survey() {
            return false;
        }
        self.link.send(DeviceCommand::Resume).await;
        self.mark_session(SessionStatus::Recording).await;
        true
    }

    /// Stop the survey, flush what is buffered and summarize the session.
    pub async fn stop_survey(&self) -> Result<SurveySummary, SurveyError> {
        let session = self.controller.stop_survey()?;
        self.link.send(DeviceCommand::Stop).await;

        if let Err(e) = self.pipeline.flush().await {
            warn!(
                "[service] flush after stop failed, {} records still buffered: {}",
                self.pipeline.buffered(),
                e
            );
        }
        self.set_status(&session.session_id, SessionStatus::Completed).await;

        let store = self.pipeline.store();
        let records = store.count_by_session(&session.session_id).await?;
        let latest = store.latest(&session.session_id).await?;
        info!("[service] session {} finished with {} records", session.session_id, records);

        Ok(SurveySummary {
            session,
            records,
            latest,
            ingest: self.pipeline.stats(),
            link: self.link.stats(),
        })
    }

    /// Stop everything. An active survey is stopped and marked Aborted.
    pub async fn shutdown(&self) {
        if let Ok(session) = self.controller.stop_survey() {
            self.set_status(&session.session_id, SessionStatus::Aborted).await;
        }

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!("[service] pipeline task ended abnormally: {}", e);
            }
        }

        self.link.stop_auto_reconnect();
        self.link.disconnect().await;
        info!("[service] shut down");
    }

    async fn mark_session(&self, status: SessionStatus) {
        let session = self.controller.snapshot().state.session().cloned();
        if let Some(session) = session {
            self.set_status(&session.session_id, status).await;
        }
    }

    async fn set_status(&self, session_id: &SessionId, status: SessionStatus) {
        if let Err(e) = self.repository.update_session_status(session_id, status).await {
            warn!("[service] could not mark session {} {:?}: {}", session_id, status, e);
        }
    }
}
