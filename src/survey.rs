use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::SurveyError;
use crate::session::{SessionMetadata, SessionRepository, SessionRequest};
use crate::types::ActiveSession;

/// Survey lifecycle states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurveyState {
    /// No survey; initial state and target of `reset()`
    Idle,
    /// Accepting data (once `ready`)
    Running(ActiveSession),
    /// Survey alive but not recording
    Paused(ActiveSession),
    /// Finished; stays here until reset
    Stopped(ActiveSession),
}

impl SurveyState {
    pub fn session(&self) -> Option<&ActiveSession> {
        match self {
            SurveyState::Idle => None,
            SurveyState::Running(s) | SurveyState::Paused(s) | SurveyState::Stopped(s) => Some(s),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SurveyState::Idle => "idle",
            SurveyState::Running(_) => "running",
            SurveyState::Paused(_) => "paused",
            SurveyState::Stopped(_) => "stopped",
        }
    }
}

/// State plus the readiness gate, published together so readers never see
/// one without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveySnapshot {
    pub state: SurveyState,
    pub ready: bool,
}

impl SurveySnapshot {
    pub fn idle() -> Self {
        Self {
            state: SurveyState::Idle,
            ready: false,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SurveyState::Running(_))
    }

    /// The session incoming data may be written to: Running and ready only.
    pub fn accepting_session(&self) -> Option<&ActiveSession> {
        match &self.state {
            SurveyState::Running(session) if self.ready => Some(session),
            _ => None,
        }
    }
}

/// Exclusive right to perform one Idle → Running transition.
///
/// Held from the state check until Running is published; released on drop,
/// so a failed or abandoned start frees the controller again.
pub struct StartClaim<'a> {
    starting: &'a AtomicBool,
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        self.starting.store(false, Ordering::Release);
    }
}

/// Single writer of the survey state.
pub struct SurveyController {
    tx: watch::Sender<SurveySnapshot>,
    starting: AtomicBool,
}

impl SurveyController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SurveySnapshot::idle());
        Self {
            tx,
            starting: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SurveySnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SurveySnapshot {
        self.tx.borrow().clone()
    }

    pub fn accepting_session(&self) -> Option<ActiveSession> {
        self.tx.borrow().accepting_session().cloned()
    }

    /// Ok only in Idle with no start in progress.
    pub fn check_can_start(&self) -> Result<(), SurveyError> {
        if self.starting.load(Ordering::Acquire) {
            return Err(SurveyError::AlreadyActive);
        }
        self.check_idle()
    }

    fn check_idle(&self) -> Result<(), SurveyError> {
        match &self.tx.borrow().state {
            SurveyState::Idle => Ok(()),
            SurveyState::Running(_) | SurveyState::Paused(_) => Err(SurveyError::AlreadyActive),
            SurveyState::Stopped(_) => Err(SurveyError::InvalidState(
                "cannot start from stopped; reset first".to_string(),
            )),
        }
    }

    /// Reserve the next start. Fails while another start holds its claim or
    /// a survey is already active.
    pub fn claim_start(&self) -> Result<StartClaim<'_>, SurveyError> {
        if self
            .starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("[survey] start rejected, another start is in progress");
            return Err(SurveyError::AlreadyActive);
        }
        let claim = StartClaim {
            starting: &self.starting,
        };
        self.check_idle()?;
        Ok(claim)
    }

    /// Idle → Running. The gate is closed before setup and only opened after
    /// Running has been published.
    pub async fn start_survey<R: SessionRepository>(
        &self,
        repo: &R,
        request: SessionRequest,
    ) -> Result<SessionMetadata, SurveyError> {
        let claim = self.claim_start()?;
        self.start_claimed(claim, repo, request).await
    }

    /// Finish a start reserved with [`claim_start`](Self::claim_start).
    pub async fn start_claimed<R: SessionRepository>(
        &self,
        _claim: StartClaim<'_>,
        repo: &R,
        request: SessionRequest,
    ) -> Result<SessionMetadata, SurveyError> {
        self.tx.send_modify(|s| s.ready = false);

        let metadata = match repo.create_session(request).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("[survey] session setup failed: {}", err);
                self.tx.send_replace(SurveySnapshot::idle());
                return Err(SurveyError::SessionSetup(err.to_string()));
            }
        };

        self.tx.send_replace(SurveySnapshot {
            state: SurveyState::Running(metadata.active_session()),
            ready: false,
        });
        self.tx.send_modify(|s| s.ready = true);

        info!(
            "[survey] started session {} (record {})",
            metadata.session_id, metadata.survey_record_id
        );
        Ok(metadata)
    }

    /// Running → Paused; logged no-op otherwise.
    pub fn pause_survey(&self) -> bool {
        let changed = self.tx.send_if_modified(|s| match &s.state {
            SurveyState::Running(session) => {
                s.state = SurveyState::Paused(session.clone());
                true
            }
            _ => false,
        });
        if changed {
            info!("[survey] paused");
        } else {
            warn!("[survey] pause ignored in state {}", self.tx.borrow().state.label());
        }
        changed
    }

    /// Paused → Running; logged no-op otherwise.
    pub fn resume_survey(&self) -> bool {
        let changed = self.tx.send_if_modified(|s| match &s.state {
            SurveyState::Paused(session) => {
                s.state = SurveyState::Running(session.clone());
                true
            }
            _ => false,
        });
        if changed {
            info!("[survey] resumed");
        } else {
            warn!("[survey] resume ignored in state {}", self.tx.borrow().state.label());
        }
        changed
    }

    /// Running | Paused → Stopped, gate closed.
    pub fn stop_survey(&self) -> Result<ActiveSession, SurveyError> {
        let mut stopped = None;
        self.tx.send_if_modified(|s| match &s.state {
            SurveyState::Running(session) | SurveyState::Paused(session) => {
                let session = session.clone();
                stopped = Some(session.clone());
                s.state = SurveyState::Stopped(session);
                s.ready = false;
                true
            }
            _ => false,
        });

        match stopped {
            Some(session) => {
                info!("[survey] stopped session {}", session.session_id);
                Ok(session)
            }
            None => {
                warn!("[survey] stop ignored in state {}", self.tx.borrow().state.label());
                Err(SurveyError::NotActive)
            }
        }
    }

    pub fn reset(&self) {
        self.tx.send_replace(SurveySnapshot::idle());
    }
}

impl Default for SurveyController {
    fn default() -> Self {
        Self::new()
    }
}
