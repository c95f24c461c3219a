// pipeline.rs - Reading → TelemetryRecord → buffer → store
//
// `ReadingProcessor` is the synchronous per-reading path (gate, movement,
// fusion, quality). `IngestPipeline` owns buffering, flushing and status, and
// `run` is the background task that feeds it from the device link.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{IngestConfig, SurveyConfig};
use crate::error::StorageError;
use crate::fusion::PositionFusion;
use crate::movement::MovementValidator;
use crate::storage::TelemetryStore;
use crate::survey::{SurveySnapshot, SurveyState};
use crate::types::{LocationFix, PositionFix, SensorReading, SessionId};

use super::buffer::RecordBuffer;
use super::quality::QualityBuilder;
use super::record::TelemetryRecord;
use super::status::{StatusReport, StatusThrottle};

/// What happened to one reading
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Record(Box<TelemetryRecord>),
    /// Survey not running; expected, not an error
    Inactive,
    /// Running but no usable session (not ready yet)
    GuardViolation,
}

/// Per-reading state: fusion, movement window and distance baseline, all
/// scoped to one session.
pub struct ReadingProcessor {
    fusion: PositionFusion,
    validator: MovementValidator,
    quality: QualityBuilder,
    location: watch::Receiver<Option<LocationFix>>,
    session: Option<SessionId>,
    last_distance_m: Option<f64>,
}

impl ReadingProcessor {
    pub fn new(config: &SurveyConfig, location: watch::Receiver<Option<LocationFix>>) -> Self {
        Self {
            fusion: PositionFusion::new(config.fusion.clone()),
            validator: MovementValidator::new(config.movement.clone()),
            quality: QualityBuilder::new(config.quality.clone(), config.movement.clone()),
            location,
            session: None,
            last_distance_m: None,
        }
    }

    pub fn process(&mut self, reading: &SensorReading, snapshot: &SurveySnapshot) -> Processed {
        if !matches!(snapshot.state, SurveyState::Running(_)) {
            return Processed::Inactive;
        }
        let Some(session) = snapshot.accepting_session() else {
            warn!(
                "[ingest] reading {} arrived before the session was ready, dropped",
                reading.sequence
            );
            return Processed::GuardViolation;
        };

        if self.session.as_ref() != Some(&session.session_id) {
            if let Some(previous) = &self.session {
                let (direct, interpolated) = self.fusion.counts();
                info!(
                    "[fusion] session {} used {} direct and {} dead-reckoned positions",
                    previous, direct, interpolated
                );
            }
            info!("[ingest] new session {}, resetting fusion and movement state", session.session_id);
            self.fusion.reset();
            self.validator.reset();
            self.last_distance_m = None;
            self.session = Some(session.session_id.clone());
        }

        let delta = self.distance_delta(reading.cumulative_distance_m);
        let movement = self
            .validator
            .validate(reading.vertical_accel_g, reading.speed_kmh, reading.timestamp);

        let candidate = self.next_fix();
        let outcome = self
            .fusion
            .resolve(delta, candidate.as_ref(), reading.heading_deg, reading.timestamp);
        let quality = self.quality.assess(reading, &movement, &outcome);

        Processed::Record(Box::new(TelemetryRecord::assemble(
            session,
            reading,
            delta,
            outcome.into_fix(),
            movement,
            quality,
        )))
    }

    // Newest fix not yet seen. Never waits.
    fn next_fix(&mut self) -> Option<LocationFix> {
        match self.location.has_changed() {
            Ok(true) => self.location.borrow_and_update().clone(),
            _ => None,
        }
    }

    fn distance_delta(&mut self, cumulative_m: f64) -> f64 {
        let previous = self.last_distance_m.replace(cumulative_m);
        match previous {
            None => 0.0,
            Some(previous) if cumulative_m < previous => {
                warn!(
                    "[ingest] distance counter went backwards ({:.2} -> {:.2} m), rebasing",
                    previous, cumulative_m
                );
                0.0
            }
            Some(previous) => cumulative_m - previous,
        }
    }

    pub fn fusion(&self) -> &PositionFusion {
        &self.fusion
    }

    pub fn validator(&self) -> &MovementValidator {
        &self.validator
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub ingested: u64,
    pub discarded_inactive: u64,
    pub guard_violations: u64,
    pub flushed: u64,
    pub flush_failures: u64,
    pub dropped_overflow: u64,
    pub lagged: u64,
}

#[derive(Default)]
struct Counters {
    ingested: AtomicU64,
    discarded_inactive: AtomicU64,
    guard_violations: AtomicU64,
    flushed: AtomicU64,
    flush_failures: AtomicU64,
    dropped_overflow: AtomicU64,
    lagged: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

pub struct IngestPipeline<S: TelemetryStore> {
    config: IngestConfig,
    store: Arc<S>,
    survey: watch::Receiver<SurveySnapshot>,
    processor: Mutex<ReadingProcessor>,
    buffer: RecordBuffer,
    flush_lock: tokio::sync::Mutex<()>,
    last_flush: Mutex<Instant>,
    throttle: Mutex<StatusThrottle>,
    counters: Counters,
    status_tx: watch::Sender<StatusReport>,
    position_tx: watch::Sender<Option<PositionFix>>,
}

impl<S: TelemetryStore> IngestPipeline<S> {
    pub fn new(
        config: &SurveyConfig,
        store: Arc<S>,
        survey: watch::Receiver<SurveySnapshot>,
        location: watch::Receiver<Option<LocationFix>>,
    ) -> Self {
        let (status_tx, _) = watch::channel(StatusReport::default());
        let (position_tx, _) = watch::channel(None);
        Self {
            config: config.ingest.clone(),
            store,
            survey,
            processor: Mutex::new(ReadingProcessor::new(config, location)),
            buffer: RecordBuffer::new(config.ingest.max_buffered_records),
            flush_lock: tokio::sync::Mutex::new(()),
            last_flush: Mutex::new(Instant::now()),
            throttle: Mutex::new(StatusThrottle::new(config.ingest.status_interval())),
            counters: Counters::default(),
            status_tx,
            position_tx,
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusReport> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_position(&self) -> watch::Receiver<Option<PositionFix>> {
        self.position_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> IngestStats {
        let c = &self.counters;
        IngestStats {
            ingested: c.ingested.load(Ordering::Relaxed),
            discarded_inactive: c.discarded_inactive.load(Ordering::Relaxed),
            guard_violations: c.guard_violations.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            flush_failures: c.flush_failures.load(Ordering::Relaxed),
            dropped_overflow: c.dropped_overflow.load(Ordering::Relaxed),
            lagged: c.lagged.load(Ordering::Relaxed),
        }
    }

    /// Process one reading and apply the flush and status policies.
    pub async fn ingest(&self, reading: SensorReading) {
        let snapshot = self.survey.borrow().clone();
        let (processed, pattern) = {
            let mut processor = self.processor.lock().unwrap_or_else(|e| e.into_inner());
            let processed = processor.process(&reading, &snapshot);
            (processed, processor.validator().analyze_recent_pattern())
        };

        let record = match processed {
            Processed::Record(record) => record,
            Processed::Inactive => {
                bump(&self.counters.discarded_inactive, 1);
                return;
            }
            Processed::GuardViolation => {
                bump(&self.counters.guard_violations, 1);
                return;
            }
        };

        bump(&self.counters.ingested, 1);
        self.position_tx.send_replace(record.position.clone());
        let mut report = StatusReport {
            speed_kmh: record.speed_kmh,
            cumulative_distance_m: record.cumulative_distance_m,
            position_origin: record.position.as_ref().map(|p| p.origin),
            position_confidence: record.position.as_ref().map(|p| p.confidence),
            last_tier: Some(record.quality_tier),
            movement_pattern: Some(pattern),
            ..StatusReport::default()
        };

        let (len, dropped) = self.buffer.push(*record);
        if dropped > 0 {
            bump(&self.counters.dropped_overflow, dropped as u64);
        }

        if len >= self.config.batch_size || self.flush_due() {
            // failure is logged and counted inside; the batch stays buffered
            let _ = self.flush().await;
        }

        if self.throttle_ready() {
            self.fill_report(&mut report, &snapshot);
            debug!("[ingest] {}", report.message());
            self.status_tx.send_replace(report);
        }
    }

    fn flush_due(&self) -> bool {
        self.last_flush
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
            >= self.config.flush_interval()
    }

    fn throttle_ready(&self) -> bool {
        self.throttle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ready(Instant::now())
    }

    fn fill_report(&self, report: &mut StatusReport, snapshot: &SurveySnapshot) {
        let stats = self.stats();
        report.survey = snapshot.state.label().to_string();
        report.session_id = snapshot.state.session().map(|s| s.session_id.to_string());
        report.records_ingested = stats.ingested;
        report.records_flushed = stats.flushed;
        report.buffered = self.buffer.len();
        report.discarded_inactive = stats.discarded_inactive;
        report.guard_violations = stats.guard_violations;
        report.flush_failures = stats.flush_failures;
        report.dropped_overflow = stats.dropped_overflow;
    }

    /// Write everything buffered to the store, in insertion order.
    ///
    /// On failure the batch goes back to the front of the buffer for the next trigger.
    pub async fn flush(&self) -> Result<usize, StorageError> {
        let _guard = self.flush_lock.lock().await;
        let batch = self.buffer.take();
        *self.last_flush.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        if batch.is_empty() {
            return Ok(0);
        }

        match self.store.insert_batch(&batch).await {
            Ok(written) => {
                bump(&self.counters.flushed, written as u64);
                debug!("[ingest] flushed {} records", written);
                Ok(written)
            }
            Err(e) => {
                bump(&self.counters.flush_failures, 1);
                warn!(
                    "[ingest] flush of {} records failed, will retry: {}",
                    batch.len(),
                    e
                );
                let dropped = self.buffer.restore(batch);
                if dropped > 0 {
                    bump(&self.counters.dropped_overflow, dropped as u64);
                }
                Err(e)
            }
        }
    }

    async fn final_flush(&self) {
        let buffered = self.buffer.len();
        match tokio::time::timeout(self.config.final_flush_timeout(), self.flush()).await {
            Ok(Ok(written)) => info!("[ingest] final flush wrote {} records", written),
            Ok(Err(e)) => error!(
                "[ingest] final flush failed, {} records not saved: {}",
                self.buffer.len(),
                e
            ),
            Err(_) => error!(
                "[ingest] final flush timed out with {} records buffered",
                buffered
            ),
        }
    }

    /// Background task. Runs until cancelled or the reading source closes,
    /// then makes one bounded final flush.
    pub async fn run(
        self: Arc<Self>,
        mut readings: broadcast::Receiver<SensorReading>,
        cancel: CancellationToken,
    ) {
        let mut survey = self.survey.clone();
        let mut was_running = survey.borrow_and_update().is_running();
        let mut survey_open = true;

        let mut tick = tokio::time::interval(self.config.flush_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        info!("[ingest] pipeline started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = readings.recv() => match received {
                    Ok(reading) => self.ingest(reading).await,
                    Err(RecvError::Lagged(skipped)) => {
                        bump(&self.counters.lagged, skipped);
                        warn!("[ingest] fell behind, {} readings skipped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        info!("[ingest] reading source closed");
                        break;
                    }
                },
                _ = tick.tick() => {
                    if !self.buffer.is_empty() && self.flush_due() {
                        let _ = self.flush().await;
                    }
                }
                changed = survey.changed(), if survey_open => match changed {
                    Ok(()) => {
                        let running = survey.borrow_and_update().is_running();
                        if was_running && !running {
                            debug!("[ingest] survey left running, flushing");
                            let _ = self.flush().await;
                        }
                        was_running = running;
                    }
                    Err(_) => survey_open = false,
                },
            }
        }

        self.final_flush().await;
        info!("[ingest] pipeline stopped ({:?})", self.stats());
    }
}
