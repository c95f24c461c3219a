//! Telemetry storage seam.
//!
//! The pipeline only needs insert and two queries. `MemoryStore` keeps
//! everything in process; `JsonLinesStore` appends one JSON object per line to
//! `<dir>/<session_id>.jsonl`.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;
use crate::ingest::TelemetryRecord;
use crate::types::SessionId;

pub trait TelemetryStore: Send + Sync + 'static {
    fn insert_one(
        &self,
        record: &TelemetryRecord,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Insert in slice order. Either the whole batch is stored or an error is returned.
    fn insert_batch(
        &self,
        records: &[TelemetryRecord],
    ) -> impl Future<Output = Result<usize, StorageError>> + Send;

    fn latest(
        &self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<Option<TelemetryRecord>, StorageError>> + Send;

    fn count_by_session(
        &self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<u64, StorageError>> + Send;
}

// ─── In-memory ───────────────────────────────────────────────────────────────

/// In-process store. Can be told to fail upcoming writes.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, Vec<TelemetryRecord>>>,
    failures_remaining: AtomicU32,
    batches: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with `StorageError::Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn records(&self, session_id: &SessionId) -> Vec<TelemetryRecord> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_records(&self) -> Vec<TelemetryRecord> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<TelemetryRecord> = sessions.values().flatten().cloned().collect();
        all.sort_by_key(|r| (r.timestamp, r.sequence));
        all
    }

    /// Successful `insert_batch` calls so far
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Result<(), StorageError> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StorageError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl TelemetryStore for MemoryStore {
    async fn insert_one(&self, record: &TelemetryRecord) -> Result<(), StorageError> {
        self.take_failure()?;
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(record.session_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn insert_batch(&self, records: &[TelemetryRecord]) -> Result<usize, StorageError> {
        self.take_failure()?;
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        for record in records {
            sessions
                .entry(record.session_id.clone())
                .or_default()
                .push(record.clone());
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(records.len())
    }

    async fn latest(&self, session_id: &SessionId) -> Result<Option<TelemetryRecord>, StorageError> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .and_then(|records| records.last().cloned()))
    }

    async fn count_by_session(&self, session_id: &SessionId) -> Result<u64, StorageError> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .map_or(0, |records| records.len() as u64))
    }
}

// ─── JSON lines on disk ──────────────────────────────────────────────────────

pub struct JsonLinesStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesStore {
    /// Create the output directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding one session's records.
    ///
    /// Ids made only of ASCII alphanumerics, `-` and `_` are used as-is. Any
    /// other id is sanitised and suffixed with `.` plus a digest of the raw
    /// id, so distinct ids never share a file.
    pub fn session_path(&self, session_id: &SessionId) -> PathBuf {
        let raw = session_id.as_str();
        let portable = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
        if raw.chars().all(portable) {
            return self.dir.join(format!("{raw}.jsonl"));
        }

        let sanitised: String = raw.chars().map(|c| if portable(c) { c } else { '_' }).collect();
        let digest = Sha256::digest(raw.as_bytes());
        let suffix: String = digest[..6].iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{sanitised}.{suffix}.jsonl"))
    }

    async fn append(&self, path: &Path, payload: &[u8]) -> Result<(), StorageError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(payload).await?;
        file.flush().await?;
        Ok(())
    }

    /// Length of `path` before a write, `None` when it does not exist yet.
    async fn length_before(path: &Path) -> Result<Option<u64>, StorageError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Err(StorageError::Io(format!("{} is not a regular file", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Undo the appends of a failed batch.
    async fn roll_back(&self, touched: &[(PathBuf, Option<u64>)]) {
        for (path, before) in touched {
            let undone = match before {
                Some(len) => match tokio::fs::OpenOptions::new().write(true).open(path).await {
                    Ok(file) => file.set_len(*len).await,
                    Err(e) => Err(e),
                },
                None => match tokio::fs::remove_file(path).await {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(e) = undone {
                warn!("[storage] could not roll back {}: {}", path.display(), e);
            }
        }
    }

    async fn read_lines(&self, session_id: &SessionId) -> Result<Vec<String>, StorageError> {
        match tokio::fs::read_to_string(self.session_path(session_id)).await {
            Ok(text) => Ok(text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl TelemetryStore for JsonLinesStore {
    async fn insert_one(&self, record: &TelemetryRecord) -> Result<(), StorageError> {
        self.insert_batch(std::slice::from_ref(record)).await.map(|_| ())
    }

    async fn insert_batch(&self, records: &[TelemetryRecord]) -> Result<usize, StorageError> {
        // serialize everything up front so a bad record writes nothing
        let mut per_session: Vec<(SessionId, Vec<u8>)> = Vec::new();
        for record in records {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            match per_session.iter_mut().find(|(id, _)| *id == record.session_id) {
                Some((_, payload)) => payload.extend_from_slice(&line),
                None => per_session.push((record.session_id.clone(), line)),
            }
        }

        let _guard = self.write_lock.lock().await;
        let mut touched: Vec<(PathBuf, Option<u64>)> = Vec::with_capacity(per_session.len());
        for (session_id, payload) in &per_session {
            let path = self.session_path(session_id);
            let written = match Self::length_before(&path).await {
                Ok(before) => {
                    touched.push((path.clone(), before));
                    self.append(&path, payload).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!("[storage] batch write to {} failed, rolling back: {}", path.display(), e);
                self.roll_back(&touched).await;
                return Err(e);
            }
        }
        debug!("[storage] appended {} records", records.len());
        Ok(records.len())
    }

    async fn latest(&self, session_id: &SessionId) -> Result<Option<TelemetryRecord>, StorageError> {
        let lines = self.read_lines(session_id).await?;
        match lines.last() {
            Some(line) => Ok(Some(serde_json::from_str(line)?)),
            None => Ok(None),
        }
    }

    async fn count_by_session(&self, session_id: &SessionId) -> Result<u64, StorageError> {
        Ok(self.read_lines(session_id).await?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{QualityAssessment, QualityTier};
    use crate::movement::MovementValidation;
    use crate::types::{ActiveSession, SensorReading};
    use chrono::Utc;

    fn session(id: &str) -> ActiveSession {
        ActiveSession {
            session_id: SessionId::new(id).unwrap(),
            survey_record_id: 7,
            started_at: Utc::now(),
        }
    }

    fn record(session: &ActiveSession, sequence: u64) -> TelemetryRecord {
        let reading = SensorReading::new(sequence, Utc::now(), sequence as f64, 20.0, 0.2);
        TelemetryRecord::assemble(
            session,
            &reading,
            1.0,
            None,
            MovementValidation::ValidMoving { confidence: 0.9 },
            QualityAssessment {
                flags: Default::default(),
                score: 100,
                tier: QualityTier::Low,
            },
        )
    }

    #[tokio::test]
    async fn test_memory_store_contracts() {
        let store = MemoryStore::new();
        let a = session("a");
        let b = session("b");

        store.insert_batch(&[record(&a, 1), record(&a, 2), record(&b, 1)]).await.unwrap();
        store.insert_one(&record(&a, 3)).await.unwrap();

        assert_eq!(store.count_by_session(&a.session_id).await.unwrap(), 3);
        assert_eq!(store.count_by_session(&b.session_id).await.unwrap(), 1);
        assert_eq!(store.latest(&a.session_id).await.unwrap().unwrap().sequence, 3);
        assert_eq!(store.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_injected_failures() {
        let store = MemoryStore::new();
        let a = session("a");
        store.fail_next(2);
        assert!(store.insert_batch(&[record(&a, 1)]).await.is_err());
        assert!(store.insert_one(&record(&a, 1)).await.is_err());
        assert!(store.insert_batch(&[record(&a, 1)]).await.is_ok());
        assert_eq!(store.count_by_session(&a.session_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_json_lines_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::open(dir.path().join("out")).await.unwrap();
        let a = session("session_1/../x");

        assert!(store.latest(&a.session_id).await.unwrap().is_none());
        assert_eq!(store.count_by_session(&a.session_id).await.unwrap(), 0);

        store.insert_batch(&[record(&a, 1), record(&a, 2)]).await.unwrap();
        store.insert_one(&record(&a, 3)).await.unwrap();

        assert_eq!(store.count_by_session(&a.session_id).await.unwrap(), 3);
        let latest = store.latest(&a.session_id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 3);
        assert_eq!(latest.session_id, a.session_id);

        // session id is sanitised into a single file name
        let path = store.session_path(&a.session_id);
        assert_eq!(path.parent().unwrap(), store.dir());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_json_lines_failed_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::open(dir.path()).await.unwrap();
        let a = session("a");
        let b = session("b");
        store.insert_one(&record(&a, 0)).await.unwrap();

        // the second session's file cannot be written
        let blocked = store.session_path(&b.session_id);
        std::fs::create_dir(&blocked).unwrap();
        let batch = [record(&a, 1), record(&b, 1), record(&a, 2)];
        assert!(store.insert_batch(&batch).await.is_err());
        assert_eq!(store.count_by_session(&a.session_id).await.unwrap(), 1);

        std::fs::remove_dir(&blocked).unwrap();
        assert_eq!(store.insert_batch(&batch).await.unwrap(), 3);
        assert_eq!(store.count_by_session(&a.session_id).await.unwrap(), 3);
        assert_eq!(store.count_by_session(&b.session_id).await.unwrap(), 1);
        assert_eq!(store.latest(&a.session_id).await.unwrap().unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_json_lines_rollback_removes_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::open(dir.path()).await.unwrap();
        let a = session("fresh");
        let b = session("blocked");
        std::fs::create_dir(store.session_path(&b.session_id)).unwrap();

        assert!(store.insert_batch(&[record(&a, 1), record(&b, 1)]).await.is_err());
        assert!(!store.session_path(&a.session_id).exists());
    }

    #[tokio::test]
    async fn test_session_files_are_distinct_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::open(dir.path()).await.unwrap();
        let ids = ["a_b", "a/b", "a:b", "a.b"].map(session);

        let mut paths: Vec<_> = ids.iter().map(|s| store.session_path(&s.session_id)).collect();
        assert_eq!(paths[0], store.dir().join("a_b.jsonl"));
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), ids.len());

        for (i, s) in ids.iter().enumerate() {
            let records: Vec<_> = (0..=i as u64).map(|seq| record(s, seq)).collect();
            store.insert_batch(&records).await.unwrap();
        }
        for (i, s) in ids.iter().enumerate() {
            assert_eq!(store.count_by_session(&s.session_id).await.unwrap(), i as u64 + 1);
        }
    }
}
