use std::sync::{Mutex, MutexGuard};

use log::error;

use super::record::TelemetryRecord;

/// Append-only record buffer with swap-and-clear draining.
///
/// `take()` hands out everything buffered so far in insertion order; records
/// appended afterwards land in a fresh vector and are never part of that batch.
pub struct RecordBuffer {
    records: Mutex<Vec<TelemetryRecord>>,
    max_records: usize,
}

impl RecordBuffer {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            max_records: max_records.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TelemetryRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append and return `(len, dropped)`, where `dropped` counts the oldest
    /// records discarded to stay under the cap.
    pub fn push(&self, record: TelemetryRecord) -> (usize, usize) {
        let mut records = self.lock();
        records.push(record);
        let dropped = Self::enforce_cap(&mut records, self.max_records);
        (records.len(), dropped)
    }

    pub fn take(&self) -> Vec<TelemetryRecord> {
        std::mem::take(&mut *self.lock())
    }

    /// Put a batch that failed to persist back in front of anything newer.
    pub fn restore(&self, mut batch: Vec<TelemetryRecord>) -> usize {
        let mut records = self.lock();
        batch.append(&mut records);
        *records = batch;
        Self::enforce_cap(&mut records, self.max_records)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn enforce_cap(records: &mut Vec<TelemetryRecord>, max: usize) -> usize {
        if records.len() <= max {
            return 0;
        }
        let excess = records.len() - max;
        records.drain(..excess);
        error!(
            "[ingest] buffer over {} records, dropped {} oldest",
            max, excess
        );
        excess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{QualityAssessment, QualityTier};
    use crate::movement::MovementValidation;
    use crate::types::{ActiveSession, SensorReading, SessionId};
    use chrono::Utc;

    fn record(sequence: u64) -> TelemetryRecord {
        let session = ActiveSession {
            session_id: SessionId::new("s").unwrap(),
            survey_record_id: 1,
            started_at: Utc::now(),
        };
        TelemetryRecord::assemble(
            &session,
            &SensorReading::new(sequence, Utc::now(), 0.0, 10.0, 0.2),
            0.0,
            None,
            MovementValidation::WarningStopped,
            QualityAssessment {
                flags: Default::default(),
                score: 100,
                tier: QualityTier::Low,
            },
        )
    }

    fn sequences(records: &[TelemetryRecord]) -> Vec<u64> {
        records.iter().map(|r| r.sequence).collect()
    }

    #[test]
    fn test_take_drains_in_order() {
        let buffer = RecordBuffer::new(100);
        for i in 0..5 {
            buffer.push(record(i));
        }
        assert_eq!(sequences(&buffer.take()), vec![0, 1, 2, 3, 4]);
        assert!(buffer.is_empty());
        assert!(buffer.take().is_empty());
    }

    #[test]
    fn test_restore_keeps_failed_batch_first() {
        let buffer = RecordBuffer::new(100);
        buffer.push(record(1));
        buffer.push(record(2));
        let batch = buffer.take();
        buffer.push(record(3));

        buffer.restore(batch);
        assert_eq!(sequences(&buffer.take()), vec![1, 2, 3]);
    }

    #[test]
    fn test_cap_drops_oldest() {
        let buffer = RecordBuffer::new(3);
        for i in 0..3 {
            assert_eq!(buffer.push(record(i)).1, 0);
        }
        assert_eq!(buffer.push(record(3)), (3, 1));
        assert_eq!(sequences(&buffer.take()), vec![1, 2, 3]);

        buffer.push(record(10));
        buffer.push(record(11));
        let dropped = buffer.restore(vec![record(7), record(8)]);
        assert_eq!(dropped, 1);
        assert_eq!(sequences(&buffer.take()), vec![8, 10, 11]);
    }
}
