//! Operation History
//!
//! Bounded ring buffer of immutable operation records. The manager appends;
//! the optimizer reads snapshots to retrain models and derive rebalancing
//! moves. Oldest records are dropped first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::entry::Priority;
use super::layer::LayerId;

/// Kind of recorded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Get,
    Set,
    Delete,
    Promotion,
}

/// One recorded operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Monotonic sequence number
    pub seq: u64,
    pub kind: OperationKind,
    pub key: String,
    pub at: DateTime<Utc>,
    /// Layer predicted for the key
    pub predicted: Option<LayerId>,
    /// Layer that served (get) or accepted (set) the operation
    pub layers: Vec<LayerId>,
    pub hit: bool,
    pub size: u64,
    pub content_type: String,
    pub priority: Priority,
    pub duration_us: u64,
}

impl OperationRecord {
    pub fn new(kind: OperationKind, key: impl Into<String>) -> Self {
        Self {
            seq: 0,
            kind,
            key: key.into(),
            at: Utc::now(),
            predicted: None,
            layers: Vec::new(),
            hit: false,
            size: 0,
            content_type: String::new(),
            priority: Priority::default(),
            duration_us: 0,
        }
    }

    /// Whether the prediction named the layer that served the operation
    pub fn prediction_correct(&self) -> bool {
        match (self.predicted, self.layers.first()) {
            (Some(predicted), Some(served)) => predicted == *served,
            _ => false,
        }
    }
}

/// Bounded operation history
pub struct OperationHistory {
    records: Mutex<VecDeque<OperationRecord>>,
    capacity: usize,
    next_seq: AtomicU64,
}

impl OperationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Append a record, assigning its sequence number
    pub fn record(&self, mut record: OperationRecord) -> u64 {
        let mut records = self.records.lock();
        // Sequence assigned under the lock so the buffer stays ordered
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        record.seq = seq;
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        seq
    }

    /// Copy of all retained records, oldest first
    pub fn snapshot(&self) -> Vec<OperationRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Records with a sequence number greater than `seq`
    pub fn since(&self, seq: u64) -> Vec<OperationRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.seq > seq)
            .cloned()
            .collect()
    }

    /// Sequence number of the newest record (0 when empty)
    pub fn last_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed) - 1
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let history = OperationHistory::new(3);
        for i in 0..5 {
            history.record(OperationRecord::new(OperationKind::Get, format!("k{}", i)));
        }

        let records = history.snapshot();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, "k2");
        assert_eq!(records[2].key, "k4");
        assert_eq!(records[2].seq, 5);
        assert_eq!(history.last_seq(), 5);
    }

    #[test]
    fn test_since() {
        let history = OperationHistory::new(10);
        assert_eq!(history.last_seq(), 0);
        let first = history.record(OperationRecord::new(OperationKind::Set, "a"));
        history.record(OperationRecord::new(OperationKind::Get, "a"));

        let newer = history.since(first);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].kind, OperationKind::Get);
    }

    #[test]
    fn test_prediction_correct() {
        let mut record = OperationRecord::new(OperationKind::Get, "k");
        assert!(!record.prediction_correct());
        record.predicted = Some(LayerId::Volatile);
        record.layers = vec![LayerId::Volatile];
        assert!(record.prediction_correct());
        record.layers = vec![LayerId::Blob];
        assert!(!record.prediction_correct());
    }
}
