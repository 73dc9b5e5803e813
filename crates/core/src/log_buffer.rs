//! In-memory ring buffer of recent log records.
//!
//! Mirrors every structured log record after augmentation so diagnostics
//! can ship recent history without touching the log files. Newest entries
//! win on overflow; readers get copies.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;

pub const DEFAULT_CAPACITY: usize = 5_000;

pub struct LogRingBuffer {
    inner: Mutex<VecDeque<Value>>,
    capacity: usize,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn push(&self, record: Value) {
        let mut buf = self.inner.lock().unwrap();
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(record);
    }

    /// Up to the last `limit` records, ordered oldest → newest.
    pub fn get_entries(&self, limit: usize) -> Vec<Value> {
        let buf = self.inner.lock().unwrap();
        let skip = buf.len().saturating_sub(limit);
        buf.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
