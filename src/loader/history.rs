//! Bounded history of load, unload and reload failures.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PluginError};

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub path: Option<PathBuf>,
    pub plugin_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// FIFO of the most recent failures
pub struct ErrorHistory {
    records: Mutex<VecDeque<ErrorRecord>>,
    capacity: Mutex<usize>,
}

impl ErrorHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: Mutex::new(capacity.max(1)),
        }
    }

    pub fn record(&self, operation: &str, path: Option<PathBuf>, plugin_id: Option<&str>, error: &PluginError) {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            path,
            plugin_id: plugin_id.or_else(|| error.plugin_id()).map(str::to_string),
            kind: error.kind(),
            message: error.message().to_string(),
        };
        let capacity = *self.capacity.lock();
        let mut records = self.records.lock();
        while records.len() >= capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Records oldest first
    pub fn entries(&self) -> Vec<ErrorRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        *self.capacity.lock() = capacity;
        let mut records = self.records.lock();
        while records.len() > capacity {
            records.pop_front();
        }
    }
}
