//! Log and metric collaborators fed by the rewind path.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::relay::{LogMessage, StatTag};

/// Level of log lines the helper read from a command's stderr.
const LEVEL_STDERR: u16 = 2;

/// Receives log lines produced inside a container.
pub trait LogSink: Send + Sync {
    /// Records one line emitted for `command` in container `container`.
    fn record(&self, container: u16, command: &str, message: &LogMessage);
}

/// Receives metric samples.
pub trait StatsAggregator: Send + Sync {
    /// Feeds one sample of `key` using aggregation `operation`.
    fn aggregate(&self, operation: &str, key: &str, value: f64, tags: &[StatTag]);
}

/// [`LogSink`] that re-emits lines as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn record(&self, container: u16, command: &str, message: &LogMessage) {
        let level = message.level();
        if level == LEVEL_STDERR {
            warn!(container, command, level, "{}", message.message);
        } else {
            info!(container, command, level, "{}", message.message);
        }
    }
}

/// Aggregated value of one metric key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    /// Current value (average for `A`, last sample otherwise).
    pub value: f64,
    /// Number of samples seen.
    pub count: u64,
}

/// In-process [`StatsAggregator`].
#[derive(Debug, Default)]
pub struct MemoryStats {
    values: Mutex<HashMap<String, Aggregate>>,
}

impl MemoryStats {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current aggregate of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Aggregate> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }
}

impl StatsAggregator for MemoryStats {
    fn aggregate(&self, operation: &str, key: &str, value: f64, _tags: &[StatTag]) {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = values.entry(key.to_string()).or_insert(Aggregate {
            value: 0.0,
            count: 0,
        });
        entry.count += 1;
        entry.value = if operation == "A" {
            entry.value + (value - entry.value) / entry.count as f64
        } else {
            value
        };
    }
}
