//! Result broker: correlates command ids with terminal results.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::CapabilityError;
use crate::relay::JobResult;

/// Stores results by correlation id and hands each one out at most once.
pub trait ResultBroker: Send + Sync {
    /// Stores a terminal result.
    fn set(&self, result: JobResult);

    /// Waits up to `timeout` for the result of `id` and consumes it.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityError::NoResult` if nothing arrived in time.
    fn get(&self, id: &str, timeout: Duration) -> Result<JobResult, CapabilityError>;

    /// Marks `id` as in flight.
    fn flag(&self, id: &str);

    /// Forgets `id` and any result stored for it.
    fn unflag(&self, id: &str);

    /// Whether `id` is in flight.
    fn flagged(&self, id: &str) -> bool;
}

/// Unclaimed results older than this are dropped.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
struct BrokerState {
    results: HashMap<String, (Instant, JobResult)>,
    flags: HashMap<String, Instant>,
}

impl BrokerState {
    /// Drops results and flags older than `ttl`.
    fn expire(&mut self, ttl: Duration) {
        let before = self.results.len();
        self.results.retain(|_, (stored, _)| stored.elapsed() < ttl);
        self.flags.retain(|_, flagged| flagged.elapsed() < ttl);
        let dropped = before - self.results.len();
        if dropped > 0 {
            debug!(dropped, "Expired unclaimed results");
        }
    }
}

/// In-process [`ResultBroker`].
///
/// Results nobody claims within the TTL are dropped on the next store.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    ready: Condvar,
    ttl: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_RESULT_TTL)
    }
}

impl MemoryBroker {
    /// Creates an empty broker with [`DEFAULT_RESULT_TTL`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty broker keeping unclaimed results for `ttl`.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            ready: Condvar::new(),
            ttl,
        }
    }

    /// Number of results waiting to be consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .results
            .len()
    }
}

impl ResultBroker for MemoryBroker {
    fn set(&self, result: JobResult) {
        trace!(id = %result.id, state = ?result.state, "Storing result");
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.expire(self.ttl);
        state
            .results
            .insert(result.id.clone(), (Instant::now(), result));
        self.ready.notify_all();
    }

    fn get(&self, id: &str, timeout: Duration) -> Result<JobResult, CapabilityError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some((_, result)) = state.results.remove(id) {
                state.flags.remove(id);
                return Ok(result);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(id, "Timed out waiting for result");
                return Err(CapabilityError::NoResult { id: id.to_string() });
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn flag(&self, id: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.flags.insert(id.to_string(), Instant::now());
    }

    fn unflag(&self, id: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.flags.remove(id);
        state.results.remove(id);
    }

    fn flagged(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flags
            .contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::relay::JobState;

    fn result(id: &str) -> JobResult {
        JobResult {
            id: id.to_string(),
            state: JobState::Success,
            ..JobResult::default()
        }
    }

    #[test]
    fn test_get_consumes_once() {
        let broker = MemoryBroker::new();
        broker.flag("a");
        broker.set(result("a"));

        let got = broker
            .get("a", Duration::from_millis(10))
            .expect("result should be there");
        assert_eq!(got.id, "a");
        assert!(!broker.flagged("a"));
        assert!(broker.get("a", Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_get_waits_for_late_result() {
        let broker = Arc::new(MemoryBroker::new());
        let setter = Arc::clone(&broker);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            setter.set(result("late"));
        });

        let got = broker
            .get("late", Duration::from_secs(5))
            .expect("late result should arrive");
        assert_eq!(got.id, "late");
        handle.join().expect("setter thread");
    }

    #[test]
    fn test_unflag_drops_result() {
        let broker = MemoryBroker::new();
        broker.flag("x");
        broker.set(result("x"));
        broker.unflag("x");
        assert_eq!(broker.pending(), 0);
    }

    #[test]
    fn test_unclaimed_results_expire() {
        let broker = MemoryBroker::with_ttl(Duration::from_millis(50));
        for id in ["a", "b", "c"] {
            broker.flag(id);
            broker.set(result(id));
        }
        assert_eq!(broker.pending(), 3);

        thread::sleep(Duration::from_millis(80));
        broker.set(result("fresh"));
        assert_eq!(broker.pending(), 1);
        assert!(!broker.flagged("a"));
        assert!(broker.get("a", Duration::ZERO).is_err());
        assert_eq!(
            broker.get("fresh", Duration::ZERO).expect("kept").id,
            "fresh"
        );
    }
}
