//! Rewind path: results, log lines and metric samples coming out of the sandbox.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace};

use super::wire::{Envelope, Rewind};
use crate::capability::{LogSink, ResultBroker, StatsAggregator};
use crate::error::RelayError;

/// Routes decoded rewind messages of one container to the collaborators.
#[derive(Clone)]
pub struct RewindRouter {
    container: u16,
    broker: Arc<dyn ResultBroker>,
    logger: Arc<dyn LogSink>,
    stats: Arc<dyn StatsAggregator>,
}

impl RewindRouter {
    /// Creates a router for container `container`.
    #[must_use]
    pub fn new(
        container: u16,
        broker: Arc<dyn ResultBroker>,
        logger: Arc<dyn LogSink>,
        stats: Arc<dyn StatsAggregator>,
    ) -> Self {
        Self {
            container,
            broker,
            logger,
            stats,
        }
    }

    /// Delivers one message.
    pub fn route(&self, message: Rewind) {
        match message {
            Rewind::Result(mut result) => {
                result.container = u64::from(self.container);
                trace!(container = self.container, id = %result.id, "Routing result");
                self.broker.set(result);
            }
            Rewind::Log { command, message } => {
                self.logger.record(self.container, &command, &message);
            }
            Rewind::Stats(sample) => {
                let key = format!("core-{}.{}", self.container, sample.key);
                self.stats
                    .aggregate(&sample.operation, &key, sample.value, &sample.tags);
            }
        }
    }

    /// Decodes envelopes from `reader` until end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Decode` on the first malformed record.
    pub fn pump(&self, reader: impl Read) -> Result<usize, RelayError> {
        let stream =
            serde_json::Deserializer::from_reader(BufReader::new(reader)).into_iter::<Envelope>();
        let mut routed = 0;
        for envelope in stream {
            let envelope = match envelope {
                Ok(envelope) => envelope,
                // a record cut short by the writer exiting
                Err(e) if e.is_eof() => break,
                Err(e) => return Err(RelayError::Decode(e)),
            };
            self.route(Rewind::decode(envelope)?);
            routed += 1;
        }
        Ok(routed)
    }
}

/// Starts the reader thread for the output FIFO at `path`.
///
/// The thread blocks until the helper opens its end, then routes messages
/// until end-of-stream or the first decode error.
///
/// # Errors
///
/// Returns `RelayError::IoError` if the thread cannot be spawned.
pub fn spawn_reader(router: RewindRouter, path: PathBuf) -> Result<JoinHandle<()>, RelayError> {
    let container = router.container;
    thread::Builder::new()
        .name(format!("rewind-{container}"))
        .spawn(move || {
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    error!(container, path = %path.display(), error = %e, "Failed to open relay output");
                    return;
                }
            };
            match router.pump(file) {
                Ok(routed) => debug!(container, routed, "Relay output closed"),
                Err(e) => error!(container, error = %e, "Failed to process relay message"),
            }
        })
        .map_err(|e| RelayError::IoError {
            context: "failed to spawn rewind reader".to_string(),
            source: e,
        })
}

/// Releases a reader still blocked opening `path` because no writer ever came.
pub fn unblock_reader(path: &Path) {
    // succeeds only while a reader is waiting; dropping it signals end-of-stream
    let _ = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path);
}
