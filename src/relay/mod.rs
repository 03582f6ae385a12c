//! Relay protocol between the agent and the in-sandbox helper.
//!
//! Each container owns two FIFOs in its backend directory:
//!
//! ```text
//! /var/cache/containers/{id}/
//! ├── in     # agent -> helper, one Command per line
//! └── out    # helper -> agent, one Envelope per line
//! ```
//!
//! The backend directory is bind-mounted into the sandbox at [`RELAY_MOUNT`].

mod forward;
mod rewind;
mod wire;

pub use forward::Forwarder;
pub use rewind::{RewindRouter, spawn_reader, unblock_reader};
pub use wire::{
    Command, Envelope, JobResult, JobState, LogMessage, MessageKind, Rewind, StatSample, StatTag,
    encode_line,
};

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, warn};

use crate::error::RelayError;

/// Where the relay FIFOs appear inside the sandbox.
pub const RELAY_MOUNT: &str = "/.corex";

/// How long shutdown waits for the reader to drain.
const READER_DRAIN: Duration = Duration::from_secs(1);

/// FIFO locations of one container.
#[derive(Debug, Clone)]
pub struct RelayPaths {
    /// Agent -> helper.
    pub input: PathBuf,
    /// Helper -> agent.
    pub output: PathBuf,
}

impl RelayPaths {
    /// Paths inside `dir`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            input: dir.join("in"),
            output: dir.join("out"),
        }
    }

    /// Creates both FIFOs, replacing stale files.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::IoError` if a FIFO cannot be created.
    pub fn create(&self) -> Result<(), RelayError> {
        for path in [&self.input, &self.output] {
            let _ = std::fs::remove_file(path);
            mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| RelayError::IoError {
                context: format!("failed to create fifo {}", path.display()),
                source: std::io::Error::from(e),
            })?;
        }
        Ok(())
    }

    /// Removes both FIFOs.
    pub fn remove(&self) {
        for path in [&self.input, &self.output] {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Live relay of one container: the forward writer plus the rewind reader.
pub struct Relay {
    paths: RelayPaths,
    forwarder: Forwarder,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    /// Starts both directions over existing FIFOs.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::IoError` if a thread cannot be spawned.
    pub fn start(
        container: u16,
        paths: RelayPaths,
        router: RewindRouter,
        timeout: Duration,
    ) -> Result<Self, RelayError> {
        let reader = spawn_reader(router, paths.output.clone())?;
        let forwarder = match Forwarder::spawn(container, paths.input.clone(), timeout) {
            Ok(forwarder) => forwarder,
            Err(e) => {
                unblock_reader(&paths.output);
                return Err(e);
            }
        };
        Ok(Self {
            paths,
            forwarder,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Forwards one command.
    ///
    /// # Errors
    ///
    /// See [`Forwarder::send`].
    pub fn send(&self, command: &Command) -> Result<(), RelayError> {
        self.forwarder.send(command)
    }

    /// Stops forwarding and lets the reader finish.
    pub fn shutdown(&self) {
        self.forwarder.close();
        unblock_reader(&self.paths.output);

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            return;
        };

        let deadline = Instant::now() + READER_DRAIN;
        while !reader.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if reader.is_finished() {
            let _ = reader.join();
            debug!("Rewind reader joined");
        } else {
            // another process still holds the write end
            warn!(path = %self.paths.output.display(), "Rewind reader still running, detaching");
        }
    }
}
