//! Forward path: commands into the sandbox's input stream.
//!
//! Callers hand encoded commands to a dedicated writer thread over a channel
//! and wait a bounded time for the delivery acknowledgement. The writer opens
//! the input FIFO per command without blocking; while nobody reads the FIFO the
//! open fails with `ENXIO` and is retried until the command's deadline.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::wire::{Command, encode_line};
use crate::error::RelayError;

/// Pause between attempts while the FIFO has no reader or is full.
const RETRY_INTERVAL: Duration = Duration::from_millis(20);

struct Delivery {
    id: String,
    line: Vec<u8>,
    deadline: Instant,
    ack: mpsc::SyncSender<Result<(), RelayError>>,
}

/// Writer side of one container's relay.
pub struct Forwarder {
    sender: Mutex<Option<mpsc::Sender<Delivery>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl Forwarder {
    /// Starts the writer thread for the FIFO at `path`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::IoError` if the thread cannot be spawned.
    pub fn spawn(container: u16, path: PathBuf, timeout: Duration) -> Result<Self, RelayError> {
        let (sender, receiver) = mpsc::channel::<Delivery>();
        let writer = thread::Builder::new()
            .name(format!("forward-{container}"))
            .spawn(move || {
                for delivery in receiver {
                    let outcome = deliver(&path, &delivery, timeout);
                    if let Err(e) = &outcome {
                        warn!(container, id = %delivery.id, error = %e, "Failed to forward command");
                    }
                    // the caller may have given up already
                    let _ = delivery.ack.send(outcome);
                }
                trace!(container, "Forward writer stopped");
            })
            .map_err(|e| RelayError::IoError {
                context: "failed to spawn forward writer".to_string(),
                source: e,
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
            timeout,
        })
    }

    /// Delivers `command` to the helper.
    ///
    /// Returns once the record was written; the result arrives later on the
    /// rewind path.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::DeliveryTimeout` if the helper did not open its
    /// input in time, or `RelayError::Closed` after [`Forwarder::close`].
    pub fn send(&self, command: &Command) -> Result<(), RelayError> {
        let line = encode_line(command)?;
        let (ack, acked) = mpsc::sync_channel(1);
        let delivery = Delivery {
            id: command.id.clone(),
            line,
            deadline: Instant::now() + self.timeout,
            ack,
        };

        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let sender = sender.as_ref().ok_or(RelayError::Closed)?;
            sender.send(delivery).map_err(|_| RelayError::Closed)?;
        }

        // earlier deliveries may still hold the writer
        match acked.recv_timeout(self.timeout + RETRY_INTERVAL * 5) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(RelayError::DeliveryTimeout {
                id: command.id.clone(),
                timeout_ms: self.timeout.as_millis(),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(RelayError::Closed),
        }
    }

    /// Stops accepting commands and waits for queued deliveries to settle.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            let _ = writer.join();
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_nonblocking(path: &Path, delivery: &Delivery, timeout: Duration) -> Result<File, RelayError> {
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => return Ok(file),
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                if Instant::now() >= delivery.deadline {
                    return Err(timeout_error(&delivery.id, timeout));
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(RelayError::IoError {
                    context: format!("failed to open {}", path.display()),
                    source: e,
                });
            }
        }
    }
}

fn timeout_error(id: &str, timeout: Duration) -> RelayError {
    RelayError::DeliveryTimeout {
        id: id.to_string(),
        timeout_ms: timeout.as_millis(),
    }
}

fn deliver(path: &Path, delivery: &Delivery, timeout: Duration) -> Result<(), RelayError> {
    let mut file = open_nonblocking(path, delivery, timeout)?;
    let line = &delivery.line;
    let mut written = 0;
    while written < line.len() {
        match file.write(&line[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= delivery.deadline {
                    return Err(timeout_error(&delivery.id, timeout));
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(RelayError::IoError {
                    context: format!("failed to write {}", path.display()),
                    source: e,
                });
            }
        }
    }
    debug!(id = %delivery.id, bytes = written, "Command forwarded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};

    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;

    use super::*;

    fn fifo(dir: &Path) -> PathBuf {
        let path = dir.join("in");
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).expect("mkfifo");
        path
    }

    #[test]
    fn test_send_without_reader_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = fifo(dir.path());
        let forwarder =
            Forwarder::spawn(1, path, Duration::from_millis(100)).expect("spawn forwarder");

        let started = Instant::now();
        let err = forwarder
            .send(&Command::new("core.ping").with_id("a"))
            .expect_err("nobody reads");
        assert!(matches!(err, RelayError::DeliveryTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_send_reaches_reader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = fifo(dir.path());
        let reader_path = path.clone();
        let reader = thread::spawn(move || {
            let file = File::open(reader_path).expect("open for reading");
            let mut line = String::new();
            BufReader::new(file).read_line(&mut line).expect("read line");
            line
        });

        let forwarder = Forwarder::spawn(1, path, Duration::from_secs(5)).expect("spawn forwarder");
        forwarder
            .send(&Command::new("core.ping").with_id("b"))
            .expect("delivered");

        let line = reader.join().expect("reader thread");
        let cmd: Command = serde_json::from_str(&line).expect("command json");
        assert_eq!(cmd.id, "b");
        assert_eq!(cmd.command, "core.ping");
    }

    #[test]
    fn test_send_after_close_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let forwarder = Forwarder::spawn(1, fifo(dir.path()), Duration::from_millis(50))
            .expect("spawn forwarder");
        forwarder.close();
        assert!(matches!(
            forwarder.send(&Command::new("x")),
            Err(RelayError::Closed)
        ));
    }
}
