//! Per-container identity-overlay (ZeroTier) daemon.
//!
//! The daemon is started at most once per container, inside the container's
//! network namespace, with its home under the container's working directory.
//! A watcher thread restarts it whenever it dies until the container
//! terminates or the daemon is stopped.

use std::fs;
use std::path::PathBuf;
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::link::netns_run;
use crate::capability::HostExec;
use crate::error::NetworkError;

/// Pause between readiness polls.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pause before restarting a dead daemon.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Network status reported once a join completed.
const STATUS_OK: &str = "OK";

/// Network statuses that will never become OK.
const STATUS_FATAL: &[&str] = &["ACCESS_DENIED", "NOT_FOUND", "PORT_ERROR", "CLIENT_TOO_OLD"];

struct Running {
    pid: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

/// Overlay daemon of one container.
pub struct OverlayDaemon {
    netns: String,
    home: PathBuf,
    identity: String,
    exec: Arc<dyn HostExec>,
    timeout: Duration,
    terminating: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
}

impl OverlayDaemon {
    /// Describes the daemon; nothing is started.
    ///
    /// `terminating` is the owning container's flag; once set the watcher
    /// stops restarting the daemon.
    #[must_use]
    pub fn new(
        netns: impl Into<String>,
        home: impl Into<PathBuf>,
        identity: impl Into<String>,
        exec: Arc<dyn HostExec>,
        timeout: Duration,
        terminating: Arc<AtomicBool>,
    ) -> Self {
        Self {
            netns: netns.into(),
            home: home.into(),
            identity: identity.into(),
            exec,
            timeout,
            terminating,
            running: Mutex::new(None),
        }
    }

    fn home_arg(&self) -> String {
        format!("-D{}", self.home.display())
    }

    fn cli(&self, args: &[&str]) -> Result<String, NetworkError> {
        let home = self.home_arg();
        let mut full = vec![home.as_str()];
        full.extend_from_slice(args);
        Ok(netns_run(self.exec.as_ref(), &self.netns, "zerotier-cli", &full)?)
    }

    fn cli_json(&self, args: &[&str]) -> Result<Value, NetworkError> {
        let mut full = vec!["-j"];
        full.extend_from_slice(args);
        let output = self.cli(&full)?;
        serde_json::from_str(&output)
            .map_err(|e| NetworkError::Overlay(format!("invalid zerotier-cli output: {e}")))
    }

    fn write_identity(&self) -> Result<(), NetworkError> {
        let io = |context: String, e: std::io::Error| NetworkError::IoError { context, source: e };
        fs::create_dir_all(&self.home)
            .map_err(|e| io(format!("failed to create {}", self.home.display()), e))?;
        if self.identity.is_empty() {
            return Ok(());
        }

        let secret = self.home.join("identity.secret");
        fs::write(&secret, &self.identity)
            .map_err(|e| io(format!("failed to write {}", secret.display()), e))?;
        let public = self.home.join("identity.public");
        fs::write(&public, public_identity(&self.identity))
            .map_err(|e| io(format!("failed to write {}", public.display()), e))
    }

    fn spawn_daemon(&self) -> Result<Child, NetworkError> {
        let home = self.home.to_string_lossy().into_owned();
        Ok(self.exec.spawn(
            "ip",
            &["netns", "exec", &self.netns, "zerotier-one", "-p0", &home],
        )?)
    }

    /// Starts the daemon if it is not running yet and waits until it answers.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Overlay` if the daemon does not answer within
    /// the configured timeout.
    #[instrument(skip(self), fields(netns = %self.netns))]
    pub fn ensure_started(&self) -> Result<(), NetworkError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Ok(());
        }

        self.write_identity()?;
        let child = self.spawn_daemon()?;
        let pid = Arc::new(AtomicU32::new(child.id()));
        let stop = Arc::new(AtomicBool::new(false));
        let watcher = self.spawn_watcher(child, Arc::clone(&pid), Arc::clone(&stop))?;
        *running = Some(Running { pid, stop, watcher });
        drop(running);

        let deadline = Instant::now() + self.timeout;
        loop {
            match self.cli(&["listnetworks"]) {
                Ok(_) => {
                    info!("Overlay daemon ready");
                    return Ok(());
                }
                Err(e) if Instant::now() >= deadline => {
                    return Err(NetworkError::Overlay(format!(
                        "daemon did not become ready within {}s: {e}",
                        self.timeout.as_secs()
                    )));
                }
                Err(_) => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    fn spawn_watcher(
        &self,
        first: Child,
        pid: Arc<AtomicU32>,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, NetworkError> {
        let exec = Arc::clone(&self.exec);
        let terminating = Arc::clone(&self.terminating);
        let netns = self.netns.clone();
        let home = self.home.to_string_lossy().into_owned();

        thread::Builder::new()
            .name(format!("overlay-{netns}"))
            .spawn(move || {
                let mut child = first;
                loop {
                    let status = child.wait();
                    if stop.load(Ordering::SeqCst) || terminating.load(Ordering::SeqCst) {
                        debug!(netns, "Overlay daemon stopped");
                        return;
                    }
                    warn!(netns, ?status, "Overlay daemon exited, restarting");
                    thread::sleep(RESTART_DELAY);
                    if stop.load(Ordering::SeqCst) || terminating.load(Ordering::SeqCst) {
                        return;
                    }
                    match exec.spawn(
                        "ip",
                        &["netns", "exec", &netns, "zerotier-one", "-p0", &home],
                    ) {
                        Ok(next) => {
                            pid.store(next.id(), Ordering::SeqCst);
                            child = next;
                        }
                        Err(e) => {
                            warn!(netns, error = %e, "Failed to restart overlay daemon");
                            return;
                        }
                    }
                }
            })
            .map_err(|e| NetworkError::IoError {
                context: "failed to spawn overlay watcher".to_string(),
                source: e,
            })
    }

    /// Whether the daemon was started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Joins network `network` and waits until it is usable.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Overlay` if the join is refused or times out.
    #[instrument(skip(self), fields(netns = %self.netns))]
    pub fn join(&self, network: &str) -> Result<(), NetworkError> {
        self.cli(&["join", network])?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let status = self.network_status(network)?;
            match status.as_deref() {
                Some(STATUS_OK) => {
                    info!(network, "Joined overlay network");
                    return Ok(());
                }
                Some(fatal) if STATUS_FATAL.contains(&fatal) => {
                    return Err(NetworkError::Overlay(format!(
                        "failed to join network {network}: {fatal}"
                    )));
                }
                _ if Instant::now() >= deadline => {
                    return Err(NetworkError::Overlay(format!(
                        "network {network} not ready within {}s",
                        self.timeout.as_secs()
                    )));
                }
                _ => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    fn network_status(&self, network: &str) -> Result<Option<String>, NetworkError> {
        let networks = self.cli_json(&["listnetworks"])?;
        Ok(networks.as_array().and_then(|list| {
            list.iter()
                .find(|entry| entry.get("nwid").and_then(Value::as_str) == Some(network))
                .and_then(|entry| entry.get("status").and_then(Value::as_str))
                .map(str::to_string)
        }))
    }

    /// Leaves network `network`.
    ///
    /// # Errors
    ///
    /// Returns the failing `zerotier-cli` invocation.
    pub fn leave(&self, network: &str) -> Result<(), NetworkError> {
        self.cli(&["leave", network]).map(|_| ())
    }

    /// Daemon status, with the secret identity injected as `secretIdentity`.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Precondition` if the daemon is not running.
    pub fn info(&self) -> Result<Value, NetworkError> {
        self.require_running()?;
        let mut info = self.cli_json(&["info"])?;
        let secret = fs::read_to_string(self.home.join("identity.secret")).unwrap_or_default();
        if let Value::Object(map) = &mut info {
            map.insert(
                "secretIdentity".to_string(),
                Value::String(secret.trim().to_string()),
            );
        }
        Ok(info)
    }

    /// Joined networks as reported by the daemon.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Precondition` if the daemon is not running.
    pub fn list(&self) -> Result<Value, NetworkError> {
        self.require_running()?;
        self.cli_json(&["listnetworks"])
    }

    fn require_running(&self) -> Result<(), NetworkError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(NetworkError::Precondition(
                "zerotier is not running in this container".to_string(),
            ))
        }
    }

    /// Stops the daemon and its watcher.
    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };

        running.stop.store(true, Ordering::SeqCst);
        let pid = running.pid.load(Ordering::SeqCst);
        if let Ok(pid) = i32::try_from(pid) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!(pid, error = %e, "Overlay daemon already gone");
            }
        }
        let _ = running.watcher.join();
    }
}

impl std::fmt::Debug for OverlayDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayDaemon")
            .field("netns", &self.netns)
            .field("home", &self.home)
            .finish_non_exhaustive()
    }
}

/// Public part of a ZeroTier identity: everything but the trailing secret field.
#[must_use]
pub fn public_identity(identity: &str) -> &str {
    let identity = identity.trim();
    match identity.rsplit_once(':') {
        Some((public, _)) => public,
        None => identity,
    }
}
