//! Isolated process launch using Linux namespaces via hakoniwa.
//!
//! The helper runs as host root with:
//! - Mount and PID namespaces
//! - UTS namespace with the container's hostname
//! - IPC namespace
//! - Network namespace, unless the container shares the host network
//!
//! Its root is the staging path, a recursive bind of the prepared sandbox
//! root, kept writable. hakoniwa binds the new root onto itself without
//! `MS_REC`, so the declared mounts and the helper are bound again inside the
//! namespace from [`LaunchSpec::binds`]. The container's backend directory is
//! bind-mounted at [`RELAY_MOUNT`] so the helper can open its relay FIFOs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use hakoniwa::{Container, Namespace, Runctl, Stdio};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, instrument, trace};

use crate::error::SandboxError;
use crate::relay::RELAY_MOUNT;

/// Global semaphore serializing namespace setup.
///
/// Concurrent namespace and mount setup contends in the kernel; only the
/// build and spawn phase is serialized, running helpers are unaffected.
static SETUP_SEMAPHORE: OnceLock<Mutex<()>> = OnceLock::new();

fn setup_semaphore() -> &'static Mutex<()> {
    SETUP_SEMAPHORE.get_or_init(|| Mutex::new(()))
}

/// Default PATH inside the sandbox.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A host path bound into the sandbox by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestBind {
    /// Host path.
    pub source: PathBuf,
    /// Absolute path inside the sandbox.
    pub guest: String,
    /// Bind read-only.
    pub read_only: bool,
}

/// Everything needed to start a container's helper.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Container id.
    pub id: u16,
    /// Staging bind of the prepared sandbox root.
    pub root: PathBuf,
    /// Mounts re-bound inside the new root.
    pub binds: Vec<GuestBind>,
    /// Hostname inside the UTS namespace.
    pub hostname: String,
    /// Keep the host network namespace.
    pub host_network: bool,
    /// Helper environment.
    pub env: BTreeMap<String, String>,
    /// Helper path inside the root.
    pub program: String,
    /// Helper arguments.
    pub args: Vec<String>,
    /// Host directory holding the relay FIFOs.
    pub relay_dir: PathBuf,
}

/// A running isolated process.
pub trait IsolatedProcess: Send + Sync {
    /// Host pid.
    fn pid(&self) -> u32;

    /// Sends `signal` to the process.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Process` if the signal cannot be delivered.
    fn signal(&self, signal: Signal) -> Result<(), SandboxError>;

    /// Blocks until the process exits and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Process` if waiting fails.
    fn wait(&self) -> Result<i32, SandboxError>;
}

/// Spawns isolated processes.
pub trait Launcher: Send + Sync {
    /// Starts the helper described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::LaunchFailed` if the process cannot be spawned.
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn IsolatedProcess>, SandboxError>;
}

/// Launcher backed by hakoniwa.
#[derive(Debug, Default, Clone, Copy)]
pub struct HakoniwaLauncher;

impl HakoniwaLauncher {
    /// Creates the launcher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Binds applied inside the new root, relay directory last.
    fn guest_mounts(spec: &LaunchSpec) -> Vec<GuestBind> {
        let mut binds = spec.binds.clone();
        binds.push(GuestBind {
            source: spec.relay_dir.clone(),
            guest: RELAY_MOUNT.to_string(),
            read_only: false,
        });
        binds
    }

    fn build_container(spec: &LaunchSpec) -> Container {
        trace!("Building hakoniwa container");
        let mut container = Container::empty();
        container
            .unshare(Namespace::Mount)
            .unshare(Namespace::Pid)
            .unshare(Namespace::Ipc)
            .unshare(Namespace::Uts);
        if !spec.host_network {
            container.unshare(Namespace::Network);
        }
        if !spec.hostname.is_empty() {
            container.hostname(&spec.hostname);
        }

        container.runctl(Runctl::RootdirRW).rootdir(&spec.root);
        container
            .procfsmount("/proc")
            .devfsmount("/dev")
            .tmpfsmount("/tmp");

        for bind in Self::guest_mounts(spec) {
            let source = bind.source.to_string_lossy();
            if bind.read_only {
                container.bindmount_ro(&source, &bind.guest);
            } else {
                container.bindmount_rw(&source, &bind.guest);
            }
        }
        container
    }
}

impl Launcher for HakoniwaLauncher {
    #[instrument(skip(self, spec), fields(id = spec.id, root = %spec.root.display()))]
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn IsolatedProcess>, SandboxError> {
        trace!("Acquiring setup semaphore");
        let setup_guard = setup_semaphore()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let container = Self::build_container(spec);
        let mut cmd = container.command(&spec.program);
        cmd.args(&spec.args);
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        if !spec.env.contains_key("PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .map_err(|e| SandboxError::LaunchFailed(format!("failed to spawn helper: {e}")))?;

        // let the child finish its mount namespace setup before the next spawn
        std::thread::sleep(std::time::Duration::from_millis(5));
        drop(setup_guard);

        let pid = child.id();
        debug!(pid, "Helper spawned");
        Ok(Arc::new(HakoniwaProcess {
            pid,
            child: Mutex::new(child),
        }))
    }
}

struct HakoniwaProcess {
    pid: u32,
    child: Mutex<hakoniwa::Child>,
}

impl IsolatedProcess for HakoniwaProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&self, signal: Signal) -> Result<(), SandboxError> {
        let pid = i32::try_from(self.pid)
            .map_err(|_| SandboxError::Process(format!("pid {} out of range", self.pid)))?;
        kill(Pid::from_raw(pid), signal)
            .map_err(|e| SandboxError::Process(format!("failed to send {signal} to {pid}: {e}")))
    }

    fn wait(&self) -> Result<i32, SandboxError> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let status = child
            .wait()
            .map_err(|e| SandboxError::Process(format!("failed to wait for helper: {e}")))?;
        debug!(pid = self.pid, code = status.code, "Helper exited");
        Ok(status.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_is_shared() {
        let a: *const Mutex<()> = setup_semaphore();
        let b: *const Mutex<()> = setup_semaphore();
        assert_eq!(a, b);
    }

    #[test]
    fn test_relay_dir_is_bound_after_declared_mounts() {
        let spec = LaunchSpec {
            id: 1,
            root: PathBuf::from("/var/lib/nodecore/roots/1.rootfs"),
            binds: vec![GuestBind {
                source: PathBuf::from("/var/lib/nodecore/roots/1/coreX"),
                guest: "/coreX".to_string(),
                read_only: true,
            }],
            hostname: "app".to_string(),
            host_network: false,
            env: BTreeMap::new(),
            program: "/coreX".to_string(),
            args: Vec::new(),
            relay_dir: PathBuf::from("/var/lib/nodecore/backend/1"),
        };

        let mounts = HakoniwaLauncher::guest_mounts(&spec);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0], spec.binds[0]);
        assert_eq!(mounts[1].source, spec.relay_dir);
        assert_eq!(mounts[1].guest, RELAY_MOUNT);
        assert!(!mounts[1].read_only);
    }
}
