//! Container lifecycle.
//!
//! A container moves through
//! `created -> sandboxed -> started -> running -> exiting -> reaped`:
//!
//! - **sandboxed**: the root is populated
//! - **started**: the helper runs; cgroups, post-start network and the relay
//!   are set up once its pid is known
//! - **running**: the relay is up and commands can be dispatched
//! - **exiting**: the helper is gone; network, mounts and directories are released
//! - **reaped**: the owner removed the id from its registry
//!
//! Failures before the helper runs roll everything back. Failures in the
//! post-start hooks are logged and recorded on the NIC, the container keeps running.

mod args;
mod paths;
mod store;

pub use args::{
    ContainerArgs, MAX_NIC_NAME, NetworkConfig, Nic, NicKind, NicState, has_scheme,
};
pub use paths::ContainerPaths;
pub use store::ConfigStore;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::capability::{CGroup, Capabilities};
use crate::config::AgentConfig;
use crate::error::{ManagerError, NetworkError, SandboxError};
use crate::network::{NetworkAttacher, OverlayDaemon, SwitchAgent};
use crate::relay::{Command, Relay, RewindRouter};
use crate::sandbox::{IsolatedProcess, LaunchSpec, SandboxBuilder};

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Registered, nothing built yet.
    Created,
    /// Root populated.
    Sandboxed,
    /// Helper spawned.
    Started,
    /// Relay active.
    Running,
    /// Helper gone, resources being released.
    Exiting,
    /// Removed from the registry.
    Reaped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Sandboxed => "sandboxed",
            Self::Started => "started",
            Self::Running => "running",
            Self::Exiting => "exiting",
            Self::Reaped => "reaped",
        };
        f.write_str(name)
    }
}

/// Notified once a container has released everything.
pub trait ContainerOwner: Send + Sync {
    /// The container `id` is gone and its id may be reused.
    fn reaped(&self, id: u16);
}

/// One supervised container.
pub struct Container {
    id: u16,
    config: Arc<AgentConfig>,
    caps: Capabilities,
    paths: ContainerPaths,
    store: Mutex<ConfigStore>,
    sandbox: SandboxBuilder,
    network: NetworkAttacher,
    owner: Arc<dyn ContainerOwner>,
    state: Mutex<ContainerState>,
    changed: Condvar,
    pid: AtomicU32,
    terminating: Arc<AtomicBool>,
    process: Mutex<Option<Arc<dyn IsolatedProcess>>>,
    relay: Mutex<Option<Arc<Relay>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    exit_code: Mutex<Option<i32>>,
}

impl Container {
    /// Creates the container's working directory and config store.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Store` if the store cannot be written.
    pub fn new(
        id: u16,
        config: Arc<AgentConfig>,
        caps: Capabilities,
        args: &ContainerArgs,
        owner: Arc<dyn ContainerOwner>,
        switch: Arc<dyn SwitchAgent>,
    ) -> Result<Arc<Self>, ManagerError> {
        let paths = ContainerPaths::new(&config, id);
        paths.remove_workdir()?;
        paths.create_workdir()?;

        let mut store = ConfigStore::open(&paths.config_file)?;
        store.write(args)?;

        let terminating = Arc::new(AtomicBool::new(false));
        let overlay = OverlayDaemon::new(
            id.to_string(),
            paths.overlay_home.clone(),
            args.identity.clone(),
            Arc::clone(&caps.exec),
            config.overlay_timeout,
            Arc::clone(&terminating),
        );
        let network = NetworkAttacher::new(id, &config, &caps, switch, paths.root.clone(), overlay);
        let sandbox = SandboxBuilder::new(id, paths.root.clone(), &caps);

        Ok(Arc::new(Self {
            id,
            config,
            caps,
            paths,
            store: Mutex::new(store),
            sandbox,
            network,
            owner,
            state: Mutex::new(ContainerState::Created),
            changed: Condvar::new(),
            pid: AtomicU32::new(0),
            terminating,
            process: Mutex::new(None),
            relay: Mutex::new(None),
            reaper: Mutex::new(None),
            exit_code: Mutex::new(None),
        }))
    }

    /// Container id.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Helper pid, 0 until spawned.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether teardown has begun.
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Filesystem layout.
    #[must_use]
    pub fn paths(&self) -> &ContainerPaths {
        &self.paths
    }

    /// Network attacher.
    #[must_use]
    pub fn network(&self) -> &NetworkAttacher {
        &self.network
    }

    /// Exit code of the helper once reaped.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ContainerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(id = self.id, from = %*state, to = %next, "Container state change");
        *state = next;
        self.changed.notify_all();
    }

    /// Declared arguments as currently stored.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Store` if the store cannot be read.
    pub fn arguments(&self) -> Result<ContainerArgs, ManagerError> {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(store.load()?)
    }

    /// Loads the arguments, applies `update` and writes them back if it succeeds.
    fn update_arguments<T>(
        &self,
        update: impl FnOnce(&mut ContainerArgs) -> Result<T, ManagerError>,
    ) -> Result<T, ManagerError> {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let mut args = store.load()?;
        let value = update(&mut args)?;
        store.write(&args)?;
        Ok(value)
    }

    fn set_nic_state(&self, index: usize, state: NicState) {
        let outcome = self.update_arguments(|args| {
            if let Some(nic) = args.nics.get_mut(index) {
                nic.state = state;
            }
            Ok(())
        });
        if let Err(e) = outcome {
            error!(id = self.id, index, error = %e, "Failed to persist nic state");
        }
    }

    /// Builds the sandbox, spawns the helper and wires it up.
    ///
    /// On error everything acquired so far is released.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error.
    #[instrument(skip(self), fields(id = self.id))]
    pub fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        let args = match self.arguments() {
            Ok(args) => args,
            Err(e) => {
                self.rollback(&ContainerArgs::default());
                return Err(e);
            }
        };

        let process = match self.spawn_helper(&args) {
            Ok(process) => process,
            Err(e) => {
                error!(error = %e, "Failed to spawn helper");
                self.rollback(&args);
                return Err(e);
            }
        };
        let pid = process.pid();
        info!(pid, "Helper started");

        self.on_start(&args, pid);

        if let Err(e) = self.activate(&process) {
            error!(error = %e, "Failed to activate container, killing helper");
            self.terminating.store(true, Ordering::SeqCst);
            let _ = process.signal(Signal::SIGKILL);
            let _ = process.wait();
            self.rollback(&self.arguments().unwrap_or(args));
            return Err(e);
        }
        Ok(())
    }

    /// Populates the root, prepares the relay and host network, and launches
    /// the helper.
    fn spawn_helper(&self, args: &ContainerArgs) -> Result<Arc<dyn IsolatedProcess>, ManagerError> {
        self.sandbox
            .build(args, &self.config.helper_path, &self.config.helper_name)?;
        self.set_state(ContainerState::Sandboxed);

        self.paths.relay().create()?;
        if !args.host_network {
            self.pre_start_network(args)?;
        }

        let process = self.caps.launcher.launch(&self.launch_spec(args)?)?;
        self.pid.store(process.pid(), Ordering::SeqCst);
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&process));
        self.set_state(ContainerState::Started);
        Ok(process)
    }

    /// Opens the relay and hands the helper to a reaper thread.
    fn activate(self: &Arc<Self>, process: &Arc<dyn IsolatedProcess>) -> Result<(), ManagerError> {
        let router = RewindRouter::new(
            self.id,
            Arc::clone(&self.caps.broker),
            Arc::clone(&self.caps.logger),
            Arc::clone(&self.caps.stats),
        );
        let relay = Relay::start(self.id, self.paths.relay(), router, self.config.forward_timeout)?;
        *self.relay.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(relay));
        self.set_state(ContainerState::Running);

        let container = Arc::clone(self);
        let process = Arc::clone(process);
        let reaper = thread::Builder::new()
            .name(format!("reaper-{}", self.id))
            .spawn(move || {
                let code = match process.wait() {
                    Ok(code) => code,
                    Err(e) => {
                        warn!(id = container.id, error = %e, "Failed to wait for helper");
                        -1
                    }
                };
                container.reap(code);
            })
            .map_err(|e| ManagerError::IoError {
                context: "failed to spawn reaper".to_string(),
                source: e,
            })?;
        *self.reaper.lock().unwrap_or_else(PoisonError::into_inner) = Some(reaper);
        Ok(())
    }

    fn pre_start_network(&self, args: &ContainerArgs) -> Result<(), NetworkError> {
        thread::scope(|scope| {
            let handles: Vec<_> = args
                .nics
                .iter()
                .enumerate()
                .filter(|(_, nic)| nic.state != NicState::Destroyed)
                .map(|(index, nic)| scope.spawn(move || self.network.pre_start(index, nic)))
                .collect();

            let mut first_error = None;
            for handle in handles {
                let outcome = handle.join().unwrap_or_else(|_| {
                    Err(NetworkError::Invalid("pre-start network step panicked".to_string()))
                });
                if let Err(e) = outcome {
                    warn!(id = self.id, error = %e, "Pre-start network failed");
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }

    fn launch_spec(&self, args: &ContainerArgs) -> Result<LaunchSpec, ManagerError> {
        let mut env = BTreeMap::from([
            (
                "PATH".to_string(),
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ),
            ("HOME".to_string(), "/".to_string()),
        ]);
        env.extend(args.env.clone());

        let mut helper_args = vec![
            "-hostname".to_string(),
            args.hostname.clone(),
        ];
        if !args.privileged {
            helper_args.push("-unprivileged".to_string());
        }

        Ok(LaunchSpec {
            id: self.id,
            root: self.sandbox.staging(),
            binds: self.sandbox.guest_binds(args, &self.config.helper_name)?,
            hostname: args.hostname.clone(),
            host_network: args.host_network,
            env,
            program: format!("/{}", self.config.helper_name),
            args: helper_args,
            relay_dir: self.paths.workdir.clone(),
        })
    }

    fn on_start(&self, args: &ContainerArgs, pid: u32) {
        let mut cgroups = args.cgroups.clone();
        if !args.privileged {
            let devices = CGroup::devices();
            if let Err(e) = self.caps.cgroups.get_or_create(&devices) {
                error!(id = self.id, cgroup = %devices, error = %e, "Failed to prepare cgroup");
            }
            cgroups.push(devices);
        }
        for cgroup in &cgroups {
            if let Err(e) = self.caps.cgroups.attach(cgroup, pid) {
                error!(id = self.id, %cgroup, error = %e, "Failed to attach cgroup");
            }
        }

        if args.host_network {
            return;
        }

        if let Err(e) = self.network.bind_netns(pid) {
            error!(id = self.id, error = %e, "Failed to bind network namespace");
            for (index, nic) in args.nics.iter().enumerate() {
                if nic.state != NicState::Destroyed {
                    self.set_nic_state(index, NicState::Error);
                }
            }
            return;
        }

        for (index, nic) in args.nics.iter().enumerate() {
            if nic.state == NicState::Destroyed {
                continue;
            }
            match self.network.post_start(index, nic) {
                Ok(()) => self.set_nic_state(index, NicState::Configured),
                Err(e) => {
                    error!(id = self.id, index, kind = %nic.kind, error = %e, "Post-start network failed");
                    self.set_nic_state(index, NicState::Error);
                }
            }
        }

        let default = args
            .nics
            .iter()
            .find(|nic| nic.kind == NicKind::Default && nic.state != NicState::Destroyed);
        for (host, guest) in &args.port {
            let Some(nic) = default else {
                warn!(id = self.id, host, "Port forward needs a default nic, skipped");
                continue;
            };
            let Ok(guest) = u16::try_from(*guest) else {
                continue;
            };
            if let Err(e) = self
                .caps
                .forwarder
                .add(self.id, self.network.default_ip(nic), host, guest)
            {
                error!(id = self.id, host, guest, error = %e, "Failed to add port forward");
            }
        }
    }

    /// Releases everything after a failed start.
    fn rollback(&self, args: &ContainerArgs) {
        warn!(id = self.id, "Rolling back container");
        self.terminating.store(true, Ordering::SeqCst);
        let relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(relay) = relay {
            relay.shutdown();
        }
        self.release(args);
        self.set_state(ContainerState::Reaped);
    }

    fn release(&self, args: &ContainerArgs) {
        if args.host_network {
            self.caps.forwarder.remove_all(self.id);
        } else {
            self.network.teardown(&args.nics);
        }

        if let Err(e) = self.sandbox.cleanup() {
            error!(id = self.id, error = %e, "Unmounting sandbox was not clean");
        }
        self.paths.relay().remove();
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release();
        if let Err(e) = self.paths.remove_workdir() {
            warn!(id = self.id, error = %e, "Failed to remove working directory");
        }
    }

    #[instrument(skip(self), fields(id = self.id))]
    fn reap(&self, code: i32) {
        self.terminating.store(true, Ordering::SeqCst);
        self.set_state(ContainerState::Exiting);
        info!(code, "Helper exited");

        let relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(relay) = relay {
            relay.shutdown();
        }

        let args = match self.arguments() {
            Ok(args) => args,
            Err(e) => {
                error!(error = %e, "Failed to load arguments for teardown");
                ContainerArgs::default()
            }
        };
        self.release(&args);

        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
        self.owner.reaped(self.id);
        self.set_state(ContainerState::Reaped);
    }

    /// Blocks until the container is reaped or `timeout` elapses.
    ///
    /// Returns whether the container was reaped.
    pub fn wait_reaped(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while *state != ContainerState::Reaped {
            match deadline {
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }

    fn signal(&self, signal: Signal) -> Result<(), ManagerError> {
        let process = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                ManagerError::PreconditionFailed("container was not started".to_string())
            })?;
        Ok(process.signal(signal)?)
    }

    /// Sends SIGTERM and waits up to `grace` for the container to be reaped,
    /// then SIGKILL and waits for good.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::PreconditionFailed` if the helper never started.
    #[instrument(skip(self), fields(id = self.id))]
    pub fn terminate(&self, grace: Duration) -> Result<(), ManagerError> {
        if self.state() == ContainerState::Reaped {
            return Ok(());
        }
        if self.pid() == 0 {
            return Err(ManagerError::PreconditionFailed(
                "container was not started".to_string(),
            ));
        }

        self.terminating.store(true, Ordering::SeqCst);
        if let Err(e) = self.signal(Signal::SIGTERM) {
            warn!(error = %e, "Failed to deliver SIGTERM");
        }
        if self.wait_reaped(Some(grace)) {
            return Ok(());
        }

        warn!(grace_ms = grace.as_millis(), "Helper ignored SIGTERM, killing");
        if let Err(e) = self.signal(Signal::SIGKILL) {
            warn!(error = %e, "Failed to deliver SIGKILL");
        }
        self.wait_reaped(None);
        Ok(())
    }

    /// Forwards `command` to the helper.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::PreconditionFailed` unless the container is
    /// running, or the relay's delivery error.
    pub fn dispatch(&self, command: &Command) -> Result<(), ManagerError> {
        let relay = self
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                ManagerError::PreconditionFailed(format!(
                    "container {} is {}",
                    self.id,
                    self.state()
                ))
            })?;
        relay.send(command)?;
        debug!(id = self.id, command = %command.command, correlation = %command.id, "Command dispatched");
        Ok(())
    }

    /// Stops (`SIGSTOP`) or resumes (`SIGCONT`) the helper's process group.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::PreconditionFailed` if the helper is not running.
    pub fn signal_group(&self, signal: Signal) -> Result<(), ManagerError> {
        let pid = i32::try_from(self.pid())
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| {
                ManagerError::PreconditionFailed("container is not fully started yet".to_string())
            })?;
        killpg(Pid::from_raw(pid), signal).map_err(|e| {
            ManagerError::Sandbox(SandboxError::Process(format!(
                "failed to send {signal} to group {pid}: {e}"
            )))
        })
    }

    /// Adds and attaches a NIC to the running container.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::InvalidArguments` for host-network containers or
    /// an invalid NIC set, or the attachment error (the NIC is then kept in
    /// `error` state).
    #[instrument(skip(self, nic), fields(id = self.id, kind = %nic.kind))]
    pub fn nic_add(&self, mut nic: Nic) -> Result<(), ManagerError> {
        nic.state = NicState::Unknown;
        let index = self.update_arguments(|args| {
            if args.host_network {
                return Err(ManagerError::InvalidArguments(
                    "cannot add a nic in host network mode".to_string(),
                ));
            }
            args.nics.push(nic.clone());
            if let Err(e) = args.validate_nics(&self.caps, &self.config.bridge_name) {
                args.nics.pop();
                return Err(e);
            }
            Ok(args.nics.len() - 1)
        })?;

        let attached = self
            .network
            .pre_start(index, &nic)
            .and_then(|()| self.network.post_start(index, &nic));
        match attached {
            Ok(()) => {
                self.set_nic_state(index, NicState::Configured);
                info!(index, "Nic added");
                Ok(())
            }
            Err(e) => {
                error!(index, error = %e, "Failed to attach nic");
                self.set_nic_state(index, NicState::Error);
                Err(e.into())
            }
        }
    }

    /// Detaches the NIC at `index`.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::NicNotFound` for a bad index,
    /// `ManagerError::PreconditionFailed` unless the NIC is `configured`, or
    /// the detach error (the NIC is then moved to `error`).
    #[instrument(skip(self), fields(id = self.id))]
    pub fn nic_remove(&self, index: usize) -> Result<(), ManagerError> {
        let args = self.arguments()?;
        let nic = args
            .nics
            .get(index)
            .ok_or(ManagerError::NicNotFound { index })?;
        if nic.state != NicState::Configured {
            return Err(ManagerError::PreconditionFailed(format!(
                "nic is in '{}' state",
                nic.state
            )));
        }

        match self.network.detach(index, nic) {
            Ok(()) => {
                self.set_nic_state(index, NicState::Destroyed);
                info!(index, "Nic removed");
                Ok(())
            }
            Err(e) => {
                self.set_nic_state(index, NicState::Error);
                Err(e.into())
            }
        }
    }

    fn default_nic(&self) -> Result<Nic, ManagerError> {
        self.arguments()?
            .nics
            .into_iter()
            .find(|nic| nic.kind == NicKind::Default && nic.state != NicState::Destroyed)
            .ok_or_else(|| {
                ManagerError::PreconditionFailed("Container doesn't have a default nic".to_string())
            })
    }

    /// Forwards host `host` to guest port `guest` on the default NIC.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::PreconditionFailed` without a default NIC,
    /// `ManagerError::InvalidArguments` for a bad host spec, or the
    /// forwarder's error.
    pub fn port_forward_add(&self, host: &str, guest: u16) -> Result<(), ManagerError> {
        let nic = self.default_nic()?;
        if !self.caps.forwarder.valid_host(host) {
            return Err(ManagerError::InvalidArguments(format!(
                "invalid host port '{host}'"
            )));
        }
        self.caps
            .forwarder
            .add(self.id, self.network.default_ip(&nic), host, guest)?;
        Ok(())
    }

    /// Removes a port forward.
    ///
    /// # Errors
    ///
    /// Returns the forwarder's error.
    pub fn port_forward_remove(&self, host: &str, guest: u16) -> Result<(), ManagerError> {
        self.caps.forwarder.remove(self.id, host, guest)?;
        Ok(())
    }

    /// Layers `source` read-only over the running root.
    ///
    /// # Errors
    ///
    /// Returns the filesystem collaborator's error.
    pub fn merge_layer(&self, source: &str) -> Result<(), ManagerError> {
        let args = self.arguments()?;
        self.caps.filesystem.merge_layer(
            &self.sandbox.namespace(),
            &args.storage,
            source,
            &self.paths.root,
        )?;
        info!(id = self.id, source, "Layer merged");
        Ok(())
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
