//! Container manager: the registry of live containers and every operation of
//! the command surface.
//!
//! # Example
//!
//! ```no_run
//! use nodecore::{AgentConfig, Manager};
//! use nodecore::capability::Capabilities;
//! use nodecore::container::{ContainerArgs, Nic, NicKind};
//!
//! let config = AgentConfig::default();
//! let caps = Capabilities::host(&config);
//! let manager = Manager::new(config, caps);
//!
//! let args = ContainerArgs {
//!     root: "file:///srv/images/base".to_string(),
//!     nics: vec![Nic::new(NicKind::Default, "")],
//!     ..ContainerArgs::default()
//! };
//! let id = manager.create(args).unwrap();
//! manager.terminate(id).unwrap();
//! ```

mod backup;
mod info;
mod sequence;

pub use backup::{META_FILE, snapshot_id};
pub use info::{ContainerDetails, ContainerInfo, ProcessStats, with_forwards};
pub use sequence::Sequence;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::capability::Capabilities;
use crate::config::AgentConfig;
use crate::container::{Container, ContainerArgs, ContainerOwner, Nic};
use crate::error::{ManagerError, NetworkError};
use crate::network::{SWITCH_TAG, SwitchAgent};
use crate::relay::{Command, JobResult, JobState};

struct ManagerInner {
    config: Arc<AgentConfig>,
    caps: Capabilities,
    registry: RwLock<HashMap<u16, Arc<Container>>>,
    /// Ids handed out whose container is still being constructed.
    reserved: Mutex<HashSet<u16>>,
    sequence: Sequence,
}

/// The node's container manager.
///
/// Cloning is cheap; every clone shares the same registry.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

/// Non-owning handle given to containers, used to reach sibling containers
/// and to unregister on reap.
struct ManagerHandle(Weak<ManagerInner>);

impl Manager {
    /// Creates a manager with an empty registry.
    #[must_use]
    pub fn new(config: AgentConfig, caps: Capabilities) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config: Arc::new(config),
                caps,
                registry: RwLock::new(HashMap::new()),
                reserved: Mutex::new(HashSet::new()),
                sequence: Sequence::new(),
            }),
        }
    }

    /// Agent configuration.
    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Collaborator handles.
    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.caps
    }

    /// Number of registered containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether no container is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a registered container.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::NotFound` if `id` is not registered.
    pub fn container(&self, id: u16) -> Result<Arc<Container>, ManagerError> {
        self.inner.container(id)
    }

    /// Validates `args`, allocates an id and starts the container.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::InvalidArguments` for invalid arguments,
    /// `ManagerError::LimitReached` at the container limit, or the error of
    /// the failing start step (everything is rolled back).
    #[instrument(skip(self, args), fields(root = %args.root))]
    pub fn create(&self, args: ContainerArgs) -> Result<u16, ManagerError> {
        self.spawn(&args).map(|container| container.id())
    }

    fn spawn(&self, args: &ContainerArgs) -> Result<Arc<Container>, ManagerError> {
        args.validate(&self.inner.caps, &self.inner.config.bridge_name)?;
        let container = self.register(args)?;
        let id = container.id();

        if let Err(e) = container.start() {
            warn!(id, error = %e.chain(), "Container failed to start");
            self.inner.unregister(id);
            return Err(e);
        }
        info!(id, "Container created");
        Ok(container)
    }

    fn register(&self, args: &ContainerArgs) -> Result<Arc<Container>, ManagerError> {
        let inner = &self.inner;
        let id = inner.reserve()?;

        let handle = Arc::new(ManagerHandle(Arc::downgrade(inner)));
        let container = match Container::new(
            id,
            Arc::clone(&inner.config),
            inner.caps.clone(),
            args,
            Arc::clone(&handle) as Arc<dyn ContainerOwner>,
            handle,
        ) {
            Ok(container) => container,
            Err(e) => {
                inner.cancel_reservation(id);
                return Err(e);
            }
        };

        let mut registry = inner.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.insert(id, Arc::clone(&container));
        inner.reserved().remove(&id);
        debug!(id, live = registry.len(), "Container registered");
        Ok(container)
    }

    /// Creates a container and blocks until it exits.
    ///
    /// # Errors
    ///
    /// See [`Manager::create`].
    pub fn create_sync(&self, args: ContainerArgs) -> Result<JobResult, ManagerError> {
        let started = chrono::Utc::now();
        let container = self.spawn(&args)?;
        let id = container.id();
        container.wait_reaped(None);

        let code = container.exit_code().unwrap_or(-1);
        let finished = chrono::Utc::now();
        Ok(JobResult {
            id: format!("core-{id}"),
            command: "corex.create-sync".to_string(),
            state: if code == 0 {
                JobState::Success
            } else {
                JobState::Error
            },
            code: u32::try_from(code).unwrap_or(u32::MAX),
            starttime: started.timestamp_millis(),
            time: (finished - started).num_milliseconds(),
            container: u64::from(id),
            ..JobResult::default()
        })
    }

    /// Forwards `command` to container `id` and returns its correlation id.
    ///
    /// A missing correlation id is generated.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::NotFound` for unknown ids, or the relay's error.
    pub fn dispatch(&self, id: u16, command: Command) -> Result<String, ManagerError> {
        self.inner.dispatch(id, command)
    }

    /// Dispatches `command` and waits for its result.
    ///
    /// # Errors
    ///
    /// See [`Manager::dispatch`]; also fails if no result arrives in time.
    pub fn dispatch_sync(&self, id: u16, command: Command) -> Result<JobResult, ManagerError> {
        self.inner.dispatch_sync(id, command)
    }

    /// Waits up to `timeout` for the result of a dispatched command and
    /// consumes it.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Capability` if no result arrives in time.
    pub fn result(&self, correlation: &str, timeout: Duration) -> Result<JobResult, ManagerError> {
        Ok(self.inner.caps.broker.get(correlation, timeout)?)
    }

    /// Stops container `id`, killing it after the grace period.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::NotFound` for unknown ids.
    #[instrument(skip(self))]
    pub fn terminate(&self, id: u16) -> Result<(), ManagerError> {
        let container = self.container(id)?;
        container.terminate(self.inner.config.terminate_grace)?;
        info!(id, "Container terminated");
        Ok(())
    }

    /// Attaches a new NIC to container `id`.
    ///
    /// # Errors
    ///
    /// See [`Container::nic_add`].
    pub fn nic_add(&self, id: u16, nic: Nic) -> Result<(), ManagerError> {
        self.container(id)?.nic_add(nic)
    }

    /// Detaches NIC `index` of container `id`.
    ///
    /// # Errors
    ///
    /// See [`Container::nic_remove`].
    pub fn nic_remove(&self, id: u16, index: usize) -> Result<(), ManagerError> {
        self.container(id)?.nic_remove(index)
    }

    /// Adds a port forward to container `id`.
    ///
    /// # Errors
    ///
    /// See [`Container::port_forward_add`].
    pub fn portforward_add(&self, id: u16, host: &str, guest: u16) -> Result<(), ManagerError> {
        self.container(id)?.port_forward_add(host, guest)
    }

    /// Removes a port forward of container `id`.
    ///
    /// # Errors
    ///
    /// See [`Container::port_forward_remove`].
    pub fn portforward_remove(&self, id: u16, host: &str, guest: u16) -> Result<(), ManagerError> {
        self.container(id)?.port_forward_remove(host, guest)
    }

    /// Summaries of every container carrying all of `tags`.
    #[must_use]
    pub fn find(&self, tags: &[String]) -> BTreeMap<u16, ContainerInfo> {
        let containers: Vec<Arc<Container>> = self.inner.read().values().cloned().collect();
        containers
            .into_iter()
            .filter_map(|container| {
                let id = container.id();
                let forwards = self.inner.caps.forwarder.list(id);
                match ContainerInfo::collect(&container, &forwards) {
                    Ok(info) if info.container.arguments.has_tags(tags) => Some((id, info)),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(id, error = %e, "Skipping container in listing");
                        None
                    }
                }
            })
            .collect()
    }

    /// Summaries of every container.
    #[must_use]
    pub fn list(&self) -> BTreeMap<u16, ContainerInfo> {
        self.find(&[])
    }

    /// Declared arguments of the container named or numbered by `query`.
    ///
    /// A string matches `name` case-insensitively, a number matches the id.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::InvalidArguments` for any other query or a
    /// number outside the id range.
    pub fn get(&self, query: &Value) -> Result<Option<ContainerArgs>, ManagerError> {
        let container = match query {
            Value::Number(number) => {
                let id = number
                    .as_u64()
                    .and_then(|id| u16::try_from(id).ok())
                    .ok_or_else(|| {
                        ManagerError::InvalidArguments(format!("invalid container id {number}"))
                    })?;
                self.inner.read().get(&id).cloned()
            }
            Value::String(name) => {
                let containers: Vec<Arc<Container>> =
                    self.inner.read().values().cloned().collect();
                containers.into_iter().find(|container| {
                    container
                        .arguments()
                        .is_ok_and(|args| args.name.eq_ignore_ascii_case(name))
                })
            }
            other => {
                return Err(ManagerError::InvalidArguments(format!(
                    "query must be a name or an id, got {other}"
                )));
            }
        };

        let Some(container) = container else {
            return Ok(None);
        };
        let forwards = self.inner.caps.forwarder.list(container.id());
        Ok(Some(with_forwards(container.arguments()?, &forwards)))
    }

    /// Backs up container `id` into the restic repository `url`.
    ///
    /// # Errors
    ///
    /// See [`backup::backup`].
    pub fn backup(&self, id: u16, url: &str, tags: &[String]) -> Result<String, ManagerError> {
        let container = self.container(id)?;
        backup::backup(
            &container,
            self.inner.caps.exec.as_ref(),
            &self.inner.config.helper_name,
            url,
            tags,
        )
    }

    /// Creates a container from the latest snapshot of `url`.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot cannot be read, or as [`Manager::create`].
    #[instrument(skip(self, url))]
    pub fn restore(&self, url: &str, tags: Option<Vec<String>>) -> Result<u16, ManagerError> {
        let scratch = self
            .inner
            .config
            .backend_dir
            .join(format!(".restore-{}", Uuid::new_v4()));
        let args = backup::restore_arguments(
            self.inner.caps.filesystem.as_ref(),
            &scratch,
            url,
            tags,
        )?;
        self.create(args)
    }

    /// Merges a read-only layer into container `id`.
    ///
    /// # Errors
    ///
    /// See [`Container::merge_layer`].
    pub fn merge_layer(&self, id: u16, source: &str) -> Result<(), ManagerError> {
        self.container(id)?.merge_layer(source)
    }

    /// Overlay daemon status of container `id`.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Network` if the daemon is not running.
    pub fn overlay_info(&self, id: u16) -> Result<Value, ManagerError> {
        Ok(self.container(id)?.network().overlay().info()?)
    }

    /// Overlay networks joined by container `id`.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Network` if the daemon is not running.
    pub fn overlay_list(&self, id: u16) -> Result<Value, ManagerError> {
        Ok(self.container(id)?.network().overlay().list()?)
    }

    /// Terminates every container.
    pub fn shutdown(&self) {
        let ids: Vec<u16> = self.inner.read().keys().copied().collect();
        info!(count = ids.len(), "Terminating all containers");
        for id in ids {
            if let Err(e) = self.terminate(id) {
                warn!(id, error = %e.chain(), "Failed to terminate container");
            }
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("containers", &self.len())
            .finish_non_exhaustive()
    }
}

impl ManagerInner {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u16, Arc<Container>>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn container(&self, id: u16) -> Result<Arc<Container>, ManagerError> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or(ManagerError::NotFound { id })
    }

    fn reserved(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a free id and holds it until the container is inserted.
    fn reserve(&self) -> Result<u16, ManagerError> {
        let registry = self.read();
        let mut reserved = self.reserved();
        let live = registry.len() + reserved.len();
        if live >= self.config.max_containers {
            return Err(ManagerError::LimitReached {
                limit: self.config.max_containers,
            });
        }
        let id = self
            .sequence
            .next(|id| registry.contains_key(&id) || reserved.contains(&id))
            .ok_or(ManagerError::LimitReached { limit: live })?;
        reserved.insert(id);
        Ok(id)
    }

    fn cancel_reservation(&self, id: u16) {
        if self.reserved().remove(&id) {
            self.sequence.release(id);
        }
    }

    fn unregister(&self, id: u16) {
        let removed = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            self.sequence.release(id);
            debug!(id, "Container unregistered");
        }
    }

    fn dispatch(&self, id: u16, mut command: Command) -> Result<String, ManagerError> {
        let container = self.container(id)?;
        if command.id.is_empty() {
            command.id = Uuid::new_v4().to_string();
        }
        self.caps.broker.flag(&command.id);
        if let Err(e) = container.dispatch(&command) {
            self.caps.broker.unflag(&command.id);
            return Err(e);
        }
        Ok(command.id)
    }

    fn dispatch_sync(&self, id: u16, command: Command) -> Result<JobResult, ManagerError> {
        let correlation = self.dispatch(id, command)?;
        Ok(self
            .caps
            .broker
            .get(&correlation, self.config.result_timeout)?)
    }

    /// Id of the running switch agent container.
    fn switch_agent(&self) -> Option<u16> {
        let containers: Vec<Arc<Container>> = self.read().values().cloned().collect();
        containers
            .into_iter()
            .filter(|container| !container.is_terminating())
            .find(|container| {
                container
                    .arguments()
                    .is_ok_and(|args| args.tags.iter().any(|tag| tag == SWITCH_TAG))
            })
            .map(|container| container.id())
    }
}

impl ContainerOwner for ManagerHandle {
    fn reaped(&self, id: u16) {
        if let Some(inner) = self.0.upgrade() {
            inner.unregister(id);
        }
    }
}

impl SwitchAgent for ManagerHandle {
    fn available(&self) -> bool {
        self.0
            .upgrade()
            .is_some_and(|inner| inner.switch_agent().is_some())
    }

    fn call(&self, command: &str, arguments: Value) -> Result<JobResult, NetworkError> {
        let inner = self
            .0
            .upgrade()
            .ok_or_else(|| NetworkError::Dispatch("manager is gone".to_string()))?;
        let id = inner.switch_agent().ok_or_else(|| {
            NetworkError::Precondition(format!("{SWITCH_TAG} container is not running"))
        })?;
        inner
            .dispatch_sync(id, Command::new(command).with_arguments(arguments))
            .map_err(|e| NetworkError::Dispatch(e.chain()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path, limit: usize) -> Manager {
        let config = AgentConfig::default()
            .with_backend_dir(dir.join("backend"))
            .with_root_dir(dir.join("roots"))
            .with_max_containers(limit);
        let caps = Capabilities::host(&config);
        Manager::new(config, caps)
    }

    #[test]
    fn test_reserved_ids_count_but_stay_invisible() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager(dir.path(), 2);
        let inner = &manager.inner;

        assert_eq!(inner.reserve().expect("first"), 1);
        assert_eq!(inner.reserve().expect("second"), 2);
        assert!(manager.is_empty());
        assert!(manager.list().is_empty());
        assert!(matches!(
            manager.container(1),
            Err(ManagerError::NotFound { id: 1 })
        ));
        assert!(matches!(
            inner.reserve(),
            Err(ManagerError::LimitReached { limit: 2 })
        ));

        inner.cancel_reservation(1);
        assert_eq!(inner.reserve().expect("reused"), 1);
    }
}
