//! Typed collaborator interfaces consumed by the manager.
//!
//! Every external service the core depends on is expressed as a trait and
//! wired once into a [`Capabilities`] set when the manager is constructed.
//! [`Capabilities::host`] builds the set backed by the local machine; tests
//! swap individual handles for in-process fakes.

mod broker;
mod cgroup;
mod exec;
mod filesystem;
mod portforward;
mod sink;

pub use broker::{MemoryBroker, ResultBroker};
pub use cgroup::{CGroup, Cgroups, UnifiedCgroups};
pub use exec::{HostExec, SystemExec};
pub use filesystem::{Filesystem, LocalFilesystem, RESTIC_SCHEME, ResticRepo};
pub use portforward::{Forward, IptablesForwarder, PortForwarder};
pub use sink::{Aggregate, LogSink, MemoryStats, StatsAggregator, TracingLogSink};

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::sandbox::{HakoniwaLauncher, HostMounter, Launcher, Mounter};

/// Handles to every collaborator, cloned cheaply into each container.
#[derive(Clone)]
pub struct Capabilities {
    /// Root image and layer mounting.
    pub filesystem: Arc<dyn Filesystem>,
    /// Cgroup management.
    pub cgroups: Arc<dyn Cgroups>,
    /// Host port forwarding.
    pub forwarder: Arc<dyn PortForwarder>,
    /// Result correlation store.
    pub broker: Arc<dyn ResultBroker>,
    /// In-sandbox log lines.
    pub logger: Arc<dyn LogSink>,
    /// Metric samples.
    pub stats: Arc<dyn StatsAggregator>,
    /// Host tool invocation.
    pub exec: Arc<dyn HostExec>,
    /// Mount syscalls.
    pub mounter: Arc<dyn Mounter>,
    /// Isolated process spawning.
    pub launcher: Arc<dyn Launcher>,
}

impl Capabilities {
    /// Builds the capability set backed by the local host.
    #[must_use]
    pub fn host(config: &AgentConfig) -> Self {
        let exec: Arc<dyn HostExec> = Arc::new(SystemExec);
        let mounter: Arc<dyn Mounter> = Arc::new(HostMounter);
        Self {
            filesystem: Arc::new(LocalFilesystem::new(
                Arc::clone(&mounter),
                Arc::clone(&exec),
                config.backend_dir.join(".layers"),
            )),
            cgroups: Arc::new(UnifiedCgroups::new(&config.cgroup_root)),
            forwarder: Arc::new(IptablesForwarder::new(Arc::clone(&exec))),
            broker: Arc::new(MemoryBroker::with_ttl(config.result_ttl)),
            logger: Arc::new(TracingLogSink),
            stats: Arc::new(MemoryStats::new()),
            exec,
            mounter,
            launcher: Arc::new(HakoniwaLauncher::new()),
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}
