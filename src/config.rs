//! Agent-wide configuration.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the node agent.
///
/// Use the builder methods to customize where containers live and how long
/// blocking operations may take.
///
/// # Example
///
/// ```
/// use nodecore::AgentConfig;
/// use std::time::Duration;
///
/// let config = AgentConfig::default()
///     .with_backend_dir("/tmp/nodecore/backend")
///     .with_root_dir("/tmp/nodecore/roots")
///     .with_max_containers(16)
///     .with_terminate_grace(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Per-container working directories (config file, relay FIFOs, overlay home).
    pub backend_dir: PathBuf,

    /// Per-container root directories.
    pub root_dir: PathBuf,

    /// Where network namespaces are bound for `ip netns exec`.
    pub netns_dir: PathBuf,

    /// Root of the cgroup hierarchy.
    pub cgroup_root: PathBuf,

    /// Host path of the in-sandbox helper binary.
    pub helper_path: PathBuf,

    /// Placeholder file name of the helper inside the root.
    pub helper_name: String,

    /// Maximum number of registered containers.
    pub max_containers: usize,

    /// Time between SIGTERM and SIGKILL on terminate.
    pub terminate_grace: Duration,

    /// How long a forwarded command may wait for the helper to open its input.
    pub forward_timeout: Duration,

    /// How long synchronous dispatches wait for a result.
    pub result_timeout: Duration,

    /// How long an unclaimed result is kept.
    pub result_ttl: Duration,

    /// How long the overlay daemon may take to answer.
    pub overlay_timeout: Duration,

    /// Name of the default NAT bridge.
    pub bridge_name: String,

    /// Address of the default bridge.
    pub bridge_ip: Ipv4Addr,

    /// Prefix length of the default bridge network.
    pub bridge_prefix: u8,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend_dir: PathBuf::from("/var/cache/containers"),
            root_dir: PathBuf::from("/mnt/containers"),
            netns_dir: PathBuf::from("/run/netns"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            helper_path: PathBuf::from("/usr/sbin/corex"),
            helper_name: String::from("coreX"),
            max_containers: 1000,
            terminate_grace: Duration::from_secs(5),
            forward_timeout: Duration::from_secs(10),
            result_timeout: Duration::from_secs(300),
            result_ttl: Duration::from_secs(3600),
            overlay_timeout: Duration::from_secs(120),
            bridge_name: String::from("core0"),
            bridge_ip: Ipv4Addr::new(172, 18, 0, 1),
            bridge_prefix: 16,
        }
    }
}

impl AgentConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the backend directory.
    #[must_use]
    pub fn with_backend_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.backend_dir = path.into();
        self
    }

    /// Sets the root base directory.
    #[must_use]
    pub fn with_root_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_dir = path.into();
        self
    }

    /// Sets the network namespace binding directory.
    #[must_use]
    pub fn with_netns_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.netns_dir = path.into();
        self
    }

    /// Sets the cgroup hierarchy root.
    #[must_use]
    pub fn with_cgroup_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.cgroup_root = path.into();
        self
    }

    /// Sets the helper binary path.
    #[must_use]
    pub fn with_helper_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.helper_path = path.into();
        self
    }

    /// Sets the container hard limit.
    #[must_use]
    pub fn with_max_containers(mut self, max: usize) -> Self {
        self.max_containers = max;
        self
    }

    /// Sets the terminate grace period.
    #[must_use]
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Sets the forward delivery timeout.
    #[must_use]
    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    /// Sets the synchronous result timeout.
    #[must_use]
    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    /// Sets how long unclaimed results are kept.
    #[must_use]
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Sets the overlay daemon timeout.
    #[must_use]
    pub fn with_overlay_timeout(mut self, timeout: Duration) -> Self {
        self.overlay_timeout = timeout;
        self
    }

    /// Sets the default bridge name.
    #[must_use]
    pub fn with_bridge_name(mut self, name: impl Into<String>) -> Self {
        self.bridge_name = name.into();
        self
    }

    /// Backend directory of one container.
    #[must_use]
    pub fn container_backend(&self, id: u16) -> PathBuf {
        self.backend_dir.join(id.to_string())
    }

    /// Root directory of one container.
    #[must_use]
    pub fn container_root(&self, id: u16) -> PathBuf {
        self.root_dir.join(id.to_string())
    }

    /// Namespace binding path of one container.
    #[must_use]
    pub fn netns_path(&self, id: u16) -> PathBuf {
        self.netns_dir.join(id.to_string())
    }

    /// Default bridge address in CIDR notation.
    #[must_use]
    pub fn bridge_cidr(&self) -> String {
        format!("{}/{}", self.bridge_ip, self.bridge_prefix)
    }

    /// Static address assigned to the default NIC of container `id`.
    #[must_use]
    pub fn default_nic_cidr(&self, id: u16) -> String {
        let host = u32::from(id) + 1;
        let [a, b, _, _] = self.bridge_ip.octets();
        format!(
            "{a}.{b}.{}.{}/{}",
            (host >> 8) & 0xff,
            host & 0xff,
            self.bridge_prefix
        )
    }

    /// Whether `path` is the helper placeholder inside `root`.
    #[must_use]
    pub fn is_helper(&self, root: &Path, path: &Path) -> bool {
        path == root.join(&self.helper_name)
    }
}
