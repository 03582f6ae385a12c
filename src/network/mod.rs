//! Network attachment of containers.
//!
//! Each NIC goes through two phases:
//!
//! - **pre-start**, before the helper exists: host-side links are created and
//!   plugged into their bridge (or the switch agent's segment bridge)
//! - **post-start**, once the helper's pid is known: the sandbox end is moved
//!   into the container's network namespace, renamed and configured
//!
//! Teardown reverses attachment per NIC, stops the overlay daemon and unbinds
//! the namespace.

mod link;
mod overlay;
mod switch;

pub use link::{attach_to_bridge, create_veth, delete_link, link_exists, link_kind, netns_run};
pub use overlay::{OverlayDaemon, public_identity};
pub use switch::{
    MAX_VLAN, SWITCH_TAG, SwitchAgent, VLAN_MASTER, VXLAN_MASTER, ensure_segment, port_add,
    port_del, segment_id,
};

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, instrument, warn};

use crate::capability::{Capabilities, HostExec, PortForwarder};
use crate::config::AgentConfig;
use crate::container::{NetworkConfig, Nic, NicKind, NicState};
use crate::error::{MountError, NetworkError};
use crate::sandbox::{Mounter, guest_path};

/// DHCP client hook script.
const UDHCP_SCRIPT: &str = "/usr/share/udhcp/simple.script";

/// Metric of default routes added for NIC gateways.
const GATEWAY_METRIC: &str = "1000";

/// Host-side link name of NIC `index` of container `id`.
#[must_use]
pub fn host_link(id: u16, index: usize) -> String {
    format!("cont{id}-{index}")
}

/// Sandbox-side link name, before it is moved and renamed.
#[must_use]
pub fn peer_link(id: u16, index: usize) -> String {
    format!("{}p", host_link(id, index))
}

/// Attaches and detaches the NICs of one container.
pub struct NetworkAttacher {
    id: u16,
    netns: String,
    netns_path: PathBuf,
    root: PathBuf,
    bridge_name: String,
    bridge_ip: Ipv4Addr,
    default_cidr: String,
    exec: Arc<dyn HostExec>,
    mounter: Arc<dyn Mounter>,
    forwarder: Arc<dyn PortForwarder>,
    switch: Arc<dyn SwitchAgent>,
    overlay: OverlayDaemon,
    bound: AtomicBool,
}

impl NetworkAttacher {
    /// Creates the attacher for container `id` rooted at `root`.
    #[must_use]
    pub fn new(
        id: u16,
        config: &AgentConfig,
        caps: &Capabilities,
        switch: Arc<dyn SwitchAgent>,
        root: impl Into<PathBuf>,
        overlay: OverlayDaemon,
    ) -> Self {
        Self {
            id,
            netns: id.to_string(),
            netns_path: config.netns_path(id),
            root: root.into(),
            bridge_name: config.bridge_name.clone(),
            bridge_ip: config.bridge_ip,
            default_cidr: config.default_nic_cidr(id),
            exec: Arc::clone(&caps.exec),
            mounter: Arc::clone(&caps.mounter),
            forwarder: Arc::clone(&caps.forwarder),
            switch,
            overlay,
            bound: AtomicBool::new(false),
        }
    }

    /// The container's overlay daemon.
    #[must_use]
    pub fn overlay(&self) -> &OverlayDaemon {
        &self.overlay
    }

    /// Address port forwards target on the default `nic`: its declared
    /// address, or the static scheme address.
    #[must_use]
    pub fn default_ip(&self, nic: &Nic) -> Ipv4Addr {
        let config = self.effective_config(nic);
        [config.cidr.as_str(), self.default_cidr.as_str()]
            .into_iter()
            .find_map(|cidr| cidr.split('/').next().and_then(|ip| ip.parse().ok()))
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    /// Address configuration applied to `nic`; a default NIC without
    /// explicit addressing gets the agent's static scheme.
    #[must_use]
    pub fn effective_config(&self, nic: &Nic) -> NetworkConfig {
        let config = nic.config.clone();
        if nic.kind != NicKind::Default || config.dhcp || !config.cidr.is_empty() {
            return config;
        }
        let gateway = self.bridge_ip.to_string();
        NetworkConfig {
            dhcp: false,
            cidr: self.default_cidr.clone(),
            dns: vec![gateway.clone()],
            gateway,
        }
    }

    /// Host-side phase of `nic` at position `index`.
    ///
    /// # Errors
    ///
    /// Returns the first failing step; the caller rolls the container back.
    #[instrument(skip(self, nic), fields(id = self.id, index, kind = %nic.kind))]
    pub fn pre_start(&self, index: usize, nic: &Nic) -> Result<(), NetworkError> {
        let exec = self.exec.as_ref();
        let host = host_link(self.id, index);
        let peer = peer_link(self.id, index);

        match nic.kind {
            NicKind::Default => {
                create_veth(exec, &host, &peer, &nic.hw_address)?;
                attach_to_bridge(exec, &host, &self.bridge_name)?;
            }
            NicKind::Bridge => {
                if link_kind(exec, &nic.id).as_deref() != Some("bridge") {
                    return Err(NetworkError::Invalid(format!(
                        "bridge '{}' does not exist",
                        nic.id
                    )));
                }
                create_veth(exec, &host, &peer, &nic.hw_address)?;
                attach_to_bridge(exec, &host, &nic.id)?;
            }
            NicKind::Passthrough | NicKind::Macvlan => {
                exec.run(
                    "ip",
                    &[
                        "link", "add", "link", &nic.id, "name", &peer, "type", "macvlan", "mode",
                        "bridge",
                    ],
                    None,
                )?;
                if !nic.hw_address.is_empty() {
                    exec.run("ip", &["link", "set", &peer, "address", &nic.hw_address], None)?;
                }
            }
            NicKind::Vlan | NicKind::Vxlan => {
                let bridge = ensure_segment(self.switch.as_ref(), nic.kind, &nic.id)?;
                create_veth(exec, &host, &peer, &nic.hw_address)?;
                port_add(self.switch.as_ref(), nic.kind, &bridge, &host)?;
                exec.run("ip", &["link", "set", &host, "up"], None)?;
            }
            NicKind::Zerotier => {}
        }

        debug!("Pre-start network done");
        Ok(())
    }

    /// Binds the helper's network namespace to the netns directory so
    /// `ip netns exec <id>` can target it, and brings loopback up.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Netns` if the bind fails.
    #[instrument(skip(self), fields(id = self.id))]
    pub fn bind_netns(&self, pid: u32) -> Result<(), NetworkError> {
        if let Some(dir) = self.netns_path.parent() {
            fs::create_dir_all(dir).map_err(|e| NetworkError::IoError {
                context: format!("failed to create {}", dir.display()),
                source: e,
            })?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.netns_path)
            .map_err(|e| {
                NetworkError::Netns(MountError::Target {
                    path: self.netns_path.clone(),
                    source: e,
                })
            })?;

        let source = PathBuf::from(format!("/proc/{pid}/ns/net"));
        self.mounter.bind(&source, &self.netns_path, false)?;
        self.bound.store(true, Ordering::SeqCst);

        netns_run(self.exec.as_ref(), &self.netns, "ip", &["link", "set", "lo", "up"])?;
        Ok(())
    }

    /// Namespace phase of `nic` at position `index`.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    #[instrument(skip(self, nic), fields(id = self.id, index, kind = %nic.kind))]
    pub fn post_start(&self, index: usize, nic: &Nic) -> Result<(), NetworkError> {
        if nic.kind == NicKind::Zerotier {
            self.overlay.ensure_started()?;
            return self.overlay.join(&nic.id);
        }

        let exec = self.exec.as_ref();
        let peer = peer_link(self.id, index);
        let dev = nic.device_name(index);

        exec.run("ip", &["link", "set", &peer, "netns", &self.netns], None)?;
        netns_run(exec, &self.netns, "ip", &["link", "set", &peer, "name", &dev])?;
        netns_run(exec, &self.netns, "ip", &["link", "set", &dev, "up"])?;

        let config = self.effective_config(nic);
        if config.dhcp {
            netns_run(
                exec,
                &self.netns,
                "udhcpc",
                &["-q", "-i", &dev, "-s", UDHCP_SCRIPT],
            )?;
        } else if !config.cidr.is_empty() {
            netns_run(exec, &self.netns, "ip", &["address", "add", &config.cidr, "dev", &dev])?;
        }

        if !config.gateway.is_empty() {
            netns_run(
                exec,
                &self.netns,
                "ip",
                &[
                    "route", "add", "metric", GATEWAY_METRIC, "default", "via", &config.gateway,
                    "dev", &dev,
                ],
            )?;
        }

        if !config.dns.is_empty() {
            self.append_dns(&config.dns)?;
        }

        debug!(dev, "Post-start network done");
        Ok(())
    }

    fn append_dns(&self, servers: &[String]) -> Result<(), NetworkError> {
        let path = guest_path(&self.root, "/etc/resolv.conf")
            .ok_or_else(|| NetworkError::Invalid("resolv.conf escapes the root".to_string()))?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| NetworkError::IoError {
                context: format!("failed to create {}", dir.display()),
                source: e,
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| NetworkError::IoError {
                context: format!("failed to open {}", path.display()),
                source: e,
            })?;
        for server in servers {
            writeln!(file, "nameserver {server}").map_err(|e| NetworkError::IoError {
                context: format!("failed to write {}", path.display()),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Detaches `nic` at position `index`.
    ///
    /// # Errors
    ///
    /// Returns the first failing step.
    #[instrument(skip(self, nic), fields(id = self.id, index, kind = %nic.kind))]
    pub fn detach(&self, index: usize, nic: &Nic) -> Result<(), NetworkError> {
        let exec = self.exec.as_ref();
        let host = host_link(self.id, index);

        match nic.kind {
            NicKind::Zerotier => self.overlay.leave(&nic.id)?,
            NicKind::Passthrough | NicKind::Macvlan => {
                netns_run(exec, &self.netns, "ip", &["link", "del", &nic.device_name(index)])?;
            }
            NicKind::Vlan | NicKind::Vxlan => {
                port_del(self.switch.as_ref(), nic.kind, &host)?;
                if link_exists(exec, &host) {
                    delete_link(exec, &host)?;
                }
            }
            NicKind::Default | NicKind::Bridge => {
                if nic.kind == NicKind::Default {
                    self.forwarder.remove_all(self.id);
                }
                if link_exists(exec, &host) {
                    delete_link(exec, &host)?;
                }
            }
        }
        Ok(())
    }

    /// Releases every network resource of a container whose helper is gone.
    ///
    /// Failures are logged; teardown always runs to the end.
    #[instrument(skip(self, nics), fields(id = self.id))]
    pub fn teardown(&self, nics: &[Nic]) {
        for (index, nic) in nics.iter().enumerate() {
            if nic.state == NicState::Destroyed {
                continue;
            }
            let host = host_link(self.id, index);
            let result = match nic.kind {
                NicKind::Vlan | NicKind::Vxlan if self.switch.available() => {
                    port_del(self.switch.as_ref(), nic.kind, &host)
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(index, error = %e, "Failed to detach nic");
            }

            // links moved into the namespace died with it; a failed start
            // leaves them on the host
            for link in [host, peer_link(self.id, index)] {
                if nic.kind == NicKind::Zerotier || !link_exists(self.exec.as_ref(), &link) {
                    continue;
                }
                if let Err(e) = delete_link(self.exec.as_ref(), &link) {
                    warn!(index, %link, error = %e, "Failed to delete link");
                }
            }
        }

        self.forwarder.remove_all(self.id);
        self.overlay.stop();
        self.unbind_netns();
    }

    fn unbind_netns(&self) {
        if !self.bound.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.mounter.unmount(&self.netns_path) {
            warn!(path = %self.netns_path.display(), error = %e, "Failed to unbind namespace");
        }
        if let Err(e) = fs::remove_file(&self.netns_path) {
            debug!(path = %self.netns_path.display(), error = %e, "Namespace path already gone");
        }
    }

    /// Path the namespace is bound to.
    #[must_use]
    pub fn netns_path(&self) -> &Path {
        &self.netns_path
    }
}

impl std::fmt::Debug for NetworkAttacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkAttacher")
            .field("id", &self.id)
            .field("netns", &self.netns)
            .finish_non_exhaustive()
    }
}

/// Creates, addresses and brings up the default bridge if it is missing.
///
/// # Errors
///
/// Returns the failing `ip` invocation.
#[instrument(skip(exec, config), fields(bridge = %config.bridge_name))]
pub fn ensure_default_bridge(exec: &dyn HostExec, config: &AgentConfig) -> Result<(), NetworkError> {
    let bridge = config.bridge_name.as_str();
    if link_exists(exec, bridge) {
        debug!("Default bridge present");
        return Ok(());
    }
    exec.run("ip", &["link", "add", bridge, "type", "bridge"], None)?;
    exec.run("ip", &["address", "add", &config.bridge_cidr(), "dev", bridge], None)?;
    exec.run("ip", &["link", "set", bridge, "up"], None)?;

    let network = format!("{}/{}", config.bridge_ip, config.bridge_prefix);
    exec.run(
        "iptables",
        &[
            "-t", "nat", "-A", "POSTROUTING", "-s", &network, "!", "-o", bridge, "-j",
            "MASQUERADE",
        ],
        None,
    )?;
    debug!("Default bridge created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_names() {
        assert_eq!(host_link(7, 0), "cont7-0");
        assert_eq!(peer_link(7, 2), "cont7-2p");
        assert!(peer_link(u16::MAX, 99).len() <= crate::container::MAX_NIC_NAME);
    }
}
