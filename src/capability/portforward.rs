//! Port-forwarding collaborator.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::HostExec;
use crate::error::CapabilityError;

/// One active forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forward {
    /// Host side: `port` or `address:port`.
    pub host: String,
    /// Guest port.
    pub guest: u16,
    /// Guest address.
    pub ip: Ipv4Addr,
}

/// Forwards host ports into containers.
pub trait PortForwarder: Send + Sync {
    /// Whether `host` is an acceptable host spec (`port` or `address:port`).
    fn valid_host(&self, host: &str) -> bool;

    /// Forwards `host` to `ip:guest` on behalf of container `owner`.
    ///
    /// # Errors
    ///
    /// Fails if the host spec is taken or the rule cannot be installed.
    fn add(&self, owner: u16, ip: Ipv4Addr, host: &str, guest: u16) -> Result<(), CapabilityError>;

    /// Removes one forward of `owner`.
    ///
    /// # Errors
    ///
    /// Fails if no such forward exists or the rule cannot be removed.
    fn remove(&self, owner: u16, host: &str, guest: u16) -> Result<(), CapabilityError>;

    /// Removes every forward of `owner`.
    fn remove_all(&self, owner: u16);

    /// Active forwards of `owner`.
    fn list(&self, owner: u16) -> Vec<Forward>;
}

/// Splits a host spec into optional address and port.
fn parse_host(host: &str) -> Option<(Option<&str>, u16)> {
    let (addr, port) = match host.rsplit_once(':') {
        Some((addr, port)) if !addr.is_empty() => (Some(addr), port),
        Some(_) => return None,
        None => (None, host),
    };
    match port.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some((addr, port)),
    }
}

/// [`PortForwarder`] installing DNAT rules with `iptables`.
pub struct IptablesForwarder {
    exec: Arc<dyn HostExec>,
    forwards: Mutex<HashMap<u16, Vec<Forward>>>,
}

impl IptablesForwarder {
    /// Creates a forwarder running rules through `exec`.
    #[must_use]
    pub fn new(exec: Arc<dyn HostExec>) -> Self {
        Self {
            exec,
            forwards: Mutex::new(HashMap::new()),
        }
    }

    fn rule(action: &str, owner: u16, forward: &Forward) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            "nat".to_string(),
            action.to_string(),
            "PREROUTING".to_string(),
            "-p".to_string(),
            "tcp".to_string(),
        ];
        // specs were validated on add
        if let Some((addr, port)) = parse_host(&forward.host) {
            if let Some(addr) = addr {
                args.extend(["-d".to_string(), addr.to_string()]);
            }
            args.extend(["--dport".to_string(), port.to_string()]);
        }
        args.extend([
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            format!("core-{owner}"),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{}:{}", forward.ip, forward.guest),
        ]);
        args
    }

    fn apply(&self, action: &str, owner: u16, forward: &Forward) -> Result<(), CapabilityError> {
        let args = Self::rule(action, owner, forward);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.exec.run("iptables", &args, None).map(|_| ())
    }
}

impl PortForwarder for IptablesForwarder {
    fn valid_host(&self, host: &str) -> bool {
        parse_host(host).is_some()
    }

    #[instrument(skip(self))]
    fn add(&self, owner: u16, ip: Ipv4Addr, host: &str, guest: u16) -> Result<(), CapabilityError> {
        if !self.valid_host(host) {
            return Err(CapabilityError::Failed {
                capability: "portforward",
                reason: format!("invalid host port '{host}'"),
            });
        }

        let mut forwards = self.forwards.lock().unwrap_or_else(PoisonError::into_inner);
        if forwards.values().flatten().any(|f| f.host == host) {
            return Err(CapabilityError::Failed {
                capability: "portforward",
                reason: format!("host port '{host}' is already forwarded"),
            });
        }

        let forward = Forward {
            host: host.to_string(),
            guest,
            ip,
        };
        self.apply("-A", owner, &forward)?;
        debug!("Port forward installed");
        forwards.entry(owner).or_default().push(forward);
        Ok(())
    }

    #[instrument(skip(self))]
    fn remove(&self, owner: u16, host: &str, guest: u16) -> Result<(), CapabilityError> {
        let mut forwards = self.forwards.lock().unwrap_or_else(PoisonError::into_inner);
        let owned = forwards.entry(owner).or_default();
        let Some(pos) = owned.iter().position(|f| f.host == host && f.guest == guest) else {
            return Err(CapabilityError::Failed {
                capability: "portforward",
                reason: format!("no forward {host} -> {guest} for container {owner}"),
            });
        };
        self.apply("-D", owner, &owned[pos])?;
        owned.remove(pos);
        Ok(())
    }

    fn remove_all(&self, owner: u16) {
        let removed = self
            .forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&owner)
            .unwrap_or_default();
        for forward in &removed {
            if let Err(e) = self.apply("-D", owner, forward) {
                warn!(owner, host = %forward.host, error = %e, "Failed to remove port forward");
            }
        }
    }

    fn list(&self, owner: u16) -> Vec<Forward> {
        self.forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&owner)
            .cloned()
            .unwrap_or_default()
    }
}
