//! Declared container arguments and their validation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capability::{CGroup, Capabilities};
use crate::error::ManagerError;
use crate::network::link_kind;

/// Longest interface name Linux accepts.
pub const MAX_NIC_NAME: usize = 15;

/// Host interface name prefixes reserved for the agent and the overlay daemon.
const RESERVED_PREFIXES: &[&str] = &["eth", "zt"];

/// Names Linux refuses for interfaces.
const RESERVED_NAMES: &[&str] = &["default"];

/// Network attachment strategy of a NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NicKind {
    /// The agent's NAT bridge.
    Default,
    /// A named bridge.
    Bridge,
    /// A physical or dummy link, shared through macvlan.
    Passthrough,
    /// Same as passthrough.
    Macvlan,
    /// A VLAN segment on the switch agent's backplane.
    Vlan,
    /// A VXLAN segment on the switch agent's backend.
    Vxlan,
    /// An identity-overlay network.
    Zerotier,
}

impl NicKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Bridge => "bridge",
            Self::Passthrough => "passthrough",
            Self::Macvlan => "macvlan",
            Self::Vlan => "vlan",
            Self::Vxlan => "vxlan",
            Self::Zerotier => "zerotier",
        }
    }
}

impl fmt::Display for NicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NicKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "bridge" => Ok(Self::Bridge),
            "passthrough" => Ok(Self::Passthrough),
            "macvlan" => Ok(Self::Macvlan),
            "vlan" => Ok(Self::Vlan),
            "vxlan" => Ok(Self::Vxlan),
            "zerotier" => Ok(Self::Zerotier),
            other => Err(format!("unsupported network type '{other}'")),
        }
    }
}

impl TryFrom<String> for NicKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NicKind> for String {
    fn from(kind: NicKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Attachment state of a NIC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicState {
    /// Declared, not yet attached.
    #[default]
    Unknown,
    /// Attached.
    Configured,
    /// Explicitly detached.
    Destroyed,
    /// Attachment or detachment failed.
    Error,
}

impl fmt::Display for NicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Configured => write!(f, "configured"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Address configuration of a NIC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Obtain an address with a DHCP client.
    pub dhcp: bool,
    /// Static address in CIDR notation.
    pub cidr: String,
    /// Default gateway.
    pub gateway: String,
    /// Name servers appended to the container's resolv.conf.
    pub dns: Vec<String>,
}

/// One declared network attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    /// Strategy.
    #[serde(rename = "type")]
    pub kind: NicKind,
    /// Bridge name, link name, segment id or overlay network id.
    #[serde(default)]
    pub id: String,
    /// Fixed hardware address.
    #[serde(default, rename = "hwaddr")]
    pub hw_address: String,
    /// Interface name inside the container, `eth<index>` when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Address configuration.
    #[serde(default)]
    pub config: NetworkConfig,
    /// Collect traffic statistics.
    #[serde(default)]
    pub monitor: bool,
    /// Attachment state.
    #[serde(default)]
    pub state: NicState,
}

impl Nic {
    /// A NIC of `kind` on `id` with everything else defaulted.
    #[must_use]
    pub fn new(kind: NicKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            hw_address: String::new(),
            name: String::new(),
            config: NetworkConfig::default(),
            monitor: false,
            state: NicState::Unknown,
        }
    }

    /// Interface name inside the container for position `index`.
    #[must_use]
    pub fn device_name(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("eth{index}")
        } else {
            self.name.clone()
        }
    }
}

/// Declared arguments of a container, persisted in its config store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerArgs {
    /// Root image reference.
    pub root: String,
    /// Bind mounts, host source to guest path.
    pub mount: BTreeMap<String, String>,
    /// Share the host network stack.
    pub host_network: bool,
    /// Identity-overlay identity.
    pub identity: String,
    /// Network attachments, ignored with `host_network`.
    pub nics: Vec<Nic>,
    /// Port forwards, host spec to guest port.
    pub port: BTreeMap<String, u32>,
    /// Skip the device cgroup restriction.
    pub privileged: bool,
    /// Hostname inside the UTS namespace.
    pub hostname: String,
    /// Storage backend reference for image mounts.
    pub storage: String,
    /// Name used by lookups.
    pub name: String,
    /// Tags used by find.
    pub tags: Vec<String>,
    /// Environment of the helper.
    pub env: BTreeMap<String, String>,
    /// Cgroups to join.
    pub cgroups: Vec<CGroup>,
    /// Files written into the root, guest path to content.
    pub config: BTreeMap<String, String>,
}

/// Whether a mount source names an image rather than a host path.
#[must_use]
pub fn has_scheme(source: &str) -> bool {
    match source.split_once(':') {
        Some((scheme, _)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        }
        None => false,
    }
}

fn invalid(message: impl Into<String>) -> ManagerError {
    ManagerError::InvalidArguments(message.into())
}

impl ContainerArgs {
    /// Whether the container carries every tag in `tags`.
    #[must_use]
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|tag| self.tags.contains(tag))
    }

    /// Validates the arguments against the host.
    ///
    /// `default_bridge` is the name of the agent's NAT bridge.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::InvalidArguments` describing the first violation.
    pub fn validate(&self, caps: &Capabilities, default_bridge: &str) -> Result<(), ManagerError> {
        if self.root.is_empty() {
            return Err(invalid("root plist is required"));
        }

        self.validate_mounts()?;

        for (host, guest) in &self.port {
            if !caps.forwarder.valid_host(host) {
                return Err(invalid(format!("invalid host port '{host}'")));
            }
            if *guest > u32::from(u16::MAX) {
                return Err(invalid(format!("invalid guest port '{guest}'")));
            }
        }

        self.validate_nics(caps, default_bridge)?;

        for cgroup in &self.cgroups {
            if !caps.cgroups.exists(cgroup) {
                return Err(invalid(format!("invalid cgroup {cgroup}")));
            }
        }

        Ok(())
    }

    fn validate_mounts(&self) -> Result<(), ManagerError> {
        for (host, guest) in &self.mount {
            if has_scheme(host) {
                continue;
            }
            if !Path::new(host).is_absolute() {
                return Err(invalid(format!("host path '{host}' must be absolute")));
            }
            if !Path::new(guest).is_absolute() {
                return Err(invalid(format!("guest path '{guest}' must be absolute")));
            }
            if !Path::new(host).exists() {
                return Err(invalid(format!("host path '{host}' does not exist")));
            }
        }
        Ok(())
    }

    /// Validates the NIC set alone.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::InvalidArguments` describing the first violation.
    pub fn validate_nics(&self, caps: &Capabilities, default_bridge: &str) -> Result<(), ManagerError> {
        let live = || self.nics.iter().filter(|nic| nic.state != NicState::Destroyed);

        let mut links: HashMap<&str, usize> = HashMap::new();
        for nic in live() {
            match nic.kind {
                NicKind::Default => {
                    let count = links.entry(default_bridge).or_default();
                    *count += 1;
                    if *count > 1 {
                        return Err(invalid("only one default network is allowed"));
                    }
                }
                NicKind::Bridge => {
                    if nic.id == default_bridge {
                        return Err(invalid(format!(
                            "cannot use bridge {default_bridge} with nic type 'bridge', please use type default instead"
                        )));
                    }
                    let count = links.entry(nic.id.as_str()).or_default();
                    *count += 1;
                    if *count > 1 {
                        return Err(invalid(format!(
                            "connecting to bridge '{}' more than one time is not allowed",
                            nic.id
                        )));
                    }
                }
                NicKind::Passthrough | NicKind::Macvlan => {
                    let kind = link_kind(caps.exec.as_ref(), &nic.id).ok_or_else(|| {
                        invalid(format!("link '{}' not found", nic.id))
                    })?;
                    if kind != "device" && kind != "dummy" {
                        return Err(invalid(format!(
                            "cannot use {kind} {} with nic type '{}', please use link with type 'device' instead",
                            nic.id, nic.kind
                        )));
                    }
                    let count = links.entry(nic.id.as_str()).or_default();
                    *count += 1;
                    if *count > 1 {
                        return Err(invalid(format!(
                            "connecting to link '{}' more than one time is not allowed",
                            nic.id
                        )));
                    }
                }
                NicKind::Vlan | NicKind::Vxlan | NicKind::Zerotier => {}
            }
        }

        let mut names: HashSet<&str> = HashSet::new();
        for nic in live() {
            if nic.name.is_empty() {
                continue;
            }
            if !names.insert(nic.name.as_str()) {
                return Err(invalid(format!(
                    "name '{}' is passed twice in the container",
                    nic.name
                )));
            }
            if nic.name.len() > MAX_NIC_NAME {
                return Err(invalid(format!("invalid name '{}' too long", nic.name)));
            }
            if RESERVED_NAMES.contains(&nic.name.as_str()) {
                return Err(invalid(format!("invalid name `{}`", nic.name)));
            }
            if RESERVED_PREFIXES.iter().any(|p| nic.name.starts_with(p)) {
                return Err(invalid(format!(
                    "name '{}' cannot be used as it is started with eth or zt",
                    nic.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nic_kind_parse() {
        assert_eq!("vxlan".parse::<NicKind>(), Ok(NicKind::Vxlan));
        assert_eq!(
            "ipvlan".parse::<NicKind>(),
            Err("unsupported network type 'ipvlan'".to_string())
        );
    }

    #[test]
    fn test_unknown_nic_type_fails_decode() {
        let err = serde_json::from_value::<Nic>(json!({"type": "token-ring"}))
            .expect_err("unknown type");
        assert!(err.to_string().contains("unsupported network type 'token-ring'"));
    }

    #[test]
    fn test_args_decode_defaults() {
        let args: ContainerArgs = serde_json::from_value(json!({
            "root": "img://base",
            "nics": [{"type": "default"}],
            "cgroups": [["cpu", "small"]],
        }))
        .expect("decode");
        assert_eq!(args.nics.len(), 1);
        assert_eq!(args.nics[0].state, NicState::Unknown);
        assert_eq!(args.nics[0].device_name(0), "eth0");
        assert_eq!(args.cgroups, vec![CGroup::new("cpu", "small")]);
        assert!(!args.host_network);
    }

    #[test]
    fn test_has_scheme() {
        assert!(has_scheme("img://base"));
        assert!(has_scheme("restic:/srv/repo"));
        assert!(!has_scheme("/srv/data"));
        assert!(!has_scheme("relative/path"));
        assert!(!has_scheme("/a:b"));
    }

    #[test]
    fn test_has_tags() {
        let args = ContainerArgs {
            tags: vec!["a".into(), "b".into()],
            ..ContainerArgs::default()
        };
        assert!(args.has_tags(&[]));
        assert!(args.has_tags(&["a".into()]));
        assert!(!args.has_tags(&["a".into(), "c".into()]));
    }
}
