//! Thin wrappers around `ip` invocations.

use serde::Deserialize;
use tracing::trace;

use crate::capability::HostExec;
use crate::error::CapabilityError;

/// MTU of the veth pairs the agent creates.
pub const VETH_MTU: &str = "1500";

#[derive(Debug, Deserialize)]
struct LinkDetails {
    #[serde(default)]
    linkinfo: Option<LinkInfo>,
}

#[derive(Debug, Deserialize)]
struct LinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
}

/// Kind of the host link `name`: `device` for physical links, otherwise the
/// driver kind reported by `ip -d` (`bridge`, `dummy`, `veth`, ...).
///
/// Returns `None` if the link does not exist.
#[must_use]
pub fn link_kind(exec: &dyn HostExec, name: &str) -> Option<String> {
    let output = exec.run("ip", &["-d", "-j", "link", "show", name], None).ok()?;
    let links: Vec<LinkDetails> = serde_json::from_str(&output).ok()?;
    let link = links.into_iter().next()?;
    Some(
        link.linkinfo
            .and_then(|info| info.info_kind)
            .unwrap_or_else(|| "device".to_string()),
    )
}

/// Whether the host link `name` exists.
#[must_use]
pub fn link_exists(exec: &dyn HostExec, name: &str) -> bool {
    exec.run("ip", &["link", "show", name], None).is_ok()
}

/// Creates a veth pair `host` / `peer`, giving the peer `hw_address` if set.
///
/// # Errors
///
/// Returns the failing `ip` invocation.
pub fn create_veth(
    exec: &dyn HostExec,
    host: &str,
    peer: &str,
    hw_address: &str,
) -> Result<(), CapabilityError> {
    trace!(host, peer, "Creating veth pair");
    exec.run(
        "ip",
        &[
            "link", "add", host, "mtu", VETH_MTU, "type", "veth", "peer", "name", peer, "mtu",
            VETH_MTU,
        ],
        None,
    )?;
    if !hw_address.is_empty() {
        exec.run("ip", &["link", "set", peer, "address", hw_address], None)?;
    }
    Ok(())
}

/// Enslaves `link` to `bridge` and brings it up.
///
/// # Errors
///
/// Returns the failing `ip` invocation.
pub fn attach_to_bridge(exec: &dyn HostExec, link: &str, bridge: &str) -> Result<(), CapabilityError> {
    exec.run("ip", &["link", "set", link, "master", bridge], None)?;
    exec.run("ip", &["link", "set", link, "up"], None)?;
    Ok(())
}

/// Deletes the host link `name`.
///
/// # Errors
///
/// Returns the failing `ip` invocation.
pub fn delete_link(exec: &dyn HostExec, name: &str) -> Result<(), CapabilityError> {
    exec.run("ip", &["link", "del", name], None).map(|_| ())
}

/// Runs `program args` inside the named network namespace.
///
/// # Errors
///
/// Returns the failing invocation.
pub fn netns_run(
    exec: &dyn HostExec,
    netns: &str,
    program: &str,
    args: &[&str],
) -> Result<String, CapabilityError> {
    let mut full = vec!["netns", "exec", netns, program];
    full.extend_from_slice(args);
    exec.run("ip", &full, None)
}

#[cfg(test)]
mod tests {
    use std::process::Child;
    use std::sync::Mutex;

    use super::*;

    struct Canned {
        output: Result<String, ()>,
        calls: Mutex<Vec<String>>,
    }

    impl HostExec for Canned {
        fn run(&self, program: &str, args: &[&str], _stdin: Option<&str>) -> Result<String, CapabilityError> {
            self.calls
                .lock()
                .expect("lock")
                .push(format!("{program} {}", args.join(" ")));
            self.output.clone().map_err(|()| CapabilityError::CommandFailed {
                program: program.to_string(),
                args: args.join(" "),
                stderr: "Device does not exist".into(),
            })
        }

        fn spawn(&self, program: &str, _args: &[&str]) -> Result<Child, CapabilityError> {
            Err(CapabilityError::Failed {
                capability: "exec",
                reason: format!("{program} not spawnable"),
            })
        }
    }

    fn canned(output: Result<&str, ()>) -> Canned {
        Canned {
            output: output.map(str::to_string),
            calls: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_link_kind_physical() {
        let exec = canned(Ok(r#"[{"ifname":"eth0","flags":["UP"]}]"#));
        assert_eq!(link_kind(&exec, "eth0").as_deref(), Some("device"));
    }

    #[test]
    fn test_link_kind_dummy() {
        let exec = canned(Ok(r#"[{"ifname":"d0","linkinfo":{"info_kind":"dummy"}}]"#));
        assert_eq!(link_kind(&exec, "d0").as_deref(), Some("dummy"));
    }

    #[test]
    fn test_link_kind_missing() {
        let exec = canned(Err(()));
        assert_eq!(link_kind(&exec, "nope"), None);
    }

    #[test]
    fn test_create_veth_sets_address() {
        let exec = canned(Ok(""));
        create_veth(&exec, "cont1-0", "cont1-0p", "02:00:00:00:00:01").expect("veth");
        let calls = exec.calls.lock().expect("lock").clone();
        assert_eq!(
            calls,
            vec![
                "ip link add cont1-0 mtu 1500 type veth peer name cont1-0p mtu 1500".to_string(),
                "ip link set cont1-0p address 02:00:00:00:00:01".to_string(),
            ]
        );
    }

    #[test]
    fn test_netns_run_prefix() {
        let exec = canned(Ok("ok"));
        let out = netns_run(&exec, "7", "ip", &["link", "set", "x", "up"]).expect("run");
        assert_eq!(out, "ok");
        assert_eq!(
            exec.calls.lock().expect("lock")[0],
            "ip netns exec 7 ip link set x up"
        );
    }
}
