//! Round-trips to the switch agent, the sibling container tagged `ovs` that
//! owns VLAN and VXLAN bridges.

use serde_json::{Value, json};
use tracing::debug;

use crate::container::NicKind;
use crate::error::NetworkError;
use crate::relay::{JobResult, JobState};

/// Tag identifying the switch agent container.
pub const SWITCH_TAG: &str = "ovs";

/// Master bridge VLAN segments hang off.
pub const VLAN_MASTER: &str = "backplane";

/// Master bridge VXLAN segments hang off.
pub const VXLAN_MASTER: &str = "vxbackend";

/// Highest usable VLAN id.
pub const MAX_VLAN: u16 = 4094;

/// Synchronous access to the switch agent.
pub trait SwitchAgent: Send + Sync {
    /// Whether a switch agent container is registered.
    fn available(&self) -> bool;

    /// Dispatches `command` to the switch agent and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Precondition` without a switch agent, or
    /// `NetworkError::Dispatch` if the round-trip fails.
    fn call(&self, command: &str, arguments: Value) -> Result<JobResult, NetworkError>;
}

fn require(switch: &dyn SwitchAgent, kind: NicKind) -> Result<(), NetworkError> {
    if switch.available() {
        Ok(())
    } else {
        Err(NetworkError::Precondition(format!(
            "{SWITCH_TAG} is needed for {kind} network type"
        )))
    }
}

fn checked(result: JobResult, command: &str) -> Result<JobResult, NetworkError> {
    if result.state == JobState::Success {
        return Ok(result);
    }
    let reason = if result.stderr().is_empty() {
        result.data.clone()
    } else {
        result.stderr().to_string()
    };
    Err(NetworkError::Switch(format!("{command} failed: {reason}")))
}

/// Parses a segment id for `kind`.
///
/// # Errors
///
/// Returns `NetworkError::Invalid` for ids out of range.
pub fn segment_id(kind: NicKind, id: &str) -> Result<u32, NetworkError> {
    match kind {
        NicKind::Vlan => id
            .parse::<u16>()
            .ok()
            .filter(|vlan| *vlan <= MAX_VLAN)
            .map(u32::from)
            .ok_or_else(|| NetworkError::Invalid(format!("invalid vlan id (0-{MAX_VLAN})"))),
        NicKind::Vxlan => id
            .parse::<u32>()
            .map_err(|_| NetworkError::Invalid(format!("invalid vxlan id '{id}'"))),
        other => Err(NetworkError::Invalid(format!(
            "{other} is not a switch-backed network type"
        ))),
    }
}

/// Asks the switch agent for the bridge carrying segment `id` and returns its name.
///
/// # Errors
///
/// Fails if the id is invalid, no switch agent runs, or it rejects the request.
pub fn ensure_segment(switch: &dyn SwitchAgent, kind: NicKind, id: &str) -> Result<String, NetworkError> {
    let segment = segment_id(kind, id)?;
    require(switch, kind)?;

    let (command, arguments) = match kind {
        NicKind::Vxlan => (
            "ovs.vxlan-ensure",
            json!({"master": VXLAN_MASTER, "vxlan": segment}),
        ),
        _ => (
            "ovs.vlan-ensure",
            json!({"master": VLAN_MASTER, "vlan": segment}),
        ),
    };

    let result = checked(switch.call(command, arguments)?, command)?;
    let bridge: String = serde_json::from_str(&result.data)
        .map_err(|e| NetworkError::Switch(format!("{command} returned invalid data: {e}")))?;
    debug!(%kind, segment, %bridge, "Switch segment ensured");
    Ok(bridge)
}

/// Adds host link `port` to `bridge` on the switch agent.
///
/// # Errors
///
/// Fails if no switch agent runs or it rejects the request.
pub fn port_add(switch: &dyn SwitchAgent, kind: NicKind, bridge: &str, port: &str) -> Result<(), NetworkError> {
    require(switch, kind)?;
    let command = "ovs.port-add";
    checked(
        switch.call(command, json!({"bridge": bridge, "port": port}))?,
        command,
    )
    .map(|_| ())
}

/// Removes host link `port` from its switch agent bridge.
///
/// # Errors
///
/// Fails if no switch agent runs or it rejects the request.
pub fn port_del(switch: &dyn SwitchAgent, kind: NicKind, port: &str) -> Result<(), NetworkError> {
    require(switch, kind)?;
    let command = "ovs.port-del";
    checked(switch.call(command, json!({"port": port}))?, command).map(|_| ())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder {
        available: bool,
        calls: Mutex<Vec<(String, Value)>>,
        reply: JobResult,
    }

    impl SwitchAgent for Recorder {
        fn available(&self) -> bool {
            self.available
        }

        fn call(&self, command: &str, arguments: Value) -> Result<JobResult, NetworkError> {
            self.calls
                .lock()
                .expect("lock")
                .push((command.to_string(), arguments));
            Ok(self.reply.clone())
        }
    }

    fn recorder(available: bool, state: JobState, data: &str) -> Recorder {
        Recorder {
            available,
            calls: Mutex::new(Vec::new()),
            reply: JobResult {
                state,
                data: data.to_string(),
                ..JobResult::default()
            },
        }
    }

    #[test]
    fn test_vlan_range() {
        assert_eq!(segment_id(NicKind::Vlan, "0").expect("vlan 0"), 0);
        assert_eq!(segment_id(NicKind::Vlan, "4094").expect("vlan 4094"), 4094);
        let err = segment_id(NicKind::Vlan, "4095").expect_err("too big");
        assert_eq!(err.to_string(), "invalid vlan id (0-4094)");
        assert!(segment_id(NicKind::Vlan, "abc").is_err());
        assert_eq!(segment_id(NicKind::Vxlan, "100000").expect("vxlan"), 100_000);
    }

    #[test]
    fn test_ensure_vlan_returns_bridge() {
        let switch = recorder(true, JobState::Success, "\"vlbr100\"");
        let bridge = ensure_segment(&switch, NicKind::Vlan, "100").expect("ensure");
        assert_eq!(bridge, "vlbr100");

        let calls = switch.calls.lock().expect("lock");
        assert_eq!(calls[0].0, "ovs.vlan-ensure");
        assert_eq!(calls[0].1, json!({"master": "backplane", "vlan": 100}));
    }

    #[test]
    fn test_ensure_vxlan_uses_backend_master() {
        let switch = recorder(true, JobState::Success, "\"vxbr7\"");
        ensure_segment(&switch, NicKind::Vxlan, "7").expect("ensure");
        let calls = switch.calls.lock().expect("lock");
        assert_eq!(calls[0].1, json!({"master": "vxbackend", "vxlan": 7}));
    }

    #[test]
    fn test_missing_switch_is_precondition() {
        let switch = recorder(false, JobState::Success, "");
        let err = ensure_segment(&switch, NicKind::Vxlan, "5").expect_err("no ovs");
        assert!(matches!(err, NetworkError::Precondition(_)));
        assert_eq!(err.to_string(), "ovs is needed for vxlan network type");
    }

    #[test]
    fn test_failed_result_is_switch_error() {
        let switch = recorder(true, JobState::Error, "boom");
        let err = port_add(&switch, NicKind::Vlan, "vlbr1", "cont1-0").expect_err("failed");
        assert!(matches!(err, NetworkError::Switch(_)));
    }
}
