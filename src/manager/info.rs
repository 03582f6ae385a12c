//! Container summaries with live process statistics.

use std::fs;

use serde::Serialize;

use crate::capability::Forward;
use crate::container::{Container, ContainerArgs, ContainerState};
use crate::error::ManagerError;

/// Kernel page size assumed when converting `rss` pages to bytes.
const PAGE_SIZE: u64 = 4096;

/// Resource usage of the helper process, read from `/proc`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStats {
    /// User plus system time in clock ticks.
    pub cpu: u64,
    /// Resident set size in bytes.
    pub rss: u64,
    /// Virtual memory size in bytes.
    pub vms: u64,
    /// Swapped-out memory in bytes.
    pub swap: u64,
}

impl ProcessStats {
    /// Reads the statistics of `pid`; a vanished process yields zeroes.
    #[must_use]
    pub fn read(pid: u32) -> Self {
        if pid == 0 {
            return Self::default();
        }
        let mut stats = fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| Self::parse_stat(&stat))
            .unwrap_or_default();
        if let Ok(status) = fs::read_to_string(format!("/proc/{pid}/status")) {
            stats.swap = parse_status_kb(&status, "VmSwap:").unwrap_or(0) * 1024;
        }
        stats
    }

    /// Parses `/proc/<pid>/stat`.
    fn parse_stat(stat: &str) -> Option<Self> {
        // comm may contain spaces; fields restart after the closing paren
        let rest = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // rest starts at field 3 (state)
        let field = |n: usize| fields.get(n - 3).and_then(|v| v.parse::<u64>().ok());
        Some(Self {
            cpu: field(14)? + field(15)?,
            vms: field(23)?,
            rss: field(24)? * PAGE_SIZE,
            swap: 0,
        })
    }
}

fn parse_status_kb(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Identity and declared state of one container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerDetails {
    /// Declared arguments, `port` reflecting active forwards.
    pub arguments: ContainerArgs,
    /// Sandbox root on the host.
    pub root: String,
    /// Helper pid.
    pub pid: u32,
    /// Lifecycle state.
    pub state: ContainerState,
}

/// Summary returned by find and list.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    /// Process statistics.
    #[serde(flatten)]
    pub stats: ProcessStats,
    /// Container details.
    pub container: ContainerDetails,
}

/// Replaces the declared port map with the active `forwards`.
#[must_use]
pub fn with_forwards(mut args: ContainerArgs, forwards: &[Forward]) -> ContainerArgs {
    args.port = forwards
        .iter()
        .map(|forward| (forward.host.clone(), u32::from(forward.guest)))
        .collect();
    args
}

impl ContainerInfo {
    /// Collects the summary of `container`.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Store` if the arguments cannot be read.
    pub fn collect(container: &Container, forwards: &[Forward]) -> Result<Self, ManagerError> {
        let pid = container.pid();
        Ok(Self {
            stats: ProcessStats::read(pid),
            container: ContainerDetails {
                arguments: with_forwards(container.arguments()?, forwards),
                root: container.paths().root.display().to_string(),
                pid,
                state: container.state(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_parse_stat() {
        let stat = "1234 (core X) S 1 1234 1234 0 -1 4194560 100 0 0 0 7 3 0 0 20 0 1 0 100 8192000 50 18446744073709551615";
        let stats = ProcessStats::parse_stat(stat).expect("parse");
        assert_eq!(stats.cpu, 10);
        assert_eq!(stats.vms, 8_192_000);
        assert_eq!(stats.rss, 50 * PAGE_SIZE);
    }

    #[test]
    fn test_parse_truncated_stat() {
        assert!(ProcessStats::parse_stat("1 (x) S 1").is_none());
        assert!(ProcessStats::parse_stat("garbage").is_none());
    }

    #[test]
    fn test_parse_swap() {
        let status = "Name:\tcoreX\nVmRSS:\t  1000 kB\nVmSwap:\t  12 kB\n";
        assert_eq!(parse_status_kb(status, "VmSwap:"), Some(12));
        assert_eq!(parse_status_kb(status, "VmLck:"), None);
    }

    #[test]
    fn test_missing_process_is_zero() {
        assert_eq!(ProcessStats::read(0), ProcessStats::default());
    }

    #[test]
    fn test_forwards_replace_ports() {
        let args = ContainerArgs {
            port: [("80".to_string(), 8080)].into_iter().collect(),
            ..ContainerArgs::default()
        };
        let forwards = [Forward {
            host: "2222".to_string(),
            guest: 22,
            ip: Ipv4Addr::new(172, 18, 0, 2),
        }];
        let args = with_forwards(args, &forwards);
        assert_eq!(args.port.len(), 1);
        assert_eq!(args.port.get("2222"), Some(&22));
    }
}
