//! System requirements checking implementation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SystemRequirementsError};

/// Minimum required kernel version (major, minor).
pub const MIN_KERNEL_VERSION: (u32, u32) = (4, 0);

/// Host tools the agent shells out to.
pub const REQUIRED_TOOLS: &[&str] = &["ip"];

/// Results of all system requirements checks.
#[derive(Debug, Clone)]
pub struct SystemRequirements {
    /// Kernel version string (e.g., "6.7.0")
    pub kernel_version: String,
    /// Parsed kernel major version
    pub kernel_major: u32,
    /// Parsed kernel minor version
    pub kernel_minor: u32,
    /// Effective user id
    pub euid: u32,
    /// Whether cgroups v2 is available
    pub cgroups_v2: bool,
    /// Resolved paths of the required tools
    pub tools: Vec<PathBuf>,
}

impl SystemRequirements {
    /// Check if all requirements are met.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        kernel_at_least(self.kernel_major, self.kernel_minor)
            && self.euid == 0
            && self.cgroups_v2
            && self.tools.len() == REQUIRED_TOOLS.len()
    }
}

fn kernel_at_least(major: u32, minor: u32) -> bool {
    major > MIN_KERNEL_VERSION.0 || (major == MIN_KERNEL_VERSION.0 && minor >= MIN_KERNEL_VERSION.1)
}

/// Check all system requirements and return detailed results.
///
/// `cgroup_root` is where the unified hierarchy is expected.
///
/// Returns `Ok(SystemRequirements)` with all check results, or
/// `Err` with the first failing requirement.
pub fn check_all(cgroup_root: &Path) -> Result<SystemRequirements> {
    let euid = check_root()?;
    let (kernel_version, kernel_major, kernel_minor) = check_kernel_version()?;
    let cgroups_v2 = check_cgroups_v2(cgroup_root)?;
    let tools = REQUIRED_TOOLS
        .iter()
        .map(|tool| check_tool(tool))
        .collect::<Result<Vec<_>>>()?;

    Ok(SystemRequirements {
        kernel_version,
        kernel_major,
        kernel_minor,
        euid,
        cgroups_v2,
        tools,
    })
}

/// Check the agent runs as root.
///
/// # Errors
///
/// Returns error if the effective user is not root.
pub fn check_root() -> Result<u32> {
    let euid = nix::unistd::geteuid();
    if !euid.is_root() {
        return Err(SystemRequirementsError::NotRoot {
            euid: euid.as_raw(),
        }
        .into());
    }
    Ok(euid.as_raw())
}

/// Check kernel version is recent enough.
///
/// Parses the kernel version from `uname -r` output.
///
/// # Returns
///
/// Tuple of (version_string, major, minor) on success.
///
/// # Errors
///
/// Returns error if kernel version cannot be read or is below minimum.
pub fn check_kernel_version() -> Result<(String, u32, u32)> {
    let uname = nix::sys::utsname::uname().map_err(|e| SystemRequirementsError::ReadFailed {
        context: "uname syscall".to_string(),
        source: std::io::Error::from(e),
    })?;

    let release = uname.release().to_string_lossy().to_string();
    let (major, minor) = parse_kernel_version(&release)?;

    if !kernel_at_least(major, minor) {
        return Err(SystemRequirementsError::KernelTooOld {
            found: release,
            required: format!("{}.{}", MIN_KERNEL_VERSION.0, MIN_KERNEL_VERSION.1),
        }
        .into());
    }

    Ok((release, major, minor))
}

fn invalid_version(context: String, reason: &str) -> SystemRequirementsError {
    SystemRequirementsError::ReadFailed {
        context,
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, reason.to_string()),
    }
}

/// Parse kernel version string into (major, minor).
fn parse_kernel_version(version: &str) -> Result<(u32, u32)> {
    let mut parts = version.split('.');
    let (Some(major), Some(minor)) = (parts.next(), parts.next()) else {
        return Err(invalid_version(
            format!("Failed to parse kernel version: {version}"),
            "Invalid kernel version format",
        )
        .into());
    };

    let major_num = major.parse::<u32>().map_err(|_| {
        invalid_version(
            format!("Failed to parse kernel major version: {major}"),
            "Invalid major version",
        )
    })?;

    // Minor version might have suffix like "7-generic", extract just the number
    let minor_str = minor
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("0");
    let minor_num = minor_str.parse::<u32>().map_err(|_| {
        invalid_version(
            format!("Failed to parse kernel minor version: {minor}"),
            "Invalid minor version",
        )
    })?;

    Ok((major_num, minor_num))
}

/// Check cgroups v2 is available under `root`.
///
/// Verifies that `cgroup.controllers` exists, indicating the unified
/// hierarchy is mounted.
///
/// # Errors
///
/// Returns error if cgroups v2 is not available.
pub fn check_cgroups_v2(root: &Path) -> Result<bool> {
    let controllers_path = root.join("cgroup.controllers");

    if !controllers_path.exists() {
        return Err(SystemRequirementsError::CgroupsV2Unavailable.into());
    }

    fs::read_to_string(&controllers_path).map_err(|e| SystemRequirementsError::ReadFailed {
        context: "cgroups v2 controllers file".to_string(),
        source: e,
    })?;

    Ok(true)
}

/// Check `tool` is on `PATH`.
///
/// # Errors
///
/// Returns error if no executable named `tool` is found.
pub fn check_tool(tool: &str) -> Result<PathBuf> {
    let path = env::var_os("PATH").unwrap_or_default();
    find_in(&path, tool).ok_or_else(|| {
        SystemRequirementsError::ToolMissing {
            tool: tool.to_string(),
        }
        .into()
    })
}

fn find_in(path: &std::ffi::OsStr, tool: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    env::split_paths(path)
        .map(|dir| dir.join(tool))
        .find(|candidate| {
            fs::metadata(candidate)
                .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        })
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn test_parse_kernel_version_standard() {
        let (major, minor) = parse_kernel_version("6.7.0").expect("should parse");
        assert_eq!(major, 6);
        assert_eq!(minor, 7);
    }

    #[test]
    fn test_parse_kernel_version_with_suffix() {
        let (major, minor) = parse_kernel_version("6.8.0-generic").expect("should parse");
        assert_eq!(major, 6);
        assert_eq!(minor, 8);
    }

    #[test]
    fn test_parse_kernel_version_ubuntu_style() {
        let (major, minor) = parse_kernel_version("5.15.0-8-generic").expect("should parse");
        assert_eq!(major, 5);
        assert_eq!(minor, 15);
    }

    #[test]
    fn test_parse_kernel_version_garbage() {
        assert!(parse_kernel_version("linux").is_err());
        assert!(parse_kernel_version("x.1").is_err());
    }

    #[test]
    fn test_minimum_kernel() {
        assert!(kernel_at_least(4, 0));
        assert!(kernel_at_least(6, 1));
        assert!(!kernel_at_least(3, 19));
    }

    #[test]
    fn test_check_kernel_version_real() {
        let (version, major, minor) = check_kernel_version().expect("kernel check");
        assert!(kernel_at_least(major, minor), "Kernel {version} is too old");
    }

    #[test]
    fn test_cgroups_v2_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(check_cgroups_v2(dir.path()).is_err());
        fs::write(dir.path().join("cgroup.controllers"), "cpu memory\n").expect("write");
        assert!(check_cgroups_v2(dir.path()).expect("present"));
    }

    #[test]
    fn test_find_tool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = dir.path().join("ip");
        fs::write(&tool, "#!/bin/sh\n").expect("write");
        assert_eq!(find_in(dir.path().as_os_str(), "ip"), None);

        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).expect("chmod");
        assert_eq!(find_in(dir.path().as_os_str(), "ip"), Some(tool));
        assert_eq!(find_in(dir.path().as_os_str(), "zerotier-one"), None);
    }
}
