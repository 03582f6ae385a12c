//! Cgroup collaborator.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::CapabilityError;

/// A cgroup reference as `[subsystem, name]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CGroup(pub String, pub String);

impl CGroup {
    /// Creates a reference to `subsystem:name`.
    #[must_use]
    pub fn new(subsystem: impl Into<String>, name: impl Into<String>) -> Self {
        Self(subsystem.into(), name.into())
    }

    /// The device-restriction group applied to unprivileged containers.
    #[must_use]
    pub fn devices() -> Self {
        Self::new("devices", "corex")
    }

    /// Subsystem part.
    #[must_use]
    pub fn subsystem(&self) -> &str {
        &self.0
    }

    /// Name part.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.1
    }
}

impl fmt::Display for CGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

/// Creates cgroups and moves processes into them.
pub trait Cgroups: Send + Sync {
    /// Ensures `group` exists.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityError::IoError` if the group cannot be created.
    fn get_or_create(&self, group: &CGroup) -> Result<(), CapabilityError>;

    /// Whether `group` exists.
    fn exists(&self, group: &CGroup) -> bool;

    /// Moves `pid` into `group`.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityError::IoError` if the pid cannot be written.
    fn attach(&self, group: &CGroup, pid: u32) -> Result<(), CapabilityError>;
}

/// [`Cgroups`] over a directory tree such as `/sys/fs/cgroup`.
#[derive(Debug, Clone)]
pub struct UnifiedCgroups {
    root: PathBuf,
}

impl UnifiedCgroups {
    /// Uses `root` as the hierarchy root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, group: &CGroup) -> PathBuf {
        self.root.join(group.subsystem()).join(group.name())
    }
}

impl Cgroups for UnifiedCgroups {
    #[instrument(skip(self), fields(group = %group))]
    fn get_or_create(&self, group: &CGroup) -> Result<(), CapabilityError> {
        let path = self.path(group);
        fs::create_dir_all(&path).map_err(|e| CapabilityError::IoError {
            context: format!("failed to create cgroup {}", path.display()),
            source: e,
        })?;
        debug!("Cgroup ready");
        Ok(())
    }

    fn exists(&self, group: &CGroup) -> bool {
        self.path(group).is_dir()
    }

    #[instrument(skip(self), fields(group = %group))]
    fn attach(&self, group: &CGroup, pid: u32) -> Result<(), CapabilityError> {
        let procs = self.path(group).join("cgroup.procs");
        fs::write(&procs, pid.to_string()).map_err(|e| CapabilityError::IoError {
            context: format!("failed to attach {pid} to {}", procs.display()),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_attach() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cgroups = UnifiedCgroups::new(dir.path());
        let group = CGroup::new("cpu", "small");

        assert!(!cgroups.exists(&group));
        cgroups.get_or_create(&group).expect("create");
        assert!(cgroups.exists(&group));

        cgroups.attach(&group, 42).expect("attach");
        let procs = fs::read_to_string(dir.path().join("cpu/small/cgroup.procs")).expect("read");
        assert_eq!(procs, "42");
    }

    #[test]
    fn test_cgroup_serializes_as_pair() {
        let json = serde_json::to_string(&CGroup::devices()).expect("serialize");
        assert_eq!(json, r#"["devices","corex"]"#);
    }
}
