//! Filesystem layout of one container.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use crate::config::AgentConfig;
use crate::error::StoreError;
use crate::relay::RelayPaths;

/// Directory permissions: owner read/write/execute only (0700).
const DIR_PERMISSIONS: u32 = 0o700;

/// Paths of one container.
///
/// ```text
/// {backend_dir}/{id}/
/// ├── config.json   # declared arguments, flock'ed while the container lives
/// ├── in            # relay FIFO, agent -> helper
/// ├── out           # relay FIFO, helper -> agent
/// └── zerotier/     # identity-overlay daemon home
///
/// {root_dir}/{id}/  # sandbox root
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPaths {
    /// Per-container working directory.
    pub workdir: PathBuf,
    /// Sandbox root.
    pub root: PathBuf,
    /// Config store file.
    pub config_file: PathBuf,
    /// Overlay daemon home.
    pub overlay_home: PathBuf,
}

impl ContainerPaths {
    /// Computes the paths of container `id`; nothing is created.
    #[must_use]
    pub fn new(config: &AgentConfig, id: u16) -> Self {
        let workdir = config.container_backend(id);
        Self {
            config_file: workdir.join("config.json"),
            overlay_home: workdir.join("zerotier"),
            root: config.container_root(id),
            workdir,
        }
    }

    /// Relay FIFO locations.
    #[must_use]
    pub fn relay(&self) -> RelayPaths {
        RelayPaths::new(&self.workdir)
    }

    /// Creates the working directory with 0700 permissions.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::IoError` if creation fails.
    pub fn create_workdir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.workdir).map_err(|e| StoreError::IoError {
            context: format!("failed to create directory: {}", self.workdir.display()),
            source: e,
        })?;
        fs::set_permissions(&self.workdir, fs::Permissions::from_mode(DIR_PERMISSIONS)).map_err(
            |e| StoreError::IoError {
                context: format!("failed to set permissions on: {}", self.workdir.display()),
                source: e,
            },
        )
    }

    /// Removes the working directory.
    ///
    /// Should only be called once nothing under it is mounted or open.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::IoError` if removal fails.
    pub fn remove_workdir(&self) -> Result<(), StoreError> {
        if self.workdir.exists() {
            fs::remove_dir_all(&self.workdir).map_err(|e| StoreError::IoError {
                context: format!("failed to remove directory: {}", self.workdir.display()),
                source: e,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let config = AgentConfig::default()
            .with_backend_dir("/b")
            .with_root_dir("/r");
        let paths = ContainerPaths::new(&config, 12);
        assert_eq!(paths.workdir, PathBuf::from("/b/12"));
        assert_eq!(paths.config_file, PathBuf::from("/b/12/config.json"));
        assert_eq!(paths.root, PathBuf::from("/r/12"));
        assert_eq!(paths.relay().input, PathBuf::from("/b/12/in"));
        assert_eq!(paths.relay().output, PathBuf::from("/b/12/out"));
    }

    #[test]
    fn test_create_and_remove_workdir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AgentConfig::default().with_backend_dir(dir.path());
        let paths = ContainerPaths::new(&config, 1);

        paths.create_workdir().expect("create");
        let mode = fs::metadata(&paths.workdir)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);

        paths.remove_workdir().expect("remove");
        assert!(!paths.workdir.exists());
    }
}
