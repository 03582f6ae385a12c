//! Sandbox root construction and cleanup.
//!
//! A root is populated in a fixed order:
//!
//! 1. Fresh root directory (a btrfs subvolume when the root filesystem is btrfs)
//! 2. Root image mounted by the filesystem collaborator
//! 3. Config overrides written into the tree
//! 4. Bind mounts, shallowest guest path first
//! 5. The helper binary bound read-only onto its placeholder
//! 6. Host `/etc/resolv.conf` for host-network containers
//! 7. The finished tree bound recursively onto the staging path the launcher
//!    pivots into
//!
//! The launcher only carries the top mount of the staging path into the new
//! namespace, so [`SandboxBuilder::guest_binds`] lists the mounts of steps 4
//! to 6 for it to recreate from the original root.
//!
//! Any failure unmounts everything under the root and removes it before the
//! error is returned.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::statfs::{BTRFS_SUPER_MAGIC, statfs};
use tracing::{debug, instrument, trace, warn};

use super::launcher::GuestBind;
use super::mounts::{Mounter, ensure_mount_point, guest_path, unmount_all};
use crate::capability::{Capabilities, Filesystem, HostExec};
use crate::container::{ContainerArgs, has_scheme};
use crate::error::SandboxError;

/// Permissions of config override files.
const CONFIG_FILE_PERMISSIONS: u32 = 0o600;

/// Inode number of a btrfs subvolume root.
const BTRFS_SUBVOLUME_INODE: u64 = 256;

/// Host resolver configuration shared with host-network containers.
const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Builds and tears down one container's root.
pub struct SandboxBuilder {
    id: u16,
    root: PathBuf,
    filesystem: Arc<dyn Filesystem>,
    mounter: Arc<dyn Mounter>,
    exec: Arc<dyn HostExec>,
}

impl SandboxBuilder {
    /// Creates a builder for the root of container `id`.
    #[must_use]
    pub fn new(id: u16, root: impl Into<PathBuf>, caps: &Capabilities) -> Self {
        Self {
            id,
            root: root.into(),
            filesystem: Arc::clone(&caps.filesystem),
            mounter: Arc::clone(&caps.mounter),
            exec: Arc::clone(&caps.exec),
        }
    }

    /// Root directory being built.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Recursive bind of the finished root handed to the launcher.
    #[must_use]
    pub fn staging(&self) -> PathBuf {
        self.root.with_extension("rootfs")
    }

    /// Scope of this container's filesystem scratch state.
    #[must_use]
    pub fn namespace(&self) -> String {
        format!("containers/{}", self.id)
    }

    /// Populates the root for `args`, with the helper at `helper_path`
    /// bound onto `/<helper_name>`.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error after cleaning up.
    #[instrument(skip(self, args, helper_path), fields(id = self.id, root = %self.root.display()))]
    pub fn build(
        &self,
        args: &ContainerArgs,
        helper_path: &Path,
        helper_name: &str,
    ) -> Result<(), SandboxError> {
        let outcome = self.populate(args, helper_path, helper_name);
        if let Err(e) = &outcome {
            warn!(error = %e, "Sandbox construction failed, cleaning up");
            if let Err(cleanup) = self.cleanup() {
                warn!(error = %cleanup, "Sandbox cleanup failed");
            }
        }
        outcome
    }

    fn populate(
        &self,
        args: &ContainerArgs,
        helper_path: &Path,
        helper_name: &str,
    ) -> Result<(), SandboxError> {
        self.reset_root()?;

        let namespace = self.namespace();
        self.filesystem.release(&namespace)?;
        self.filesystem
            .mount(&namespace, &args.storage, &args.root, &self.root)?;
        debug!(image = %args.root, "Root image mounted");

        self.write_config(args)?;
        self.bind_mounts(args, &namespace)?;

        let placeholder = self.resolve(helper_name)?;
        ensure_mount_point(helper_path, &placeholder)?;
        self.mounter.bind(helper_path, &placeholder, true)?;
        trace!(helper = %helper_path.display(), "Helper injected");

        if args.host_network {
            let resolv = Path::new(HOST_RESOLV_CONF);
            let target = self.resolve(HOST_RESOLV_CONF)?;
            ensure_mount_point(resolv, &target)?;
            self.mounter.bind(resolv, &target, true)?;
        }

        let staging = self.staging();
        ensure_mount_point(&self.root, &staging)?;
        self.mounter.bind(&self.root, &staging, false)?;
        trace!(staging = %staging.display(), "Root staged");

        Ok(())
    }

    /// Mounts below the root the launcher must recreate inside the sandbox,
    /// shallowest guest path first.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::PathEscape` if a guest path leaves the root.
    pub fn guest_binds(
        &self,
        args: &ContainerArgs,
        helper_name: &str,
    ) -> Result<Vec<GuestBind>, SandboxError> {
        let mut binds = Vec::new();
        for (_, guest) in sorted_mounts(args) {
            binds.push(self.guest_bind(guest, false)?);
        }
        binds.push(self.guest_bind(helper_name, true)?);
        if args.host_network {
            binds.push(self.guest_bind(HOST_RESOLV_CONF, true)?);
        }
        Ok(binds)
    }

    fn guest_bind(&self, guest: &str, read_only: bool) -> Result<GuestBind, SandboxError> {
        Ok(GuestBind {
            source: self.resolve(guest)?,
            guest: format!("/{}", guest.trim_start_matches('/')),
            read_only,
        })
    }

    /// Unmounts everything under the root, deepest first, removes it and
    /// drops the filesystem scratch state.
    ///
    /// # Errors
    ///
    /// Returns the first unmount error, or an I/O error if removal fails.
    #[instrument(skip(self), fields(id = self.id, root = %self.root.display()))]
    pub fn cleanup(&self) -> Result<(), SandboxError> {
        let staging = self.remove_staging();
        unmount_all(self.mounter.as_ref(), &self.root)?;
        self.remove_root()?;
        self.filesystem.release(&self.namespace())?;
        staging
    }

    fn resolve(&self, guest: &str) -> Result<PathBuf, SandboxError> {
        guest_path(&self.root, guest).ok_or_else(|| SandboxError::PathEscape {
            path: guest.to_string(),
        })
    }

    fn remove_staging(&self) -> Result<(), SandboxError> {
        let staging = self.staging();
        unmount_all(self.mounter.as_ref(), &staging)?;
        match fs::remove_dir(&staging) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::IoError {
                context: format!("failed to remove {}", staging.display()),
                source: e,
            }),
        }
    }

    fn reset_root(&self) -> Result<(), SandboxError> {
        self.remove_staging()?;
        if self.root.exists() {
            unmount_all(self.mounter.as_ref(), &self.root)?;
            self.remove_root()?;
        }

        let parent = self.root.parent().unwrap_or(Path::new("/"));
        fs::create_dir_all(parent).map_err(|e| SandboxError::IoError {
            context: format!("failed to create {}", parent.display()),
            source: e,
        })?;

        if on_btrfs(parent) {
            let root = self.root.to_string_lossy();
            self.exec
                .run("btrfs", &["subvolume", "create", &root], None)?;
            debug!("Created root subvolume");
            return Ok(());
        }

        fs::create_dir_all(&self.root).map_err(|e| SandboxError::IoError {
            context: format!("failed to create {}", self.root.display()),
            source: e,
        })
    }

    fn remove_root(&self) -> Result<(), SandboxError> {
        let Ok(meta) = fs::symlink_metadata(&self.root) else {
            return Ok(());
        };

        if meta.ino() == BTRFS_SUBVOLUME_INODE && on_btrfs(&self.root) {
            let root = self.root.to_string_lossy();
            self.exec
                .run("btrfs", &["subvolume", "delete", &root], None)?;
            return Ok(());
        }

        fs::remove_dir_all(&self.root).map_err(|e| SandboxError::IoError {
            context: format!("failed to remove {}", self.root.display()),
            source: e,
        })
    }

    fn write_config(&self, args: &ContainerArgs) -> Result<(), SandboxError> {
        for (guest, content) in &args.config {
            let path = self.resolve(guest)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| SandboxError::IoError {
                    context: format!("failed to create {}", parent.display()),
                    source: e,
                })?;
            }
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(CONFIG_FILE_PERMISSIONS)
                .open(&path)
                .map_err(|e| SandboxError::IoError {
                    context: format!("failed to open {}", path.display()),
                    source: e,
                })?;
            file.write_all(content.as_bytes())
                .map_err(|e| SandboxError::IoError {
                    context: format!("failed to write {}", path.display()),
                    source: e,
                })?;
            trace!(path = %path.display(), "Config override written");
        }
        Ok(())
    }

    fn bind_mounts(&self, args: &ContainerArgs, namespace: &str) -> Result<(), SandboxError> {
        for (source, guest) in sorted_mounts(args) {
            let target = self.resolve(guest)?;
            if has_scheme(source) {
                self.filesystem
                    .mount(namespace, &args.storage, source, &target)?;
            } else {
                let source = Path::new(source);
                ensure_mount_point(source, &target)?;
                self.mounter.bind(source, &target, false)?;
            }
            debug!(source = %source, guest = %guest, "Mount applied");
        }
        Ok(())
    }
}

impl std::fmt::Debug for SandboxBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxBuilder")
            .field("id", &self.id)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Declared mounts, shallowest guest path first.
fn sorted_mounts(args: &ContainerArgs) -> Vec<(&String, &String)> {
    let mut mounts: Vec<(&String, &String)> = args.mount.iter().collect();
    mounts.sort_by_key(|(_, guest)| Path::new(guest.as_str()).components().count());
    mounts
}

fn on_btrfs(path: &Path) -> bool {
    statfs(path).is_ok_and(|stat| stat.filesystem_type() == BTRFS_SUPER_MAGIC)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::capability::{MemoryBroker, MemoryStats, SystemExec, TracingLogSink};
    use crate::capability::{CGroup, Cgroups, Forward, PortForwarder};
    use crate::error::{CapabilityError, MountError};
    use crate::sandbox::HakoniwaLauncher;

    #[derive(Default)]
    struct RecordingMounter {
        binds: Mutex<Vec<(PathBuf, PathBuf, bool)>>,
        active: Mutex<Vec<PathBuf>>,
    }

    impl Mounter for RecordingMounter {
        fn bind(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), MountError> {
            self.binds
                .lock()
                .expect("lock")
                .push((source.to_path_buf(), target.to_path_buf(), read_only));
            self.active.lock().expect("lock").push(target.to_path_buf());
            Ok(())
        }

        fn overlay(
            &self,
            _lower: &[PathBuf],
            _upper: &Path,
            _work: &Path,
            target: &Path,
        ) -> Result<(), MountError> {
            self.active.lock().expect("lock").push(target.to_path_buf());
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<(), MountError> {
            self.active.lock().expect("lock").retain(|p| p != target);
            Ok(())
        }

        fn mounts_under(&self, root: &Path) -> Vec<PathBuf> {
            self.active
                .lock()
                .expect("lock")
                .iter()
                .filter(|p| p.starts_with(root))
                .cloned()
                .collect()
        }
    }

    struct DirFilesystem {
        fail: bool,
    }

    impl Filesystem for DirFilesystem {
        fn mount(
            &self,
            _namespace: &str,
            _storage: &str,
            source: &str,
            target: &Path,
        ) -> Result<(), CapabilityError> {
            if self.fail {
                return Err(CapabilityError::Failed {
                    capability: "filesystem",
                    reason: format!("cannot mount {source}"),
                });
            }
            fs::create_dir_all(target.join("etc")).expect("etc");
            Ok(())
        }

        fn merge_layer(
            &self,
            _namespace: &str,
            _storage: &str,
            _source: &str,
            _target: &Path,
        ) -> Result<(), CapabilityError> {
            Ok(())
        }

        fn release(&self, _namespace: &str) -> Result<(), CapabilityError> {
            Ok(())
        }

        fn restore_backup(&self, _url: &str, _target: &Path, _name: &str) -> Result<(), CapabilityError> {
            Ok(())
        }
    }

    struct NoCgroups;

    impl Cgroups for NoCgroups {
        fn get_or_create(&self, _cgroup: &CGroup) -> Result<(), CapabilityError> {
            Ok(())
        }
        fn exists(&self, _cgroup: &CGroup) -> bool {
            true
        }
        fn attach(&self, _cgroup: &CGroup, _pid: u32) -> Result<(), CapabilityError> {
            Ok(())
        }
    }

    struct NoForwards;

    impl PortForwarder for NoForwards {
        fn valid_host(&self, _host: &str) -> bool {
            true
        }
        fn add(&self, _owner: u16, _ip: std::net::Ipv4Addr, _host: &str, _guest: u16) -> Result<(), CapabilityError> {
            Ok(())
        }
        fn remove(&self, _owner: u16, _host: &str, _guest: u16) -> Result<(), CapabilityError> {
            Ok(())
        }
        fn remove_all(&self, _owner: u16) {}
        fn list(&self, _owner: u16) -> Vec<Forward> {
            Vec::new()
        }
    }

    fn caps(mounter: Arc<RecordingMounter>, fail: bool) -> Capabilities {
        Capabilities {
            filesystem: Arc::new(DirFilesystem { fail }),
            cgroups: Arc::new(NoCgroups),
            forwarder: Arc::new(NoForwards),
            broker: Arc::new(MemoryBroker::new()),
            logger: Arc::new(TracingLogSink),
            stats: Arc::new(MemoryStats::new()),
            exec: Arc::new(SystemExec),
            mounter,
            launcher: Arc::new(HakoniwaLauncher::new()),
        }
    }

    fn helper(dir: &Path) -> PathBuf {
        let path = dir.join("corex");
        fs::write(&path, b"#!/bin/sh\n").expect("helper");
        path
    }

    #[test]
    fn test_build_writes_config_and_binds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("data");
        fs::create_dir_all(&data).expect("data");
        let mounter = Arc::new(RecordingMounter::default());
        let builder = SandboxBuilder::new(1, dir.path().join("roots/1"), &caps(Arc::clone(&mounter), false));

        let args = ContainerArgs {
            root: "img://base".into(),
            mount: BTreeMap::from([(data.to_string_lossy().into_owned(), "/srv/data".into())]),
            config: BTreeMap::from([("/etc/motd".into(), "hello\n".into())]),
            ..ContainerArgs::default()
        };
        builder
            .build(&args, &helper(dir.path()), "coreX")
            .expect("build");

        let root = builder.root();
        assert_eq!(
            fs::read_to_string(root.join("etc/motd")).expect("motd"),
            "hello\n"
        );
        assert!(root.join("srv/data").is_dir());
        assert!(root.join("coreX").is_file());

        let binds = mounter.binds.lock().expect("lock").clone();
        assert_eq!(binds.len(), 3);
        assert_eq!(binds[0].1, root.join("srv/data"));
        assert_eq!(binds[1].1, root.join("coreX"));
        assert!(binds[1].2, "helper is read-only");
        assert_eq!(binds[2], (root.to_path_buf(), builder.staging(), false));

        let guest = builder.guest_binds(&args, "coreX").expect("guest binds");
        assert_eq!(
            guest,
            vec![
                GuestBind {
                    source: root.join("srv/data"),
                    guest: "/srv/data".to_string(),
                    read_only: false,
                },
                GuestBind {
                    source: root.join("coreX"),
                    guest: "/coreX".to_string(),
                    read_only: true,
                },
            ]
        );
    }

    #[test]
    fn test_config_escape_is_rejected_and_cleaned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mounter = Arc::new(RecordingMounter::default());
        let builder = SandboxBuilder::new(2, dir.path().join("roots/2"), &caps(Arc::clone(&mounter), false));

        let args = ContainerArgs {
            root: "img://base".into(),
            config: BTreeMap::from([("/../../escape".into(), "x".into())]),
            ..ContainerArgs::default()
        };
        let err = builder
            .build(&args, &helper(dir.path()), "coreX")
            .expect_err("escape");
        assert!(matches!(err, SandboxError::PathEscape { .. }));
        assert!(!builder.root().exists());
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn test_image_failure_removes_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mounter = Arc::new(RecordingMounter::default());
        let builder = SandboxBuilder::new(3, dir.path().join("roots/3"), &caps(Arc::clone(&mounter), true));

        let args = ContainerArgs {
            root: "img://base".into(),
            ..ContainerArgs::default()
        };
        let err = builder
            .build(&args, &helper(dir.path()), "coreX")
            .expect_err("image");
        assert!(matches!(err, SandboxError::Filesystem(_)));
        assert!(!builder.root().exists());
    }

    #[test]
    fn test_cleanup_unmounts_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mounter = Arc::new(RecordingMounter::default());
        let builder = SandboxBuilder::new(4, dir.path().join("roots/4"), &caps(Arc::clone(&mounter), false));
        let args = ContainerArgs {
            root: "img://base".into(),
            host_network: true,
            ..ContainerArgs::default()
        };
        builder
            .build(&args, &helper(dir.path()), "coreX")
            .expect("build");
        assert!(!mounter.mounts_under(builder.root()).is_empty());

        assert!(builder.staging().is_dir());
        assert!(
            builder
                .guest_binds(&args, "coreX")
                .expect("guest binds")
                .iter()
                .any(|bind| bind.guest == HOST_RESOLV_CONF && bind.read_only)
        );

        builder.cleanup().expect("cleanup");
        assert!(mounter.mounts_under(builder.root()).is_empty());
        assert!(mounter.mounts_under(&builder.staging()).is_empty());
        assert!(!builder.root().exists());
        assert!(!builder.staging().exists());
    }
}
