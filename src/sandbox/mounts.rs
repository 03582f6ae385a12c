//! Bind, overlay and teardown mounts under a container root.
//!
//! The agent performs these mounts in its own (host) mount namespace before the
//! isolated process starts. The builder binds the populated root recursively at
//! a staging path, which the launcher uses as the new root; since hakoniwa
//! rebinds that root without `MS_REC`, the launcher binds the declared mounts
//! and the helper again inside the new namespace.
//!
//! Teardown reads the live mount table and unmounts everything at or below a
//! root, deepest path first, so a parent is never detached before its children.

use std::fs::{self, OpenOptions};
use std::path::{Component, Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::{debug, instrument, trace, warn};

use crate::error::MountError;

/// Performs mount operations on behalf of the Sandbox Builder and the Network Attacher.
pub trait Mounter: Send + Sync {
    /// Bind-mounts `source` onto `target`, optionally read-only.
    ///
    /// # Errors
    ///
    /// Returns `MountError::BindMount` if the mount fails.
    fn bind(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), MountError>;

    /// Mounts an overlay of `lower` (first entry on top) with a writable `upper` at `target`.
    ///
    /// # Errors
    ///
    /// Returns `MountError::OverlayMount` if the mount fails.
    fn overlay(
        &self,
        lower: &[PathBuf],
        upper: &Path,
        work: &Path,
        target: &Path,
    ) -> Result<(), MountError>;

    /// Unmounts `target`.
    ///
    /// # Errors
    ///
    /// Returns `MountError::Unmount` if both normal and lazy unmount fail.
    fn unmount(&self, target: &Path) -> Result<(), MountError>;

    /// Every mount point equal to `root` or below it.
    fn mounts_under(&self, root: &Path) -> Vec<PathBuf>;
}

/// [`Mounter`] issuing real `mount(2)` calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMounter;

impl Mounter for HostMounter {
    #[instrument(skip_all, fields(source = %source.display(), target = %target.display(), read_only))]
    fn bind(&self, source: &Path, target: &Path, read_only: bool) -> Result<(), MountError> {
        trace!("Creating bind mount");
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| MountError::BindMount(format!("{}: {e}", source.display())))?;

        if read_only {
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| MountError::BindMount(format!("remount read-only failed: {e}")))?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(target = %target.display()))]
    fn overlay(
        &self,
        lower: &[PathBuf],
        upper: &Path,
        work: &Path,
        target: &Path,
    ) -> Result<(), MountError> {
        let lower_str = lower
            .iter()
            .filter(|p| p.exists())
            .map(|p| p.to_string_lossy())
            .collect::<Vec<_>>()
            .join(":");

        if lower_str.is_empty() {
            return Err(MountError::OverlayMount(
                "no valid lower directories found".to_string(),
            ));
        }

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower_str,
            upper.display(),
            work.display()
        );
        trace!(options = %options, "OverlayFS mount options");

        mount(
            Some("overlay"),
            target,
            Some("overlay"),
            MsFlags::MS_NODEV,
            Some(options.as_str()),
        )
        .map_err(|e| MountError::OverlayMount(format!("mount failed: {e}")))?;

        debug!("Overlay mounted");
        Ok(())
    }

    #[instrument(skip_all, fields(target = %target.display()))]
    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        match umount2(target, MntFlags::empty()) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Normal unmount failed, trying lazy unmount");
                umount2(target, MntFlags::MNT_DETACH)
                    .map_err(|e| MountError::Unmount(format!("{}: {e}", target.display())))
            }
        }
    }

    fn mounts_under(&self, root: &Path) -> Vec<PathBuf> {
        match fs::read_to_string("/proc/mounts") {
            Ok(table) => parse_mount_table(&table, root),
            Err(e) => {
                warn!(error = %e, "Failed to read /proc/mounts");
                Vec::new()
            }
        }
    }
}

/// Extracts mount points at or below `root` from a `/proc/mounts` table.
pub(crate) fn parse_mount_table(table: &str, root: &Path) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .filter(|target| target.starts_with(root))
        .collect()
}

/// Decodes the octal escapes (`\040` for space, ...) used in the mount table.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Unmounts everything at or below `root`, deepest path first.
///
/// Continues on errors to release as much as possible and returns the first error.
///
/// # Errors
///
/// Returns the first `MountError::Unmount` encountered.
#[instrument(skip(mounter), fields(root = %root.display()))]
pub fn unmount_all(mounter: &dyn Mounter, root: &Path) -> Result<(), MountError> {
    let mut targets = mounter.mounts_under(root);
    targets.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    targets.dedup();
    debug!(count = targets.len(), "Unmounting sandbox mounts");

    let mut first_error: Option<MountError> = None;
    for target in &targets {
        if let Err(e) = mounter.unmount(target) {
            warn!(target = %target.display(), error = %e, "Failed to unmount");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Creates the mount point for `source` at `target`: a directory for a
/// directory source, an empty file otherwise.
///
/// # Errors
///
/// Returns `MountError::Target` if the mount point cannot be created.
pub fn ensure_mount_point(source: &Path, target: &Path) -> Result<(), MountError> {
    let result = if source.is_dir() {
        fs::create_dir_all(target)
    } else {
        let parent = target.parent().map(fs::create_dir_all).transpose();
        parent.and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(target)
                .map(|_| ())
        })
    };
    result.map_err(|e| MountError::Target {
        path: target.to_path_buf(),
        source: e,
    })
}

/// Joins a guest path onto `root`, resolving `.` and `..` lexically.
///
/// Returns `None` if the path would leave `root`.
#[must_use]
pub fn guest_path(root: &Path, guest: &str) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(guest).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Prefix(_) => return None,
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(part) => parts.push(part),
        }
    }
    let mut path = root.to_path_buf();
    path.extend(parts);
    Some(path)
}
