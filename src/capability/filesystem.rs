//! Filesystem collaborator: root images, extra layers and backup extraction.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, instrument};
use walkdir::WalkDir;

use super::HostExec;
use crate::error::CapabilityError;
use crate::sandbox::Mounter;

/// Prefix of sources served from a restic repository.
pub const RESTIC_SCHEME: &str = "restic:";

/// Mounts images into directories.
pub trait Filesystem: Send + Sync {
    /// Mounts a writable view of `source` at `target`; writes land in
    /// scratch state scoped by `namespace` and never reach the image.
    ///
    /// # Errors
    ///
    /// Fails if the source is unsupported or the mount fails.
    fn mount(
        &self,
        namespace: &str,
        storage: &str,
        source: &str,
        target: &Path,
    ) -> Result<(), CapabilityError>;

    /// Layers `source` read-only over the already mounted `target`.
    ///
    /// # Errors
    ///
    /// Fails if the source is unsupported or the mount fails.
    fn merge_layer(
        &self,
        namespace: &str,
        storage: &str,
        source: &str,
        target: &Path,
    ) -> Result<(), CapabilityError>;

    /// Removes the scratch state of `namespace` once its mounts are gone.
    ///
    /// # Errors
    ///
    /// Fails if the scratch directory cannot be removed.
    fn release(&self, namespace: &str) -> Result<(), CapabilityError>;

    /// Extracts file `name` of the latest snapshot in `url` into `target/name`.
    ///
    /// # Errors
    ///
    /// Fails if the repository cannot be read or holds no such file.
    fn restore_backup(&self, url: &str, target: &Path, name: &str) -> Result<(), CapabilityError>;
}

/// A restic repository reference parsed from a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResticRepo {
    /// Repository argument for `restic -r`.
    pub repo: String,
    /// Password from the `password` query parameter.
    pub password: String,
}

impl ResticRepo {
    /// Parses `file:///path?password=x`, a bare path, or any other restic URL.
    #[must_use]
    pub fn parse(url: &str) -> Self {
        let url = url.split('#').next().unwrap_or_default();
        let (base, query) = url.split_once('?').unwrap_or((url, ""));
        let password = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("password="))
            .unwrap_or_default()
            .to_string();
        let repo = base.strip_prefix("file://").unwrap_or(base).to_string();
        Self { repo, password }
    }
}

/// [`Filesystem`] serving local directories and restic snapshots.
///
/// Sources are `file://<dir>`, an absolute directory, or `restic:<url>`.
pub struct LocalFilesystem {
    mounter: Arc<dyn Mounter>,
    exec: Arc<dyn HostExec>,
    scratch: PathBuf,
    slots: AtomicU32,
}

impl LocalFilesystem {
    /// Creates a filesystem keeping overlay scratch space under `scratch`.
    #[must_use]
    pub fn new(mounter: Arc<dyn Mounter>, exec: Arc<dyn HostExec>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            mounter,
            exec,
            scratch: scratch.into(),
            slots: AtomicU32::new(0),
        }
    }

    fn local_dir(source: &str) -> Result<PathBuf, CapabilityError> {
        let path = source.strip_prefix("file://").unwrap_or(source);
        if !path.starts_with('/') {
            return Err(CapabilityError::Failed {
                capability: "filesystem",
                reason: format!("unsupported source '{source}'"),
            });
        }
        let path = PathBuf::from(path);
        if !path.is_dir() {
            return Err(CapabilityError::Failed {
                capability: "filesystem",
                reason: format!("source directory '{}' does not exist", path.display()),
            });
        }
        Ok(path)
    }

    /// Fresh `upper` and `work` directories under the scratch space of `namespace`.
    fn scratch_dirs(&self, namespace: &str, kind: &str) -> Result<(PathBuf, PathBuf), CapabilityError> {
        let seq = self.slots.fetch_add(1, Ordering::SeqCst);
        let scratch = self.scratch.join(namespace).join(format!("{kind}-{seq}"));
        let upper = scratch.join("upper");
        let work = scratch.join("work");
        for dir in [&upper, &work] {
            fs::create_dir_all(dir).map_err(|e| CapabilityError::IoError {
                context: format!("failed to create {}", dir.display()),
                source: e,
            })?;
        }
        Ok((upper, work))
    }

    fn restic(&self, repo: &ResticRepo, args: &[&str]) -> Result<String, CapabilityError> {
        let mut full = vec!["-r", repo.repo.as_str()];
        full.extend_from_slice(args);
        self.exec.run("restic", &full, Some(&repo.password))
    }
}

impl Filesystem for LocalFilesystem {
    #[instrument(skip(self), fields(target = %target.display()))]
    fn mount(
        &self,
        namespace: &str,
        _storage: &str,
        source: &str,
        target: &Path,
    ) -> Result<(), CapabilityError> {
        fs::create_dir_all(target).map_err(|e| CapabilityError::IoError {
            context: format!("failed to create {}", target.display()),
            source: e,
        })?;

        if let Some(url) = source.strip_prefix(RESTIC_SCHEME) {
            let repo = ResticRepo::parse(url);
            let target_str = target.to_string_lossy();
            self.restic(&repo, &["restore", "latest", "--target", &target_str])?;
            debug!(namespace, "Restored snapshot into root");
            return Ok(());
        }

        let dir = Self::local_dir(source)?;
        let (upper, work) = self.scratch_dirs(namespace, "mount")?;
        self.mounter
            .overlay(&[dir], &upper, &work, target)
            .map_err(|e| CapabilityError::Failed {
                capability: "filesystem",
                reason: e.to_string(),
            })?;
        debug!(namespace, upper = %upper.display(), "Image mounted copy-on-write");
        Ok(())
    }

    #[instrument(skip(self), fields(target = %target.display()))]
    fn merge_layer(
        &self,
        namespace: &str,
        _storage: &str,
        source: &str,
        target: &Path,
    ) -> Result<(), CapabilityError> {
        let layer = Self::local_dir(source)?;
        let (upper, work) = self.scratch_dirs(namespace, "layer")?;

        self.mounter
            .overlay(&[layer, target.to_path_buf()], &upper, &work, target)
            .map_err(|e| CapabilityError::Failed {
                capability: "filesystem",
                reason: e.to_string(),
            })
    }

    fn release(&self, namespace: &str) -> Result<(), CapabilityError> {
        let dir = self.scratch.join(namespace);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "Scratch space removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapabilityError::IoError {
                context: format!("failed to remove {}", dir.display()),
                source: e,
            }),
        }
    }

    #[instrument(skip(self, url), fields(target = %target.display()))]
    fn restore_backup(&self, url: &str, target: &Path, name: &str) -> Result<(), CapabilityError> {
        let repo = ResticRepo::parse(url);
        let target_str = target.to_string_lossy();
        let include = format!("**/{name}");
        self.restic(
            &repo,
            &["restore", "latest", "--target", &target_str, "--include", &include],
        )?;

        // snapshots keep absolute paths; lift the file to the top of target
        let found = WalkDir::new(target)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .find(|entry| entry.file_type().is_file() && entry.file_name() == name)
            .map(walkdir::DirEntry::into_path)
            .ok_or_else(|| CapabilityError::Failed {
                capability: "filesystem",
                reason: format!("snapshot has no {name}"),
            })?;

        let dest = target.join(name);
        if found != dest {
            fs::copy(&found, &dest).map_err(|e| CapabilityError::IoError {
                context: format!("failed to copy {}", found.display()),
                source: e,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::capability::SystemExec;
    use crate::error::MountError;

    #[derive(Default)]
    struct Overlays {
        mounts: Mutex<Vec<(Vec<PathBuf>, PathBuf, PathBuf)>>,
        binds: Mutex<usize>,
    }

    impl Mounter for Overlays {
        fn bind(&self, _source: &Path, _target: &Path, _read_only: bool) -> Result<(), MountError> {
            *self.binds.lock().expect("lock") += 1;
            Ok(())
        }

        fn overlay(
            &self,
            lower: &[PathBuf],
            upper: &Path,
            _work: &Path,
            target: &Path,
        ) -> Result<(), MountError> {
            self.mounts.lock().expect("lock").push((
                lower.to_vec(),
                upper.to_path_buf(),
                target.to_path_buf(),
            ));
            Ok(())
        }

        fn unmount(&self, _target: &Path) -> Result<(), MountError> {
            Ok(())
        }

        fn mounts_under(&self, _root: &Path) -> Vec<PathBuf> {
            Vec::new()
        }
    }

    #[test]
    fn test_containers_get_private_upper_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("image");
        fs::create_dir_all(&image).expect("image");
        let scratch = dir.path().join("scratch");
        let mounter = Arc::new(Overlays::default());
        let filesystem = LocalFilesystem::new(
            Arc::clone(&mounter) as Arc<dyn Mounter>,
            Arc::new(SystemExec),
            &scratch,
        );

        let source = format!("file://{}", image.display());
        for id in [1, 2] {
            let target = dir.path().join(format!("roots/{id}"));
            filesystem
                .mount(&format!("containers/{id}"), "", &source, &target)
                .expect("mount");
        }

        let mounts = mounter.mounts.lock().expect("lock").clone();
        assert_eq!(*mounter.binds.lock().expect("lock"), 0);
        assert_eq!(mounts.len(), 2);
        for (index, (lower, upper, target)) in mounts.iter().enumerate() {
            let id = index + 1;
            assert_eq!(lower, &vec![image.clone()]);
            assert!(upper.starts_with(scratch.join(format!("containers/{id}"))));
            assert!(upper.is_dir());
            assert_eq!(target, &dir.path().join(format!("roots/{id}")));
        }

        filesystem.release("containers/1").expect("release");
        assert!(!scratch.join("containers/1").exists());
        assert!(scratch.join("containers/2").exists());
        filesystem.release("containers/1").expect("release twice");
    }

    #[test]
    fn test_parse_file_url() {
        let repo = ResticRepo::parse("file:///srv/backups?password=s3cret#frag");
        assert_eq!(repo.repo, "/srv/backups");
        assert_eq!(repo.password, "s3cret");
    }

    #[test]
    fn test_parse_bare_path() {
        let repo = ResticRepo::parse("/srv/backups");
        assert_eq!(repo.repo, "/srv/backups");
        assert!(repo.password.is_empty());
    }

    #[test]
    fn test_parse_remote_url_drops_query() {
        let repo = ResticRepo::parse("s3:https://host/bucket?password=p");
        assert_eq!(repo.repo, "s3:https://host/bucket");
        assert_eq!(repo.password, "p");
    }

    #[test]
    fn test_local_dir_rejects_unknown_scheme() {
        assert!(LocalFilesystem::local_dir("ipfs://abc").is_err());
        assert!(LocalFilesystem::local_dir("/definitely/not/here").is_err());
    }
}
