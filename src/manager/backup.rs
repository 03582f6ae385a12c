//! Container backup into restic repositories and restore from them.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use nix::sys::signal::Signal;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::capability::{Filesystem, HostExec, RESTIC_SCHEME, ResticRepo};
use crate::container::{Container, ContainerArgs, NicState};
use crate::error::{CapabilityError, ManagerError};

/// File holding the declared arguments inside a backed up root.
pub const META_FILE: &str = ".corex.meta";

/// Root entries never backed up, relative to the root.
const EXCLUDES: &[&str] = &["proc/**", "dev/**", "sys/**"];

static SNAPSHOT: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"snapshot ([^\s]+) saved").unwrap()
});

fn io_error(context: String) -> impl FnOnce(std::io::Error) -> ManagerError {
    move |source| ManagerError::IoError { context, source }
}

/// Writes `args` to `<root>/.corex.meta`, read-only for the owner.
fn write_meta(root: &Path, args: &ContainerArgs) -> Result<PathBuf, ManagerError> {
    let path = root.join(META_FILE);
    if path.exists() {
        fs::remove_file(&path).map_err(io_error(format!("failed to remove {}", path.display())))?;
    }
    let content = serde_json::to_vec(args)
        .map_err(|e| ManagerError::Backup(format!("failed to encode arguments: {e}")))?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(&path)
        .map_err(io_error(format!("failed to create {}", path.display())))?;
    file.write_all(&content)
        .map_err(io_error(format!("failed to write {}", path.display())))?;
    Ok(path)
}

/// Top-level entries of `root` except the helper placeholder.
fn backup_sources(root: &Path, helper_name: &str) -> Result<Vec<String>, ManagerError> {
    let mut sources: Vec<String> = fs::read_dir(root)
        .map_err(io_error(format!("failed to list {}", root.display())))?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name() != helper_name)
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .collect();
    sources.sort();
    Ok(sources)
}

/// Snapshot id from restic's `backup` output.
#[must_use]
pub fn snapshot_id(output: &str) -> Option<&str> {
    SNAPSHOT
        .captures(output)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str())
}

/// Backs up the root of `container` into the restic repository `url`.
///
/// The helper's process group is stopped for the duration of the run.
///
/// # Errors
///
/// Returns `ManagerError::PreconditionFailed` if the helper is not running,
/// `ManagerError::Backup` if restic fails or prints no snapshot id.
#[instrument(skip(container, exec, url), fields(id = container.id()))]
pub fn backup(
    container: &Container,
    exec: &dyn HostExec,
    helper_name: &str,
    url: &str,
    tags: &[String],
) -> Result<String, ManagerError> {
    if container.pid() == 0 {
        return Err(ManagerError::PreconditionFailed(
            "container is not fully started yet".to_string(),
        ));
    }

    let mut args = container.arguments()?;
    args.nics.retain(|nic| nic.state == NicState::Configured);
    let root = container.paths().root.clone();
    let meta = write_meta(&root, &args)?;

    let outcome = run_backup(container, exec, &root, helper_name, url, &args.tags, tags);

    if let Err(e) = fs::remove_file(&meta) {
        warn!(error = %e, "Failed to remove backup meta file");
    }
    outcome
}

fn run_backup(
    container: &Container,
    exec: &dyn HostExec,
    root: &Path,
    helper_name: &str,
    url: &str,
    container_tags: &[String],
    tags: &[String],
) -> Result<String, ManagerError> {
    let sources = backup_sources(root, helper_name)?;
    if sources.is_empty() {
        return Err(ManagerError::Backup("nothing to backup".to_string()));
    }

    let repo = ResticRepo::parse(url);
    let excludes: Vec<String> = EXCLUDES
        .iter()
        .map(|pattern| root.join(pattern).to_string_lossy().into_owned())
        .collect();

    let mut cmd: Vec<&str> = vec!["-r", &repo.repo, "backup"];
    for exclude in &excludes {
        cmd.extend(["--exclude", exclude.as_str()]);
    }
    for tag in container_tags.iter().chain(tags) {
        cmd.extend(["--tag", tag.as_str()]);
    }
    cmd.extend(sources.iter().map(String::as_str));

    container.signal_group(Signal::SIGSTOP)?;
    debug!(sources = sources.len(), "Container paused for backup");
    let output = exec.run("restic", &cmd, Some(&repo.password));
    if let Err(e) = container.signal_group(Signal::SIGCONT) {
        warn!(error = %e, "Failed to resume container after backup");
    }

    let output = output.map_err(|e| match e {
        CapabilityError::CommandFailed { stderr, .. } => {
            ManagerError::Backup(format!("failed to backup container: {stderr}"))
        }
        other => ManagerError::Backup(format!("failed to backup container: {other}")),
    })?;

    let snapshot = snapshot_id(&output)
        .ok_or_else(|| ManagerError::Backup("failed to retrieve snapshot ID".to_string()))?;
    info!(snapshot, "Container backed up");
    Ok(snapshot.to_string())
}

/// Loads the arguments stored in the latest snapshot of `url`.
///
/// `root` is rewritten to `restic:<url>` and, when `tags` is given, the
/// stored tags are replaced.
///
/// # Errors
///
/// Returns the filesystem collaborator's error, or `ManagerError::Backup` if
/// the stored arguments are unreadable.
#[instrument(skip(filesystem, url, scratch))]
pub fn restore_arguments(
    filesystem: &dyn Filesystem,
    scratch: &Path,
    url: &str,
    tags: Option<Vec<String>>,
) -> Result<ContainerArgs, ManagerError> {
    fs::create_dir_all(scratch).map_err(io_error(format!("failed to create {}", scratch.display())))?;
    let loaded = load_meta(filesystem, scratch, url);
    if let Err(e) = fs::remove_dir_all(scratch) {
        warn!(error = %e, "Failed to remove restore scratch directory");
    }

    let mut args = loaded?;
    args.root = format!("{RESTIC_SCHEME}{url}");
    if let Some(tags) = tags {
        args.tags = tags;
    }
    Ok(args)
}

fn load_meta(filesystem: &dyn Filesystem, scratch: &Path, url: &str) -> Result<ContainerArgs, ManagerError> {
    filesystem.restore_backup(url, scratch, META_FILE)?;
    let path = scratch.join(META_FILE);
    let content = fs::read(&path).map_err(io_error(format!("failed to read {}", path.display())))?;
    serde_json::from_slice(&content)
        .map_err(|e| ManagerError::Backup(format!("invalid backup metadata: {e}")))
}
