//! Host tool execution (`ip`, `udhcpc`, `zerotier-cli`, `restic`, ...).

use std::io::Write;
use std::process::{Child, Command, Stdio};

use tracing::{debug, trace};

use crate::error::CapabilityError;

/// Runs programs on the host on behalf of the agent.
pub trait HostExec: Send + Sync {
    /// Runs `program` to completion and returns its stdout.
    ///
    /// `stdin` is written to the child's standard input when given.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityError::CommandFailed` on a non-zero exit.
    fn run(&self, program: &str, args: &[&str], stdin: Option<&str>)
    -> Result<String, CapabilityError>;

    /// Starts a long-running `program` and hands back the child.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityError::IoError` if the program cannot be spawned.
    fn spawn(&self, program: &str, args: &[&str]) -> Result<Child, CapabilityError>;
}

/// [`HostExec`] backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExec;

impl HostExec for SystemExec {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String, CapabilityError> {
        trace!(program, ?args, "Running host command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CapabilityError::IoError {
                context: format!("failed to spawn {program}"),
                source: e,
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .map_err(|e| CapabilityError::IoError {
                    context: format!("failed to write stdin of {program}"),
                    source: e,
                })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| CapabilityError::IoError {
                context: format!("failed to wait for {program}"),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(program, code = ?output.status.code(), %stderr, "Host command failed");
            return Err(CapabilityError::CommandFailed {
                program: program.to_string(),
                args: args.join(" "),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn(&self, program: &str, args: &[&str]) -> Result<Child, CapabilityError> {
        debug!(program, ?args, "Spawning host daemon");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CapabilityError::IoError {
                context: format!("failed to spawn {program}"),
                source: e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let out = SystemExec
            .run("echo", &["hello"], None)
            .expect("echo should run");
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_run_feeds_stdin() {
        let out = SystemExec
            .run("cat", &[], Some("secret"))
            .expect("cat should run");
        assert_eq!(out, "secret");
    }

    #[test]
    fn test_run_reports_failure() {
        let err = SystemExec
            .run("sh", &["-c", "echo boom >&2; exit 3"], None)
            .expect_err("non-zero exit must fail");
        match err {
            CapabilityError::CommandFailed { program, stderr, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
