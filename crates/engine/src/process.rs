//! Subprocess helpers for modplay
//!
//! External tools are started in their own process group so that a timeout can
//! take down the tool together with anything it forked.

use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Longest stderr tail kept for debug logs
const STDERR_TAIL_BYTES: usize = 2048;

/// Error type for running an external tool
#[derive(Debug, Error)]
pub enum RunError {
    /// The binary could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for the process failed
    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process outlived its bound and was killed
    #[error("{program} timed out after {after:?}")]
    TimedOut { program: String, after: Duration },
}

/// Kills a whole process group when dropped, unless disarmed
pub struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    /// Guard the group led by `child`
    pub fn new(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    /// The process exited normally; nothing left to kill
    pub fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        kill_group(pgid);
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    // SAFETY: killpg only sends a signal; a stale group id yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        debug!(pgid, "Killed process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

/// Build a command that runs in a new process group and dies with its handle
pub fn group_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Run a command to completion
///
/// Dropping the returned future kills the whole process group. The exit status
/// is returned as-is; callers decide what counts as success.
pub async fn run(mut cmd: Command) -> Result<ExitStatus, RunError> {
    let program = program_name(&cmd);

    let child = cmd.spawn().map_err(|source| RunError::Spawn {
        program: program.clone(),
        source,
    })?;
    let mut guard = ProcessGroupGuard::new(&child);

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| RunError::Wait {
            program: program.clone(),
            source,
        })?;
    guard.disarm();

    if !output.status.success() {
        debug!(
            program = %program,
            status = %output.status,
            stderr = %stderr_tail(&output.stderr),
            "External tool exited unsuccessfully"
        );
    }
    Ok(output.status)
}

/// Run a command to completion within `timeout`
///
/// On timeout the process group is killed and `RunError::TimedOut` returned.
pub async fn run_with_timeout(cmd: Command, timeout: Duration) -> Result<ExitStatus, RunError> {
    let program = program_name(&cmd);
    match tokio::time::timeout(timeout, run(cmd)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(program = %program, timeout_secs = timeout.as_secs(), "External tool timed out, killing process group");
            Err(RunError::TimedOut {
                program,
                after: timeout,
            })
        }
    }
}

/// Run a command and capture its stdout, within `timeout`
pub async fn capture_stdout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<(ExitStatus, String), RunError> {
    cmd.stdout(Stdio::piped());
    let program = program_name(&cmd);

    let child = cmd.spawn().map_err(|source| RunError::Spawn {
        program: program.clone(),
        source,
    })?;
    let mut guard = ProcessGroupGuard::new(&child);

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            guard.disarm();
            Ok((
                output.status,
                String::from_utf8_lossy(&output.stdout).into_owned(),
            ))
        }
        Ok(Err(source)) => Err(RunError::Wait { program, source }),
        Err(_) => Err(RunError::TimedOut {
            program,
            after: timeout,
        }),
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_successful_command() {
        let mut cmd = group_command("sh");
        cmd.arg("-c").arg("exit 0");
        let status = run_with_timeout(cmd, Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let mut cmd = group_command("sh");
        cmd.arg("-c").arg("echo oops >&2; exit 3");
        let status = run_with_timeout(cmd, Duration::from_secs(5)).await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let mut cmd = group_command("sh");
        cmd.arg("-c").arg("sleep 30");
        let started = Instant::now();
        let result = run_with_timeout(cmd, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(RunError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let cmd = group_command("/nonexistent/modplay-test-binary");
        let result = run_with_timeout(cmd, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RunError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_capture_stdout() {
        let mut cmd = group_command("sh");
        cmd.arg("-c").arg("echo playername: Protracker");
        let (status, stdout) = capture_stdout(cmd, Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
        assert_eq!(stdout.trim(), "playername: Protracker");
    }

    #[test]
    fn test_stderr_tail_truncates() {
        let long = vec![b'x'; STDERR_TAIL_BYTES * 2];
        assert_eq!(stderr_tail(&long).len(), STDERR_TAIL_BYTES);
    }
}
