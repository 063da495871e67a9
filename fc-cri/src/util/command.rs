//! External command execution.
//!
//! All shelling out in the runtime (`mkfs.ext4`, `mount`, `umount`, `cp`)
//! goes through [`run_command`]: args, captured output, and a hard deadline.
//! Non-zero exit maps to `Internal` carrying the tail of stderr.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use fc_cri_shared::{FcError, FcResult};
use tokio::process::Command;

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args`, capturing output, failing on non-zero exit or
/// on `timeout` elapsing (the child is killed on timeout).
pub async fn run_command<I, S>(
    program: impl AsRef<OsStr>,
    args: I,
    timeout: Duration,
) -> FcResult<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let program_display = program.to_string_lossy().to_string();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::trace!(command = %program_display, "exec");

    let child = cmd
        .spawn()
        .map_err(|e| FcError::Internal(format!("spawn {}: {}", program_display, e)))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => {
            result.map_err(|e| FcError::Internal(format!("wait {}: {}", program_display, e)))?
        }
        Err(_) => {
            return Err(FcError::DeadlineExceeded(format!(
                "{} did not finish within {:?}",
                program_display, timeout
            )))
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(FcError::Internal(format!(
            "{} exited with {}: {}",
            program_display,
            output.status,
            tail(&stderr, 1024)
        )));
    }

    Ok(CommandOutput { stdout, stderr })
}

// Trailing bytes only, to keep pathological stderr out of error messages.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s.trim_end();
    }
    let start = s.len() - max;
    // Stay on a char boundary.
    let start = (start..s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(start);
    s[start..].trim_end()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run_command("echo", ["hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_internal_with_stderr() {
        let err = run_command("sh", ["-c", "echo nope >&2; exit 3"], Duration::from_secs(5))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nope"), "missing stderr in: {msg}");
        assert!(msg.starts_with("internal"));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports_deadline() {
        let err = run_command("sleep", ["5"], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FcError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_internal() {
        let err = run_command("/does/not/exist", ["x"], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FcError::Internal(_)));
    }

    #[test]
    fn tail_truncates_long_output() {
        let long = "x".repeat(4096);
        assert_eq!(tail(&long, 1024).len(), 1024);
        assert_eq!(tail("short", 1024), "short");
    }
}
