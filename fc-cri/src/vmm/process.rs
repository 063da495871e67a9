//! Spawning and stopping the Firecracker process.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use fc_cri_shared::{FcError, FcResult};
use tokio::process::{Child, Command};

use crate::util::process::kill_process;

/// How long to wait for the API socket to appear after spawn.
const API_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// A spawned VMM (or jailer) child process.
#[derive(Debug)]
pub struct VmmProcess {
    child: Child,
    pid: u32,
}

impl VmmProcess {
    /// Spawn `firecracker --api-sock <socket> --id <id>` and wait for the
    /// API socket to come up.
    pub async fn spawn(binary: &Path, api_socket: &Path, id: &str) -> FcResult<Self> {
        if !binary.exists() {
            return Err(FcError::FailedPrecondition(format!(
                "firecracker binary not found: {}",
                binary.display()
            )));
        }

        // A stale socket from a previous run makes the VMM refuse to bind.
        if api_socket.exists() {
            let _ = std::fs::remove_file(api_socket);
        }

        let mut args: Vec<OsString> = Vec::new();
        args.push("--api-sock".into());
        args.push(api_socket.into());
        args.push("--id".into());
        args.push(id.into());

        Self::spawn_with_args(binary, args, api_socket).await
    }

    /// Spawn an arbitrary VMM command line (used for jailed VMs, where the
    /// jailer binary re-execs Firecracker inside the chroot).
    pub async fn spawn_with_args(
        binary: &Path,
        args: Vec<OsString>,
        api_socket: &Path,
    ) -> FcResult<Self> {
        let mut cmd = Command::new(binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            FcError::Internal(format!("spawn vmm {}: {}", binary.display(), e))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| FcError::Internal("vmm exited before reporting a pid".into()))?;

        tracing::debug!(pid, binary = %binary.display(), "vmm process spawned");

        let process = Self { child, pid };
        wait_for_socket(api_socket, API_SOCKET_TIMEOUT).await?;
        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait up to `timeout` for the child to exit. Returns `true` if it did.
    pub async fn wait(&mut self, timeout: Duration) -> FcResult<bool> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                let status =
                    status.map_err(|e| FcError::Internal(format!("wait vmm: {}", e)))?;
                tracing::debug!(pid = self.pid, %status, "vmm process exited");
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// SIGKILL the child and reap it.
    pub async fn force_kill(&mut self) {
        kill_process(self.pid);
        let _ = self.child.wait().await;
    }
}

/// Poll for a Unix socket path to appear.
pub async fn wait_for_socket(path: &Path, timeout: Duration) -> FcResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !path.exists() {
        if tokio::time::Instant::now() >= deadline {
            return Err(FcError::Internal(format!(
                "vmm api socket {} did not appear within {:?}",
                path.display(),
                timeout
            )));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_failed_precondition() {
        let dir = tempfile::tempdir().unwrap();
        let err = VmmProcess::spawn(
            Path::new("/nonexistent/firecracker"),
            &dir.path().join("api.sock"),
            "sb-1",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FcError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn wait_for_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = wait_for_socket(&dir.path().join("never.sock"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not appear"));
    }

    #[tokio::test]
    async fn wait_for_socket_sees_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.sock");
        std::fs::File::create(&path).unwrap();
        wait_for_socket(&path, Duration::from_millis(50)).await.unwrap();
    }
}
