//! Firecracker VMM integration: process control and the REST API.
//!
//! A [`VmmHandle`] bundles what a sandbox holds onto for its VMM: the API
//! client bound to the instance's Unix socket, the child process (when we
//! spawned it directly rather than through a daemonizing jailer), and the
//! pid for force-stop.

pub mod client;
pub mod models;
pub mod process;

use std::time::Duration;

use fc_cri_shared::FcResult;

pub use client::VmmApiClient;
pub use process::VmmProcess;

use crate::util::process::{is_process_alive, kill_process};

/// Handle to a running VMM instance.
#[derive(Debug)]
pub struct VmmHandle {
    pid: u32,
    api: VmmApiClient,
    process: tokio::sync::Mutex<Option<VmmProcess>>,
}

impl VmmHandle {
    pub fn new(api: VmmApiClient, process: Option<VmmProcess>, pid: u32) -> Self {
        Self {
            pid,
            api,
            process: tokio::sync::Mutex::new(process),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn api(&self) -> &VmmApiClient {
        &self.api
    }

    /// Wait up to `timeout` for the VMM process to exit; escalate to SIGKILL
    /// on expiry. Callers issue the graceful shutdown action beforehand.
    pub async fn wait_exit_or_kill(&self, timeout: Duration) -> FcResult<()> {
        let mut guard = self.process.lock().await;
        match guard.as_mut() {
            Some(process) => {
                if !process.wait(timeout).await? {
                    tracing::warn!(pid = self.pid, "graceful shutdown timed out, sending SIGKILL");
                    process.force_kill().await;
                }
                Ok(())
            }
            None => {
                // Daemonized jailer: we only hold the pid.
                let deadline = tokio::time::Instant::now() + timeout;
                while is_process_alive(self.pid) {
                    if tokio::time::Instant::now() >= deadline {
                        tracing::warn!(pid = self.pid, "graceful shutdown timed out, sending SIGKILL");
                        kill_process(self.pid);
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Ok(())
            }
        }
    }

    /// SIGKILL the VMM unconditionally.
    pub async fn force_kill(&self) {
        let mut guard = self.process.lock().await;
        match guard.as_mut() {
            Some(process) => process.force_kill().await,
            None => {
                kill_process(self.pid);
            }
        }
    }
}
