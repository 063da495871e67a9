//! Task request/response types.
//!
//! Owned mirrors of the containerd v2 task surface; the embedding shim
//! binary converts between these and the ttrpc protobufs.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Status of a process as reported to containerd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub task_id: String,
    pub bundle: String,
    /// Host paths of the prepared rootfs images; the first one becomes the
    /// root drive.
    pub rootfs: Vec<PathBuf>,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CreateTaskResponse {
    /// The VMM pid; the workload pid lives inside the guest.
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub task_id: String,
    /// Empty for the init process.
    pub exec_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct StartResponse {
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct StateRequest {
    pub task_id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone)]
pub struct StateResponse {
    pub id: String,
    pub bundle: String,
    pub pid: u32,
    pub status: TaskStatus,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct KillRequest {
    pub task_id: String,
    pub exec_id: String,
    pub signal: u32,
    pub all: bool,
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub task_id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone)]
pub struct DeleteResponse {
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct WaitRequest {
    pub task_id: String,
    pub exec_id: String,
}

#[derive(Debug, Clone)]
pub struct WaitResponse {
    pub exit_status: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StatsRequest {
    pub task_id: String,
}

/// Aggregated guest-side resource usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsResponse {
    pub cpu_usage_ns: u64,
    pub memory_usage_bytes: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectResponse {
    pub shim_pid: u32,
    /// The VMM pid, 0 before a sandbox exists.
    pub task_pid: u32,
    pub version: &'static str,
}

#[derive(Debug, Clone)]
pub struct PidsResponse {
    pub pids: Vec<u32>,
}
