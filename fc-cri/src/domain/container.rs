//! Containers and their configuration within a sandbox.

use chrono::{DateTime, Utc};

/// Lifecycle state of a container inside a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// A workload process group created inside a sandbox by the guest agent.
///
/// In v1 a sandbox holds at most one init container; exec processes are
/// tracked by the shim, not here.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub sandbox_id: String,
    pub name: String,
    pub image: String,

    pub state: ContainerState,
    /// Process id inside the guest.
    pub pid: u32,
    pub exit_code: i32,

    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub mounts: Vec<Mount>,
    pub resources: ResourceLimits,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Container {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sandbox_id: String::new(),
            name: String::new(),
            image: String::new(),
            state: ContainerState::Created,
            pid: 0,
            exit_code: 0,
            command: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: String::new(),
            mounts: Vec::new(),
            resources: ResourceLimits::default(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Mark the container running with its guest-side pid.
    pub fn set_running(&mut self, pid: u32) {
        self.state = ContainerState::Running;
        self.pid = pid;
        self.started_at = Some(Utc::now());
    }

    /// Mark the container exited.
    pub fn set_exited(&mut self, exit_code: i32) {
        self.state = ContainerState::Exited;
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
    }
}

/// A filesystem mount inside a container.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Mount {
    pub source: String,
    pub destination: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    pub options: Vec<String>,
    pub read_only: bool,
}

/// Resource limits applied to a container by the guest.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    pub cpu_shares: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub memory_limit_mb: i64,
    pub oom_score_adj: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_starts_created() {
        let c = Container::new("c-1");
        assert_eq!(c.state, ContainerState::Created);
        assert_eq!(c.pid, 0);
        assert!(c.started_at.is_none());
    }

    #[test]
    fn running_then_exited_transitions() {
        let mut c = Container::new("c-1");
        c.set_running(42);
        assert_eq!(c.state, ContainerState::Running);
        assert_eq!(c.pid, 42);
        assert!(c.started_at.is_some());

        c.set_exited(137);
        assert_eq!(c.state, ContainerState::Exited);
        assert_eq!(c.exit_code, 137);
        assert!(c.finished_at.is_some());
    }
}
