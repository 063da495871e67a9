//! The sandbox aggregate: one pod-scoped microVM.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::agent::AgentClient;
use crate::vmm::VmmHandle;

use super::container::Container;
use super::vm_config::VmConfig;

/// Shared handle to a sandbox.
///
/// The mutex guards the mutable state; the VMM and agent handles inside are
/// `Arc`s so callers clone them out and drop the lock before awaiting.
pub type SandboxRef = Arc<Mutex<Sandbox>>;

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// VM is being created.
    Pending,
    /// VMM is running and the agent is reachable.
    Ready,
    /// VM has been stopped.
    Stopped,
}

impl SandboxState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SandboxState::Ready)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxState::Pending => "pending",
            SandboxState::Ready => "ready",
            SandboxState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A pod sandbox: the microVM hosting the pod's containers, plus everything
/// the host tracks about it.
#[derive(Debug)]
pub struct Sandbox {
    // Identity
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,

    // VM state
    pub state: SandboxState,
    pub vmm: Option<Arc<VmmHandle>>,
    pub vm_config: VmConfig,
    pub pid: u32,

    // Guest communication
    pub vsock_path: PathBuf,
    pub vsock_cid: u32,
    pub agent: Option<Arc<AgentClient>>,

    // Networking (populated by the external CNI step)
    pub netns_path: Option<String>,
    pub ip: Option<String>,
    pub gateway: Option<String>,

    // Storage
    pub rootfs_path: Option<PathBuf>,

    // Containers within this sandbox, keyed by id.
    pub containers: HashMap<String, Container>,

    // Lifecycle timestamps
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    // Pool bookkeeping
    pub pooled_at: Option<DateTime<Utc>>,
    pub from_pool: bool,
}

impl Sandbox {
    /// Create a new sandbox in `Pending` state.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            namespace: String::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            state: SandboxState::Pending,
            vmm: None,
            vm_config: VmConfig::default(),
            pid: 0,
            vsock_path: PathBuf::new(),
            vsock_cid: 0,
            agent: None,
            netns_path: None,
            ip: None,
            gateway: None,
            rootfs_path: None,
            containers: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            pooled_at: None,
            from_pool: false,
        }
    }

    /// Wrap into the shared handle form.
    pub fn into_ref(self) -> SandboxRef {
        Arc::new(Mutex::new(self))
    }

    pub fn add_container(&mut self, mut container: Container) {
        container.sandbox_id = self.id.clone();
        self.containers.insert(container.id.clone(), container);
    }

    pub fn container(&self, id: &str) -> Option<&Container> {
        self.containers.get(id)
    }

    pub fn remove_container(&mut self, id: &str) -> Option<Container> {
        self.containers.remove(id)
    }

    /// Drop all per-workload container state (pool recycling).
    pub fn clear_containers(&mut self) {
        self.containers.clear();
    }

    /// Wall-clock age since creation.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// Time spent sitting in the ready queue, if pooled.
    pub fn idle_time(&self) -> Option<chrono::Duration> {
        self.pooled_at.map(|t| Utc::now() - t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sandbox_is_pending() {
        let sb = Sandbox::new("sb-1");
        assert_eq!(sb.state, SandboxState::Pending);
        assert!(!sb.from_pool);
        assert!(sb.containers.is_empty());
        assert!(sb.pooled_at.is_none());
    }

    #[test]
    fn containers_are_keyed_and_owned() {
        let mut sb = Sandbox::new("sb-1");
        sb.add_container(Container::new("c-1"));
        assert_eq!(sb.container("c-1").unwrap().sandbox_id, "sb-1");

        let removed = sb.remove_container("c-1").unwrap();
        assert_eq!(removed.id, "c-1");
        assert!(sb.container("c-1").is_none());
    }

    #[test]
    fn clear_containers_resets_map() {
        let mut sb = Sandbox::new("sb-1");
        sb.add_container(Container::new("a"));
        sb.add_container(Container::new("b"));
        sb.clear_containers();
        assert!(sb.containers.is_empty());
    }

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(SandboxState::Pending.to_string(), "pending");
        assert_eq!(SandboxState::Ready.to_string(), "ready");
        assert_eq!(SandboxState::Stopped.to_string(), "stopped");
    }
}
