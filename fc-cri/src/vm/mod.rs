//! VM lifecycle: manager, pool, snapshots, drive hotplug, jailer.
//!
//! The pool depends on the [`VmLifecycle`] and [`SnapshotRestore`] traits
//! rather than on the concrete manager, so its contracts are testable
//! without a Firecracker binary on the host.

pub mod hotplug;
pub mod jailer;
pub mod manager;
pub mod pool;
pub mod snapshot;

use async_trait::async_trait;
use fc_cri_shared::FcResult;

use crate::domain::{SandboxRef, VmConfig};

pub use hotplug::HotplugManager;
pub use jailer::JailerManager;
pub use manager::{ManagerConfig, VmManager};
pub use pool::Pool;
pub use snapshot::{Snapshot, SnapshotManager};

/// Lifecycle operations on Firecracker-backed sandboxes.
#[async_trait]
pub trait VmLifecycle: Send + Sync {
    /// Create and boot a new VM; the returned sandbox is `Ready`.
    async fn create_vm(&self, config: VmConfig) -> FcResult<SandboxRef>;

    /// Gracefully stop a VM, escalating to force-stop after the shutdown
    /// window. Idempotent on already-stopped sandboxes.
    async fn stop_vm(&self, sandbox: &SandboxRef) -> FcResult<()>;

    /// Terminate a VM and remove all per-sandbox runtime state. Idempotent;
    /// unknown sandboxes are a no-op.
    async fn destroy_vm(&self, sandbox: &SandboxRef) -> FcResult<()>;

    /// Suspend vCPU execution.
    async fn pause_vm(&self, sandbox: &SandboxRef) -> FcResult<()>;

    /// Resume a paused VM.
    async fn resume_vm(&self, sandbox: &SandboxRef) -> FcResult<()>;
}

/// Fast sandbox acquisition from a golden snapshot.
#[async_trait]
pub trait SnapshotRestore: Send + Sync {
    /// Whether a golden snapshot is currently available.
    fn has_golden(&self) -> bool;

    /// Restore a fresh `Ready` sandbox from the golden snapshot.
    async fn restore_from_golden(&self) -> FcResult<SandboxRef>;
}
