//! Core data model: sandboxes, containers, and VM configuration.
//!
//! A [`Sandbox`] is a pod-scoped microVM together with its runtime state;
//! exactly one is owned by each shim process. Sandboxes are shared as
//! [`SandboxRef`] (`Arc<Mutex<_>>`); lock scopes stay short and are never
//! held across an `.await` - async handles are `Arc`s cloned out first.

mod container;
mod sandbox;
mod vm_config;

pub use container::{Container, ContainerState, Mount, ResourceLimits};
pub use sandbox::{Sandbox, SandboxRef, SandboxState};
pub use vm_config::{
    AttachedDrive, CacheType, CniSpec, DriveRateLimit, DriveSpec, HotplugConfig, JailerSpec,
    NetworkMode, VmConfig, VolumeKind, VolumeSpec,
};

/// Generate a new sandbox id (ULID: sortable, 26 chars).
pub fn generate_sandbox_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Point-in-time view of the VM pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Ready sandboxes waiting in the queue.
    pub available: usize,
    /// Sandboxes currently handed out.
    pub in_use: usize,
    /// Queue capacity.
    pub max_size: usize,
    /// Total `acquire` calls served.
    pub total_served: u64,
    /// Acquires satisfied from the ready queue.
    pub hits: u64,
    /// Acquires that fell through to restore or fresh boot.
    pub misses: u64,
}
