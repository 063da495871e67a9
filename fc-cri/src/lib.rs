//! fc-cri - Firecracker-backed container runtime core.
//!
//! Each Kubernetes pod sandbox runs inside a dedicated Firecracker microVM.
//! The embedding containerd v2 shim binary owns one [`shim::TaskService`] per
//! sandbox; the service acquires a VM from the [`vm::Pool`] (pre-warmed, or
//! restored from a golden snapshot, or cold-booted), connects the
//! [`agent::AgentClient`] over vsock, and drives the in-guest agent through
//! the container lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! containerd -> (ttrpc, external) -> shim::TaskService
//!     -> vm::Pool -> vm::VmManager -> vmm::VmmProcess + vmm::VmmApiClient
//!     -> agent::AgentClient -> vsock -> guest agent -> runc -> container
//! ```
//!
//! The containerd transport, CNI invocation, and image-to-ext4 conversion
//! are external collaborators; this crate is the core between them.

pub mod agent;
pub mod config;
pub mod domain;
pub mod layout;
pub mod metrics;
pub mod shim;
pub mod util;
pub mod vm;
pub mod vmm;
pub mod volumes;

pub use config::Config;
pub use fc_cri_shared::{FcError, FcResult};
