//! VM configuration value objects and drive/volume descriptors.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fc_cri_shared::constants::{drives, DEFAULT_KERNEL_ARGS};

/// Configuration for creating a Firecracker VM. Immutable once built; a
/// sandbox stores the config it was booted (or customized) with.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VmConfig {
    // Compute
    pub vcpu_count: u64,
    pub memory_mib: u64,
    pub smt: bool,

    // Boot
    pub kernel_path: PathBuf,
    pub kernel_args: String,
    pub initrd_path: Option<PathBuf>,

    // Storage
    pub root_drive: Option<DriveSpec>,

    // Network
    pub network_mode: NetworkMode,
    pub cni: Option<CniSpec>,

    // Guest communication
    pub vsock_enabled: bool,
    /// Assigned at VM creation; 0 means not yet allocated.
    pub vsock_cid: u32,

    // Isolation
    pub jailer: Option<JailerSpec>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 1,
            memory_mib: 128,
            smt: false,
            kernel_path: PathBuf::new(),
            kernel_args: DEFAULT_KERNEL_ARGS.to_string(),
            initrd_path: None,
            root_drive: None,
            network_mode: NetworkMode::Cni,
            cni: None,
            vsock_enabled: true,
            vsock_cid: 0,
            jailer: None,
        }
    }
}

/// How the sandbox gets networked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Cni,
    None,
}

/// CNI parameters handed to the external network setup call.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CniSpec {
    pub network_name: String,
    pub if_name: String,
}

/// Jailer parameters for a confined VMM.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JailerSpec {
    pub uid: u32,
    pub gid: u32,
    pub chroot_base_dir: PathBuf,
    pub netns: Option<String>,
}

/// Block device caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CacheType {
    /// Host page cache only; fastest, data loss on host crash.
    Unsafe,
    /// Write back through the host.
    Writeback,
}

impl CacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Unsafe => "Unsafe",
            CacheType::Writeback => "Writeback",
        }
    }
}

/// A block device in a VM configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DriveSpec {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub read_only: bool,
    pub is_root: bool,
    pub cache_type: CacheType,
}

impl DriveSpec {
    /// A writable root drive backed by `path`.
    pub fn root(path: impl Into<PathBuf>) -> Self {
        Self {
            drive_id: drives::ROOTFS_DRIVE_ID.to_string(),
            path_on_host: path.into(),
            read_only: false,
            is_root: true,
            cache_type: CacheType::Unsafe,
        }
    }
}

/// A drive to hot-attach to a running VM.
#[derive(Debug, Clone)]
pub struct HotplugConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub read_only: bool,
    pub is_root_device: bool,
    pub cache_type: CacheType,
    pub rate_limiter: Option<DriveRateLimit>,
    /// Where the agent should mount the drive inside the guest; `None`
    /// attaches without mounting.
    pub mount_point: Option<String>,
}

/// I/O rate limits for a hot-attached drive.
#[derive(Debug, Clone, Copy)]
pub struct DriveRateLimit {
    pub bandwidth_bytes_per_sec: i64,
    pub bandwidth_burst_bytes: i64,
    pub ops_per_sec: i64,
    pub ops_burst: i64,
}

/// A drive currently bound to a sandbox.
#[derive(Debug, Clone)]
pub struct AttachedDrive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub mount_point: Option<String>,
    pub read_only: bool,
    pub attached_at: DateTime<Utc>,
}

/// Kinds of volumes a sandbox can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Rootfs,
    Data,
    Secret,
    ConfigMap,
    EmptyDir,
}

/// A volume to materialize and attach to a sandbox.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    /// Volume name; used to derive the drive id.
    pub name: String,
    pub kind: VolumeKind,
    /// Host source path for externally-produced volumes (rootfs, data,
    /// secret, configmap content).
    pub source: Option<PathBuf>,
    /// Mount path inside the container.
    pub mount_path: String,
    pub read_only: bool,
    /// Size for dynamically created volumes (emptydir); 0 means default.
    pub size_bytes: u64,
}
