//! Runtime configuration.
//!
//! Loaded from a TOML file (default `/etc/fc-cri/config.toml`) with serde
//! defaults for every field, then overlaid with `FC_CRI_*` environment
//! variables for the operational knobs. Sections mirror the components that
//! consume them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fc_cri_shared::{constants, FcError, FcResult};
use serde::{Deserialize, Serialize};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fc-cri/config.toml";

/// Top-level configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub vm: VmDefaults,
    pub pool: PoolConfig,
    pub agent: AgentConfig,
    pub snapshot: SnapshotConfig,
    pub jailer: JailerConfig,
}

impl Config {
    /// Parse a TOML configuration file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> FcResult<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(FcError::Internal(format!(
                    "read config {}: {}",
                    path.display(),
                    err
                )))
            }
        };

        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| FcError::InvalidArgument(format!("parse config {}: {}", path.display(), e)))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Overlay `FC_CRI_*` environment variables on the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("FC_CRI_RUNTIME_DIR") {
            self.runtime.runtime_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("FC_CRI_FIRECRACKER_BINARY") {
            self.runtime.firecracker_binary = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("FC_CRI_KERNEL_PATH") {
            self.vm.kernel_path = PathBuf::from(path);
        }
        if let Ok(v) = std::env::var("FC_CRI_POOL_ENABLED") {
            self.pool.enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Reject configurations that cannot work. Binary/kernel existence is
    /// checked lazily by the components that need them.
    pub fn validate(&self) -> FcResult<()> {
        if self.pool.min_size > self.pool.max_size {
            return Err(FcError::InvalidArgument(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.pool.warm_concurrency == 0 {
            return Err(FcError::InvalidArgument(
                "pool.warm_concurrency must be at least 1".into(),
            ));
        }
        if self.vm.min_memory_mb > self.vm.max_memory_mb {
            return Err(FcError::InvalidArgument(format!(
                "vm.min_memory_mb ({}) exceeds vm.max_memory_mb ({})",
                self.vm.min_memory_mb, self.vm.max_memory_mb
            )));
        }
        Ok(())
    }
}

/// General runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory for per-sandbox runtime state (sockets, pid files).
    pub runtime_dir: PathBuf,
    pub firecracker_binary: PathBuf,
    pub jailer_binary: PathBuf,
    pub enable_jailer: bool,
    /// Graceful VM shutdown window before force-stop.
    pub shutdown_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("/run/fc-cri"),
            firecracker_binary: PathBuf::from("/usr/bin/firecracker"),
            jailer_binary: PathBuf::from("/usr/bin/jailer"),
            enable_jailer: false,
            shutdown_timeout_secs: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Default VM sizing and boot assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefaults {
    pub kernel_path: PathBuf,
    pub kernel_args: String,
    pub initrd_path: Option<PathBuf>,
    pub default_vcpu_count: u64,
    pub default_memory_mb: u64,
    pub min_memory_mb: u64,
    pub max_memory_mb: u64,
    pub enable_smt: bool,
    /// Base rootfs used for pooled (pre-warmed) VMs.
    pub base_rootfs_path: PathBuf,
    pub vsock_enabled: bool,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from("/var/lib/fc-cri/vmlinux"),
            kernel_args: constants::DEFAULT_KERNEL_ARGS.to_string(),
            initrd_path: None,
            default_vcpu_count: 1,
            default_memory_mb: 128,
            min_memory_mb: 64,
            max_memory_mb: 8192,
            enable_smt: false,
            base_rootfs_path: PathBuf::from("/var/lib/fc-cri/base-rootfs.ext4"),
            vsock_enabled: true,
        }
    }
}

/// VM pool behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,
    /// Maximum pre-warmed VMs kept ready.
    pub max_size: usize,
    /// Replenish target.
    pub min_size: usize,
    /// Idle age after which a pooled VM is destroyed.
    pub max_idle_time_secs: u64,
    /// Concurrent fresh-VM creations during warming.
    pub warm_concurrency: usize,
    pub replenish_interval_secs: u64,
    pub prewarm_on_start: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 10,
            min_size: 3,
            max_idle_time_secs: 300,
            warm_concurrency: 2,
            replenish_interval_secs: 10,
            prewarm_on_start: false,
        }
    }
}

impl PoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn replenish_interval(&self) -> Duration {
        Duration::from_secs(self.replenish_interval_secs)
    }
}

/// Guest agent connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub vsock_port: u32,
    pub connect_timeout_secs: u64,
    /// Readiness pings after connect.
    pub dial_retries: u32,
    pub dial_retry_interval_ms: u64,
    /// Default deadline for agent calls without a caller deadline.
    pub command_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            vsock_port: constants::vsock::AGENT_PORT,
            connect_timeout_secs: 30,
            dial_retries: 30,
            dial_retry_interval_ms: 100,
            command_timeout_secs: 30,
        }
    }
}

impl AgentConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn dial_retry_interval(&self) -> Duration {
        Duration::from_millis(self.dial_retry_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Snapshot type requested from the VMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotType {
    Full,
    Diff,
}

/// Snapshot memory backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryBackend {
    File,
    Uffd,
}

/// Snapshot manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub cache_dir: PathBuf,
    /// Non-golden snapshots kept before pruning.
    pub max_cached: usize,
    pub golden_snapshot_name: String,
    pub snapshot_type: SnapshotType,
    pub memory_backend: MemoryBackend,
    /// Settle time after booting the golden VM before snapshotting, giving
    /// the in-guest agent time to come up.
    pub golden_settle_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_dir: PathBuf::from("/var/lib/fc-cri/snapshots"),
            max_cached: 10,
            golden_snapshot_name: "golden-base".to_string(),
            snapshot_type: SnapshotType::Full,
            memory_backend: MemoryBackend::File,
            golden_settle_secs: 2,
        }
    }
}

impl SnapshotConfig {
    pub fn golden_settle(&self) -> Duration {
        Duration::from_secs(self.golden_settle_secs)
    }
}

/// Jailer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JailerConfig {
    pub enabled: bool,
    pub chroot_base_dir: PathBuf,
    pub uid: u32,
    pub gid: u32,
    /// NUMA node to pin to; negative disables pinning.
    pub numa_node: i32,
    /// "1" or "2".
    pub cgroup_version: String,
    pub cgroup_parent: String,
    pub netns: Option<String>,
    pub daemonize: bool,
    /// Seccomp filter level 0-2.
    pub seccomp_level: u8,
    pub resource_limits: JailerResourceLimits,
}

impl Default for JailerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chroot_base_dir: PathBuf::from("/srv/jailer"),
            uid: 1000,
            gid: 1000,
            numa_node: -1,
            cgroup_version: "2".to_string(),
            cgroup_parent: "fc-cri.slice".to_string(),
            netns: None,
            daemonize: true,
            seccomp_level: 2,
            resource_limits: JailerResourceLimits::default(),
        }
    }
}

/// Resource constraints for jailed VMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JailerResourceLimits {
    pub max_open_files: u64,
    pub max_processes: u64,
    /// 0 means unlimited.
    pub max_memory_bytes: u64,
    /// Cgroup CPU weight, 1-10000.
    pub cpu_weight: u64,
    /// Microseconds per period; 0 disables the quota.
    pub cpu_quota_us: i64,
    pub cpu_period_us: i64,
}

impl Default for JailerResourceLimits {
    fn default() -> Self {
        Self {
            max_open_files: 2048,
            max_processes: 100,
            max_memory_bytes: 0,
            cpu_weight: 100,
            cpu_quota_us: 0,
            cpu_period_us: 100_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.runtime.runtime_dir, PathBuf::from("/run/fc-cri"));
        assert_eq!(cfg.runtime.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.vm.default_vcpu_count, 1);
        assert_eq!(cfg.vm.default_memory_mb, 128);
        assert_eq!(cfg.pool.max_size, 10);
        assert_eq!(cfg.pool.min_size, 3);
        assert_eq!(cfg.agent.vsock_port, 1024);
        assert_eq!(cfg.agent.dial_retries, 30);
        assert_eq!(cfg.snapshot.golden_snapshot_name, "golden-base");
        assert!(!cfg.snapshot.enabled);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [pool]
            max_size = 5
            min_size = 2

            [agent]
            vsock_port = 2048
            "#,
        )
        .unwrap();
        assert_eq!(cfg.pool.max_size, 5);
        assert_eq!(cfg.pool.min_size, 2);
        assert_eq!(cfg.agent.vsock_port, 2048);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.runtime.shutdown_timeout_secs, 10);
        assert_eq!(cfg.vm.default_memory_mb, 128);
    }

    #[test]
    fn validate_rejects_inverted_pool_bounds() {
        let mut cfg = Config::default();
        cfg.pool.min_size = 20;
        cfg.pool.max_size = 10;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("min_size"));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let cfg = Config::load("/nonexistent/fc-cri/config.toml").unwrap();
        assert_eq!(cfg.pool.max_size, 10);
    }

    #[test]
    fn snapshot_type_round_trips() {
        let cfg: Config = toml::from_str(
            r#"
            [snapshot]
            enabled = true
            snapshot_type = "Diff"
            memory_backend = "Uffd"
            "#,
        )
        .unwrap();
        assert!(cfg.snapshot.enabled);
        assert_eq!(cfg.snapshot.snapshot_type, SnapshotType::Diff);
        assert_eq!(cfg.snapshot.memory_backend, MemoryBackend::Uffd);
    }
}
