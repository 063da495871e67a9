//! On-disk layout of runtime state.
//!
//! Every sandbox owns a directory under the runtime dir holding its VMM API
//! socket and vsock endpoint; volume images and snapshot files live in their
//! own trees. Jailed VMs get a chroot under the jailer base.
//!
//! ```text
//! <runtime_dir>/<sandbox-id>/         RuntimeLayout::sandbox_dir
//! ├── firecracker.sock                VMM API socket
//! ├── vsock.sock                      vsock Unix endpoint
//! └── firecracker.pid                 written by a daemonized jailer
//! <runtime_dir>/volumes/<sandbox-id>/ volume images (ext4 files)
//! <cache_dir>/<snapshot-name>/        SnapshotLayout
//! ├── memory
//! ├── state
//! └── metadata.json
//! <chroot_base>/firecracker/<id>/root JailLayout::chroot_dir
//! ```

use std::path::{Path, PathBuf};

/// File names inside a sandbox runtime directory.
pub mod files {
    /// VMM API socket.
    pub const API_SOCKET: &str = "firecracker.sock";

    /// Vsock Unix socket exposed by the VMM.
    pub const VSOCK_SOCKET: &str = "vsock.sock";

    /// Pid file written by a daemonized jailer.
    pub const PID_FILE: &str = "firecracker.pid";

    /// Snapshot memory file.
    pub const SNAPSHOT_MEMORY: &str = "memory";

    /// Snapshot VM state file.
    pub const SNAPSHOT_STATE: &str = "state";

    /// Snapshot metadata.
    pub const SNAPSHOT_METADATA: &str = "metadata.json";
}

/// Layout of per-sandbox runtime state under the runtime directory.
#[derive(Clone, Debug)]
pub struct RuntimeLayout {
    runtime_dir: PathBuf,
}

impl RuntimeLayout {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Sandbox directory: `<runtime_dir>/<id>`
    pub fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.runtime_dir.join(sandbox_id)
    }

    /// VMM API socket: `<runtime_dir>/<id>/firecracker.sock`
    pub fn api_socket(&self, sandbox_id: &str) -> PathBuf {
        self.sandbox_dir(sandbox_id).join(files::API_SOCKET)
    }

    /// Vsock endpoint: `<runtime_dir>/<id>/vsock.sock`
    pub fn vsock_socket(&self, sandbox_id: &str) -> PathBuf {
        self.sandbox_dir(sandbox_id).join(files::VSOCK_SOCKET)
    }

    /// Jailer pid file: `<runtime_dir>/<id>/firecracker.pid`
    pub fn pid_file(&self, sandbox_id: &str) -> PathBuf {
        self.sandbox_dir(sandbox_id).join(files::PID_FILE)
    }

    /// Volume image directory for a sandbox: `<runtime_dir>/volumes/<id>`
    pub fn volumes_dir(&self, sandbox_id: &str) -> PathBuf {
        self.runtime_dir.join("volumes").join(sandbox_id)
    }
}

/// Layout of the snapshot cache.
#[derive(Clone, Debug)]
pub struct SnapshotLayout {
    cache_dir: PathBuf,
}

impl SnapshotLayout {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Snapshot directory: `<cache_dir>/<name>`
    pub fn snapshot_dir(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    /// Memory file: `<cache_dir>/<name>/memory`
    pub fn memory_file(&self, name: &str) -> PathBuf {
        self.snapshot_dir(name).join(files::SNAPSHOT_MEMORY)
    }

    /// State file: `<cache_dir>/<name>/state`
    pub fn state_file(&self, name: &str) -> PathBuf {
        self.snapshot_dir(name).join(files::SNAPSHOT_STATE)
    }

    /// Metadata file: `<cache_dir>/<name>/metadata.json`
    pub fn metadata_file(&self, name: &str) -> PathBuf {
        self.snapshot_dir(name).join(files::SNAPSHOT_METADATA)
    }
}

/// Layout of a jailed VM's chroot environment.
///
/// The jailer itself derives the same tree from `--chroot-base-dir`,
/// `--exec-file` and `--id`; we pre-create it to install device nodes and
/// bind mounts before handing off.
#[derive(Clone, Debug)]
pub struct JailLayout {
    chroot_base: PathBuf,
    sandbox_id: String,
}

impl JailLayout {
    pub fn new(chroot_base: impl Into<PathBuf>, sandbox_id: impl Into<String>) -> Self {
        Self {
            chroot_base: chroot_base.into(),
            sandbox_id: sandbox_id.into(),
        }
    }

    /// Chroot root: `<base>/firecracker/<id>/root`
    pub fn chroot_dir(&self) -> PathBuf {
        self.chroot_base
            .join("firecracker")
            .join(&self.sandbox_id)
            .join("root")
    }

    /// `<chroot>/dev`
    pub fn dev_dir(&self) -> PathBuf {
        self.chroot_dir().join("dev")
    }

    /// `<chroot>/dev/net`
    pub fn dev_net_dir(&self) -> PathBuf {
        self.dev_dir().join("net")
    }

    /// `<chroot>/run`
    pub fn run_dir(&self) -> PathBuf {
        self.chroot_dir().join("run")
    }

    /// Kernel image bind-mount target: `<chroot>/kernel`
    pub fn kernel_path(&self) -> PathBuf {
        self.chroot_dir().join("kernel")
    }

    /// Rootfs bind-mount target: `<chroot>/rootfs.ext4`
    pub fn rootfs_path(&self) -> PathBuf {
        self.chroot_dir().join("rootfs.ext4")
    }

    /// API socket as seen from the host: `<chroot>/run/firecracker.socket`
    pub fn api_socket_on_host(&self) -> PathBuf {
        self.run_dir().join("firecracker.socket")
    }

    /// API socket as seen from inside the chroot.
    pub fn api_socket_in_jail(&self) -> &'static str {
        "/run/firecracker.socket"
    }

    /// The per-id directory removed on teardown: `<base>/firecracker/<id>`
    pub fn id_dir(&self) -> PathBuf {
        self.chroot_base.join("firecracker").join(&self.sandbox_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_layout_paths() {
        let layout = RuntimeLayout::new("/run/fc-cri");
        assert_eq!(
            layout.api_socket("sb-1").to_str().unwrap(),
            "/run/fc-cri/sb-1/firecracker.sock"
        );
        assert_eq!(
            layout.vsock_socket("sb-1").to_str().unwrap(),
            "/run/fc-cri/sb-1/vsock.sock"
        );
        assert_eq!(
            layout.volumes_dir("sb-1").to_str().unwrap(),
            "/run/fc-cri/volumes/sb-1"
        );
    }

    #[test]
    fn snapshot_layout_paths() {
        let layout = SnapshotLayout::new("/var/lib/fc-cri/snapshots");
        assert_eq!(
            layout.memory_file("golden-base").to_str().unwrap(),
            "/var/lib/fc-cri/snapshots/golden-base/memory"
        );
        assert_eq!(
            layout.metadata_file("golden-base").to_str().unwrap(),
            "/var/lib/fc-cri/snapshots/golden-base/metadata.json"
        );
    }

    #[test]
    fn jail_layout_paths() {
        let jail = JailLayout::new("/srv/jailer", "sb-1");
        assert_eq!(
            jail.chroot_dir().to_str().unwrap(),
            "/srv/jailer/firecracker/sb-1/root"
        );
        assert_eq!(
            jail.api_socket_on_host().to_str().unwrap(),
            "/srv/jailer/firecracker/sb-1/root/run/firecracker.socket"
        );
        assert_eq!(jail.api_socket_in_jail(), "/run/firecracker.socket");
        assert_eq!(
            jail.id_dir().to_str().unwrap(),
            "/srv/jailer/firecracker/sb-1"
        );
    }
}
