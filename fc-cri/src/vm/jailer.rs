//! Jailer integration.
//!
//! Production VMs run under the Firecracker jailer: a chroot with only the
//! device nodes and images the VMM needs, dropped privileges, a dedicated
//! cgroup, and seccomp. This module prepares the chroot tree before the
//! jailer starts and tears it down afterwards.
//!
//! Chroot layout:
//!
//! ```text
//! <base>/firecracker/<id>/root/
//! ├── dev/{null,zero,urandom,kvm}
//! ├── dev/net/tun
//! ├── run/firecracker.socket
//! ├── kernel            (bind mount)
//! └── rootfs.ext4       (bind mount)
//! ```

use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fc_cri_shared::{FcError, FcResult};

use crate::config::JailerConfig;
use crate::domain::VmConfig;
use crate::layout::JailLayout;
use crate::util::process::read_pid_file;
use crate::util::run_command;
use crate::vmm::process::wait_for_socket;
use crate::vmm::VmmProcess;

/// Deadline for mount/jailer invocations.
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Device nodes installed in the chroot: (relative path, mode, major, minor).
const DEVICE_NODES: &[(&str, u32, u32, u32)] = &[
    ("dev/null", 0o666, 1, 3),
    ("dev/zero", 0o666, 1, 5),
    ("dev/urandom", 0o666, 1, 9),
    ("dev/kvm", 0o660, 10, 232),
    ("dev/net/tun", 0o660, 10, 200),
];

/// Prepares chroot environments and invokes the jailer binary.
pub struct JailerManager {
    config: JailerConfig,
    jailer_binary: PathBuf,
    firecracker_binary: PathBuf,
}

impl JailerManager {
    pub fn new(
        config: JailerConfig,
        jailer_binary: impl Into<PathBuf>,
        firecracker_binary: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            jailer_binary: jailer_binary.into(),
            firecracker_binary: firecracker_binary.into(),
        }
    }

    /// Verify the host can run jailed VMs. Collects every failure into one
    /// message so operators fix them in a single pass.
    pub fn check_prerequisites(&self) -> FcResult<()> {
        let mut problems = Vec::new();

        if !self.jailer_binary.exists() {
            problems.push(format!(
                "jailer binary not found: {}",
                self.jailer_binary.display()
            ));
        }
        if !self.firecracker_binary.exists() {
            problems.push(format!(
                "firecracker binary not found: {}",
                self.firecracker_binary.display()
            ));
        }
        if !Path::new("/dev/kvm").exists() {
            problems.push("/dev/kvm not available".to_string());
        }
        if self.config.uid > 65534 {
            problems.push(format!("invalid uid: {}", self.config.uid));
        }
        if self.config.cgroup_version == "2"
            && !Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
        {
            problems.push("cgroups v2 not mounted".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(FcError::FailedPrecondition(format!(
                "jailer prerequisites not met: {}",
                problems.join("; ")
            )))
        }
    }

    /// Build the chroot tree, device nodes, bind mounts, and cgroup for a VM.
    pub async fn prepare(&self, sandbox_id: &str, vm_config: &VmConfig) -> FcResult<JailLayout> {
        let jail = JailLayout::new(&self.config.chroot_base_dir, sandbox_id);
        tracing::info!(sandbox_id, chroot = %jail.chroot_dir().display(), "preparing jail");

        for dir in [jail.chroot_dir(), jail.dev_dir(), jail.dev_net_dir(), jail.run_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| FcError::Internal(format!("create {}: {}", dir.display(), e)))?;
            self.chown(&dir);
        }

        self.setup_devices(&jail).await;

        self.bind_mount(&vm_config.kernel_path, &jail.kernel_path())
            .await?;
        if let Some(root) = &vm_config.root_drive {
            self.bind_mount(&root.path_on_host, &jail.rootfs_path())
                .await?;
        }

        self.setup_cgroup(sandbox_id);
        Ok(jail)
    }

    /// Launch the jailer. For a daemonized jailer the foreground process
    /// exits once Firecracker is running and the pid comes from the pid
    /// file; otherwise we keep the child.
    pub async fn spawn(
        &self,
        sandbox_id: &str,
        api_socket_on_host: &Path,
    ) -> FcResult<(Option<VmmProcess>, u32)> {
        let args = self.jailer_args(sandbox_id);

        if self.config.daemonize {
            run_command(&self.jailer_binary, &args, TOOL_TIMEOUT).await?;
            wait_for_socket(api_socket_on_host, Duration::from_secs(5)).await?;

            let jail = JailLayout::new(&self.config.chroot_base_dir, sandbox_id);
            let pid_file = jail.id_dir().join("firecracker.pid");
            let pid = read_pid_file(&pid_file)?;
            tracing::info!(sandbox_id, pid, "jailed vm started (daemonized)");
            Ok((None, pid))
        } else {
            let process =
                VmmProcess::spawn_with_args(&self.jailer_binary, args, api_socket_on_host).await?;
            let pid = process.pid();
            tracing::info!(sandbox_id, pid, "jailed vm started");
            Ok((Some(process), pid))
        }
    }

    /// Command line for the jailer binary. Firecracker's own arguments
    /// follow the `--` separator, with the API socket relative to the
    /// chroot.
    pub fn jailer_args(&self, sandbox_id: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--id".into(),
            sandbox_id.into(),
            "--exec-file".into(),
            self.firecracker_binary.clone().into(),
            "--uid".into(),
            self.config.uid.to_string().into(),
            "--gid".into(),
            self.config.gid.to_string().into(),
            "--chroot-base-dir".into(),
            self.config.chroot_base_dir.clone().into(),
        ];

        if self.config.numa_node >= 0 {
            args.push("--node".into());
            args.push(self.config.numa_node.to_string().into());
        }

        args.push("--cgroup-version".into());
        args.push(self.config.cgroup_version.clone().into());
        if !self.config.cgroup_parent.is_empty() {
            args.push("--parent-cgroup".into());
            args.push(self.config.cgroup_parent.clone().into());
        }

        if let Some(netns) = &self.config.netns {
            args.push("--netns".into());
            args.push(netns.clone().into());
        }

        if self.config.daemonize {
            args.push("--daemonize".into());
        }

        args.push("--".into());
        args.push("--api-sock".into());
        args.push("/run/firecracker.socket".into());

        if self.config.seccomp_level > 0 {
            args.push("--seccomp-level".into());
            args.push(self.config.seccomp_level.to_string().into());
        }

        args
    }

    /// Unmount, remove the chroot tree, and drop the cgroup. Best effort.
    pub fn teardown(&self, sandbox_id: &str) {
        let jail = JailLayout::new(&self.config.chroot_base_dir, sandbox_id);
        if !jail.id_dir().exists() {
            return;
        }
        tracing::debug!(sandbox_id, "tearing down jail");

        let mut mounts = vec![jail.kernel_path(), jail.rootfs_path()];
        for (rel, _, _, _) in DEVICE_NODES {
            mounts.push(jail.chroot_dir().join(rel));
        }
        for mount in mounts {
            unmount(&mount);
        }

        if let Err(err) = std::fs::remove_dir_all(jail.id_dir()) {
            tracing::warn!(sandbox_id, error = %err, "failed to remove chroot tree");
        }

        for path in self.cgroup_dirs(sandbox_id) {
            let _ = std::fs::remove_dir(path);
        }
    }

    // -- internals ----------------------------------------------------------

    async fn setup_devices(&self, jail: &JailLayout) {
        for (rel, mode, major, minor) in DEVICE_NODES {
            let path = jail.chroot_dir().join(rel);
            let _ = std::fs::remove_file(&path);

            if let Err(err) = mknod_chr(&path, *mode, *major, *minor) {
                // Unprivileged hosts cannot mknod; fall back to binding the
                // host's node into the chroot.
                let host_node = Path::new("/").join(rel);
                if let Err(bind_err) = self.bind_mount(&host_node, &path).await {
                    tracing::warn!(
                        path = %path.display(),
                        mknod_error = %err,
                        bind_error = %bind_err,
                        "failed to create device node"
                    );
                    continue;
                }
            }
            self.chown(&path);
        }
    }

    async fn bind_mount(&self, source: &Path, target: &Path) -> FcResult<()> {
        if !source.exists() {
            return Err(FcError::FailedPrecondition(format!(
                "bind mount source not found: {}",
                source.display()
            )));
        }

        if source.is_dir() {
            std::fs::create_dir_all(target)
                .map_err(|e| FcError::Internal(format!("create {}: {}", target.display(), e)))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| FcError::Internal(format!("create {}: {}", parent.display(), e)))?;
            }
            std::fs::File::create(target)
                .map_err(|e| FcError::Internal(format!("create {}: {}", target.display(), e)))?;
        }

        let source = source.to_string_lossy().into_owned();
        let target = target.to_string_lossy().into_owned();
        run_command(
            "mount",
            ["--bind", source.as_str(), target.as_str()],
            TOOL_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    fn chown(&self, path: &Path) {
        let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
            return;
        };
        let rc = unsafe { libc::chown(cpath.as_ptr(), self.config.uid, self.config.gid) };
        if rc != 0 {
            tracing::warn!(
                path = %path.display(),
                error = %std::io::Error::last_os_error(),
                "failed to chown"
            );
        }
    }

    fn setup_cgroup(&self, sandbox_id: &str) {
        if self.config.cgroup_version == "2" {
            self.setup_cgroup_v2(sandbox_id);
        } else {
            self.setup_cgroup_v1(sandbox_id);
        }
    }

    fn setup_cgroup_v2(&self, sandbox_id: &str) {
        let path = Path::new("/sys/fs/cgroup")
            .join(&self.config.cgroup_parent)
            .join(sandbox_id);
        if let Err(err) = std::fs::create_dir_all(&path) {
            tracing::warn!(sandbox_id, error = %err, "cgroup v2 setup failed, continuing without limits");
            return;
        }

        let limits = &self.config.resource_limits;
        if limits.cpu_weight > 0 {
            write_cgroup(&path.join("cpu.weight"), &limits.cpu_weight.to_string());
        }
        if limits.cpu_quota_us > 0 && limits.cpu_period_us > 0 {
            write_cgroup(
                &path.join("cpu.max"),
                &format!("{} {}", limits.cpu_quota_us, limits.cpu_period_us),
            );
        }
        if limits.max_memory_bytes > 0 {
            write_cgroup(&path.join("memory.max"), &limits.max_memory_bytes.to_string());
        }
        write_cgroup(&path.join("cgroup.subtree_control"), "+cpu +memory +io");
    }

    fn setup_cgroup_v1(&self, sandbox_id: &str) {
        let limits = &self.config.resource_limits;
        for controller in ["cpu", "memory", "pids"] {
            let path = Path::new("/sys/fs/cgroup")
                .join(controller)
                .join(&self.config.cgroup_parent)
                .join(sandbox_id);
            if std::fs::create_dir_all(&path).is_err() {
                continue;
            }

            match controller {
                "cpu" => {
                    if limits.cpu_quota_us > 0 {
                        write_cgroup(
                            &path.join("cpu.cfs_quota_us"),
                            &limits.cpu_quota_us.to_string(),
                        );
                    }
                    if limits.cpu_period_us > 0 {
                        write_cgroup(
                            &path.join("cpu.cfs_period_us"),
                            &limits.cpu_period_us.to_string(),
                        );
                    }
                }
                "memory" => {
                    if limits.max_memory_bytes > 0 {
                        write_cgroup(
                            &path.join("memory.limit_in_bytes"),
                            &limits.max_memory_bytes.to_string(),
                        );
                    }
                }
                "pids" => {
                    if limits.max_processes > 0 {
                        write_cgroup(&path.join("pids.max"), &limits.max_processes.to_string());
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    fn cgroup_dirs(&self, sandbox_id: &str) -> Vec<PathBuf> {
        if self.config.cgroup_version == "2" {
            vec![Path::new("/sys/fs/cgroup")
                .join(&self.config.cgroup_parent)
                .join(sandbox_id)]
        } else {
            ["cpu", "memory", "pids"]
                .iter()
                .map(|ctrl| {
                    Path::new("/sys/fs/cgroup")
                        .join(ctrl)
                        .join(&self.config.cgroup_parent)
                        .join(sandbox_id)
                })
                .collect()
        }
    }
}

fn mknod_chr(path: &Path, mode: u32, major: u32, minor: u32) -> std::io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let dev = libc::makedev(major, minor);
    let rc = unsafe { libc::mknod(cpath.as_ptr(), libc::S_IFCHR | mode, dev) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn unmount(path: &Path) {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    unsafe {
        libc::umount2(cpath.as_ptr(), 0);
    }
}

fn write_cgroup(path: &Path, value: &str) {
    if let Err(err) = std::fs::write(path, value) {
        tracing::warn!(path = %path.display(), error = %err, "cgroup write failed");
    }
}
