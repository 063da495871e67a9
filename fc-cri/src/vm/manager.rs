//! Firecracker VM lifecycle manager.
//!
//! Owns one VMM process per sandbox: spawns it (directly or through the
//! jailer), drives the boot configuration over the API socket, and tears
//! everything down on destroy. CID allocation is strictly monotonic for the
//! life of the manager.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fc_cri_shared::constants::vsock::FIRST_GUEST_CID;
use fc_cri_shared::{FcError, FcResult};

use crate::config::Config;
use crate::domain::{generate_sandbox_id, Sandbox, SandboxRef, SandboxState, VmConfig};
use crate::layout::RuntimeLayout;
use crate::metrics::RuntimeMetrics;
use crate::vm::jailer::JailerManager;
use crate::vm::VmLifecycle;
use crate::vmm::models::{BootSource, Drive, MachineConfiguration, Vsock};
use crate::vmm::{VmmApiClient, VmmHandle, VmmProcess};

/// Settings the manager needs from the configuration tree.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub firecracker_binary: PathBuf,
    pub runtime_dir: PathBuf,
    pub default_kernel_path: PathBuf,
    pub default_kernel_args: String,
    pub shutdown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            firecracker_binary: PathBuf::from("/usr/bin/firecracker"),
            runtime_dir: PathBuf::from("/run/fc-cri"),
            default_kernel_path: PathBuf::from("/var/lib/fc-cri/vmlinux"),
            default_kernel_args: fc_cri_shared::constants::DEFAULT_KERNEL_ARGS.to_string(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ManagerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            firecracker_binary: config.runtime.firecracker_binary.clone(),
            runtime_dir: config.runtime.runtime_dir.clone(),
            default_kernel_path: config.vm.kernel_path.clone(),
            default_kernel_args: config.vm.kernel_args.clone(),
            shutdown_timeout: config.runtime.shutdown_timeout(),
        }
    }
}

/// Manages the set of live sandboxes on this host.
pub struct VmManager {
    config: ManagerConfig,
    layout: RuntimeLayout,
    jailer: Option<Arc<JailerManager>>,
    sandboxes: RwLock<HashMap<String, SandboxRef>>,
    cid_counter: AtomicU32,
    metrics: RuntimeMetrics,
}

impl VmManager {
    pub fn new(
        config: ManagerConfig,
        jailer: Option<Arc<JailerManager>>,
        metrics: RuntimeMetrics,
    ) -> FcResult<Self> {
        std::fs::create_dir_all(&config.runtime_dir).map_err(|e| {
            FcError::Internal(format!(
                "create runtime dir {}: {}",
                config.runtime_dir.display(),
                e
            ))
        })?;

        let layout = RuntimeLayout::new(&config.runtime_dir);
        Ok(Self {
            config,
            layout,
            jailer,
            sandboxes: RwLock::new(HashMap::new()),
            cid_counter: AtomicU32::new(FIRST_GUEST_CID),
            metrics,
        })
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    pub(crate) fn firecracker_binary(&self) -> &PathBuf {
        &self.config.firecracker_binary
    }

    /// Hand out the next guest CID. Strictly monotonic per manager.
    pub(crate) fn allocate_cid(&self) -> u32 {
        self.cid_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Track a sandbox created outside `create_vm` (snapshot restore).
    pub(crate) fn register(&self, sandbox: SandboxRef) {
        let id = sandbox.lock().unwrap().id.clone();
        self.sandboxes.write().unwrap().insert(id, sandbox);
    }

    pub fn get_sandbox(&self, id: &str) -> Option<SandboxRef> {
        self.sandboxes.read().unwrap().get(id).cloned()
    }

    pub fn list_sandboxes(&self) -> Vec<SandboxRef> {
        self.sandboxes.read().unwrap().values().cloned().collect()
    }

    /// Fill in manager defaults for fields the caller left empty.
    fn apply_defaults(&self, config: &mut VmConfig) {
        if config.kernel_path.as_os_str().is_empty() {
            config.kernel_path = self.config.default_kernel_path.clone();
        }
        if config.kernel_args.is_empty() {
            config.kernel_args = self.config.default_kernel_args.clone();
        }
    }

    /// Boot-time API configuration common to jailed and unjailed VMs.
    async fn configure_boot(
        &self,
        api: &VmmApiClient,
        config: &VmConfig,
        kernel_path: &str,
        root_path: Option<&str>,
        vsock_uds_path: &str,
        cid: u32,
    ) -> FcResult<()> {
        api.put_boot_source(&BootSource {
            kernel_image_path: kernel_path.to_string(),
            boot_args: Some(config.kernel_args.clone()),
            initrd_path: config
                .initrd_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        })
        .await?;

        api.put_machine_config(&MachineConfiguration {
            vcpu_count: config.vcpu_count,
            mem_size_mib: config.memory_mib,
            smt: Some(config.smt),
        })
        .await?;

        if let (Some(root), Some(path)) = (&config.root_drive, root_path) {
            api.put_drive(&Drive {
                drive_id: root.drive_id.clone(),
                path_on_host: path.to_string(),
                is_root_device: root.is_root,
                is_read_only: root.read_only,
                cache_type: Some(root.cache_type.as_str().to_string()),
                rate_limiter: None,
            })
            .await?;
        }

        if config.vsock_enabled {
            api.put_vsock(&Vsock {
                guest_cid: cid,
                uds_path: vsock_uds_path.to_string(),
            })
            .await?;
        }

        Ok(())
    }

    async fn boot_direct(
        &self,
        sandbox_id: &str,
        config: &VmConfig,
        cid: u32,
    ) -> FcResult<(Arc<VmmHandle>, PathBuf)> {
        let api_socket = self.layout.api_socket(sandbox_id);
        let vsock_socket = self.layout.vsock_socket(sandbox_id);

        let process = VmmProcess::spawn(&self.config.firecracker_binary, &api_socket, sandbox_id)
            .await?;
        let pid = process.pid();
        let api = VmmApiClient::new(&api_socket);

        let boot = self
            .configure_boot(
                &api,
                config,
                &config.kernel_path.to_string_lossy(),
                config
                    .root_drive
                    .as_ref()
                    .map(|d| d.path_on_host.to_string_lossy().into_owned())
                    .as_deref(),
                &vsock_socket.to_string_lossy(),
                cid,
            )
            .await;

        let handle = Arc::new(VmmHandle::new(api, Some(process), pid));

        if let Err(err) = boot {
            handle.force_kill().await;
            return Err(err);
        }
        if let Err(err) = handle.api().instance_start().await {
            handle.force_kill().await;
            return Err(err);
        }

        Ok((handle, vsock_socket))
    }

    async fn boot_jailed(
        &self,
        jailer: &JailerManager,
        sandbox_id: &str,
        config: &VmConfig,
        cid: u32,
    ) -> FcResult<(Arc<VmmHandle>, PathBuf)> {
        let jail = jailer.prepare(sandbox_id, config).await?;
        let api_socket = jail.api_socket_on_host();
        let vsock_socket = jail.run_dir().join("vsock.sock");

        let spawned = jailer.spawn(sandbox_id, &api_socket).await;
        let (process, pid) = match spawned {
            Ok(pair) => pair,
            Err(err) => {
                jailer.teardown(sandbox_id);
                return Err(err);
            }
        };

        let api = VmmApiClient::new(&api_socket);
        // Paths handed to the VMM are relative to the chroot.
        let boot = self
            .configure_boot(&api, config, "/kernel", Some("/rootfs.ext4"), "/run/vsock.sock", cid)
            .await;

        let handle = Arc::new(VmmHandle::new(api, process, pid));

        let started = match boot {
            Ok(()) => handle.api().instance_start().await,
            Err(err) => Err(err),
        };
        if let Err(err) = started {
            handle.force_kill().await;
            jailer.teardown(sandbox_id);
            return Err(err);
        }

        Ok((handle, vsock_socket))
    }
}

#[async_trait]
impl VmLifecycle for VmManager {
    async fn create_vm(&self, mut config: VmConfig) -> FcResult<SandboxRef> {
        let sandbox_id = generate_sandbox_id();
        tracing::info!(sandbox_id = %sandbox_id, "creating vm");

        self.apply_defaults(&mut config);
        if !config.kernel_path.exists() {
            self.metrics.inc_vm_create_errors();
            return Err(FcError::FailedPrecondition(format!(
                "kernel not found: {}",
                config.kernel_path.display()
            )));
        }

        let cid = self.allocate_cid();
        config.vsock_cid = cid;

        let sandbox_dir = self.layout.sandbox_dir(&sandbox_id);
        std::fs::create_dir_all(&sandbox_dir).map_err(|e| {
            FcError::Internal(format!("create sandbox dir {}: {}", sandbox_dir.display(), e))
        })?;

        let use_jailer = config.jailer.is_some() || self.jailer.is_some();
        let booted = if use_jailer {
            match &self.jailer {
                Some(jailer) => self.boot_jailed(jailer, &sandbox_id, &config, cid).await,
                None => Err(FcError::FailedPrecondition(
                    "jailer requested but not configured".into(),
                )),
            }
        } else {
            self.boot_direct(&sandbox_id, &config, cid).await
        };

        let (handle, vsock_socket) = match booted {
            Ok(pair) => pair,
            Err(err) => {
                // Never leave partial state behind for the pool to trip on.
                let _ = std::fs::remove_dir_all(&sandbox_dir);
                self.metrics.inc_vm_create_errors();
                tracing::warn!(sandbox_id = %sandbox_id, error = %err, "vm create failed");
                return Err(err);
            }
        };

        let mut sandbox = Sandbox::new(sandbox_id.clone());
        sandbox.pid = handle.pid();
        sandbox.vsock_cid = cid;
        sandbox.vsock_path = vsock_socket;
        sandbox.rootfs_path = config.root_drive.as_ref().map(|d| d.path_on_host.clone());
        sandbox.vm_config = config;
        sandbox.vmm = Some(handle);
        sandbox.state = SandboxState::Ready;
        sandbox.started_at = Some(Utc::now());

        let sandbox = sandbox.into_ref();
        self.sandboxes
            .write()
            .unwrap()
            .insert(sandbox_id.clone(), sandbox.clone());
        self.metrics.inc_vms_created();

        tracing::info!(
            sandbox_id = %sandbox_id,
            pid = sandbox.lock().unwrap().pid,
            cid,
            "vm started"
        );
        Ok(sandbox)
    }

    async fn stop_vm(&self, sandbox: &SandboxRef) -> FcResult<()> {
        let (id, state, handle) = {
            let sb = sandbox.lock().unwrap();
            (sb.id.clone(), sb.state, sb.vmm.clone())
        };

        if state == SandboxState::Stopped {
            return Ok(());
        }
        tracing::info!(sandbox_id = %id, "stopping vm");

        if let Some(handle) = handle {
            if let Err(err) = handle.api().send_ctrl_alt_del().await {
                tracing::warn!(sandbox_id = %id, error = %err, "graceful shutdown failed, forcing stop");
                handle.force_kill().await;
            } else {
                handle.wait_exit_or_kill(self.config.shutdown_timeout).await?;
            }
        }

        let mut sb = sandbox.lock().unwrap();
        sb.state = SandboxState::Stopped;
        sb.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn destroy_vm(&self, sandbox: &SandboxRef) -> FcResult<()> {
        let (id, state, agent) = {
            let sb = sandbox.lock().unwrap();
            (sb.id.clone(), sb.state, sb.agent.clone())
        };
        tracing::info!(sandbox_id = %id, "destroying vm");

        if state == SandboxState::Ready {
            if let Err(err) = self.stop_vm(sandbox).await {
                tracing::warn!(sandbox_id = %id, error = %err, "error stopping vm during destroy");
            }
        }

        if let Some(agent) = agent {
            agent.close().await;
        }

        if let Some(jailer) = &self.jailer {
            jailer.teardown(&id);
        }

        let sandbox_dir = self.layout.sandbox_dir(&id);
        if let Err(err) = std::fs::remove_dir_all(&sandbox_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(sandbox_id = %id, error = %err, "failed to remove sandbox dir");
            }
        }
        let volumes_dir = self.layout.volumes_dir(&id);
        if volumes_dir.exists() {
            let _ = std::fs::remove_dir_all(&volumes_dir);
        }

        let removed = self.sandboxes.write().unwrap().remove(&id);
        if removed.is_some() {
            self.metrics.inc_vms_destroyed();
        }
        Ok(())
    }

    async fn pause_vm(&self, sandbox: &SandboxRef) -> FcResult<()> {
        let (id, handle) = {
            let sb = sandbox.lock().unwrap();
            (sb.id.clone(), sb.vmm.clone())
        };
        let handle = handle
            .ok_or_else(|| FcError::FailedPrecondition(format!("sandbox {} has no vmm", id)))?;
        handle.api().pause().await
    }

    async fn resume_vm(&self, sandbox: &SandboxRef) -> FcResult<()> {
        let (id, handle) = {
            let sb = sandbox.lock().unwrap();
            (sb.id.clone(), sb.vmm.clone())
        };
        let handle = handle
            .ok_or_else(|| FcError::FailedPrecondition(format!("sandbox {} has no vmm", id)))?;
        handle.api().resume().await
    }
}
