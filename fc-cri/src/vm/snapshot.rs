//! VM snapshots: create a golden image once, restore fresh VMs from it.
//!
//! Restore skips the kernel boot entirely (spawn a VMM, map the memory
//! file, resume), which beats even pool hits for cold capacity. Workflow:
//!
//! 1. Boot a golden VM with the base rootfs and let the agent settle.
//! 2. Pause it and snapshot memory + device state via the VMM API.
//! 3. New sandboxes load the snapshot with `resume_vm` and get the
//!    workload rootfs hot-attached afterwards.
//!
//! Snapshot portability across host kernels is best effort.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fc_cri_shared::{FcError, FcResult};
use serde::{Deserialize, Serialize};

use crate::config::{MemoryBackend, SnapshotConfig, SnapshotType};
use crate::domain::{Sandbox, SandboxRef, SandboxState, VmConfig};
use crate::layout::SnapshotLayout;
use crate::vm::{SnapshotRestore, VmLifecycle, VmManager};
use crate::vmm::models::{MemoryBackendConfig, SnapshotCreateParams, SnapshotLoadParams};
use crate::vmm::{VmmApiClient, VmmHandle, VmmProcess};

/// Snapshot data format version we write.
const SNAPSHOT_VERSION: &str = "1.0";

/// A saved VM state on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub memory_path: PathBuf,
    pub state_path: PathBuf,
    pub vm_config: VmConfig,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub is_golden: bool,
}

/// Snapshot inventory summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub available: usize,
    pub has_golden: bool,
    pub total_size_bytes: u64,
}

/// Creates, restores, persists, and prunes snapshots.
pub struct SnapshotManager {
    config: SnapshotConfig,
    golden_vm_config: VmConfig,
    layout: SnapshotLayout,
    manager: Arc<VmManager>,
    snapshots: RwLock<HashMap<String, Arc<Snapshot>>>,
    golden: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotManager {
    /// Build the manager and load whatever snapshots already exist in the
    /// cache; the entry matching the configured golden name becomes active.
    pub fn new(
        config: SnapshotConfig,
        golden_vm_config: VmConfig,
        manager: Arc<VmManager>,
    ) -> FcResult<Self> {
        let layout = SnapshotLayout::new(&config.cache_dir);
        let sm = Self {
            config,
            golden_vm_config,
            layout,
            manager,
            snapshots: RwLock::new(HashMap::new()),
            golden: RwLock::new(None),
        };

        if !sm.config.enabled {
            return Ok(sm);
        }

        std::fs::create_dir_all(sm.layout.cache_dir()).map_err(|e| {
            FcError::Internal(format!(
                "create snapshot cache dir {}: {}",
                sm.layout.cache_dir().display(),
                e
            ))
        })?;

        if let Err(err) = sm.load_snapshots() {
            tracing::warn!(error = %err, "failed to load existing snapshots");
        }

        let golden = sm
            .snapshots
            .read()
            .unwrap()
            .get(&sm.config.golden_snapshot_name)
            .cloned();
        if let Some(snap) = golden {
            tracing::info!(snapshot = %snap.name, "golden snapshot loaded");
            *sm.golden.write().unwrap() = Some(snap);
        }

        Ok(sm)
    }

    /// Create the golden base snapshot. Boots a fresh VM from the golden
    /// config, waits for the agent to settle, snapshots it, and destroys
    /// the source VM.
    pub async fn create_golden_snapshot(&self) -> FcResult<Arc<Snapshot>> {
        self.ensure_enabled()?;
        tracing::info!("creating golden snapshot");

        let sandbox = self.manager.create_vm(self.golden_vm_config.clone()).await?;
        tokio::time::sleep(self.config.golden_settle()).await;

        let name = self.config.golden_snapshot_name.clone();
        let snap = match self.create_snapshot(&sandbox, &name, true).await {
            Ok(snap) => snap,
            Err(err) => {
                let _ = self.manager.destroy_vm(&sandbox).await;
                return Err(err);
            }
        };

        // Only the snapshot is needed; the source VM has served its purpose.
        let _ = self.manager.destroy_vm(&sandbox).await;

        tracing::info!(name = %snap.name, size_bytes = snap.size_bytes, "golden snapshot created");
        Ok(snap)
    }

    /// Snapshot a running VM. The source is paused for the duration and
    /// resumed afterwards - including on failure.
    pub async fn create_snapshot(
        &self,
        sandbox: &SandboxRef,
        name: &str,
        is_golden: bool,
    ) -> FcResult<Arc<Snapshot>> {
        self.ensure_enabled()?;

        if self.snapshots.read().unwrap().contains_key(name) {
            return Err(FcError::AlreadyExists(format!("snapshot {}", name)));
        }

        let (sandbox_id, vm_config, handle) = {
            let sb = sandbox.lock().unwrap();
            (sb.id.clone(), sb.vm_config.clone(), sb.vmm.clone())
        };
        let handle: Arc<VmmHandle> = handle
            .ok_or_else(|| FcError::FailedPrecondition(format!("sandbox {} has no vmm", sandbox_id)))?;

        tracing::info!(sandbox_id = %sandbox_id, name, "creating snapshot");

        let snap_dir = self.layout.snapshot_dir(name);
        std::fs::create_dir_all(&snap_dir).map_err(|e| {
            FcError::Internal(format!("create snapshot dir {}: {}", snap_dir.display(), e))
        })?;

        let memory_path = self.layout.memory_file(name);
        let state_path = self.layout.state_file(name);

        handle.api().pause().await?;

        let created = handle
            .api()
            .create_snapshot(&SnapshotCreateParams {
                mem_file_path: memory_path.to_string_lossy().into_owned(),
                snapshot_path: state_path.to_string_lossy().into_owned(),
                snapshot_type: Some(self.snapshot_type_str().to_string()),
            })
            .await;

        if let Err(err) = created {
            if let Err(resume_err) = handle.api().resume().await {
                tracing::warn!(sandbox_id = %sandbox_id, error = %resume_err, "failed to resume vm after snapshot failure");
            }
            let _ = std::fs::remove_dir_all(&snap_dir);
            return Err(err);
        }

        let size_bytes = file_size(&memory_path) + file_size(&state_path);
        let snap = Arc::new(Snapshot {
            name: name.to_string(),
            memory_path,
            state_path,
            vm_config,
            version: SNAPSHOT_VERSION.to_string(),
            created_at: Utc::now(),
            size_bytes,
            metadata: HashMap::from([("source_sandbox".to_string(), sandbox_id.clone())]),
            is_golden,
        });

        if let Err(err) = self.save_metadata(&snap) {
            tracing::warn!(name, error = %err, "failed to save snapshot metadata");
        }

        self.snapshots
            .write()
            .unwrap()
            .insert(name.to_string(), snap.clone());
        if is_golden {
            *self.golden.write().unwrap() = Some(snap.clone());
        }

        if let Err(err) = handle.api().resume().await {
            tracing::warn!(sandbox_id = %sandbox_id, error = %err, "failed to resume vm after snapshot");
        }

        tracing::info!(
            name,
            size_mb = snap.size_bytes / 1024 / 1024,
            is_golden,
            "snapshot created"
        );
        Ok(snap)
    }

    /// Boot a new sandbox from a snapshot. Much faster than a cold boot:
    /// the guest resumes from the memory file instead of booting a kernel.
    pub async fn restore_from_snapshot(&self, snap: &Snapshot) -> FcResult<SandboxRef> {
        self.ensure_enabled()?;
        tracing::info!(snapshot = %snap.name, "restoring from snapshot");
        let started = std::time::Instant::now();

        let sandbox_id = crate::domain::generate_sandbox_id();
        let layout = self.manager.layout();
        let sandbox_dir = layout.sandbox_dir(&sandbox_id);
        std::fs::create_dir_all(&sandbox_dir).map_err(|e| {
            FcError::Internal(format!("create sandbox dir {}: {}", sandbox_dir.display(), e))
        })?;

        let cid = self.manager.allocate_cid();
        let api_socket = layout.api_socket(&sandbox_id);
        let vsock_path = layout.vsock_socket(&sandbox_id);

        let process =
            VmmProcess::spawn(self.manager.firecracker_binary(), &api_socket, &sandbox_id).await?;
        let pid = process.pid();
        let api = VmmApiClient::new(&api_socket);
        let handle = Arc::new(VmmHandle::new(api, Some(process), pid));

        let load = handle.api().load_snapshot(&self.load_params(snap)).await;
        if let Err(err) = load {
            handle.force_kill().await;
            let _ = std::fs::remove_dir_all(&sandbox_dir);
            return Err(err);
        }

        let mut sandbox = Sandbox::new(sandbox_id.clone());
        sandbox.pid = pid;
        sandbox.vsock_cid = cid;
        sandbox.vsock_path = vsock_path;
        sandbox.vm_config = snap.vm_config.clone();
        sandbox.vmm = Some(handle);
        sandbox.state = SandboxState::Ready;
        sandbox.started_at = Some(Utc::now());
        // Consumers treat restored VMs like pooled ones: pre-warmed, needs
        // workload customization.
        sandbox.from_pool = true;

        let sandbox = sandbox.into_ref();
        self.manager.register(sandbox.clone());

        tracing::info!(
            sandbox_id = %sandbox_id,
            snapshot = %snap.name,
            restore_ms = started.elapsed().as_millis() as u64,
            "vm restored from snapshot"
        );
        Ok(sandbox)
    }

    /// Retrieve a snapshot by name.
    pub fn get(&self, name: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.read().unwrap().get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Snapshot>> {
        self.snapshots.read().unwrap().values().cloned().collect()
    }

    /// Delete a snapshot and its files. Deleting the golden snapshot is
    /// rejected; deleting an unknown name is a no-op.
    pub fn delete(&self, name: &str) -> FcResult<()> {
        let mut snapshots = self.snapshots.write().unwrap();
        let Some(snap) = snapshots.get(name) else {
            return Ok(());
        };
        if snap.is_golden {
            return Err(FcError::FailedPrecondition(
                "cannot delete golden snapshot".into(),
            ));
        }

        let snap_dir = self.layout.snapshot_dir(name);
        std::fs::remove_dir_all(&snap_dir).map_err(|e| {
            FcError::Internal(format!("remove snapshot {}: {}", snap_dir.display(), e))
        })?;
        snapshots.remove(name);
        tracing::info!(name, "snapshot deleted");
        Ok(())
    }

    /// Prune oldest non-golden snapshots until the count fits `max_cached`.
    pub fn cleanup(&self) {
        let mut snapshots = self.snapshots.write().unwrap();
        while snapshots.len() > self.config.max_cached {
            let oldest = snapshots
                .values()
                .filter(|s| !s.is_golden)
                .min_by_key(|s| s.created_at)
                .map(|s| s.name.clone());
            let Some(name) = oldest else {
                break;
            };
            let snap_dir = self.layout.snapshot_dir(&name);
            let _ = std::fs::remove_dir_all(&snap_dir);
            snapshots.remove(&name);
            tracing::info!(name = %name, "pruned old snapshot");
        }
    }

    pub fn stats(&self) -> SnapshotStats {
        let snapshots = self.snapshots.read().unwrap();
        SnapshotStats {
            available: snapshots.len(),
            has_golden: self.golden.read().unwrap().is_some(),
            total_size_bytes: snapshots.values().map(|s| s.size_bytes).sum(),
        }
    }

    // -- internals ----------------------------------------------------------

    fn ensure_enabled(&self) -> FcResult<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(FcError::FailedPrecondition("snapshots not enabled".into()))
        }
    }

    fn snapshot_type_str(&self) -> &'static str {
        match self.config.snapshot_type {
            SnapshotType::Full => "Full",
            SnapshotType::Diff => "Diff",
        }
    }

    fn load_params(&self, snap: &Snapshot) -> SnapshotLoadParams {
        let memory = snap.memory_path.to_string_lossy().into_owned();
        let (mem_file_path, mem_backend) = match self.config.memory_backend {
            MemoryBackend::File => (Some(memory), None),
            MemoryBackend::Uffd => (
                None,
                Some(MemoryBackendConfig {
                    backend_type: "Uffd".to_string(),
                    backend_path: memory,
                }),
            ),
        };
        SnapshotLoadParams {
            snapshot_path: snap.state_path.to_string_lossy().into_owned(),
            mem_file_path,
            mem_backend,
            enable_diff_snapshots: match self.config.snapshot_type {
                SnapshotType::Diff => Some(true),
                SnapshotType::Full => None,
            },
            resume_vm: Some(true),
        }
    }

    fn save_metadata(&self, snap: &Snapshot) -> FcResult<()> {
        let path = self.layout.metadata_file(&snap.name);
        let data = serde_json::to_vec_pretty(snap)?;
        std::fs::write(&path, data)
            .map_err(|e| FcError::Internal(format!("write {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Scan the cache dir for `metadata.json` files, skipping entries whose
    /// snapshot files have gone missing.
    fn load_snapshots(&self) -> FcResult<()> {
        let entries = match std::fs::read_dir(self.layout.cache_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut snapshots = self.snapshots.write().unwrap();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let meta_path = entry.path().join(crate::layout::files::SNAPSHOT_METADATA);
            let Ok(data) = std::fs::read(&meta_path) else {
                continue;
            };
            let Ok(snap) = serde_json::from_slice::<Snapshot>(&data) else {
                tracing::warn!(path = %meta_path.display(), "unreadable snapshot metadata, skipping");
                continue;
            };
            if !snap.memory_path.exists() || !snap.state_path.exists() {
                tracing::warn!(name = %snap.name, "snapshot files missing, skipping");
                continue;
            }
            snapshots.insert(snap.name.clone(), Arc::new(snap));
        }

        tracing::debug!(count = snapshots.len(), "loaded existing snapshots");
        Ok(())
    }
}

#[async_trait]
impl SnapshotRestore for SnapshotManager {
    fn has_golden(&self) -> bool {
        self.golden.read().unwrap().is_some()
    }

    async fn restore_from_golden(&self) -> FcResult<SandboxRef> {
        let golden = self.golden.read().unwrap().clone();
        let Some(golden) = golden else {
            return Err(FcError::FailedPrecondition(
                "no golden snapshot available".into(),
            ));
        };
        self.restore_from_snapshot(&golden).await
    }
}

fn file_size(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
