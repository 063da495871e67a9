//! Pre-warmed VM pool.
//!
//! Keeps a bounded FIFO of ready sandboxes so pod creation skips the VM
//! boot. Acquire order: pool hit (customize the pre-warmed VM for the
//! workload), golden-snapshot restore, fresh cold boot. Background loops
//! replenish to the minimum size and evict idle VMs.
//!
//! Contracts: a sandbox is delivered to at most one acquirer; acquisition
//! is FIFO over the ready queue; `hits + misses == total_served` at all
//! times; release either requeues or destroys, never both.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use fc_cri_shared::constants::drives::ROOTFS_DRIVE_ID;
use fc_cri_shared::{FcError, FcResult};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::domain::{HotplugConfig, PoolStats, SandboxRef, VmConfig};
use crate::vm::{HotplugManager, SnapshotRestore, VmLifecycle};

/// Fixed cadence of the idle-eviction sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for one replenish round.
const REPLENISH_DEADLINE: Duration = Duration::from_secs(30);

/// Pool of ready-to-use sandboxes.
pub struct Pool {
    config: PoolConfig,
    default_vm_config: VmConfig,

    lifecycle: Arc<dyn VmLifecycle>,
    hotplug: Arc<HotplugManager>,
    snapshots: Option<Arc<dyn SnapshotRestore>>,

    ready: Mutex<VecDeque<SandboxRef>>,
    in_use: Mutex<HashMap<String, SandboxRef>>,

    total_served: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,

    warm_sem: Semaphore,
    cancel: CancellationToken,
    closed: AtomicBool,

    /// Self-reference for spawning warm tasks; loops and tasks upgrade it
    /// and stop when the pool is gone.
    weak: std::sync::Weak<Pool>,
}

impl Pool {
    /// Create the pool and start its background loops. Loops hold a weak
    /// reference and stop when the pool is dropped or closed.
    pub fn new(
        config: PoolConfig,
        default_vm_config: VmConfig,
        lifecycle: Arc<dyn VmLifecycle>,
        hotplug: Arc<HotplugManager>,
        snapshots: Option<Arc<dyn SnapshotRestore>>,
    ) -> Arc<Self> {
        let warm_permits = config.warm_concurrency.max(1);
        let pool = Arc::new_cyclic(|weak| Self {
            config,
            default_vm_config,
            lifecycle,
            hotplug,
            snapshots,
            ready: Mutex::new(VecDeque::new()),
            in_use: Mutex::new(HashMap::new()),
            total_served: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            warm_sem: Semaphore::new(warm_permits),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            weak: weak.clone(),
        });

        // A disabled pool is a pure pass-through: every acquire falls
        // through to a fresh boot and nothing is kept warm.
        if pool.config.enabled {
            Self::spawn_replenish_loop(&pool);
            Self::spawn_cleanup_loop(&pool);
        }
        pool
    }

    fn strong(&self) -> FcResult<Arc<Self>> {
        self.weak
            .upgrade()
            .ok_or_else(|| FcError::Unavailable("pool is shutting down".into()))
    }

    /// Kick off initial warming in the background when configured.
    pub fn maybe_prewarm(&self) {
        if !self.config.enabled || !self.config.prewarm_on_start {
            return;
        }
        let Ok(pool) = self.strong() else {
            return;
        };
        tokio::spawn(async move {
            let count = pool.config.min_size;
            if let Err(err) = pool.warm_from_snapshot(count).await {
                tracing::warn!(error = %err, "initial pool warming failed");
            }
        });
    }

    /// Get a ready sandbox, falling back to snapshot restore and then to a
    /// fresh boot. The returned sandbox is tracked as in-use.
    pub async fn acquire(&self, config: VmConfig) -> FcResult<SandboxRef> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FcError::Unavailable("pool is closed".into()));
        }
        self.total_served.fetch_add(1, Ordering::SeqCst);

        let popped = self.ready.lock().unwrap().pop_front();
        if let Some(sandbox) = popped {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let id = {
                let mut sb = sandbox.lock().unwrap();
                sb.from_pool = true;
                sb.id.clone()
            };
            self.in_use.lock().unwrap().insert(id.clone(), sandbox.clone());
            tracing::debug!(sandbox_id = %id, "acquired vm from pool");

            match self.customize_vm(&sandbox, &config).await {
                Ok(()) => return Ok(sandbox),
                Err(err) => {
                    // A VM we cannot customize never reaches the caller.
                    tracing::warn!(sandbox_id = %id, error = %err, "customize failed, destroying pooled vm");
                    self.in_use.lock().unwrap().remove(&id);
                    let _ = self.lifecycle.destroy_vm(&sandbox).await;
                }
            }
        } else {
            self.misses.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("pool empty");
        }

        if let Some(snapshots) = self.snapshots.as_ref().filter(|s| s.has_golden()) {
            match snapshots.restore_from_golden().await {
                Ok(sandbox) => {
                    let id = sandbox.lock().unwrap().id.clone();
                    self.in_use.lock().unwrap().insert(id.clone(), sandbox.clone());
                    match self.customize_vm(&sandbox, &config).await {
                        Ok(()) => return Ok(sandbox),
                        Err(err) => {
                            tracing::warn!(sandbox_id = %id, error = %err, "customize of restored vm failed");
                            self.in_use.lock().unwrap().remove(&id);
                            let _ = self.lifecycle.destroy_vm(&sandbox).await;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "snapshot restore failed, falling back to fresh vm");
                }
            }
        }

        self.create_fresh(config).await
    }

    /// Return a sandbox: requeue it if it is young and there is room,
    /// destroy it otherwise. Non-fatal errors are logged, not surfaced.
    pub async fn release(&self, sandbox: &SandboxRef) {
        let (id, age) = {
            let sb = sandbox.lock().unwrap();
            (sb.id.clone(), sb.age().to_std().unwrap_or_default())
        };
        self.in_use.lock().unwrap().remove(&id);

        let ready_len = self.ready.lock().unwrap().len();
        if ready_len >= self.config.max_size || age > self.config.max_idle_time() {
            tracing::debug!(
                sandbox_id = %id,
                ready = ready_len,
                age_secs = age.as_secs(),
                "destroying vm instead of returning to pool"
            );
            self.destroy(sandbox).await;
            return;
        }

        if let Err(err) = self.reset_vm(sandbox).await {
            tracing::warn!(sandbox_id = %id, error = %err, "reset failed, destroying vm");
            self.destroy(sandbox).await;
            return;
        }

        sandbox.lock().unwrap().pooled_at = Some(Utc::now());
        if self.enqueue_ready(sandbox.clone()) {
            tracing::debug!(sandbox_id = %id, "returned vm to pool");
        } else {
            // Lost the race for the last slot.
            self.destroy(sandbox).await;
        }
    }

    /// Destroy an in-use sandbox without recycling (agent unreachable,
    /// fatal workload error).
    pub async fn discard(&self, sandbox: &SandboxRef) {
        let id = sandbox.lock().unwrap().id.clone();
        self.in_use.lock().unwrap().remove(&id);
        self.destroy(sandbox).await;
    }

    /// Boot `count` VMs in parallel (bounded by the warm semaphore) and
    /// enqueue them. Returns an aggregate error if any boot failed.
    pub async fn warm(&self, count: usize, config: VmConfig) -> FcResult<()> {
        tracing::info!(count, "warming vm pool");

        let this = self.strong()?;
        let mut tasks: JoinSet<FcResult<()>> = JoinSet::new();
        for _ in 0..count {
            let pool = this.clone();
            let config = config.clone();
            tasks.spawn(async move {
                let _permit = pool
                    .warm_sem
                    .acquire()
                    .await
                    .map_err(|_| FcError::Cancelled("pool closed during warm".into()))?;

                let sandbox = pool.lifecycle.create_vm(config).await?;
                sandbox.lock().unwrap().pooled_at = Some(Utc::now());
                if pool.enqueue_ready(sandbox.clone()) {
                    let id = sandbox.lock().unwrap().id.clone();
                    tracing::debug!(sandbox_id = %id, "added warmed vm to pool");
                } else {
                    let _ = pool.lifecycle.destroy_vm(&sandbox).await;
                }
                Ok(())
            });
        }

        let mut failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "warm vm creation failed");
                    failures += 1;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "warm task panicked");
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            return Err(FcError::Internal(format!("failed to warm {} vms", failures)));
        }
        Ok(())
    }

    /// Fill the pool by restoring from the golden snapshot when available,
    /// falling back to regular warming.
    pub async fn warm_from_snapshot(&self, count: usize) -> FcResult<()> {
        let Some(snapshots) = self.snapshots.as_ref().filter(|s| s.has_golden()) else {
            return self.warm(count, self.default_vm_config.clone()).await;
        };

        tracing::info!(count, "warming pool from golden snapshot");
        for _ in 0..count {
            match snapshots.restore_from_golden().await {
                Ok(sandbox) => {
                    sandbox.lock().unwrap().pooled_at = Some(Utc::now());
                    if !self.enqueue_ready(sandbox.clone()) {
                        let _ = self.lifecycle.destroy_vm(&sandbox).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "restore for pool warming failed");
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.ready.lock().unwrap().len(),
            in_use: self.in_use.lock().unwrap().len(),
            max_size: self.config.max_size,
            total_served: self.total_served.load(Ordering::SeqCst),
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
        }
    }

    /// Stop the loops and destroy every pooled and in-use sandbox.
    /// Idempotent and safe to call concurrently.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        tracing::info!("closing vm pool");

        loop {
            let sandbox = self.ready.lock().unwrap().pop_front();
            match sandbox {
                Some(sandbox) => self.destroy(&sandbox).await,
                None => break,
            }
        }

        let in_use: Vec<SandboxRef> = self.in_use.lock().unwrap().drain().map(|(_, s)| s).collect();
        for sandbox in in_use {
            self.destroy(&sandbox).await;
        }
    }

    // -- internals ----------------------------------------------------------

    async fn create_fresh(&self, config: VmConfig) -> FcResult<SandboxRef> {
        let sandbox = self.lifecycle.create_vm(config).await?;
        let id = sandbox.lock().unwrap().id.clone();
        self.in_use.lock().unwrap().insert(id, sandbox.clone());
        Ok(sandbox)
    }

    /// Bind the workload's rootfs and config onto a pre-warmed VM.
    async fn customize_vm(&self, sandbox: &SandboxRef, config: &VmConfig) -> FcResult<()> {
        if let Some(root) = &config.root_drive {
            let (id, booted_with_root) = {
                let sb = sandbox.lock().unwrap();
                (sb.id.clone(), sb.vm_config.root_drive.is_some())
            };
            let already_tracked = self
                .hotplug
                .attached_drives(&id)
                .iter()
                .any(|d| d.drive_id == ROOTFS_DRIVE_ID);

            if booted_with_root || already_tracked {
                self.hotplug
                    .update_drive_path(sandbox, ROOTFS_DRIVE_ID, &root.path_on_host)
                    .await?;
            } else {
                self.hotplug
                    .attach_drive(
                        sandbox,
                        HotplugConfig {
                            drive_id: ROOTFS_DRIVE_ID.to_string(),
                            path_on_host: root.path_on_host.clone(),
                            read_only: root.read_only,
                            is_root_device: true,
                            cache_type: root.cache_type,
                            rate_limiter: None,
                            mount_point: None,
                        },
                    )
                    .await?;
            }
        }

        let mut sb = sandbox.lock().unwrap();
        let cid = sb.vsock_cid;
        sb.rootfs_path = config.root_drive.as_ref().map(|d| d.path_on_host.clone());
        sb.vm_config = config.clone();
        // The CID was allocated at boot; the caller's config never carries
        // a real one.
        sb.vm_config.vsock_cid = cid;
        Ok(())
    }

    /// Strip workload state so a VM can serve the next tenant.
    async fn reset_vm(&self, sandbox: &SandboxRef) -> FcResult<()> {
        let (id, agent) = {
            let mut sb = sandbox.lock().unwrap();
            (sb.id.clone(), sb.agent.take())
        };
        if let Some(agent) = agent {
            agent.close().await;
        }
        self.hotplug.detach_all_drives(&id);

        let mut sb = sandbox.lock().unwrap();
        sb.clear_containers();
        sb.from_pool = false;
        Ok(())
    }

    async fn destroy(&self, sandbox: &SandboxRef) {
        let id = sandbox.lock().unwrap().id.clone();
        self.hotplug.forget(&id);
        if let Err(err) = self.lifecycle.destroy_vm(sandbox).await {
            tracing::warn!(sandbox_id = %id, error = %err, "error destroying pooled vm");
        }
    }

    fn enqueue_ready(&self, sandbox: SandboxRef) -> bool {
        let mut ready = self.ready.lock().unwrap();
        if ready.len() >= self.config.max_size {
            return false;
        }
        ready.push_back(sandbox);
        true
    }

    fn spawn_replenish_loop(pool: &Arc<Self>) {
        let weak = Arc::downgrade(pool);
        let cancel = pool.cancel.clone();
        let interval = pool.config.replenish_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(pool) = weak.upgrade() else { return };
                pool.replenish().await;
            }
        });
    }

    fn spawn_cleanup_loop(pool: &Arc<Self>) {
        let weak = Arc::downgrade(pool);
        let cancel = pool.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
                }
                let Some(pool) = weak.upgrade() else { return };
                pool.cleanup_idle().await;
            }
        });
    }

    async fn replenish(&self) {
        let available = self.ready.lock().unwrap().len();
        if available >= self.config.min_size {
            return;
        }
        let needed = self.config.min_size - available;
        tracing::debug!(current = available, min = self.config.min_size, needed, "replenishing pool");

        match tokio::time::timeout(
            REPLENISH_DEADLINE,
            self.warm(needed, self.default_vm_config.clone()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "replenish failed"),
            Err(_) => tracing::warn!("replenish timed out"),
        }
    }

    /// Drain the ready queue, destroy entries idle past the limit, and put
    /// the rest back. An acquire racing the drain sees a miss; acceptable.
    pub(crate) async fn cleanup_idle(&self) {
        let mut drained = Vec::new();
        {
            let mut ready = self.ready.lock().unwrap();
            while let Some(sandbox) = ready.pop_front() {
                drained.push(sandbox);
            }
        }

        let mut keep = Vec::new();
        for sandbox in drained {
            let idle = sandbox
                .lock()
                .unwrap()
                .idle_time()
                .and_then(|d| d.to_std().ok())
                .unwrap_or_default();
            if idle > self.config.max_idle_time() {
                let id = sandbox.lock().unwrap().id.clone();
                tracing::debug!(sandbox_id = %id, idle_secs = idle.as_secs(), "removing idle vm from pool");
                self.destroy(&sandbox).await;
            } else {
                keep.push(sandbox);
            }
        }

        for sandbox in keep {
            if !self.enqueue_ready(sandbox.clone()) {
                self.destroy(&sandbox).await;
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
