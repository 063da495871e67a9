//! Drive hotplug for running VMs.
//!
//! Pooled VMs boot with a minimal base rootfs; when acquired for a workload
//! the real rootfs and any volumes are bound over the VMM API without a
//! reboot. Firecracker has no true hot-detach, so detach is a tracking-only
//! contract: the agent unmounts on container teardown and the backing image
//! dies with the sandbox. The `rootfs` drive is never auto-detached.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use fc_cri_shared::constants::drives::ROOTFS_DRIVE_ID;
use fc_cri_shared::{FcError, FcResult};

use crate::domain::{AttachedDrive, DriveRateLimit, HotplugConfig, SandboxRef};
use crate::vmm::models::{Drive, PartialDrive, RateLimiter, TokenBucket};
use crate::vmm::VmmHandle;

/// Tracks hot-attached drives per sandbox and talks to the drives endpoint.
#[derive(Default)]
pub struct HotplugManager {
    attached: Mutex<HashMap<String, Vec<AttachedDrive>>>,
}

impl HotplugManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hot-attach a drive to a running VM.
    pub async fn attach_drive(&self, sandbox: &SandboxRef, config: HotplugConfig) -> FcResult<()> {
        if !config.path_on_host.exists() {
            return Err(FcError::InvalidArgument(format!(
                "drive path does not exist: {}",
                config.path_on_host.display()
            )));
        }

        let (sandbox_id, handle) = vmm_handle(sandbox)?;

        tracing::info!(
            sandbox_id = %sandbox_id,
            drive_id = %config.drive_id,
            path = %config.path_on_host.display(),
            read_only = config.read_only,
            "hot-attaching drive"
        );

        let drive = Drive {
            drive_id: config.drive_id.clone(),
            path_on_host: config.path_on_host.to_string_lossy().into_owned(),
            is_root_device: config.is_root_device,
            is_read_only: config.read_only,
            cache_type: Some(config.cache_type.as_str().to_string()),
            rate_limiter: config.rate_limiter.as_ref().map(rate_limiter_model),
        };
        handle.api().put_drive(&drive).await?;

        let mut attached = self.attached.lock().unwrap();
        attached.entry(sandbox_id).or_default().push(AttachedDrive {
            drive_id: config.drive_id,
            path_on_host: config.path_on_host,
            mount_point: config.mount_point,
            read_only: config.read_only,
            attached_at: Utc::now(),
        });
        Ok(())
    }

    /// Swap the backing file of an existing drive in place.
    pub async fn update_drive_path(
        &self,
        sandbox: &SandboxRef,
        drive_id: &str,
        new_path: &Path,
    ) -> FcResult<()> {
        if !new_path.exists() {
            return Err(FcError::InvalidArgument(format!(
                "new drive path does not exist: {}",
                new_path.display()
            )));
        }

        let (sandbox_id, handle) = vmm_handle(sandbox)?;

        tracing::info!(
            sandbox_id = %sandbox_id,
            drive_id,
            new_path = %new_path.display(),
            "updating drive path"
        );

        handle
            .api()
            .patch_drive(&PartialDrive {
                drive_id: drive_id.to_string(),
                path_on_host: new_path.to_string_lossy().into_owned(),
            })
            .await?;

        let mut attached = self.attached.lock().unwrap();
        if let Some(drives) = attached.get_mut(&sandbox_id) {
            for drive in drives.iter_mut() {
                if drive.drive_id == drive_id {
                    drive.path_on_host = new_path.to_path_buf();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Drop a drive from tracking. Best effort: the guest-side unmount is the
    /// agent's job during container teardown.
    pub fn detach_drive(&self, sandbox_id: &str, drive_id: &str) {
        let mut attached = self.attached.lock().unwrap();
        if let Some(drives) = attached.get_mut(sandbox_id) {
            drives.retain(|d| d.drive_id != drive_id);
        }
        tracing::debug!(sandbox_id, drive_id, "drive detached from tracking");
    }

    /// Drop all per-workload drives when a VM returns to the pool. The
    /// `rootfs` drive stays.
    pub fn detach_all_drives(&self, sandbox_id: &str) {
        let mut attached = self.attached.lock().unwrap();
        if let Some(drives) = attached.get_mut(sandbox_id) {
            let before = drives.len();
            drives.retain(|d| d.drive_id == ROOTFS_DRIVE_ID);
            tracing::debug!(
                sandbox_id,
                detached = before - drives.len(),
                "detached workload drives"
            );
        }
    }

    /// Forget a sandbox entirely (on destroy).
    pub fn forget(&self, sandbox_id: &str) {
        self.attached.lock().unwrap().remove(sandbox_id);
    }

    /// Snapshot of the drives currently bound to a sandbox.
    pub fn attached_drives(&self, sandbox_id: &str) -> Vec<AttachedDrive> {
        self.attached
            .lock()
            .unwrap()
            .get(sandbox_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn vmm_handle(sandbox: &SandboxRef) -> FcResult<(String, std::sync::Arc<VmmHandle>)> {
    let sb = sandbox.lock().unwrap();
    let handle = sb
        .vmm
        .clone()
        .ok_or_else(|| FcError::FailedPrecondition(format!("sandbox {} has no vmm", sb.id)))?;
    Ok((sb.id.clone(), handle))
}

// Firecracker token buckets: `size` is the burst, `one_time_burst` the
// initial allowance, refilled once per second.
fn rate_limiter_model(limit: &DriveRateLimit) -> RateLimiter {
    RateLimiter {
        bandwidth: Some(TokenBucket {
            size: limit.bandwidth_burst_bytes,
            refill_time: 1000,
            one_time_burst: Some(limit.bandwidth_bytes_per_sec),
        }),
        ops: Some(TokenBucket {
            size: limit.ops_burst,
            refill_time: 1000,
            one_time_burst: Some(limit.ops_per_sec),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CacheType, Sandbox};
    use std::path::PathBuf;

    fn tracked(manager: &HotplugManager, sandbox_id: &str, drive_id: &str) {
        manager
            .attached
            .lock()
            .unwrap()
            .entry(sandbox_id.to_string())
            .or_default()
            .push(AttachedDrive {
                drive_id: drive_id.to_string(),
                path_on_host: PathBuf::from("/img/x.ext4"),
                mount_point: None,
                read_only: false,
                attached_at: Utc::now(),
            });
    }

    #[tokio::test]
    async fn attach_missing_path_is_invalid_argument() {
        let manager = HotplugManager::new();
        let sandbox = Sandbox::new("sb-1").into_ref();
        let err = manager
            .attach_drive(
                &sandbox,
                HotplugConfig {
                    drive_id: "data0".into(),
                    path_on_host: PathBuf::from("/nonexistent/data.ext4"),
                    read_only: false,
                    is_root_device: false,
                    cache_type: CacheType::Writeback,
                    rate_limiter: None,
                    mount_point: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FcError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn attach_without_vmm_is_failed_precondition() {
        let manager = HotplugManager::new();
        let sandbox = Sandbox::new("sb-1").into_ref();
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = manager
            .attach_drive(
                &sandbox,
                HotplugConfig {
                    drive_id: "data0".into(),
                    path_on_host: file.path().to_path_buf(),
                    read_only: false,
                    is_root_device: false,
                    cache_type: CacheType::Writeback,
                    rate_limiter: None,
                    mount_point: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FcError::FailedPrecondition(_)));
    }

    #[test]
    fn detach_all_keeps_rootfs() {
        let manager = HotplugManager::new();
        tracked(&manager, "sb-1", ROOTFS_DRIVE_ID);
        tracked(&manager, "sb-1", "vol0-data");
        tracked(&manager, "sb-1", "vol1-cache");

        manager.detach_all_drives("sb-1");

        let drives = manager.attached_drives("sb-1");
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].drive_id, ROOTFS_DRIVE_ID);
    }

    #[test]
    fn detach_single_drive_removes_only_it() {
        let manager = HotplugManager::new();
        tracked(&manager, "sb-1", "vol0-data");
        tracked(&manager, "sb-1", "vol1-cache");

        manager.detach_drive("sb-1", "vol0-data");

        let drives = manager.attached_drives("sb-1");
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].drive_id, "vol1-cache");
    }

    #[test]
    fn forget_clears_sandbox_tracking() {
        let manager = HotplugManager::new();
        tracked(&manager, "sb-1", "vol0-data");
        manager.forget("sb-1");
        assert!(manager.attached_drives("sb-1").is_empty());
    }

    #[test]
    fn rate_limiter_mapping() {
        let model = rate_limiter_model(&DriveRateLimit {
            bandwidth_bytes_per_sec: 1_000_000,
            bandwidth_burst_bytes: 2_000_000,
            ops_per_sec: 500,
            ops_burst: 1000,
        });
        let bandwidth = model.bandwidth.unwrap();
        assert_eq!(bandwidth.size, 2_000_000);
        assert_eq!(bandwidth.refill_time, 1000);
        assert_eq!(bandwidth.one_time_burst, Some(1_000_000));
        let ops = model.ops.unwrap();
        assert_eq!(ops.size, 1000);
    }
}
