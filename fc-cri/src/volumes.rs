//! Per-sandbox volume images.
//!
//! Volume specs become concrete drive configurations: the rootfs passes
//! through as the root device, data volumes attach writeback, emptydirs are
//! materialized as sparse ext4 images, and secrets/configmaps become small
//! read-only images populated from their host source. Images live under
//! `<runtime_dir>/volumes/<sandbox-id>/` and are removed on destroy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fc_cri_shared::constants::drives::ROOTFS_DRIVE_ID;
use fc_cri_shared::{FcError, FcResult};

use crate::domain::{CacheType, HotplugConfig, VolumeKind, VolumeSpec};
use crate::layout::RuntimeLayout;
use crate::util::run_command;

/// Default emptydir size when the spec leaves it zero.
const DEFAULT_EMPTYDIR_BYTES: u64 = 100 * 1024 * 1024;

/// Size of secret/configmap images; their content is tiny.
const CONFIG_IMAGE_BYTES: u64 = 16 * 1024 * 1024;

/// Deadline for mkfs/mount/cp invocations.
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Prepares and cleans up volume images for sandboxes.
pub struct VolumeManager {
    layout: RuntimeLayout,
}

impl VolumeManager {
    pub fn new(layout: RuntimeLayout) -> Self {
        Self { layout }
    }

    /// Turn volume specs into drive configurations, creating backing images
    /// where needed.
    pub async fn prepare_volumes(
        &self,
        sandbox_id: &str,
        volumes: &[VolumeSpec],
    ) -> FcResult<Vec<HotplugConfig>> {
        let mut configs = Vec::with_capacity(volumes.len());
        for (index, volume) in volumes.iter().enumerate() {
            let config = self.prepare_volume(sandbox_id, volume, index).await?;
            configs.push(config);
        }
        Ok(configs)
    }

    async fn prepare_volume(
        &self,
        sandbox_id: &str,
        volume: &VolumeSpec,
        index: usize,
    ) -> FcResult<HotplugConfig> {
        let source = |volume: &VolumeSpec| -> FcResult<PathBuf> {
            volume.source.clone().ok_or_else(|| {
                FcError::InvalidArgument(format!(
                    "volume {} ({:?}) has no host source",
                    volume.name, volume.kind
                ))
            })
        };

        match volume.kind {
            VolumeKind::Rootfs => Ok(HotplugConfig {
                drive_id: ROOTFS_DRIVE_ID.to_string(),
                path_on_host: source(volume)?,
                read_only: volume.read_only,
                is_root_device: true,
                cache_type: CacheType::Unsafe,
                rate_limiter: None,
                mount_point: None,
            }),
            VolumeKind::Data => Ok(HotplugConfig {
                drive_id: drive_id(index, &volume.name),
                path_on_host: source(volume)?,
                read_only: volume.read_only,
                is_root_device: false,
                cache_type: CacheType::Writeback,
                rate_limiter: None,
                mount_point: Some(volume.mount_path.clone()),
            }),
            VolumeKind::EmptyDir => {
                let size = if volume.size_bytes == 0 {
                    DEFAULT_EMPTYDIR_BYTES
                } else {
                    volume.size_bytes
                };
                let image = self
                    .create_ext4_image(sandbox_id, &volume.name, size)
                    .await?;
                Ok(HotplugConfig {
                    drive_id: drive_id(index, &volume.name),
                    path_on_host: image,
                    read_only: false,
                    is_root_device: false,
                    cache_type: CacheType::Unsafe,
                    rate_limiter: None,
                    mount_point: Some(volume.mount_path.clone()),
                })
            }
            VolumeKind::Secret | VolumeKind::ConfigMap => {
                let image = self
                    .create_config_image(sandbox_id, &volume.name, &source(volume)?)
                    .await?;
                Ok(HotplugConfig {
                    drive_id: drive_id(index, &volume.name),
                    path_on_host: image,
                    read_only: true,
                    is_root_device: false,
                    cache_type: CacheType::Unsafe,
                    rate_limiter: None,
                    mount_point: Some(volume.mount_path.clone()),
                })
            }
        }
    }

    /// Sparse ext4 image of the requested size.
    async fn create_ext4_image(
        &self,
        sandbox_id: &str,
        name: &str,
        size_bytes: u64,
    ) -> FcResult<PathBuf> {
        let path = self.image_path(sandbox_id, name)?;

        let file = std::fs::File::create(&path)
            .map_err(|e| FcError::Internal(format!("create image {}: {}", path.display(), e)))?;
        file.set_len(size_bytes)
            .map_err(|e| FcError::Internal(format!("truncate image {}: {}", path.display(), e)))?;
        drop(file);

        let path_str = path.to_string_lossy();
        run_command("mkfs.ext4", ["-F", "-q", path_str.as_ref()], TOOL_TIMEOUT).await?;

        tracing::debug!(sandbox_id, name, size_bytes, path = %path.display(), "created ext4 image");
        Ok(path)
    }

    /// Small read-only image populated with the contents of `content_dir`.
    /// The copy goes through a transient mount, so this needs the privileges
    /// the runtime already has for jailing.
    async fn create_config_image(
        &self,
        sandbox_id: &str,
        name: &str,
        content_dir: &Path,
    ) -> FcResult<PathBuf> {
        if !content_dir.exists() {
            return Err(FcError::InvalidArgument(format!(
                "volume source does not exist: {}",
                content_dir.display()
            )));
        }

        let path = self
            .create_ext4_image(sandbox_id, name, CONFIG_IMAGE_BYTES)
            .await?;

        let staging = self.layout.volumes_dir(sandbox_id).join(format!(".mnt-{}", name));
        std::fs::create_dir_all(&staging)
            .map_err(|e| FcError::Internal(format!("create staging dir: {}", e)))?;

        let image = path.to_string_lossy().into_owned();
        let mount_point = staging.to_string_lossy().into_owned();

        run_command(
            "mount",
            ["-o", "loop", image.as_str(), mount_point.as_str()],
            TOOL_TIMEOUT,
        )
        .await?;

        let copy = run_command(
            "cp",
            [
                "-a".to_string(),
                format!("{}/.", content_dir.display()),
                mount_point.clone(),
            ],
            TOOL_TIMEOUT,
        )
        .await;

        let unmount = run_command("umount", [mount_point.as_str()], TOOL_TIMEOUT).await;
        let _ = std::fs::remove_dir(&staging);

        copy?;
        unmount?;
        Ok(path)
    }

    fn image_path(&self, sandbox_id: &str, name: &str) -> FcResult<PathBuf> {
        let dir = self.layout.volumes_dir(sandbox_id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            FcError::Internal(format!("create volumes dir {}: {}", dir.display(), e))
        })?;
        Ok(dir.join(format!("{}.ext4", name)))
    }

    /// Remove every volume image belonging to a sandbox.
    pub fn cleanup_volumes(&self, sandbox_id: &str) {
        let dir = self.layout.volumes_dir(sandbox_id);
        if dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(sandbox_id, error = %err, "failed to remove volume dir");
            }
        }
    }
}

fn drive_id(index: usize, name: &str) -> String {
    format!("vol{}-{}", index, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> (VolumeManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (
            VolumeManager::new(RuntimeLayout::new(dir.path())),
            dir,
        )
    }

    #[tokio::test]
    async fn rootfs_volume_becomes_root_device() {
        let (manager, dir) = test_manager();
        let rootfs = dir.path().join("a.ext4");
        std::fs::File::create(&rootfs).unwrap();

        let configs = manager
            .prepare_volumes(
                "sb-1",
                &[VolumeSpec {
                    name: "root".into(),
                    kind: VolumeKind::Rootfs,
                    source: Some(rootfs.clone()),
                    mount_path: "/".into(),
                    read_only: false,
                    size_bytes: 0,
                }],
            )
            .await
            .unwrap();

        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].drive_id, "rootfs");
        assert!(configs[0].is_root_device);
        assert_eq!(configs[0].cache_type, CacheType::Unsafe);
        assert_eq!(configs[0].path_on_host, rootfs);
    }

    #[tokio::test]
    async fn data_volume_uses_writeback_and_indexed_id() {
        let (manager, dir) = test_manager();
        let source = dir.path().join("data.ext4");
        std::fs::File::create(&source).unwrap();

        let configs = manager
            .prepare_volumes(
                "sb-1",
                &[VolumeSpec {
                    name: "scratch".into(),
                    kind: VolumeKind::Data,
                    source: Some(source),
                    mount_path: "/data".into(),
                    read_only: false,
                    size_bytes: 0,
                }],
            )
            .await
            .unwrap();

        assert_eq!(configs[0].drive_id, "vol0-scratch");
        assert_eq!(configs[0].cache_type, CacheType::Writeback);
        assert_eq!(configs[0].mount_point.as_deref(), Some("/data"));
        assert!(!configs[0].is_root_device);
    }

    #[tokio::test]
    async fn data_volume_without_source_is_rejected() {
        let (manager, _dir) = test_manager();
        let err = manager
            .prepare_volumes(
                "sb-1",
                &[VolumeSpec {
                    name: "scratch".into(),
                    kind: VolumeKind::Data,
                    source: None,
                    mount_path: "/data".into(),
                    read_only: false,
                    size_bytes: 0,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, fc_cri_shared::FcError::InvalidArgument(_)));
        assert!(err.to_string().contains("scratch"));
    }

    #[test]
    fn cleanup_removes_volume_dir() {
        let (manager, dir) = test_manager();
        let volumes = RuntimeLayout::new(dir.path()).volumes_dir("sb-1");
        std::fs::create_dir_all(&volumes).unwrap();
        std::fs::write(volumes.join("x.ext4"), b"img").unwrap();

        manager.cleanup_volumes("sb-1");
        assert!(!volumes.exists());
    }

    #[test]
    fn drive_id_format() {
        assert_eq!(drive_id(2, "cache"), "vol2-cache");
    }
}
