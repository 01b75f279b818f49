//! Restore mount service: attaches a completed backup disk's QCOW2 to a
//! kernel NBD device, mounts its partitions read-only and serves file
//! listings and downloads until the mount expires or is deleted.

pub mod browse;
pub mod device;
pub mod error;
pub mod eviction;

pub use error::RestoreError;

use crate::config::ServerConfig;
use crate::schemas::v1::db::queries as db;
use crate::schemas::v1::models::restore::{PartitionInfo, RestoreMount};
use chrono::{Duration as ChronoDuration, Utc};
use log::{info, warn};
use sqlx::{MySql, Pool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Partitions smaller than this are alignment slack or reserved areas and
/// are not worth mounting.
const MIN_PARTITION_BYTES: u64 = 1024 * 1024;

pub struct RestoreService {
    pool: Pool<MySql>,
    config: Arc<ServerConfig>,
    /// Devices held by in-flight attach attempts, before their mount row
    /// exists. Closes the race between two concurrent mounts picking the
    /// same free device.
    claimed_devices: Mutex<HashSet<String>>,
}

impl RestoreService {
    pub fn new(pool: Pool<MySql>, config: Arc<ServerConfig>) -> Self {
        Self {
            pool,
            config,
            claimed_devices: Mutex::new(HashSet::new()),
        }
    }

    pub fn pool(&self) -> &Pool<MySql> {
        &self.pool
    }

    /// Mounts one disk of a completed backup and returns the persisted
    /// mount record.
    pub async fn mount_disk(&self, backup_disk_id: i64) -> Result<RestoreMount, RestoreError> {
        let disk = db::disk::disk_by_id(&self.pool, backup_disk_id)
            .await?
            .ok_or_else(|| {
                RestoreError::NotFound(format!("backup disk {} does not exist", backup_disk_id))
            })?;

        if disk.status != "completed" {
            return Err(RestoreError::BadInput(format!(
                "backup disk {} is {}, not completed",
                backup_disk_id, disk.status
            )));
        }

        if db::mount::active_mount_for_disk(&self.pool, backup_disk_id)
            .await?
            .is_some()
        {
            return Err(RestoreError::AlreadyMounted(backup_disk_id));
        }

        let device = self.claim_free_device().await?;
        let mount_uuid = Uuid::new_v4().to_string();

        match self
            .attach_and_mount(&device, &mount_uuid, Path::new(&disk.qcow2_path))
            .await
        {
            Ok(partitions) => {
                let expires_at =
                    Utc::now() + ChronoDuration::seconds(self.config.restore_idle_ttl_secs as i64);
                let base = self.base_path(&mount_uuid);

                let row = db::mount::create_mount(
                    &self.pool,
                    &mount_uuid,
                    backup_disk_id,
                    &device,
                    &base.to_string_lossy(),
                    &serde_json::to_value(&partitions).unwrap_or_default(),
                    expires_at,
                )
                .await;

                match row {
                    Ok(row) => {
                        info!(
                            "Mounted backup disk {} on {} as {} ({} partitions)",
                            backup_disk_id,
                            device,
                            mount_uuid,
                            partitions.iter().filter(|p| p.mount_path.is_some()).count()
                        );
                        Ok(row)
                    }
                    Err(e) => {
                        // Persisting failed; tear the kernel state back down.
                        self.teardown_kernel_state(&device, &mount_uuid, &partitions).await;
                        Err(e.into())
                    }
                }
            }
            Err(e) => {
                let _ = device::detach(&self.config.qemu_nbd_path, &device).await;
                self.release_device(&device).await;
                Err(e)
            }
        }
    }

    fn base_path(&self, mount_uuid: &str) -> PathBuf {
        Path::new(&self.config.restore_mount_base).join(mount_uuid)
    }

    async fn claim_free_device(&self) -> Result<String, RestoreError> {
        let mut claimed = self.claimed_devices.lock().await;
        for index in 0..self.config.nbd_device_count {
            let device = device::device_path(index);
            if claimed.contains(&device) {
                continue;
            }
            if device::device_is_free(index).await {
                claimed.insert(device.clone());
                return Ok(device);
            }
        }
        Err(RestoreError::NoFreeDevice)
    }

    async fn release_device(&self, device: &str) {
        self.claimed_devices.lock().await.remove(device);
    }

    async fn attach_and_mount(
        &self,
        device: &str,
        mount_uuid: &str,
        qcow2_path: &Path,
    ) -> Result<Vec<PartitionInfo>, RestoreError> {
        device::attach(&self.config.qemu_nbd_path, device, qcow2_path).await?;

        let probed = device::probe_partitions(device).await?;
        let base = self.base_path(mount_uuid);

        let mut partitions: Vec<PartitionInfo> = Vec::new();
        let mut next_index: u32 = 1;
        let mut mounted_any = false;

        for candidate in probed {
            if candidate.size_bytes < MIN_PARTITION_BYTES {
                continue;
            }

            let (filesystem, label) = device::blkid(&candidate.device).await;
            let index = next_index;
            next_index += 1;

            let mount_point = base.join(format!("partition-{}", index));
            let mount_path = match device::mount_readonly(&candidate.device, &mount_point).await {
                Ok(()) => {
                    mounted_any = true;
                    Some(mount_point.to_string_lossy().into_owned())
                }
                Err(e) => {
                    // Unsupported or encrypted filesystems are expected;
                    // the partition stays listed but unbrowsable.
                    warn!("Skipping partition {}: {}", candidate.device, e);
                    None
                }
            };

            partitions.push(PartitionInfo {
                index,
                device: candidate.device,
                mount_path,
                size_bytes: candidate.size_bytes,
                filesystem,
                label,
            });
        }

        if !mounted_any {
            for partition in partitions.iter().rev() {
                if let Some(path) = &partition.mount_path {
                    device::unmount(Path::new(path)).await;
                }
            }
            let _ = tokio::fs::remove_dir_all(&base).await;
            return Err(RestoreError::NothingMounted);
        }

        Ok(partitions)
    }

    /// Looks up a mount by its public id.
    pub async fn get_mount(&self, mount_uuid: &str) -> Result<RestoreMount, RestoreError> {
        db::mount::get_mount_by_uuid(&self.pool, mount_uuid)
            .await?
            .ok_or_else(|| RestoreError::NotFound(format!("mount {} does not exist", mount_uuid)))
    }

    /// Unmounts everything, detaches the device and deletes the record.
    /// Idempotent: a second call for a gone mount succeeds quietly.
    pub async fn unmount(&self, mount_uuid: &str) -> Result<(), RestoreError> {
        let Some(mount) = db::mount::get_mount_by_uuid(&self.pool, mount_uuid).await? else {
            return Ok(());
        };

        let partitions = mount.partitions();
        self.teardown_kernel_state(&mount.block_device, mount_uuid, &partitions).await;

        db::mount::delete_mount(&self.pool, mount_uuid).await?;
        info!("Unmounted restore mount {}", mount_uuid);
        Ok(())
    }

    /// Reverse of attach_and_mount: unmount partitions in reverse order,
    /// remove the directories, detach the block device.
    async fn teardown_kernel_state(
        &self,
        block_device: &str,
        mount_uuid: &str,
        partitions: &[PartitionInfo],
    ) {
        for partition in partitions.iter().rev() {
            if let Some(path) = &partition.mount_path {
                device::unmount(Path::new(path)).await;
            }
        }

        let base = self.base_path(mount_uuid);
        if let Err(e) = tokio::fs::remove_dir_all(&base).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", base.display(), e);
            }
        }

        let _ = device::detach(&self.config.qemu_nbd_path, block_device).await;
        self.release_device(block_device).await;
    }

    /// Finds the partition record for a browse path index.
    pub fn partition_by_index(
        mount: &RestoreMount,
        index: u32,
    ) -> Result<PartitionInfo, RestoreError> {
        mount
            .partitions()
            .into_iter()
            .find(|p| p.index == index)
            .ok_or_else(|| RestoreError::NotFound(format!("no partition-{} in this mount", index)))
    }
}
