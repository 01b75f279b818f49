//! Kernel NBD block-device handling for restore mounts. This is the NBD
//! *client* role: the same protocol that carries backup data into the
//! block servers here attaches a finished QCOW2 to /dev/nbdX so its
//! partitions can be mounted read-only.

use crate::restore::error::RestoreError;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Sysfs node that exists while a kernel NBD device has a server
/// connected. Devices in use by anyone else are skipped during discovery.
fn sysfs_pid_path(device_index: u32) -> String {
    format!("/sys/block/nbd{}/pid", device_index)
}

pub fn device_path(device_index: u32) -> String {
    format!("/dev/nbd{}", device_index)
}

/// True when the kernel reports no server attached to the device.
pub async fn device_is_free(device_index: u32) -> bool {
    tokio::fs::metadata(sysfs_pid_path(device_index)).await.is_err()
}

/// Attaches a QCOW2 read-only to the given device and waits for the
/// kernel to publish a non-zero size.
pub async fn attach(
    qemu_nbd_path: &str,
    device: &str,
    qcow2_path: &Path,
) -> Result<(), RestoreError> {
    let status = Command::new(qemu_nbd_path)
        .arg("--connect")
        .arg(device)
        .arg("--read-only")
        .arg("--format")
        .arg("qcow2")
        .arg(qcow2_path)
        .status()
        .await?;

    if !status.success() {
        return Err(RestoreError::AttachFailed {
            device: device.to_string(),
            detail: format!("qemu-nbd exited with {}", status),
        });
    }

    // The size node flips from 0 once the connection is live and the
    // kernel has re-read the partition table.
    let name = device.trim_start_matches("/dev/");
    let size_path = format!("/sys/block/{}/size", name);
    for _ in 0..50 {
        if let Ok(content) = tokio::fs::read_to_string(&size_path).await {
            if content.trim().parse::<u64>().unwrap_or(0) > 0 {
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let _ = detach(qemu_nbd_path, device).await;
    Err(RestoreError::AttachFailed {
        device: device.to_string(),
        detail: "device never reported a size".to_string(),
    })
}

/// Detaches the device. Safe to call on an already-detached device.
pub async fn detach(qemu_nbd_path: &str, device: &str) -> Result<(), RestoreError> {
    let status = Command::new(qemu_nbd_path)
        .arg("--disconnect")
        .arg(device)
        .status()
        .await?;

    if !status.success() {
        log::warn!("qemu-nbd --disconnect {} exited with {}", device, status);
    }
    Ok(())
}

/// A partition the kernel discovered on an attached device.
#[derive(Debug, Clone)]
pub struct ProbedPartition {
    pub device: String,
    pub size_bytes: u64,
}

/// Scans sysfs for partitions of an attached device. When the disk has no
/// partition table the whole device is returned as the single candidate,
/// which covers unpartitioned filesystems.
pub async fn probe_partitions(device: &str) -> Result<Vec<ProbedPartition>, RestoreError> {
    let name = device.trim_start_matches("/dev/");
    let sys_dir = format!("/sys/block/{}", name);

    let mut partitions: Vec<(u32, ProbedPartition)> = Vec::new();
    let mut entries = tokio::fs::read_dir(&sys_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let entry_name = entry.file_name().to_string_lossy().into_owned();
        let Some(suffix) = entry_name.strip_prefix(&format!("{}p", name)) else {
            continue;
        };
        let Ok(part_number) = suffix.parse::<u32>() else {
            continue;
        };

        let size_path = format!("{}/{}/size", sys_dir, entry_name);
        let sectors = tokio::fs::read_to_string(&size_path)
            .await
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);

        partitions.push((
            part_number,
            ProbedPartition {
                device: format!("/dev/{}", entry_name),
                size_bytes: sectors * 512,
            },
        ));
    }

    partitions.sort_by_key(|(n, _)| *n);

    if partitions.is_empty() {
        let sectors = tokio::fs::read_to_string(format!("{}/size", sys_dir))
            .await
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        return Ok(vec![ProbedPartition {
            device: device.to_string(),
            size_bytes: sectors * 512,
        }]);
    }

    Ok(partitions.into_iter().map(|(_, p)| p).collect())
}

/// Filesystem type and label as reported by blkid, when it knows.
pub async fn blkid(device: &str) -> (Option<String>, Option<String>) {
    let output = Command::new("blkid").arg("-o").arg("export").arg(device).output().await;

    let Ok(output) = output else {
        return (None, None);
    };

    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    let mut fs_type = None;
    let mut label = None;
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("TYPE=") {
            fs_type = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("LABEL=") {
            label = Some(value.to_string());
        }
    }
    (fs_type, label)
}

/// Mounts a partition read-only. Failures are the caller's to log and
/// skip; encrypted or exotic filesystems are expected in the wild.
pub async fn mount_readonly(device: &str, mount_point: &Path) -> Result<(), RestoreError> {
    tokio::fs::create_dir_all(mount_point).await?;

    let status = Command::new("mount")
        .arg("-o")
        .arg("ro")
        .arg(device)
        .arg(mount_point)
        .status()
        .await?;

    if !status.success() {
        let _ = tokio::fs::remove_dir(mount_point).await;
        return Err(RestoreError::AttachFailed {
            device: device.to_string(),
            detail: format!("mount exited with {}", status),
        });
    }
    Ok(())
}

/// Unmounts a path, escalating to a lazy unmount after a bounded wait so
/// eviction succeeds even against a misbehaving filesystem.
pub async fn unmount(mount_point: &Path) {
    let status = Command::new("umount").arg(mount_point).status().await;

    if matches!(status, Ok(s) if s.success()) {
        return;
    }

    log::warn!(
        "umount of {} failed, retrying lazily in 2s",
        mount_point.display()
    );
    tokio::time::sleep(Duration::from_secs(2)).await;

    let lazy = Command::new("umount").arg("-l").arg(mount_point).status().await;
    if !matches!(lazy, Ok(s) if s.success()) {
        log::error!("lazy umount of {} also failed", mount_point.display());
    }
}
