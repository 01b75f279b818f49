//! Path resolution and directory listing for mounted backups. Partitions
//! are presented as virtual `partition-N` directories under the mount
//! root so callers never see kernel device names.

use crate::restore::error::RestoreError;
use crate::schemas::v1::models::restore::PartitionInfo;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// Path usable in subsequent list/download calls
    pub path: String,
    pub is_dir: bool,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Where a browse path points.
#[derive(Debug, PartialEq)]
pub enum ResolvedPath {
    /// The synthetic mount root listing the partitions
    Root,
    /// Inside partition `index`, at `subpath` relative to its mount point
    Partition { index: u32, subpath: String },
}

/// Splits `/partition-N/rest` into its partition number and relative
/// remainder. Any `..` component or absolute remainder is rejected before
/// the filesystem is ever touched.
pub fn resolve_browse_path(path: &str) -> Result<ResolvedPath, RestoreError> {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return Ok(ResolvedPath::Root);
    }

    let without_root = trimmed.trim_start_matches('/');
    let (first, rest) = match without_root.split_once('/') {
        Some((first, rest)) => (first, rest),
        None => (without_root, ""),
    };

    let index: u32 = first
        .strip_prefix("partition-")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| RestoreError::BadInput(format!("unknown path '{}'", path)))?;

    let subpath = Path::new(rest);
    for component in subpath.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(RestoreError::PathEscape(path.to_string())),
        }
    }

    Ok(ResolvedPath::Partition {
        index,
        subpath: rest.to_string(),
    })
}

/// The synthetic root listing: one directory entry per partition that
/// actually mounted, annotated with size and label.
pub fn list_root(partitions: &[PartitionInfo]) -> Vec<FileEntry> {
    partitions
        .iter()
        .filter(|p| p.mount_path.is_some())
        .map(|p| FileEntry {
            name: format!("partition-{}", p.index),
            path: format!("/partition-{}", p.index),
            is_dir: true,
            size_bytes: p.size_bytes,
            modified: None,
            filesystem: p.filesystem.clone(),
            label: p.label.clone(),
        })
        .collect()
}

/// Resolves a partition-relative subpath against the partition's real
/// mount point, confirming the canonical result stays inside it. This is
/// the only symlink-escape barrier, so both listing and download go
/// through it.
pub async fn resolve_on_disk(
    partition: &PartitionInfo,
    subpath: &str,
) -> Result<PathBuf, RestoreError> {
    let mount_path = partition
        .mount_path
        .as_deref()
        .ok_or_else(|| RestoreError::BadInput(format!("partition-{} did not mount", partition.index)))?;

    let candidate = Path::new(mount_path).join(subpath);
    let canonical = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| RestoreError::NotFound(format!("no such path '{}'", subpath)))?;

    let canonical_root = tokio::fs::canonicalize(mount_path).await?;
    if !canonical.starts_with(&canonical_root) {
        return Err(RestoreError::PathEscape(subpath.to_string()));
    }

    Ok(canonical)
}

/// Lists a real directory inside a partition.
pub async fn list_directory(
    partition: &PartitionInfo,
    subpath: &str,
) -> Result<Vec<FileEntry>, RestoreError> {
    let dir = resolve_on_disk(partition, subpath).await?;

    let metadata = tokio::fs::metadata(&dir).await?;
    if !metadata.is_dir() {
        return Err(RestoreError::BadInput(format!("'{}' is not a directory", subpath)));
    }

    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(_) => continue,
        };

        let rel = if subpath.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", subpath.trim_end_matches('/'), name)
        };

        entries.push(FileEntry {
            name,
            path: format!("/partition-{}/{}", partition.index, rel),
            is_dir: meta.is_dir(),
            size_bytes: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            filesystem: None,
            label: None,
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_paths_resolve_to_the_synthetic_listing() {
        assert_eq!(resolve_browse_path("/").unwrap(), ResolvedPath::Root);
        assert_eq!(resolve_browse_path("").unwrap(), ResolvedPath::Root);
        assert_eq!(resolve_browse_path("  / ").unwrap(), ResolvedPath::Root);
    }

    #[test]
    fn partition_paths_split_index_and_subpath() {
        assert_eq!(
            resolve_browse_path("/partition-2/etc/hosts").unwrap(),
            ResolvedPath::Partition {
                index: 2,
                subpath: "etc/hosts".to_string()
            }
        );
        assert_eq!(
            resolve_browse_path("/partition-1").unwrap(),
            ResolvedPath::Partition {
                index: 1,
                subpath: String::new()
            }
        );
    }

    #[test]
    fn traversal_components_are_rejected() {
        assert!(matches!(
            resolve_browse_path("/partition-1/../../etc/shadow"),
            Err(RestoreError::PathEscape(_))
        ));
        assert!(matches!(
            resolve_browse_path("/partition-1/a/../../b"),
            Err(RestoreError::PathEscape(_))
        ));
    }

    #[test]
    fn non_partition_prefixes_are_rejected() {
        assert!(resolve_browse_path("/dev/nbd0p1").is_err());
        assert!(resolve_browse_path("/partition-x/etc").is_err());
    }

    #[test]
    fn root_listing_only_shows_mounted_partitions() {
        let partitions = vec![
            PartitionInfo {
                index: 1,
                device: "/dev/nbd0p1".to_string(),
                mount_path: Some("/restore/m/partition-1".to_string()),
                size_bytes: 512 * 1024 * 1024,
                filesystem: Some("ext4".to_string()),
                label: Some("root".to_string()),
            },
            PartitionInfo {
                index: 2,
                device: "/dev/nbd0p2".to_string(),
                mount_path: None,
                size_bytes: 4096,
                filesystem: None,
                label: None,
            },
        ];

        let listing = list_root(&partitions);
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "partition-1");
        assert!(listing[0].is_dir);
        assert_eq!(listing[0].filesystem.as_deref(), Some("ext4"));
    }
}
