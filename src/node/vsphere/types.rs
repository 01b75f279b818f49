use serde::{Deserialize, Serialize};

/// A VM as seen through the SDK, with the managed object reference the
/// other calls need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub moref: String,
    pub name: String,
    pub instance_uuid: String,
    pub power_state: Option<String>,
    pub disks: Vec<DiskRecord>,
}

/// One virtual disk of a VM. The key is the hypervisor's per-VM device
/// key; `change_id` is only present once CBT has produced one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRecord {
    pub key: i32,
    pub unit_number: i32,
    pub capacity_bytes: i64,
    /// Datastore path, e.g. "[datastore1] alpha/alpha.vmdk"
    pub backing_file: String,
    pub change_id: Option<String>,
}

/// An extent of a disk that holds data (full) or changed since a prior
/// change id (incremental).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedArea {
    pub start: u64,
    pub length: u64,
}

impl DiskRecord {
    /// Splits the "[datastore] relative/path.vmdk" backing path into the
    /// datastore name and the path within it.
    pub fn datastore_and_path(&self) -> Option<(String, String)> {
        let rest = self.backing_file.strip_prefix('[')?;
        let (datastore, path) = rest.split_once(']')?;
        Some((datastore.to_string(), path.trim_start().to_string()))
    }

    /// Path of the flat extent file that actually holds the disk data.
    /// The descriptor vmdk is a small text file; block reads go against
    /// `<name>-flat.vmdk`.
    pub fn flat_file_path(&self) -> Option<(String, String)> {
        let (datastore, path) = self.datastore_and_path()?;
        let flat = path.strip_suffix(".vmdk")?;
        Some((datastore, format!("{}-flat.vmdk", flat)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(backing: &str) -> DiskRecord {
        DiskRecord {
            key: 2000,
            unit_number: 0,
            capacity_bytes: 1 << 30,
            backing_file: backing.to_string(),
            change_id: None,
        }
    }

    #[test]
    fn backing_paths_split_into_datastore_and_relative_path() {
        let d = disk("[datastore1] alpha/alpha.vmdk");
        assert_eq!(
            d.datastore_and_path(),
            Some(("datastore1".to_string(), "alpha/alpha.vmdk".to_string()))
        );
    }

    #[test]
    fn flat_file_sits_next_to_the_descriptor() {
        let d = disk("[ds] beta/beta_1.vmdk");
        assert_eq!(
            d.flat_file_path(),
            Some(("ds".to_string(), "beta/beta_1-flat.vmdk".to_string()))
        );
    }

    #[test]
    fn malformed_backing_paths_yield_none() {
        assert_eq!(disk("no-brackets.vmdk").datastore_and_path(), None);
        assert_eq!(disk("[ds] not-a-vmdk.img").flat_file_path(), None);
    }
}
