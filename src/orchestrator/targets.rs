use thiserror::Error;

/// One NBD export assignment for one disk. `disk_key` is the hypervisor's
/// per-VM device key, not our disk index: the node client matches the
/// transport to the hypervisor disk by key, and an index here would
/// silently route disk 0's data into disk 1's target on VMs whose keys
/// are not contiguous from 2000.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdTarget {
    pub disk_key: i32,
    pub host: String,
    pub port: u16,
    pub export_name: String,
}

#[derive(Error, Debug, PartialEq)]
pub enum DescriptorError {
    #[error("empty NBD target descriptor")]
    Empty,

    #[error("malformed NBD target entry: {0}")]
    Malformed(String),
}

/// Serializes targets as `disk_key:nbd://host:port/export` joined by
/// commas, preserving disk order.
pub fn build_descriptor(targets: &[NbdTarget]) -> String {
    targets
        .iter()
        .map(|t| {
            format!(
                "{}:nbd://{}:{}/{}",
                t.disk_key, t.host, t.port, t.export_name
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a multi-target descriptor back into per-disk targets, order
/// preserved.
pub fn parse_descriptor(descriptor: &str) -> Result<Vec<NbdTarget>, DescriptorError> {
    if descriptor.trim().is_empty() {
        return Err(DescriptorError::Empty);
    }

    let mut targets = Vec::new();
    for entry in descriptor.split(',') {
        let (key_part, uri) = entry
            .split_once(':')
            .ok_or_else(|| DescriptorError::Malformed(entry.to_string()))?;

        let disk_key: i32 = key_part
            .parse()
            .map_err(|_| DescriptorError::Malformed(entry.to_string()))?;

        let rest = uri
            .strip_prefix("nbd://")
            .ok_or_else(|| DescriptorError::Malformed(entry.to_string()))?;

        let (addr, export_name) = rest
            .split_once('/')
            .ok_or_else(|| DescriptorError::Malformed(entry.to_string()))?;

        let (host, port_str) = addr
            .rsplit_once(':')
            .ok_or_else(|| DescriptorError::Malformed(entry.to_string()))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| DescriptorError::Malformed(entry.to_string()))?;

        if host.is_empty() || export_name.is_empty() {
            return Err(DescriptorError::Malformed(entry.to_string()));
        }

        targets.push(NbdTarget {
            disk_key,
            host: host.to_string(),
            port,
            export_name: export_name.to_string(),
        });
    }

    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<NbdTarget> {
        vec![
            NbdTarget {
                disk_key: 2000,
                host: "127.0.0.1".to_string(),
                port: 10105,
                export_name: "beta-disk0-20260801T101500".to_string(),
            },
            NbdTarget {
                disk_key: 2001,
                host: "127.0.0.1".to_string(),
                port: 10106,
                export_name: "beta-disk1-20260801T101500".to_string(),
            },
        ]
    }

    #[test]
    fn descriptor_round_trips_in_order() {
        let targets = sample();
        let descriptor = build_descriptor(&targets);
        assert_eq!(
            descriptor,
            "2000:nbd://127.0.0.1:10105/beta-disk0-20260801T101500,2001:nbd://127.0.0.1:10106/beta-disk1-20260801T101500"
        );
        assert_eq!(parse_descriptor(&descriptor).unwrap(), targets);
    }

    #[test]
    fn descriptor_carries_disk_keys_not_indexes() {
        // A VM with a non-contiguous key layout: key 2000 and 2002.
        let targets = vec![
            NbdTarget {
                disk_key: 2000,
                host: "127.0.0.1".to_string(),
                port: 10100,
                export_name: "e0".to_string(),
            },
            NbdTarget {
                disk_key: 2002,
                host: "127.0.0.1".to_string(),
                port: 10101,
                export_name: "e1".to_string(),
            },
        ];
        let parsed = parse_descriptor(&build_descriptor(&targets)).unwrap();
        assert_eq!(parsed[1].disk_key, 2002);
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert_eq!(parse_descriptor(""), Err(DescriptorError::Empty));
        assert!(parse_descriptor("2000:http://x:1/e").is_err());
        assert!(parse_descriptor("abc:nbd://127.0.0.1:10100/e").is_err());
        assert!(parse_descriptor("2000:nbd://127.0.0.1:notaport/e").is_err());
        assert!(parse_descriptor("2000:nbd://127.0.0.1:10100").is_err());
    }
}
