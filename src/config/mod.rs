use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration for the CoreVault hub.
///
/// This structure defines all the configurable parameters for the hub
/// appliance: the control API binding, the NBD transport port pool, the
/// node control channel, and the restore mount service. It supports
/// serialization to and deserialization from JSON for persistent
/// configuration.
///
/// The configuration can be loaded from a file or generated with default
/// values if no configuration file exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The port number on which the control API will listen
    pub port: u16,

    /// The IP address to which the control API will bind
    pub address: String,

    /// Lowest TCP port of the NBD transport pool (inclusive)
    pub nbd_port_min: u16,

    /// Highest TCP port of the NBD transport pool (inclusive)
    pub nbd_port_max: u16,

    /// Base URL of the node API as seen from the hub. With the tunnel up
    /// this is the reverse-forwarded port on the hub loopback.
    pub node_api_url: String,

    /// Seconds to wait for the node to accept a backup request
    pub node_request_timeout_secs: u64,

    /// Upper bound on the lifetime of a running job. Jobs still `running`
    /// past this are failed and cleaned up by the watchdog.
    pub job_max_duration_secs: u64,

    /// Directory under which restore mounts are created
    pub restore_mount_base: String,

    /// Idle TTL for restore mounts, in seconds
    pub restore_idle_ttl_secs: u64,

    /// Number of kernel NBD devices (/dev/nbd0..N-1) the restore service
    /// may probe for a free slot
    pub nbd_device_count: u32,

    /// Path to the qemu-nbd binary
    pub qemu_nbd_path: String,

    /// Path to the qemu-img binary
    pub qemu_img_path: String,

    /// Shared bearer token the node presents on the completion callback
    pub callback_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9443,
            address: "0.0.0.0".to_string(),
            nbd_port_min: 10100,
            nbd_port_max: 10200,
            node_api_url: "http://127.0.0.1:9081".to_string(),
            node_request_timeout_secs: 30,
            job_max_duration_secs: 6 * 3600,
            restore_mount_base: "/var/lib/corevault/restore".to_string(),
            restore_idle_ttl_secs: 3600,
            nbd_device_count: 16,
            qemu_nbd_path: "qemu-nbd".to_string(),
            qemu_img_path: "qemu-img".to_string(),
            callback_token: "change-me".to_string(),
        }
    }
}

/// Configuration for the CoreVault node appliance.
///
/// The node runs next to the VMware site: a local HTTP API driven by the
/// hub over the reverse tunnel, the backup client that streams disks into
/// the hub's NBD exports, and the SSH tunnel itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// The port number on which the node API will listen
    pub port: u16,

    /// The IP address to which the node API will bind
    pub address: String,

    /// Base URL of the hub API as seen from the node. With the tunnel up
    /// this is a forwarded port on the node loopback.
    pub hub_api_url: String,

    /// Shared bearer token presented on the completion callback
    pub callback_token: String,

    /// vCenter SDK endpoint, e.g. "https://vcenter.example.com"
    pub vcenter_url: String,

    /// vCenter account used for snapshot and CBT operations
    pub vcenter_username: String,

    /// Password for the vCenter account
    pub vcenter_password: String,

    /// Accept self-signed vCenter certificates
    pub vcenter_insecure_tls: bool,

    /// Datacenter name used for datastore file access
    pub vcenter_datacenter: String,

    /// In-flight extent reads per disk stream
    pub streams_per_disk: usize,

    /// SSH tunnel to the hub
    pub tunnel: TunnelConfig,
}

/// SSH tunnel parameters. The whole NBD pool plus the hub API port are
/// forwarded into the node loopback; the node API port is reverse-forwarded
/// back to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Whether the node maintains the tunnel itself. Disabled in test
    /// environments where hub and node share a host.
    pub enabled: bool,

    /// Hub SSH endpoint hostname or address
    pub hub_ssh_host: String,

    /// Hub SSH endpoint port
    pub hub_ssh_port: u16,

    /// SSH user on the hub
    pub ssh_user: String,

    /// Private key file for the tunnel user
    pub ssh_key_path: String,

    /// Lowest forwarded NBD port (must match the hub pool)
    pub forward_port_min: u16,

    /// Highest forwarded NBD port (must match the hub pool)
    pub forward_port_max: u16,

    /// Hub API port, forwarded so the completion callback rides the tunnel
    pub hub_api_port: u16,

    /// Remote port on the hub loopback that reverse-forwards to the node API
    pub reverse_remote_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            address: "127.0.0.1".to_string(),
            hub_api_url: "http://127.0.0.1:9443".to_string(),
            callback_token: "change-me".to_string(),
            vcenter_url: "https://vcenter.local".to_string(),
            vcenter_username: "administrator@vsphere.local".to_string(),
            vcenter_password: String::new(),
            vcenter_insecure_tls: true,
            vcenter_datacenter: "Datacenter".to_string(),
            streams_per_disk: 3,
            tunnel: TunnelConfig {
                enabled: true,
                hub_ssh_host: "hub.local".to_string(),
                hub_ssh_port: 22,
                ssh_user: "corevault".to_string(),
                ssh_key_path: "/etc/corevault/tunnel_ed25519".to_string(),
                forward_port_min: 10100,
                forward_port_max: 10200,
                hub_api_port: 9443,
                reverse_remote_port: 9081,
            },
        }
    }
}

/// Possible errors that can occur during configuration operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigError {
    /// Indicates that the configuration file could not be found
    FileNotFound,

    /// Indicates that writing to the configuration file failed
    FailedToWrite,

    /// Indicates that parsing the configuration file content failed
    ParseError,
}

/// Global static reference to the hub configuration.
///
/// Initialized when first accessed, reading from the configuration file or
/// creating default settings if no configuration exists.
///
/// # Panics
///
/// Panics if the configuration cannot be read or written, which would
/// prevent the hub from starting properly.
lazy_static! {
    pub static ref SERVER_CONFIG: Arc<ServerConfig> =
        Arc::new(ServerConfig::read().expect("Failed to initialize hub config"));
}

/// Global static reference to the node configuration.
lazy_static! {
    pub static ref NODE_CONFIG: Arc<NodeConfig> =
        Arc::new(NodeConfig::read().expect("Failed to initialize node config"));
}

fn read_or_default<T>(config_path: &str) -> Result<T, ConfigError>
where
    T: Default + Serialize + for<'de> Deserialize<'de>,
{
    let config_content = match std::fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(_) => {
            // If file doesn't exist, create a default configuration
            write_config(config_path, &T::default())?;
            return Ok(T::default());
        }
    };

    match serde_json::from_str(&config_content) {
        Ok(config) => Ok(config),
        Err(_) => Err(ConfigError::ParseError),
    }
}

fn write_config<T: Serialize>(config_path: &str, config: &T) -> Result<(), ConfigError> {
    let config_content = match serde_json::to_string_pretty(config) {
        Ok(content) => content,
        Err(_) => return Err(ConfigError::ParseError),
    };

    match std::fs::write(config_path, config_content) {
        Ok(_) => Ok(()),
        Err(_) => Err(ConfigError::FailedToWrite),
    }
}

impl ServerConfig {
    /// Reads the hub configuration from "config.json" in the current
    /// directory, creating it with defaults if it doesn't exist yet.
    pub fn read() -> Result<Self, ConfigError> {
        read_or_default("config.json")
    }

    /// Writes the current configuration back to "config.json".
    pub fn write(&self) -> Result<(), ConfigError> {
        write_config("config.json", self)
    }

    /// Size of the configured NBD port pool.
    pub fn nbd_pool_size(&self) -> usize {
        (self.nbd_port_max.saturating_sub(self.nbd_port_min) as usize) + 1
    }
}

impl NodeConfig {
    /// Reads the node configuration from "node.json" in the current
    /// directory, creating it with defaults if it doesn't exist yet.
    pub fn read() -> Result<Self, ConfigError> {
        read_or_default("node.json")
    }

    /// Writes the current configuration back to "node.json".
    pub fn write(&self) -> Result<(), ConfigError> {
        write_config("node.json", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_round_trips_through_json() {
        let config = ServerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.nbd_port_min, config.nbd_port_min);
        assert_eq!(parsed.nbd_port_max, config.nbd_port_max);
        assert_eq!(parsed.node_api_url, config.node_api_url);
    }

    #[test]
    fn default_pool_spans_101_ports() {
        let config = ServerConfig::default();
        assert_eq!(config.nbd_pool_size(), 101);
    }

    #[test]
    fn node_config_round_trips_through_json() {
        let config = NodeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: NodeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.tunnel.forward_port_min, 10100);
        assert_eq!(parsed.streams_per_disk, 3);
    }
}
