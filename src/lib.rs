//! CoreVault: VM backup control plane and data transport.
//!
//! Two binaries share this crate. The hub (`corevault-hub`) runs the
//! control API, the NBD port allocator, the block-server supervisor, the
//! backup metadata store and the restore mount service. The node
//! (`corevault-node`) runs at the VMware site and carries the backup
//! client, the vSphere client and the SSH tunnel back to the hub.

pub mod api_models;
pub mod config;
pub mod cors;
pub mod db_manager;
pub mod endpoints;
pub mod logging;
pub mod node;
pub mod orchestrator;
pub mod restore;
pub mod schemas;
pub mod server;
pub mod state;
pub mod transport;
pub mod tunnel;
