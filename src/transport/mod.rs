//! NBD data transport: the TCP port pool and the per-disk block-server
//! processes that expose QCOW2 files to the node during a backup.

pub mod error;
pub mod port_pool;
pub mod supervisor;

pub use error::TransportError;
pub use port_pool::PortAllocator;
pub use supervisor::{BlockServerSupervisor, TransportLease};
