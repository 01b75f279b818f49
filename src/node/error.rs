use crate::node::nbd::NbdError;
use crate::orchestrator::targets::DescriptorError;
use thiserror::Error;

/// Errors from the node-side backup client and its collaborators. Any of
/// these aborts the whole job; partial per-disk success is never reported
/// as success.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("vSphere error: {0}")]
    Vsphere(String),

    #[error("VM not found: {0}")]
    VmNotFound(String),

    #[error("NBD transport error: {0}")]
    Nbd(#[from] NbdError),

    #[error("bad target descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backup cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
