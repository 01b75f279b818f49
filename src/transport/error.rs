use thiserror::Error;

/// Errors that can occur in the NBD transport layer
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("NBD port pool exhausted ({pool_size} ports in use)")]
    Exhausted { pool_size: usize },

    #[error("Failed to spawn block server: {0}")]
    SpawnFailed(String),

    #[error("Block server on port {port} exited during startup: {detail}")]
    DiedOnStartup { port: u16, detail: String },

    #[error("Block server on port {port} never started accepting connections")]
    PortNeverOpened { port: u16 },

    #[error("A block server already has {0} open for write")]
    PathBusy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
