//! Error types for the svostream engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to reserve address space: {0}")]
    Reserve(#[source] std::io::Error),

    #[error("Failed to commit pages: {0}")]
    Commit(#[source] std::io::Error),

    #[error("Chunk pool exhausted ({capacity} slots in use)")]
    ChunkPoolExhausted { capacity: u32 },

    #[error("Chunk node space exhausted ({max_nodes} nodes)")]
    NodeSpaceExhausted { max_nodes: u32 },

    #[error("Failed to start worker pool: {0}")]
    WorkerPool(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Terminate the process on an unrecoverable condition.
///
/// Used for address-space exhaustion: continuing would leave the octree in an
/// inconsistent state, so there is no unwinding path.
#[cold]
pub fn fatal(err: Error) -> ! {
    log::error!("fatal: {}", err);
    eprintln!("svostream fatal error: {}", err);
    std::process::abort()
}
