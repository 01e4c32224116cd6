//! Address-space reservation and the chunk pool built on it

pub mod vm;
pub mod pool;

pub use pool::{ChunkHandle, ChunkPool, PoolLimits, PoolStats};
