//! Voxel data structures and operations

pub mod voxel;
pub mod svo;

pub use voxel::{Voxel, materials};
pub use svo::{Chunk, ChunkKey, ChunkLevel, EditOutcome, Svo};
