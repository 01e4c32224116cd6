//! Sparse Voxel Octree implementation
//!
//! Two levels of octree share one node format. The root chunk covers the
//! whole streamed footprint and its leaves are chunk-table indices; leaf
//! chunks hold voxel values.

pub mod node;
pub mod storage;
pub mod chunk;
pub mod octree;
pub mod builder;
pub mod tree;

use glam::IVec3;

pub use node::Node;
pub use chunk::{Chunk, ChunkKey, ChunkLevel, ChunkSpec};
pub use octree::CellState;
pub use builder::bulk_build;
pub use tree::{EditOutcome, Finalized, Svo, SvoStats};

/// Deepest path a single traversal may walk (levels below a chunk root)
pub const MAX_DEPTH: usize = 20;

/// Nodes stored inside the chunk header before spilling to paged storage
pub const INLINE_NODES: usize = 6;

/// Root-chunk leaf value meaning "no chunk resident here"
pub const NULL_CHUNK: u16 = u16::MAX;

/// Unit offset of `octant` (bit 0 = x, bit 1 = y, bit 2 = z)
#[inline]
pub fn octant_offset(octant: u8) -> IVec3 {
    IVec3::new(
        (octant & 1) as i32,
        ((octant >> 1) & 1) as i32,
        ((octant >> 2) & 1) as i32,
    )
}

/// Octant index from unit offsets in `0..=1`
#[inline]
pub fn octant_index(offset: IVec3) -> u8 {
    debug_assert!(offset.min_element() >= 0 && offset.max_element() <= 1);
    (offset.x | (offset.y << 1) | (offset.z << 2)) as u8
}

/// Octant of `cell` at a level whose children span `2^level` cells
#[inline]
pub(crate) fn octant_at(cell: IVec3, level: u8) -> u8 {
    let bit = |v: i32| ((v >> level) & 1) as u8;
    bit(cell.x) | (bit(cell.y) << 1) | (bit(cell.z) << 2)
}
