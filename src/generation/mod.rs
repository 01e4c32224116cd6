//! Voxel content generation for streamed chunks.
//!
//! Workers call a [`VoxelGenerator`] to fill each chunk before it is built
//! into octree form. Generators run on worker threads and must be pure: the
//! same region, resolution and seed always yield the same voxels.

pub mod terrain;

pub use terrain::{TerrainGenerator, TerrainParams};

use crate::voxel::svo::ChunkKey;
use crate::voxel::voxel::Voxel;

/// Source of voxel content
pub trait VoxelGenerator: Send + Sync {
    /// Fill the region `key` with a dense `side³` grid, `side = 2^resolution`,
    /// ordered x fastest, then y, then z. Each voxel spans
    /// `2^(key.scale - resolution)` world units.
    fn generate(&self, key: ChunkKey, resolution: u8, seed: u32) -> Vec<Voxel>;
}

impl<F> VoxelGenerator for F
where
    F: Fn(ChunkKey, u8, u32) -> Vec<Voxel> + Send + Sync,
{
    fn generate(&self, key: ChunkKey, resolution: u8, seed: u32) -> Vec<Voxel> {
        self(key, resolution, seed)
    }
}

/// Generator that fills every voxel with one value
#[derive(Clone, Copy, Debug)]
pub struct UniformGenerator(pub Voxel);

impl VoxelGenerator for UniformGenerator {
    fn generate(&self, _key: ChunkKey, resolution: u8, _seed: u32) -> Vec<Voxel> {
        let side = 1usize << resolution;
        vec![self.0; side * side * side]
    }
}
