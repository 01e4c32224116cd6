//! Noise-based procedural terrain generation

use noise::{Fbm, MultiFractal, NoiseFn, Perlin};

use super::VoxelGenerator;
use crate::voxel::svo::ChunkKey;
use crate::voxel::voxel::{Voxel, materials};

/// Parameters controlling terrain generation
#[derive(Clone, Debug)]
pub struct TerrainParams {
    pub scale: f64,        // Horizontal scale (larger = smoother)
    pub height_scale: f64, // Vertical range above base_height
    pub base_height: f64,  // Height of the lowest valleys
    pub octaves: u32,      // FBM octaves (detail levels)
    pub persistence: f64,  // FBM persistence (0.5 typical)
    pub lacunarity: f64,   // FBM lacunarity (2.0 typical)
    pub sea_level: f64,    // Air below this height is water
    pub dirt_depth: f64,   // Dirt thickness under the surface
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            scale: 200.0,
            height_scale: 64.0,
            base_height: 0.0,
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            sea_level: 16.0,
            dirt_depth: 3.0,
        }
    }
}

/// Procedural terrain generator using fractal Brownian motion (FBM)
///
/// Produces a heightfield of stone under dirt under grass (sand near the
/// shore), with water filling air below sea level.
pub struct TerrainGenerator {
    params: TerrainParams,
    seed: u32,
    noise: Fbm<Perlin>,
}

impl TerrainGenerator {
    /// Create a new terrain generator; `seed` is the one expected at
    /// generation time, others build their noise on demand
    pub fn new(params: TerrainParams, seed: u32) -> Self {
        let noise = Self::build_noise(&params, seed);
        Self {
            params,
            seed,
            noise,
        }
    }

    fn build_noise(params: &TerrainParams, seed: u32) -> Fbm<Perlin> {
        Fbm::<Perlin>::new(seed)
            .set_octaves(params.octaves as usize)
            .set_persistence(params.persistence)
            .set_lacunarity(params.lacunarity)
    }

    /// Get terrain parameters
    pub fn params(&self) -> &TerrainParams {
        &self.params
    }

    /// Get terrain height at world position (x, z)
    pub fn height_at(&self, x: f64, z: f64) -> f64 {
        self.sample_height(&self.noise, x, z)
    }

    fn sample_height(&self, noise: &Fbm<Perlin>, x: f64, z: f64) -> f64 {
        let value = noise.get([x / self.params.scale, z / self.params.scale]);
        let normalized = ((value + 1.0) * 0.5).clamp(0.0, 1.0);
        self.params.base_height + normalized * self.params.height_scale
    }

    /// Material of a voxel centred at height `y` in a column of height
    /// `surface`, for voxels `voxel_size` tall
    fn classify(&self, y: f64, surface: f64, voxel_size: f64) -> Voxel {
        let p = &self.params;
        if y > surface {
            return if y <= p.sea_level {
                materials::WATER
            } else {
                materials::AIR
            };
        }

        let depth = surface - y;
        if depth < voxel_size.max(1.0) {
            if surface < p.sea_level + 1.0 {
                materials::SAND
            } else {
                materials::GRASS
            }
        } else if depth < p.dirt_depth.max(voxel_size) {
            materials::DIRT
        } else {
            materials::STONE
        }
    }
}

impl VoxelGenerator for TerrainGenerator {
    fn generate(&self, key: ChunkKey, resolution: u8, seed: u32) -> Vec<Voxel> {
        let fallback;
        let noise = if seed == self.seed {
            &self.noise
        } else {
            fallback = Self::build_noise(&self.params, seed);
            &fallback
        };

        let side = 1usize << resolution;
        let voxel_size = (1u64 << (key.scale - resolution)) as f64;
        let origin = key.position.as_dvec3();
        let center = |i: usize, base: f64| base + (i as f64 + 0.5) * voxel_size;

        let mut heights = Vec::with_capacity(side * side);
        for z in 0..side {
            for x in 0..side {
                heights.push(self.sample_height(noise, center(x, origin.x), center(z, origin.z)));
            }
        }

        let mut voxels = vec![Voxel::EMPTY; side * side * side];
        for z in 0..side {
            for y in 0..side {
                let wy = center(y, origin.y);
                let row = (z * side + y) * side;
                for x in 0..side {
                    voxels[row + x] = self.classify(wy, heights[z * side + x], voxel_size);
                }
            }
        }
        voxels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec3;

    #[test]
    fn test_terrain_params_default() {
        let params = TerrainParams::default();
        assert_eq!(params.octaves, 4);
        assert_eq!(params.persistence, 0.5);
        assert_eq!(params.lacunarity, 2.0);
    }

    #[test]
    fn test_height_in_range() {
        let generator = TerrainGenerator::new(TerrainParams::default(), 12345);
        for (x, z) in [(0.0, 0.0), (50.0, 50.0), (-300.0, 812.5)] {
            let h = generator.height_at(x, z);
            assert!((0.0..=64.0).contains(&h), "height {} at ({}, {})", h, x, z);
            assert_eq!(h, generator.height_at(x, z));
        }
    }

    #[test]
    fn test_different_seeds() {
        let gen1 = TerrainGenerator::new(TerrainParams::default(), 1);
        let gen2 = TerrainGenerator::new(TerrainParams::default(), 2);
        assert_ne!(gen1.height_at(50.0, 50.0), gen2.height_at(50.0, 50.0));
    }

    #[test]
    fn test_generate_layers() {
        let generator = TerrainGenerator::new(TerrainParams::default(), 7);
        // Tall column through the whole height range
        let key = ChunkKey::new(IVec3::new(0, -64, 0), 8);
        let voxels = generator.generate(key, 5, 7);
        assert_eq!(voxels.len(), 32 * 32 * 32);

        let at = |x: usize, y: usize, z: usize| voxels[(z * 32 + y) * 32 + x];
        assert_eq!(at(3, 0, 3), materials::STONE);
        assert_eq!(at(3, 31, 3), materials::AIR);
    }

    #[test]
    fn test_generate_is_deterministic() {
        let generator = TerrainGenerator::new(TerrainParams::default(), 3);
        let key = ChunkKey::new(IVec3::new(64, 0, -32), 5);
        assert_eq!(generator.generate(key, 4, 3), generator.generate(key, 4, 3));
        // Foreign seed builds its own noise
        let other = TerrainGenerator::new(TerrainParams::default(), 9);
        assert_eq!(generator.generate(key, 4, 9), other.generate(key, 4, 9));
    }
}
