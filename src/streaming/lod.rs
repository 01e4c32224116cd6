//! Level of Detail (LOD) selection from viewer distance
//!
//! Each LOD level doubles the chunk side, and since every leaf chunk holds
//! the same number of voxels, doubles the voxel size as well. Levels grow
//! logarithmically with distance past `start`.

use serde::{Deserialize, Serialize};

/// Distance to LOD mapping
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// Distance below which full detail is always used
    pub start: f64,
    /// Width of the LOD 0 band past `start`; each further level doubles it
    pub unit: f64,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            start: 0.0,
            unit: 96.0,
        }
    }
}

/// Calculate LOD level from distance
///
/// `max(0, floor(log2((distance - start) / unit)))`, and 0 for anything
/// closer than `start + unit`.
///
/// # Examples
/// ```
/// use svostream::streaming::lod::{lod_from_distance, LodConfig};
///
/// let config = LodConfig { start: 0.0, unit: 96.0 };
/// assert_eq!(lod_from_distance(50.0, &config), 0);
/// assert_eq!(lod_from_distance(96.0, &config), 0);
/// assert_eq!(lod_from_distance(200.0, &config), 1);
/// assert_eq!(lod_from_distance(400.0, &config), 2);
/// assert_eq!(lod_from_distance(1000.0, &config), 3);
/// ```
pub fn lod_from_distance(distance: f64, config: &LodConfig) -> u32 {
    let t = (distance - config.start) / config.unit;
    if !(t > 1.0) {
        return 0;
    }
    t.log2().floor().min(31.0) as u32
}

/// Chunk scale a cell at `distance` should be streamed at
///
/// # Arguments
/// * `distance` - Distance from viewer to the cell centre
/// * `min_scale` - Finest chunk scale
/// * `max_scale` - Coarsest chunk scale
///
/// # Examples
/// ```
/// use svostream::streaming::lod::{desired_chunk_scale, LodConfig};
///
/// let config = LodConfig::default();
/// assert_eq!(desired_chunk_scale(10.0, &config, 5, 9), 5);
/// assert_eq!(desired_chunk_scale(400.0, &config, 5, 9), 7);
/// assert_eq!(desired_chunk_scale(1e9, &config, 5, 9), 9);
/// ```
pub fn desired_chunk_scale(distance: f64, config: &LodConfig, min_scale: u8, max_scale: u8) -> u8 {
    let lod = lod_from_distance(distance, config);
    (min_scale as u32 + lod).min(max_scale as u32) as u8
}
