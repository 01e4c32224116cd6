//! Voxel value type

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// 16-bit material id stored in leaf-chunk octree leaves
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize,
)]
pub struct Voxel(pub u16);

impl Voxel {
    /// Empty space (air); fresh chunks are filled with it
    pub const EMPTY: Self = Self(0);

    /// Returned by lookups that hit no resident chunk. Never stored.
    pub const UNLOADED: Self = Self(u16::MAX);

    /// Create voxel from material id
    pub const fn new(material: u16) -> Self {
        Self(material)
    }

    /// Material id
    pub fn material(&self) -> u16 {
        self.0
    }

    /// Check if voxel is empty (air)
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Check if this is the unloaded sentinel
    pub fn is_unloaded(&self) -> bool {
        *self == Self::UNLOADED
    }
}

/// Built-in material ids used by the terrain generator
pub mod materials {
    use super::Voxel;

    pub const AIR: Voxel = Voxel::EMPTY;
    pub const STONE: Voxel = Voxel(1);
    pub const DIRT: Voxel = Voxel(2);
    pub const GRASS: Voxel = Voxel(3);
    pub const SAND: Voxel = Voxel(4);
    pub const WATER: Voxel = Voxel(5);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size() {
        assert_eq!(std::mem::size_of::<Voxel>(), 2);
    }

    #[test]
    fn test_sentinels() {
        assert!(Voxel::default().is_empty());
        assert!(Voxel::UNLOADED.is_unloaded());
        assert!(!materials::STONE.is_empty());
        assert_eq!(Voxel::new(3), materials::GRASS);
    }
}
