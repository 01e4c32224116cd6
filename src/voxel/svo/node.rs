//! Sparse Voxel Octree node

use bytemuck::{Pod, Zeroable};

/// Octree node - 18 bytes, 2-byte aligned
///
/// Layout:
/// - children (16 bytes): one `u16` per octant, either a leaf value or the
///   index of a child node in the same chunk
/// - leaf_mask (1 byte): bit `i` set when child `i` is a leaf value
/// - padding (1 byte)
///
/// Octant bits: bit 0 = +x, bit 1 = +y, bit 2 = +z.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Node {
    /// Leaf value or child node index per octant
    pub children: [u16; 8],
    /// Which octants hold leaf values
    pub leaf_mask: u8,
    _padding: u8,
}

impl Node {
    /// Node whose children are not yet assigned. Every octant must be set
    /// before the node is read.
    pub const EMPTY: Self = Self {
        children: [0; 8],
        leaf_mask: 0,
        _padding: 0,
    };

    /// Node with eight identical leaves
    pub const fn uniform(value: u16) -> Self {
        Self {
            children: [value; 8],
            leaf_mask: 0xFF,
            _padding: 0,
        }
    }

    /// Check if the child at `octant` is a leaf value
    #[inline]
    pub fn is_leaf(&self, octant: u8) -> bool {
        debug_assert!(octant < 8);
        (self.leaf_mask >> octant) & 1 != 0
    }

    /// Raw child slot (leaf value or node index)
    #[inline]
    pub fn child(&self, octant: u8) -> u16 {
        self.children[octant as usize]
    }

    /// Store a leaf value at `octant`
    #[inline]
    pub fn set_leaf(&mut self, octant: u8, value: u16) {
        self.children[octant as usize] = value;
        self.leaf_mask |= 1 << octant;
    }

    /// Point `octant` at child node `index`
    #[inline]
    pub fn set_branch(&mut self, octant: u8, index: u16) {
        self.children[octant as usize] = index;
        self.leaf_mask &= !(1 << octant);
    }

    /// If all eight children are leaves with the same value, return it
    pub fn uniform_leaf(&self) -> Option<u16> {
        let first = self.children[0];
        (self.leaf_mask == 0xFF && self.children.iter().all(|&c| c == first)).then_some(first)
    }

    /// Number of branch (non-leaf) children
    pub fn branch_count(&self) -> u32 {
        8 - self.leaf_mask.count_ones()
    }
}
