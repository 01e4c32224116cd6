//! Octree construction from dense voxel arrays

use glam::IVec3;
use smallvec::SmallVec;

use super::chunk::Chunk;
use super::node::Node;
use super::{MAX_DEPTH, octant_offset};
use crate::voxel::voxel::Voxel;

struct Frame {
    node: u16,
    /// Next octant to visit
    next: u8,
    /// Min corner in cells
    origin: IVec3,
    /// Children of this node span `2^(level - 1)` cells
    level: u8,
}

/// Rebuild `chunk` from a dense `side³` array, x fastest, then y, then z,
/// where `side = 2^(scale - voxel_scale)`.
///
/// Children are visited depth-first with an explicit stack. When a node
/// finishes with eight identical leaves it is folded into its parent and
/// popped; it is always the last node allocated, so storage never holds
/// garbage from uniform regions.
///
/// # Panics
/// If `voxels` has the wrong length.
pub fn bulk_build(chunk: &mut Chunk, voxels: &[Voxel]) {
    let depth = chunk.depth();
    let side = 1usize << depth;
    assert_eq!(
        voxels.len(),
        side * side * side,
        "expected {}³ voxels for chunk {}",
        side,
        chunk.key()
    );

    let voxel_at = |cell: IVec3| {
        let (x, y, z) = (cell.x as usize, cell.y as usize, cell.z as usize);
        voxels[x + side * (y + side * z)]
    };

    chunk.reset(Voxel::EMPTY.0);
    let mut stack: SmallVec<[Frame; MAX_DEPTH]> = SmallVec::new();
    stack.push(Frame {
        node: 0,
        next: 0,
        origin: IVec3::ZERO,
        level: depth,
    });

    loop {
        let Some(top) = stack.last_mut() else {
            break;
        };

        if top.next < 8 {
            let octant = top.next;
            top.next += 1;
            let parent = top.node;
            let child_level = top.level - 1;
            let origin = top.origin + octant_offset(octant) * (1 << child_level);

            if child_level == 0 {
                chunk.node_mut(parent).set_leaf(octant, voxel_at(origin).0);
            } else {
                let child = chunk.alloc_node(Node::EMPTY);
                chunk.node_mut(parent).set_branch(octant, child);
                stack.push(Frame {
                    node: child,
                    next: 0,
                    origin,
                    level: child_level,
                });
            }
            continue;
        }

        let node = top.node;
        stack.pop();
        if let Some(parent) = stack.last() {
            if let Some(value) = chunk.node(node).uniform_leaf() {
                chunk.node_mut(parent.node).set_leaf(parent.next - 1, value);
                chunk.pop_node(node);
            }
        }
    }

    chunk.mark_dirty();
}

/// Dense sphere of `material` centred in a `side³` grid
pub fn create_test_sphere(side: u32, radius: f32, material: Voxel) -> Vec<Voxel> {
    let mut voxels = vec![Voxel::EMPTY; (side * side * side) as usize];
    let center = side as f32 / 2.0;

    for z in 0..side {
        for y in 0..side {
            for x in 0..side {
                let dx = x as f32 - center + 0.5;
                let dy = y as f32 - center + 0.5;
                let dz = z as f32 - center + 0.5;
                if (dx * dx + dy * dy + dz * dz).sqrt() <= radius {
                    voxels[(z * side * side + y * side + x) as usize] = material;
                }
            }
        }
    }

    voxels
}
