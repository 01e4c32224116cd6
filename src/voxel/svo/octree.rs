//! Point write and read on a single chunk's octree.
//!
//! Positions are world coordinates; scales are world scales (a cell at
//! scale `s` spans `2^s` units). Inside a chunk, cells are addressed in units
//! of the chunk's `voxel_scale`.

use glam::IVec3;

use super::chunk::Chunk;
use super::node::Node;
use super::{MAX_DEPTH, octant_at};

/// What covers a cell of a given scale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellState {
    /// A single leaf value covers the cell; `scale` is the leaf's own scale
    /// (at least the queried one)
    Leaf { value: u16, scale: u8 },
    /// The cell is subdivided below the queried scale
    Branch { node: u16 },
}

impl Chunk {
    /// Cell coordinates of `pos` relative to this chunk
    #[inline]
    fn local_cell(&self, pos: IVec3) -> IVec3 {
        (pos - self.position()) >> self.voxel_scale() as i32
    }

    /// Set the cell of world scale `scale` containing `pos` to `value`.
    ///
    /// Leaves on the way down are split into eight copies; afterwards every
    /// ancestor left with eight identical leaves collapses into one. Nodes
    /// detached by a collapse or by overwriting a subtree are counted dead,
    /// not reclaimed.
    ///
    /// # Panics
    /// If `pos` lies outside the chunk or `scale` is not in
    /// `voxel_scale..scale`.
    pub fn write(&mut self, pos: IVec3, scale: u8, value: u16) {
        assert!(self.contains(pos), "write at {} outside chunk {}", pos, self.key());
        assert!(
            scale >= self.voxel_scale() && scale < self.scale(),
            "write scale {} outside {}..{}",
            scale,
            self.voxel_scale(),
            self.scale()
        );

        let target = scale - self.voxel_scale();
        let cell = self.local_cell(pos);
        let mut stack = [(0u16, 0u8); MAX_DEPTH];
        let mut depth = 0;
        let mut node = 0u16;
        let mut level = self.depth();

        loop {
            level -= 1;
            let octant = octant_at(cell, level);
            stack[depth] = (node, octant);
            depth += 1;

            let current = *self.node(node);
            if level == target {
                if current.is_leaf(octant) {
                    if current.child(octant) == value {
                        return;
                    }
                } else {
                    let detached = self.visit_subtree(current.child(octant), |_| {});
                    self.add_dead_nodes(detached);
                }
                self.node_mut(node).set_leaf(octant, value);
                break;
            }

            if current.is_leaf(octant) {
                let covering = current.child(octant);
                if covering == value {
                    return;
                }
                let child = self.alloc_node(Node::uniform(covering));
                self.node_mut(node).set_branch(octant, child);
                node = child;
            } else {
                node = current.child(octant);
            }
        }

        self.collapse(&stack[..depth]);
        self.mark_dirty();
    }

    /// Fold uniform nodes on `path` into their parents, bottom up.
    fn collapse(&mut self, path: &[(u16, u8)]) {
        for i in (1..path.len()).rev() {
            let (node, _) = path[i];
            let Some(value) = self.node(node).uniform_leaf() else {
                break;
            };
            let (parent, octant) = path[i - 1];
            self.node_mut(parent).set_leaf(octant, value);
            self.add_dead_nodes(1);
        }
    }

    /// Leaf value covering `pos`, or `None` outside the chunk
    pub fn read(&self, pos: IVec3) -> Option<u16> {
        match self.cell(pos, self.voxel_scale())? {
            CellState::Leaf { value, .. } => Some(value),
            CellState::Branch { .. } => None,
        }
    }

    /// Describe the cell of world scale `scale` containing `pos`
    pub fn cell(&self, pos: IVec3, scale: u8) -> Option<CellState> {
        if !self.contains(pos) || scale < self.voxel_scale() || scale > self.scale() {
            return None;
        }
        let target = scale - self.voxel_scale();
        let cell = self.local_cell(pos);
        let mut node = 0u16;
        let mut level = self.depth();

        if level == target {
            return Some(match self.node(0).uniform_leaf() {
                Some(value) => CellState::Leaf {
                    value,
                    scale: self.scale(),
                },
                None => CellState::Branch { node: 0 },
            });
        }

        loop {
            level -= 1;
            let octant = octant_at(cell, level);
            let current = self.node(node);
            if current.is_leaf(octant) {
                return Some(CellState::Leaf {
                    value: current.child(octant),
                    scale: level + self.voxel_scale(),
                });
            }
            node = current.child(octant);
            if level == target {
                return Some(CellState::Branch { node });
            }
        }
    }

    /// Walk the subtree rooted at node `root`, calling `on_leaf` for every
    /// leaf value. Returns the number of nodes visited.
    pub fn visit_subtree(&self, root: u16, mut on_leaf: impl FnMut(u16)) -> u32 {
        let mut stack: Vec<u16> = vec![root];
        let mut visited = 0;
        while let Some(index) = stack.pop() {
            visited += 1;
            let node = self.node(index);
            for octant in 0..8 {
                if node.is_leaf(octant) {
                    on_leaf(node.child(octant));
                } else {
                    stack.push(node.child(octant));
                }
            }
        }
        visited
    }

    /// Nodes reachable from node 0
    pub fn live_nodes(&self) -> u32 {
        self.visit_subtree(0, |_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pool::{ChunkPool, PoolLimits};
    use crate::voxel::svo::chunk::{ChunkKey, ChunkSpec};

    fn pool() -> ChunkPool {
        ChunkPool::new(PoolLimits {
            max_chunks: 8,
            max_nodes: 4096,
        })
        .unwrap()
    }

    fn chunk(pool: &mut ChunkPool, scale: u8, depth: u8) -> Chunk {
        pool.try_alloc_chunk(ChunkSpec::leaf(ChunkKey::new(IVec3::ZERO, scale), depth), 0)
            .unwrap()
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut pool = pool();
        let mut chunk = chunk(&mut pool, 5, 5);

        let points = [
            IVec3::new(0, 0, 0),
            IVec3::new(31, 31, 31),
            IVec3::new(7, 19, 2),
            IVec3::new(16, 0, 30),
        ];
        for (i, &p) in points.iter().enumerate() {
            chunk.write(p, 0, i as u16 + 1);
        }
        for (i, &p) in points.iter().enumerate() {
            assert_eq!(chunk.read(p), Some(i as u16 + 1));
        }
        assert_eq!(chunk.read(IVec3::new(1, 0, 0)), Some(0));
        assert_eq!(chunk.read(IVec3::new(32, 0, 0)), None);
        pool.free_chunk(chunk);
    }

    #[test]
    fn test_sibling_isolation() {
        let mut pool = pool();
        let mut chunk = chunk(&mut pool, 4, 4);

        chunk.write(IVec3::new(2, 2, 2), 0, 9);
        let cell = IVec3::new(2, 2, 2) >> 1 << 1;
        for octant in 0..8u8 {
            let p = cell + crate::voxel::svo::octant_offset(octant);
            let expected = if p == IVec3::new(2, 2, 2) { 9 } else { 0 };
            assert_eq!(chunk.read(p), Some(expected), "at {}", p);
        }
        pool.free_chunk(chunk);
    }

    #[test]
    fn test_scale_four_scenario() {
        let mut pool = pool();
        let mut chunk = chunk(&mut pool, 4, 4);

        chunk.write(IVec3::ZERO, 0, 7);
        assert_eq!(chunk.read(IVec3::ZERO), Some(7));
        assert_eq!(chunk.read(IVec3::new(1, 0, 0)), Some(0));
        let nodes = chunk.node_count();
        assert_eq!(nodes, 4);

        for octant in 0..8u8 {
            chunk.write(crate::voxel::svo::octant_offset(octant), 0, 7);
        }
        for octant in 0..8u8 {
            assert_eq!(chunk.read(crate::voxel::svo::octant_offset(octant)), Some(7));
        }
        assert_eq!(chunk.node_count(), nodes);
        assert_eq!(chunk.dead_nodes(), 1);
        assert_eq!(
            chunk.cell(IVec3::ZERO, 1),
            Some(CellState::Leaf { value: 7, scale: 1 })
        );
        pool.free_chunk(chunk);
    }

    #[test]
    fn test_collapse_to_root_keeps_node_zero() {
        let mut pool = pool();
        let mut chunk = chunk(&mut pool, 2, 2);

        for z in 0..4 {
            for y in 0..4 {
                for x in 0..4 {
                    chunk.write(IVec3::new(x, y, z), 0, 5);
                }
            }
        }
        // Everything folded back into node 0's leaves
        assert_eq!(chunk.node(0).uniform_leaf(), Some(5));
        assert_eq!(chunk.live_nodes(), 1);
        assert_eq!(chunk.node_count() - chunk.dead_nodes(), 1);
        assert_eq!(
            chunk.cell(IVec3::new(3, 3, 3), 2),
            Some(CellState::Leaf { value: 5, scale: 2 })
        );
        pool.free_chunk(chunk);
    }

    #[test]
    fn test_coarse_write_overwrites_subtree() {
        let mut pool = pool();
        let mut chunk = chunk(&mut pool, 4, 4);

        chunk.write(IVec3::new(1, 1, 1), 0, 3);
        let before = chunk.node_count();
        chunk.write(IVec3::ZERO, 3, 8);

        assert_eq!(chunk.node_count(), before);
        assert_eq!(chunk.dead_nodes(), before - 1);
        assert_eq!(chunk.read(IVec3::new(1, 1, 1)), Some(8));
        assert_eq!(chunk.read(IVec3::new(7, 7, 7)), Some(8));
        assert_eq!(chunk.read(IVec3::new(8, 0, 0)), Some(0));
        pool.free_chunk(chunk);
    }

    #[test]
    fn test_same_value_write_is_noop() {
        let mut pool = pool();
        let mut chunk = chunk(&mut pool, 4, 4);
        chunk.clear_dirty();

        chunk.write(IVec3::new(3, 3, 3), 0, 0);
        assert_eq!(chunk.node_count(), 1);
        assert!(!chunk.is_dirty());

        chunk.write(IVec3::new(3, 3, 3), 0, 1);
        assert!(chunk.is_dirty());
        pool.free_chunk(chunk);
    }

    #[test]
    fn test_lod_chunk_uses_voxel_scale() {
        let mut pool = pool();
        // 128-unit chunk with 32 cells per side: each cell spans 4 units
        let mut chunk = pool
            .try_alloc_chunk(ChunkSpec::leaf(ChunkKey::new(IVec3::new(128, 0, 0), 7), 5), 0)
            .unwrap();
        chunk.write(IVec3::new(130, 1, 2), 2, 4);
        assert_eq!(chunk.read(IVec3::new(128, 0, 0)), Some(4));
        assert_eq!(chunk.read(IVec3::new(131, 3, 3)), Some(4));
        assert_eq!(chunk.read(IVec3::new(132, 0, 0)), Some(0));
        pool.free_chunk(chunk);
    }

    #[test]
    #[should_panic(expected = "outside chunk")]
    fn test_write_outside_panics() {
        let mut pool = pool();
        let mut chunk = chunk(&mut pool, 4, 4);
        chunk.write(IVec3::new(16, 0, 0), 0, 1);
    }

    #[test]
    fn test_compact_drops_dead_nodes() {
        let mut pool = pool();
        let mut chunk = chunk(&mut pool, 5, 5);
        let points: Vec<IVec3> = (0..12).map(|i| IVec3::new(i * 2, 31 - i, i)).collect();
        for (i, &p) in points.iter().enumerate() {
            chunk.write(p, 0, i as u16 + 1);
        }
        // Overwrite half of them with coarse cells to leave dead subtrees
        for &p in points.iter().step_by(2) {
            chunk.write(p, 2, 40);
        }
        let before: Vec<_> = points.iter().map(|&p| chunk.read(p)).collect();
        assert!(chunk.dead_nodes() > 0);
        let live = chunk.live_nodes();
        let count = chunk.node_count();
        assert_eq!(count - chunk.dead_nodes(), live);
        chunk.clear_dirty();

        assert_eq!(chunk.compact(), count - live);
        assert_eq!(chunk.node_count(), live);
        assert_eq!(chunk.live_nodes(), live);
        assert_eq!(chunk.dead_nodes(), 0);
        assert!(!chunk.is_dirty());

        let after: Vec<_> = points.iter().map(|&p| chunk.read(p)).collect();
        assert_eq!(before, after);
        assert_eq!(chunk.read(IVec3::new(30, 0, 30)), Some(0));

        // Still editable afterwards
        chunk.write(IVec3::new(30, 0, 30), 0, 9);
        assert_eq!(chunk.read(IVec3::new(30, 0, 30)), Some(9));
        pool.free_chunk(chunk);
    }

    #[test]
    fn test_spill_keeps_indices_valid() {
        let mut pool = pool();
        let mut chunk = chunk(&mut pool, 5, 5);
        for i in 0..16 {
            chunk.write(IVec3::new(i * 2, i, 31 - i), 0, i as u16 + 1);
        }
        assert!(chunk.is_spilled());
        for i in 0..16 {
            assert_eq!(chunk.read(IVec3::new(i * 2, i, 31 - i)), Some(i as u16 + 1));
        }
        pool.free_chunk(chunk);
    }
}
