//! Chunk - an octree over a cubic region, living in a pool slot.

use std::fmt;
use std::ptr::NonNull;

use glam::{DVec3, IVec3};

use super::node::Node;
use super::storage::{NodeStorage, SpillRegion};
use super::{MAX_DEPTH, octant_index, octant_offset};
use crate::core::error::{Result, fatal};
use crate::memory::pool::ChunkHandle;

/// Identity of a cubic region: min corner aligned to `2^scale`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub position: IVec3,
    pub scale: u8,
}

impl ChunkKey {
    pub fn new(position: IVec3, scale: u8) -> Self {
        debug_assert_eq!(
            position,
            Self::containing(position, scale).position,
            "chunk position not aligned to scale"
        );
        Self { position, scale }
    }

    /// Key of the `2^scale` cell containing `pos`
    pub fn containing(pos: IVec3, scale: u8) -> Self {
        let snap = |v: i32| (v >> scale) << scale;
        Self {
            position: IVec3::new(snap(pos.x), snap(pos.y), snap(pos.z)),
            scale,
        }
    }

    /// Side length in world units
    #[inline]
    pub fn side(&self) -> i32 {
        1 << self.scale
    }

    pub fn center(&self) -> DVec3 {
        self.position.as_dvec3() + DVec3::splat(self.side() as f64 * 0.5)
    }

    pub fn contains(&self, pos: IVec3) -> bool {
        let d = pos - self.position;
        let side = self.side();
        d.cmpge(IVec3::ZERO).all() && d.cmplt(IVec3::splat(side)).all()
    }

    pub fn parent(&self) -> Self {
        Self::containing(self.position, self.scale + 1)
    }

    pub fn child(&self, octant: u8) -> Self {
        debug_assert!(self.scale > 0);
        let half = self.side() >> 1;
        Self {
            position: self.position + octant_offset(octant) * half,
            scale: self.scale - 1,
        }
    }

    pub fn children(&self) -> [Self; 8] {
        std::array::from_fn(|octant| self.child(octant as u8))
    }

    /// Which octant of its parent this key occupies
    pub fn octant_in_parent(&self) -> u8 {
        let rel = (self.position - self.parent().position) >> self.scale as i32;
        octant_index(rel)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})@{}",
            self.position.x, self.position.y, self.position.z, self.scale
        )
    }
}

/// Which of the two octree levels a chunk belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkLevel {
    /// The single root chunk: leaves are chunk-table indices
    Root,
    /// Resident voxel chunk: leaves are voxel values
    Leaf,
}

/// Everything needed to initialise a chunk header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSpec {
    pub position: IVec3,
    pub scale: u8,
    pub voxel_scale: u8,
    pub level: ChunkLevel,
}

impl ChunkSpec {
    /// Leaf chunk for `key` holding `2^chunk_depth` voxels per side
    pub fn leaf(key: ChunkKey, chunk_depth: u8) -> Self {
        Self {
            position: key.position,
            scale: key.scale,
            voxel_scale: key.scale - chunk_depth,
            level: ChunkLevel::Leaf,
        }
    }

    /// Root chunk whose finest cell is a `2^min_chunk_scale` chunk
    pub fn root(position: IVec3, scale: u8, min_chunk_scale: u8) -> Self {
        Self {
            position,
            scale,
            voxel_scale: min_chunk_scale,
            level: ChunkLevel::Root,
        }
    }

    pub(crate) fn validate(&self) {
        assert!(
            self.voxel_scale < self.scale && (self.scale - self.voxel_scale) as usize <= MAX_DEPTH,
            "chunk depth {} outside 1..={}",
            self.scale as i32 - self.voxel_scale as i32,
            MAX_DEPTH
        );
        assert!(self.scale <= 30, "chunk scale {} too large", self.scale);
    }
}

/// Chunk header as laid out in a pool slot.
#[repr(C)]
pub(crate) struct ChunkHeader {
    pub(crate) storage: NodeStorage,
    pub(crate) position: IVec3,
    pub(crate) scale: u8,
    pub(crate) voxel_scale: u8,
    pub(crate) level: ChunkLevel,
    pub(crate) dirty: bool,
}

impl ChunkHeader {
    pub(crate) fn new(spec: ChunkSpec) -> Self {
        Self {
            storage: NodeStorage::new(),
            position: spec.position,
            scale: spec.scale,
            voxel_scale: spec.voxel_scale,
            level: spec.level,
            dirty: true,
        }
    }
}

/// Exclusive token for one pool slot.
///
/// A chunk is not `Clone`; whoever holds it (the tree, a pending map, or a
/// worker job) is the only code that can touch its nodes. Give it back with
/// [`ChunkPool::free_chunk`](crate::memory::pool::ChunkPool::free_chunk).
pub struct Chunk {
    header: NonNull<ChunkHeader>,
    region: SpillRegion,
    handle: ChunkHandle,
}

// The token owns its header and node range exclusively and keeps the backing
// reservation alive through `region`.
unsafe impl Send for Chunk {}

impl Chunk {
    /// # Safety
    /// `header` must point to an initialised header in a committed page of
    /// the pool behind `region`, and no other `Chunk` may reference the slot.
    pub(crate) unsafe fn from_raw(
        header: NonNull<ChunkHeader>,
        region: SpillRegion,
        handle: ChunkHandle,
    ) -> Self {
        Self {
            header,
            region,
            handle,
        }
    }

    #[inline]
    fn header(&self) -> &ChunkHeader {
        // SAFETY: see `from_raw`.
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut ChunkHeader {
        // SAFETY: see `from_raw`.
        unsafe { self.header.as_mut() }
    }

    pub(crate) fn region(&self) -> &SpillRegion {
        &self.region
    }

    pub fn handle(&self) -> ChunkHandle {
        self.handle
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            position: self.position(),
            scale: self.scale(),
        }
    }

    pub fn position(&self) -> IVec3 {
        self.header().position
    }

    pub(crate) fn set_position(&mut self, position: IVec3) {
        self.header_mut().position = position;
    }

    pub fn scale(&self) -> u8 {
        self.header().scale
    }

    /// World scale of one leaf cell
    pub fn voxel_scale(&self) -> u8 {
        self.header().voxel_scale
    }

    /// Octree levels below node 0
    pub fn depth(&self) -> u8 {
        self.scale() - self.voxel_scale()
    }

    pub fn level(&self) -> ChunkLevel {
        self.header().level
    }

    pub fn contains(&self, pos: IVec3) -> bool {
        self.key().contains(pos)
    }

    pub fn is_dirty(&self) -> bool {
        self.header().dirty
    }

    pub fn mark_dirty(&mut self) {
        self.header_mut().dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.header_mut().dirty = false;
    }

    /// Nodes allocated (live and dead)
    pub fn node_count(&self) -> u32 {
        self.header().storage.len()
    }

    pub fn committed_nodes(&self) -> u32 {
        self.header().storage.committed()
    }

    pub fn dead_nodes(&self) -> u32 {
        self.header().storage.dead()
    }

    pub fn is_spilled(&self) -> bool {
        self.header().storage.is_spilled()
    }

    pub fn nodes(&self) -> &[Node] {
        self.header().storage.nodes(&self.region)
    }

    /// Node array as raw bytes, e.g. for upload
    pub fn node_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.nodes())
    }

    #[inline]
    pub fn node(&self, index: u16) -> &Node {
        &self.nodes()[index as usize]
    }

    #[inline]
    pub(crate) fn node_mut(&mut self, index: u16) -> &mut Node {
        let region = &self.region;
        // SAFETY: see `from_raw`; `region` is a disjoint field.
        let header = unsafe { self.header.as_mut() };
        &mut header.storage.nodes_mut(region)[index as usize]
    }

    /// Allocate a node, surfacing exhaustion as an error
    pub fn try_alloc_node(&mut self, node: Node) -> Result<u16> {
        let region = &self.region;
        // SAFETY: see `from_raw`; `region` is a disjoint field.
        let header = unsafe { self.header.as_mut() };
        header.storage.try_alloc(region, node)
    }

    /// Allocate a node; exhaustion aborts the process
    pub fn alloc_node(&mut self, node: Node) -> u16 {
        match self.try_alloc_node(node) {
            Ok(index) => index,
            Err(e) => fatal(e),
        }
    }

    /// Free the most recently allocated node
    pub fn pop_node(&mut self, index: u16) {
        self.header_mut().storage.pop(index);
    }

    pub(crate) fn add_dead_nodes(&mut self, count: u32) {
        if count > 0 {
            self.header_mut().storage.add_dead(count);
        }
    }

    /// Drop every node and restart with a single root uniformly `fill`.
    /// Committed node pages are kept for reuse.
    pub fn reset(&mut self, fill: u16) {
        self.header_mut().storage.clear();
        self.alloc_node(Node::uniform(fill));
        self.mark_dirty();
    }

    /// Rebuild the node array from the nodes reachable from node 0,
    /// breadth first. Leaf values and the dirty flag are unchanged; node
    /// indices are not. Returns the number of nodes reclaimed.
    pub fn compact(&mut self) -> u32 {
        let before = self.node_count();
        let mut live = vec![*self.node(0)];
        let mut next = 0;
        while next < live.len() {
            let mut node = live[next];
            for octant in 0..8 {
                if !node.is_leaf(octant) {
                    let index = live.len() as u16;
                    live.push(*self.node(node.child(octant)));
                    node.set_branch(octant, index);
                }
            }
            live[next] = node;
            next += 1;
        }

        self.header_mut().storage.clear();
        for node in live {
            self.alloc_node(node);
        }
        before - self.node_count()
    }

    /// Decommit spilled node pages ahead of returning the slot.
    pub(crate) fn release_storage(&mut self) {
        let region = &self.region;
        // SAFETY: see `from_raw`; `region` is a disjoint field.
        let header = unsafe { self.header.as_mut() };
        header.storage.release(region);
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("key", &self.key())
            .field("level", &self.level())
            .field("handle", &self.handle)
            .field("nodes", &self.node_count())
            .finish()
    }
}
