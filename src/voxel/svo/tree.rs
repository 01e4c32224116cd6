//! Two-level sparse voxel octree.
//!
//! The root chunk spans the streamed footprint; each of its leaves holds
//! either [`NULL_CHUNK`] or the table index of a resident leaf chunk. Reads
//! and writes resolve through the root into the owning chunk.
//!
//! Chunks being streamed in are tracked in pending maps until they can be
//! swapped in whole: a split only becomes visible once all eight children
//! have arrived, and a merge replaces all eight children at once.

use std::collections::{HashMap, HashSet};

use glam::{DVec3, IVec3};
use smallvec::SmallVec;

use super::chunk::{Chunk, ChunkKey, ChunkLevel, ChunkSpec};
use super::node::Node;
use super::octree::CellState;
use super::{INLINE_NODES, NULL_CHUNK, octant_index, octant_offset};
use crate::core::config::StreamingConfig;
use crate::core::error::Result;
use crate::memory::pool::{ChunkHandle, ChunkPool, PoolStats};
use crate::voxel::voxel::Voxel;

/// Result of [`Svo::write`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditOutcome {
    Written,
    /// No resident chunk covers the position
    Unloaded,
    /// The covering chunk's voxels are coarser than the requested scale
    BelowResolution,
}

/// What happened to a chunk handed back by a worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finalized {
    /// Created chunk is now resident
    Inserted,
    /// Split child stored; `ready` of 8 siblings have arrived
    Stashed { ready: usize },
    /// Last split child arrived; parent replaced by all 8 children
    Promoted,
    /// Merged parent replaced its 8 children
    Merged,
    /// Target changed while the job ran; the chunk was freed
    Discarded,
}

struct SplitGroup {
    parent: ChunkHandle,
    siblings: SmallVec<[Chunk; 8]>,
}

struct MergeGroup {
    children: [ChunkHandle; 8],
}

/// Tree counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SvoStats {
    pub root_position: IVec3,
    pub root_scale: u8,
    pub resident_chunks: usize,
    pub root_nodes: u32,
    /// Nodes allocated across the root and every resident chunk
    pub total_nodes: u64,
    pub dead_nodes: u64,
    pub pending_creates: usize,
    pub pending_splits: usize,
    pub pending_merges: usize,
    pub pool: PoolStats,
}

/// Root chunk plus the resident chunk set.
pub struct Svo {
    pool: ChunkPool,
    root: Chunk,
    /// Resident chunks by pool slot index
    table: Vec<Option<Chunk>>,
    chunks: HashMap<ChunkKey, ChunkHandle>,
    pending_creates: HashSet<ChunkKey>,
    pending_splits: HashMap<ChunkKey, SplitGroup>,
    pending_merges: HashMap<ChunkKey, MergeGroup>,
    chunk_depth: u8,
    min_chunk_scale: u8,
    max_chunk_scale: u8,
    root_hysteresis: f64,
}

impl Svo {
    /// Build an empty tree whose root is centred on the origin.
    pub fn new(config: &StreamingConfig) -> Result<Self> {
        config.validate()?;
        let mut pool = ChunkPool::new(config.pool_limits())?;

        let half = 1i32 << (config.root_scale - 1);
        let root = pool.try_alloc_chunk(
            ChunkSpec::root(IVec3::splat(-half), config.root_scale, config.min_chunk_scale),
            NULL_CHUNK,
        )?;
        let table = (0..config.max_chunks).map(|_| None).collect();

        log::info!(
            "SVO root {} ({} units per side), chunks {}..={} at depth {}",
            root.key(),
            root.key().side(),
            config.min_chunk_scale,
            config.max_chunk_scale,
            config.chunk_depth
        );

        Ok(Self {
            pool,
            root,
            table,
            chunks: HashMap::new(),
            pending_creates: HashSet::new(),
            pending_splits: HashMap::new(),
            pending_merges: HashMap::new(),
            chunk_depth: config.chunk_depth,
            min_chunk_scale: config.min_chunk_scale,
            max_chunk_scale: config.max_chunk_scale,
            root_hysteresis: config.root_hysteresis,
        })
    }

    pub fn root(&self) -> &Chunk {
        &self.root
    }

    /// Whether `pos` lies inside the current root footprint
    pub fn contains(&self, pos: IVec3) -> bool {
        self.root.contains(pos)
    }

    pub fn chunk_depth(&self) -> u8 {
        self.chunk_depth
    }

    pub fn min_chunk_scale(&self) -> u8 {
        self.min_chunk_scale
    }

    pub fn max_chunk_scale(&self) -> u8 {
        self.max_chunk_scale
    }

    // ---- Allocation ----

    /// Allocate an empty leaf chunk for `key`
    pub fn try_alloc_leaf(&mut self, key: ChunkKey) -> Result<Chunk> {
        self.pool
            .try_alloc_chunk(ChunkSpec::leaf(key, self.chunk_depth), Voxel::EMPTY.0)
    }

    /// Allocate an empty leaf chunk for `key`; exhaustion aborts
    pub fn alloc_leaf(&mut self, key: ChunkKey) -> Chunk {
        self.pool
            .alloc_chunk(ChunkSpec::leaf(key, self.chunk_depth), Voxel::EMPTY.0)
    }

    /// Return a chunk that is not resident to the pool
    pub fn free_chunk(&mut self, chunk: Chunk) {
        self.pool.free_chunk(chunk);
    }

    // ---- Lookup ----

    fn table_index(&self, pos: IVec3) -> Option<usize> {
        match self.root.read(pos)? {
            NULL_CHUNK => None,
            index => Some(index as usize),
        }
    }

    /// Resident chunk covering `pos`
    pub fn chunk_at(&self, pos: IVec3) -> Option<&Chunk> {
        let index = self.table_index(pos)?;
        self.table[index].as_ref()
    }

    fn chunk_at_mut(&mut self, pos: IVec3) -> Option<&mut Chunk> {
        let index = self.table_index(pos)?;
        self.table[index].as_mut()
    }

    fn resolve(&self, handle: ChunkHandle) -> Option<&Chunk> {
        self.table
            .get(handle.index as usize)?
            .as_ref()
            .filter(|c| c.handle() == handle)
    }

    /// Resident chunk with exactly this key
    pub fn chunk(&self, key: &ChunkKey) -> Option<&Chunk> {
        self.resolve(*self.chunks.get(key)?)
    }

    pub fn chunk_mut(&mut self, key: &ChunkKey) -> Option<&mut Chunk> {
        let handle = *self.chunks.get(key)?;
        self.table
            .get_mut(handle.index as usize)?
            .as_mut()
            .filter(|c| c.handle() == handle)
    }

    pub fn handle(&self, key: &ChunkKey) -> Option<ChunkHandle> {
        self.chunks.get(key).copied()
    }

    pub fn is_resident(&self, key: &ChunkKey) -> bool {
        self.chunks.contains_key(key)
    }

    /// All resident chunks, in slot order
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> + '_ {
        self.table.iter().flatten()
    }

    pub fn resident_count(&self) -> usize {
        self.chunks.len()
    }

    /// True if no chunk covers any part of `key` and it lies inside the root
    pub fn is_unloaded(&self, key: ChunkKey) -> bool {
        matches!(
            self.root.cell(key.position, key.scale),
            Some(CellState::Leaf {
                value: NULL_CHUNK,
                ..
            })
        )
    }

    // ---- Voxel access ----

    /// Voxel at `pos`, or [`Voxel::UNLOADED`] if nothing resident covers it
    pub fn read(&self, pos: IVec3) -> Voxel {
        self.chunk_at(pos)
            .and_then(|chunk| chunk.read(pos))
            .map(Voxel)
            .unwrap_or(Voxel::UNLOADED)
    }

    /// Set the cell of world scale `scale` containing `pos`.
    ///
    /// A cell at least as large as the covering chunk fills every resident
    /// chunk inside it.
    ///
    /// # Panics
    /// If `pos` is outside the root, `scale` is not below the root scale or
    /// `value` is [`Voxel::UNLOADED`].
    pub fn write(&mut self, pos: IVec3, scale: u8, value: Voxel) -> EditOutcome {
        assert!(
            self.contains(pos),
            "write at {} outside root {}",
            pos,
            self.root.key()
        );
        assert!(scale < self.root.scale(), "write scale {} not below root", scale);
        assert!(!value.is_unloaded(), "the unloaded sentinel cannot be stored");

        let Some(chunk) = self.chunk_at_mut(pos) else {
            return EditOutcome::Unloaded;
        };
        if scale < chunk.voxel_scale() {
            return EditOutcome::BelowResolution;
        }
        if scale < chunk.scale() {
            chunk.write(pos, scale, value.0);
            return EditOutcome::Written;
        }

        let cell = ChunkKey::containing(pos, scale);
        for chunk in self.table.iter_mut().flatten() {
            if chunk.scale() <= scale && cell.contains(chunk.position()) {
                chunk.reset(value.0);
            }
        }
        EditOutcome::Written
    }

    // ---- Residency ----

    /// Make a leaf chunk resident.
    ///
    /// # Panics
    /// If the chunk's scale is outside the chunk range, it lies outside the
    /// root or any part of its region is already covered.
    pub fn insert_chunk(&mut self, chunk: Chunk) {
        let key = chunk.key();
        assert_eq!(chunk.level(), ChunkLevel::Leaf, "only leaf chunks are inserted");
        assert!(
            (self.min_chunk_scale..=self.max_chunk_scale).contains(&key.scale),
            "chunk {} outside scale range",
            key
        );
        assert!(
            self.is_unloaded(key),
            "chunk {} outside root or overlapping resident data",
            key
        );

        let handle = chunk.handle();
        self.root.write(key.position, key.scale, handle.index);
        self.compact_root();
        self.table[handle.index as usize] = Some(chunk);
        self.chunks.insert(key, handle);
        log::trace!("Chunk {} resident in slot {}", key, handle.index);
    }

    /// Take a chunk out of the tree; its region reads as unloaded afterwards
    pub fn remove_chunk(&mut self, key: &ChunkKey) -> Option<Chunk> {
        let handle = self.chunks.remove(key)?;
        let chunk = self.table[handle.index as usize].take()?;
        self.root.write(key.position, key.scale, NULL_CHUNK);
        self.compact_root();
        Some(chunk)
    }

    /// Rebuild the root's node array once dead nodes outnumber live ones.
    fn compact_root(&mut self) {
        let dead = self.root.dead_nodes();
        if (dead as usize) < INLINE_NODES || dead * 2 <= self.root.node_count() {
            return;
        }
        let reclaimed = self.root.compact();
        log::trace!(
            "Compacted root: {} nodes reclaimed, {} live",
            reclaimed,
            self.root.node_count()
        );
    }

    fn evict(&mut self, index: u16) {
        if let Some(chunk) = self.table[index as usize].take() {
            self.chunks.remove(&chunk.key());
            self.pool.free_chunk(chunk);
        }
    }

    // ---- Dirty tracking ----

    /// Resident chunks modified since their flag was last cleared
    pub fn dirty_chunks(&self) -> Vec<ChunkKey> {
        self.chunks().filter(|c| c.is_dirty()).map(Chunk::key).collect()
    }

    pub fn clear_dirty(&mut self, key: &ChunkKey) -> bool {
        match self.chunk_mut(key) {
            Some(chunk) => {
                chunk.clear_dirty();
                true
            }
            None => false,
        }
    }

    /// Whether the chunk index (root chunk) changed since last cleared
    pub fn is_root_dirty(&self) -> bool {
        self.root.is_dirty()
    }

    pub fn clear_root_dirty(&mut self) {
        self.root.clear_dirty();
    }

    // ---- Pending operations ----

    /// A chunk is locked while it is the parent of a pending split or a
    /// child of a pending merge.
    pub fn is_locked(&self, key: &ChunkKey) -> bool {
        self.pending_splits.contains_key(key)
            || (key.scale < self.max_chunk_scale && self.pending_merges.contains_key(&key.parent()))
    }

    pub fn is_pending_create(&self, key: &ChunkKey) -> bool {
        self.pending_creates.contains(key)
    }

    /// Record a CREATE for an unloaded cell. False if not applicable.
    pub fn begin_create(&mut self, key: ChunkKey) -> bool {
        if self.pending_creates.contains(&key) || !self.is_unloaded(key) {
            return false;
        }
        self.pending_creates.insert(key)
    }

    pub fn complete_create(&mut self, chunk: Chunk) -> Finalized {
        let key = chunk.key();
        let expected = self.pending_creates.remove(&key);
        if !expected || !self.is_unloaded(key) {
            log::debug!("Discarding created chunk {}", key);
            self.pool.free_chunk(chunk);
            return Finalized::Discarded;
        }
        self.insert_chunk(chunk);
        Finalized::Inserted
    }

    /// Record a SPLIT of a resident, unlocked chunk. False if not applicable.
    pub fn begin_split(&mut self, key: ChunkKey) -> bool {
        if key.scale <= self.min_chunk_scale || self.is_locked(&key) {
            return false;
        }
        let Some(&parent) = self.chunks.get(&key) else {
            return false;
        };
        self.pending_splits.insert(
            key,
            SplitGroup {
                parent,
                siblings: SmallVec::new(),
            },
        );
        true
    }

    /// Stash one finished child of a split. The eighth child swaps the
    /// parent for all eight at once.
    pub fn complete_split_child(&mut self, parent_key: ChunkKey, chunk: Chunk) -> Finalized {
        debug_assert_eq!(chunk.key().parent(), parent_key);
        let ready = match self.pending_splits.get_mut(&parent_key) {
            Some(group) => {
                group.siblings.push(chunk);
                group.siblings.len()
            }
            None => {
                self.pool.free_chunk(chunk);
                return Finalized::Discarded;
            }
        };
        if ready < 8 {
            return Finalized::Stashed { ready };
        }

        let Some(group) = self.pending_splits.remove(&parent_key) else {
            return Finalized::Discarded;
        };
        if self.chunks.get(&parent_key) != Some(&group.parent) {
            log::debug!("Split parent {} gone, discarding children", parent_key);
            for sibling in group.siblings {
                self.pool.free_chunk(sibling);
            }
            return Finalized::Discarded;
        }

        if let Some(parent) = self.remove_chunk(&parent_key) {
            self.pool.free_chunk(parent);
        }
        for sibling in group.siblings {
            self.insert_chunk(sibling);
        }
        Finalized::Promoted
    }

    /// Record a MERGE of eight resident, unlocked siblings into `parent_key`.
    /// False if not applicable.
    pub fn begin_merge(&mut self, parent_key: ChunkKey) -> bool {
        if parent_key.scale > self.max_chunk_scale || self.pending_merges.contains_key(&parent_key)
        {
            return false;
        }
        let mut handles: SmallVec<[ChunkHandle; 8]> = SmallVec::new();
        for child in parent_key.children() {
            if self.pending_splits.contains_key(&child) {
                return false;
            }
            match self.chunks.get(&child) {
                Some(&handle) => handles.push(handle),
                None => return false,
            }
        }
        let Ok(children) = handles.into_inner() else {
            return false;
        };
        self.pending_merges.insert(parent_key, MergeGroup { children });
        true
    }

    /// Swap a merged parent in for its eight children
    pub fn complete_merge(&mut self, chunk: Chunk) -> Finalized {
        let key = chunk.key();
        let Some(group) = self.pending_merges.remove(&key) else {
            self.pool.free_chunk(chunk);
            return Finalized::Discarded;
        };

        let children = key.children();
        let intact = children
            .iter()
            .zip(group.children.iter())
            .all(|(child, handle)| self.chunks.get(child) == Some(handle));
        if !intact {
            log::debug!("Merge children of {} changed, discarding", key);
            self.pool.free_chunk(chunk);
            return Finalized::Discarded;
        }

        for child in &children {
            if let Some(old) = self.remove_chunk(child) {
                self.pool.free_chunk(old);
            }
        }
        self.insert_chunk(chunk);
        Finalized::Merged
    }

    // ---- Root relocation ----

    /// Re-centre the root footprint when the viewer strays past a quarter of
    /// its side plus hysteresis on any axis. Returns the shift in half-sides.
    ///
    /// Top-level octants keep their content when they stay inside the
    /// footprint; the rest are pruned and their chunks freed. A shift of two
    /// halves or more on any axis clears the root.
    pub fn root_move(&mut self, viewer: DVec3) -> Option<IVec3> {
        let key = self.root.key();
        let half = key.side() / 2;
        let half_f = half as f64;
        let center = key.center();
        let threshold = half_f * 0.5 + self.root_hysteresis;

        let mut shift = IVec3::ZERO;
        for axis in 0..3 {
            let offset = viewer[axis] - center[axis];
            if offset.abs() > threshold {
                shift[axis] = (offset / half_f).round().clamp(-2.0, 2.0) as i32;
            }
        }
        if shift == IVec3::ZERO {
            return None;
        }

        let position = if shift.abs().max_element() >= 2 {
            for octant in 0..8 {
                let node = *self.root.node(0);
                self.prune_octant(&node, octant);
            }
            self.root.reset(NULL_CHUNK);
            ((viewer / half_f).round() * half_f).as_ivec3() - IVec3::splat(half)
        } else {
            self.shuffle_root(shift);
            key.position + shift * half
        };

        self.root.set_position(position);
        self.root.mark_dirty();
        self.compact_root();
        log::debug!(
            "Root moved by {} halves to {} ({} chunks resident)",
            shift,
            self.root.key(),
            self.chunks.len()
        );
        Some(shift)
    }

    fn shuffle_root(&mut self, shift: IVec3) {
        let old = *self.root.node(0);
        let mut next = Node::uniform(NULL_CHUNK);
        let mut kept = 0u8;

        for octant in 0..8u8 {
            let source = octant_offset(octant) + shift;
            if source.cmpge(IVec3::ZERO).all() && source.cmple(IVec3::ONE).all() {
                let from = octant_index(source);
                kept |= 1 << from;
                if old.is_leaf(from) {
                    next.set_leaf(octant, old.child(from));
                } else {
                    next.set_branch(octant, old.child(from));
                }
            }
        }

        for octant in 0..8u8 {
            if kept & (1 << octant) == 0 {
                self.prune_octant(&old, octant);
            }
        }
        *self.root.node_mut(0) = next;
    }

    /// Free every chunk under `node`'s `octant`; subtree nodes become dead
    fn prune_octant(&mut self, node: &Node, octant: u8) {
        let child = node.child(octant);
        if node.is_leaf(octant) {
            if child != NULL_CHUNK {
                self.evict(child);
            }
            return;
        }

        let mut indices = Vec::new();
        let visited = self.root.visit_subtree(child, |leaf| {
            if leaf != NULL_CHUNK {
                indices.push(leaf);
            }
        });
        self.root.add_dead_nodes(visited);
        for index in indices {
            self.evict(index);
        }
    }

    // ---- Diagnostics ----

    pub fn stats(&self) -> SvoStats {
        let mut total_nodes = self.root.node_count() as u64;
        let mut dead_nodes = self.root.dead_nodes() as u64;
        for chunk in self.chunks() {
            total_nodes += chunk.node_count() as u64;
            dead_nodes += chunk.dead_nodes() as u64;
        }

        SvoStats {
            root_position: self.root.position(),
            root_scale: self.root.scale(),
            resident_chunks: self.chunks.len(),
            root_nodes: self.root.node_count(),
            total_nodes,
            dead_nodes,
            pending_creates: self.pending_creates.len(),
            pending_splits: self.pending_splits.len(),
            pending_merges: self.pending_merges.len(),
            pool: self.pool.stats(),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
