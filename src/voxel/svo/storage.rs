//! Per-chunk node storage.
//!
//! The first [`INLINE_NODES`] nodes live inside the chunk header. When a
//! chunk outgrows them, its nodes move to the slot's private range of the
//! pool's node reservation and that range is committed page by page as the
//! chunk grows. Node indices never change, so links stay valid across the
//! spill.

use std::sync::Arc;

use super::INLINE_NODES;
use super::node::Node;
use crate::core::error::{Error, Result};
use crate::memory::pool::PoolMemory;
use crate::memory::vm::page_size;

const NODE_SIZE: usize = std::mem::size_of::<Node>();

/// A chunk slot's private range in the node reservation.
pub(crate) struct SpillRegion {
    memory: Arc<PoolMemory>,
    offset: usize,
}

impl SpillRegion {
    pub(crate) fn new(memory: Arc<PoolMemory>, offset: usize) -> Self {
        Self { memory, offset }
    }

    pub(crate) fn memory(&self) -> &Arc<PoolMemory> {
        &self.memory
    }

    fn base(&self) -> *mut Node {
        // SAFETY: offset is a slot boundary inside the node reservation.
        unsafe { self.memory.nodes.base().as_ptr().add(self.offset) as *mut Node }
    }

    fn max_nodes(&self) -> u32 {
        self.memory.max_nodes
    }

    /// Nodes that fit in `pages` committed pages
    fn capacity(&self, pages: u32) -> u32 {
        let bytes = pages as usize * page_size();
        ((bytes / NODE_SIZE) as u32).min(self.max_nodes())
    }

    fn commit_page(&self, page: u32) -> Result<()> {
        let size = page_size();
        self.memory
            .nodes
            .commit(self.offset + page as usize * size, size)
            .map_err(Error::Commit)?;
        self.memory.note_node_pages_committed(1);
        Ok(())
    }

    fn decommit_pages(&self, pages: u32) {
        if pages == 0 {
            return;
        }
        let size = page_size();
        if let Err(e) = self.memory.nodes.decommit(self.offset, pages as usize * size) {
            log::warn!("Failed to decommit {} node pages: {}", pages, e);
        }
        self.memory.note_node_pages_released(pages);
    }
}

/// Node array with inline small-chunk storage.
#[repr(C)]
pub struct NodeStorage {
    inline: [Node; INLINE_NODES],
    /// Next node index to hand out
    alloc_ptr: u32,
    /// Nodes addressable without committing more pages
    commit_ptr: u32,
    /// Pages committed in the spill region
    committed_pages: u32,
    /// Nodes unreachable from the root but not reclaimed
    dead: u32,
    spilled: bool,
}

impl NodeStorage {
    pub(crate) const fn new() -> Self {
        Self {
            inline: [Node::EMPTY; INLINE_NODES],
            alloc_ptr: 0,
            commit_ptr: INLINE_NODES as u32,
            committed_pages: 0,
            dead: 0,
            spilled: false,
        }
    }

    /// Nodes allocated so far (live and dead)
    pub fn len(&self) -> u32 {
        self.alloc_ptr
    }

    pub fn is_empty(&self) -> bool {
        self.alloc_ptr == 0
    }

    /// Nodes addressable without committing more memory
    pub fn committed(&self) -> u32 {
        self.commit_ptr
    }

    pub fn dead(&self) -> u32 {
        self.dead
    }

    pub fn is_spilled(&self) -> bool {
        self.spilled
    }

    pub fn committed_pages(&self) -> u32 {
        self.committed_pages
    }

    pub(crate) fn nodes<'a>(&'a self, region: &'a SpillRegion) -> &'a [Node] {
        if self.spilled {
            // SAFETY: the first alloc_ptr nodes of the region are committed
            // and initialised, and only this chunk addresses the region.
            unsafe { std::slice::from_raw_parts(region.base(), self.alloc_ptr as usize) }
        } else {
            &self.inline[..self.alloc_ptr as usize]
        }
    }

    pub(crate) fn nodes_mut<'a>(&'a mut self, region: &'a SpillRegion) -> &'a mut [Node] {
        if self.spilled {
            // SAFETY: as in `nodes`; `&mut self` makes the borrow exclusive.
            unsafe { std::slice::from_raw_parts_mut(region.base(), self.alloc_ptr as usize) }
        } else {
            &mut self.inline[..self.alloc_ptr as usize]
        }
    }

    /// Append `node`, spilling or committing a page when full.
    pub(crate) fn try_alloc(&mut self, region: &SpillRegion, node: Node) -> Result<u16> {
        if self.alloc_ptr == self.commit_ptr {
            self.grow(region)?;
        }
        let index = self.alloc_ptr;
        self.alloc_ptr += 1;
        self.nodes_mut(region)[index as usize] = node;
        Ok(index as u16)
    }

    fn grow(&mut self, region: &SpillRegion) -> Result<()> {
        if self.commit_ptr >= region.max_nodes() {
            return Err(Error::NodeSpaceExhausted {
                max_nodes: region.max_nodes(),
            });
        }

        // Commit until the inline nodes fit, or one page past the current end
        let target = if self.spilled {
            self.commit_ptr + 1
        } else {
            INLINE_NODES as u32
        };
        while region.capacity(self.committed_pages) < target.min(region.max_nodes()) {
            region.commit_page(self.committed_pages)?;
            self.committed_pages += 1;
        }

        if !self.spilled {
            // SAFETY: the region now holds at least INLINE_NODES committed nodes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.inline.as_ptr(),
                    region.base(),
                    self.alloc_ptr as usize,
                );
            }
            self.spilled = true;
            log::trace!("Node storage spilled after {} nodes", self.alloc_ptr);
        }
        self.commit_ptr = region.capacity(self.committed_pages);
        Ok(())
    }

    /// Return the most recently allocated node. Only the last node may be
    /// popped.
    pub(crate) fn pop(&mut self, index: u16) {
        assert_eq!(
            index as u32 + 1,
            self.alloc_ptr,
            "only the last allocated node can be popped"
        );
        self.alloc_ptr -= 1;
    }

    pub(crate) fn add_dead(&mut self, count: u32) {
        self.dead += count;
    }

    /// Forget every node but keep committed pages for reuse.
    pub(crate) fn clear(&mut self) {
        self.alloc_ptr = 0;
        self.dead = 0;
    }

    /// Decommit the spill region and fall back to inline storage.
    pub(crate) fn release(&mut self, region: &SpillRegion) {
        region.decommit_pages(self.committed_pages);
        *self = Self::new();
    }
}
