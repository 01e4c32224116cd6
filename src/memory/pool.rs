//! Chunk pool - fixed-capacity slots backed by reserved address space.
//!
//! Headers for every slot live in one reservation and node pages for every
//! slot in another. Nothing is committed until a slot goes live: a header
//! page is committed with the first live slot in it and decommitted with the
//! last, node pages are committed by the chunk's own storage as it grows.
//!
//! Slots carry a generation counter so a [`ChunkHandle`] taken before a free
//! never resolves to the slot's next occupant.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::vm::{Reservation, page_size, round_to_pages};
use crate::core::error::{Error, Result, fatal};
use crate::voxel::svo::chunk::{Chunk, ChunkHeader, ChunkSpec};
use crate::voxel::svo::node::Node;
use crate::voxel::svo::storage::SpillRegion;

/// Pool capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolLimits {
    /// Chunk slots
    pub max_chunks: u32,
    /// Nodes per chunk
    pub max_nodes: u32,
}

/// Generational reference to a pool slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkHandle {
    pub index: u16,
    pub generation: u32,
}

/// Pool counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: u32,
    pub live: u32,
    pub committed_header_pages: u32,
    pub committed_node_pages: u64,
}

/// The two reservations behind a pool, shared with every chunk token.
pub(crate) struct PoolMemory {
    pub(crate) headers: Reservation,
    pub(crate) nodes: Reservation,
    pub(crate) header_stride: usize,
    pub(crate) node_stride: usize,
    pub(crate) max_nodes: u32,
    committed_node_pages: AtomicU64,
}

impl PoolMemory {
    pub(crate) fn reserve(limits: PoolLimits) -> Result<Self> {
        let page = page_size();
        let header_stride = std::mem::size_of::<ChunkHeader>().next_power_of_two();
        assert!(header_stride <= page, "chunk header larger than a page");
        let node_stride = round_to_pages(limits.max_nodes as usize * std::mem::size_of::<Node>());
        let slots = limits.max_chunks as usize;

        let headers = Reservation::reserve(slots * header_stride).map_err(Error::Reserve)?;
        let nodes = Reservation::reserve(slots * node_stride).map_err(Error::Reserve)?;

        Ok(Self {
            headers,
            nodes,
            header_stride,
            node_stride,
            max_nodes: limits.max_nodes,
            committed_node_pages: AtomicU64::new(0),
        })
    }

    pub(crate) fn note_node_pages_committed(&self, pages: u32) {
        self.committed_node_pages
            .fetch_add(pages as u64, Ordering::Relaxed);
    }

    pub(crate) fn note_node_pages_released(&self, pages: u32) {
        self.committed_node_pages
            .fetch_sub(pages as u64, Ordering::Relaxed);
    }

    pub(crate) fn committed_node_pages(&self) -> u64 {
        self.committed_node_pages.load(Ordering::Relaxed)
    }
}

/// Fixed-capacity chunk allocator.
pub struct ChunkPool {
    memory: Arc<PoolMemory>,
    limits: PoolLimits,
    /// One bit per slot, set when live
    occupied: Vec<u64>,
    generations: Vec<u32>,
    /// Live slots per header page
    page_live: Vec<u32>,
    slots_per_page: usize,
    live: u32,
    committed_header_pages: u32,
}

impl ChunkPool {
    /// Reserve address space for `limits`. Nothing is committed yet.
    pub fn new(limits: PoolLimits) -> Result<Self> {
        if limits.max_chunks == 0 || limits.max_chunks > u16::MAX as u32 {
            return Err(Error::Config(format!(
                "max_chunks {} outside 1..={}",
                limits.max_chunks,
                u16::MAX
            )));
        }
        if limits.max_nodes < 8 || limits.max_nodes > 1 << 16 {
            return Err(Error::Config(format!(
                "max_nodes {} outside 8..=65536",
                limits.max_nodes
            )));
        }

        let memory = PoolMemory::reserve(limits)?;
        let slots_per_page = page_size() / memory.header_stride;
        let slots = limits.max_chunks as usize;

        log::info!(
            "Chunk pool: {} slots, {} B headers, {} KiB node range per slot",
            slots,
            memory.header_stride,
            memory.node_stride / 1024
        );

        Ok(Self {
            memory: Arc::new(memory),
            limits,
            occupied: vec![0; slots.div_ceil(64)],
            generations: vec![0; slots],
            page_live: vec![0; slots.div_ceil(slots_per_page)],
            slots_per_page,
            live: 0,
            committed_header_pages: 0,
        })
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Take a free slot and initialise it with a root node uniformly `fill`.
    pub fn try_alloc_chunk(&mut self, spec: ChunkSpec, fill: u16) -> Result<Chunk> {
        spec.validate();
        let index = self.find_free().ok_or(Error::ChunkPoolExhausted {
            capacity: self.limits.max_chunks,
        })?;

        let page = index / self.slots_per_page;
        if self.page_live[page] == 0 {
            let size = page_size();
            self.memory
                .headers
                .commit(page * size, size)
                .map_err(Error::Commit)?;
            self.committed_header_pages += 1;
        }
        self.page_live[page] += 1;
        self.occupied[index / 64] |= 1 << (index % 64);
        self.live += 1;

        // SAFETY: the slot lies in a committed header page, is suitably
        // aligned (power-of-two stride) and was free until now.
        let header = unsafe {
            let ptr = self
                .memory
                .headers
                .base()
                .as_ptr()
                .add(index * self.memory.header_stride) as *mut ChunkHeader;
            ptr.write(ChunkHeader::new(spec));
            NonNull::new_unchecked(ptr)
        };
        let region = SpillRegion::new(self.memory.clone(), index * self.memory.node_stride);
        let handle = ChunkHandle {
            index: index as u16,
            generation: self.generations[index],
        };

        // SAFETY: header initialised above; the slot bit guarantees exclusivity.
        let mut chunk = unsafe { Chunk::from_raw(header, region, handle) };
        chunk.reset(fill);
        Ok(chunk)
    }

    /// Like [`try_alloc_chunk`](Self::try_alloc_chunk); exhaustion aborts.
    pub fn alloc_chunk(&mut self, spec: ChunkSpec, fill: u16) -> Chunk {
        match self.try_alloc_chunk(spec, fill) {
            Ok(chunk) => chunk,
            Err(e) => fatal(e),
        }
    }

    /// Return a chunk's slot to the pool.
    ///
    /// # Panics
    /// If the chunk came from another pool or its handle is stale.
    pub fn free_chunk(&mut self, mut chunk: Chunk) {
        assert!(
            Arc::ptr_eq(chunk.region().memory(), &self.memory),
            "chunk freed into a pool that did not allocate it"
        );
        let handle = chunk.handle();
        assert!(self.is_current(handle), "stale chunk {:?} freed", handle);

        chunk.release_storage();
        drop(chunk);

        let index = handle.index as usize;
        self.occupied[index / 64] &= !(1 << (index % 64));
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.live -= 1;

        let page = index / self.slots_per_page;
        self.page_live[page] -= 1;
        if self.page_live[page] == 0 {
            let size = page_size();
            if let Err(e) = self.memory.headers.decommit(page * size, size) {
                log::warn!("Failed to decommit header page {}: {}", page, e);
            }
            self.committed_header_pages -= 1;
        }
    }

    /// Whether `handle` still names a live slot
    pub fn is_current(&self, handle: ChunkHandle) -> bool {
        let index = handle.index as usize;
        index < self.generations.len()
            && self.generations[index] == handle.generation
            && self.occupied[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn live(&self) -> u32 {
        self.live
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.limits.max_chunks,
            live: self.live,
            committed_header_pages: self.committed_header_pages,
            committed_node_pages: self.memory.committed_node_pages(),
        }
    }

    fn find_free(&self) -> Option<usize> {
        for (word_index, &word) in self.occupied.iter().enumerate() {
            if word != u64::MAX {
                let index = word_index * 64 + (!word).trailing_zeros() as usize;
                return (index < self.limits.max_chunks as usize).then_some(index);
            }
        }
        None
    }
}
