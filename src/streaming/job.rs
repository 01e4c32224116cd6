//! Streaming jobs handed to workers and their results.

use std::time::{Duration, Instant};

use crate::generation::VoxelGenerator;
use crate::voxel::svo::{Chunk, ChunkKey, bulk_build};

/// What a job's chunk will be used for once it comes back
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    /// New top-level chunk for an unloaded cell
    Create,
    /// One of eight children replacing `parent`
    Split { parent: ChunkKey },
    /// Parent replacing its eight resident children
    Merge,
}

/// Work item: fill `chunk` with generated content.
///
/// The chunk was allocated on the main thread and travels with the job, so
/// the worker owns it exclusively until the result is sent back.
pub struct Job {
    pub kind: JobKind,
    pub chunk: Chunk,
    pub seed: u32,
    pub queued_at: Instant,
}

impl Job {
    pub fn new(kind: JobKind, chunk: Chunk, seed: u32) -> Self {
        Self {
            kind,
            chunk,
            seed,
            queued_at: Instant::now(),
        }
    }

    pub fn key(&self) -> ChunkKey {
        self.chunk.key()
    }
}

/// Where a job spent its time
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct JobTiming {
    /// Waiting in the queue
    pub queued: Duration,
    /// Inside the generator
    pub generate: Duration,
    /// Building the octree
    pub build: Duration,
}

impl JobTiming {
    /// Time spent working, excluding the queue
    pub fn work(&self) -> Duration {
        self.generate + self.build
    }
}

/// Finished job on its way back to the main thread
pub struct CompletedJob {
    pub kind: JobKind,
    pub chunk: Chunk,
    pub timing: JobTiming,
}

/// Generate and build one job's chunk.
pub fn execute(job: Job, generator: &dyn VoxelGenerator) -> CompletedJob {
    let Job {
        kind,
        mut chunk,
        seed,
        queued_at,
    } = job;
    let queued = queued_at.elapsed();

    let start = Instant::now();
    let voxels = generator.generate(chunk.key(), chunk.depth(), seed);
    let generate = start.elapsed();

    let start = Instant::now();
    bulk_build(&mut chunk, &voxels);
    let build = start.elapsed();

    log::trace!(
        "Built {:?} chunk {}: {} nodes in {:.2}ms",
        kind,
        chunk.key(),
        chunk.node_count(),
        (generate + build).as_secs_f32() * 1000.0
    );

    CompletedJob {
        kind,
        chunk,
        timing: JobTiming {
            queued,
            generate,
            build,
        },
    }
}
