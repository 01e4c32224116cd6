//! Per-tick streaming driver.
//!
//! Each [`StreamingPipeline::tick`] runs, in order:
//! 1. root relocation around the viewer
//! 2. classification of CREATE / SPLIT / MERGE candidates, nearest first
//! 3. finalization of jobs the workers have completed
//! 4. submission of the classified operations within budget
//!
//! All pool allocation and tree mutation happens here on the calling
//! thread; workers only ever see the chunk inside their job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{DVec3, IVec3};

use super::job::{CompletedJob, Job, JobKind};
use super::lod::desired_chunk_scale;
use super::stats::StreamingStats;
use super::worker::WorkerPool;
use crate::core::config::StreamingConfig;
use crate::core::error::Result;
use crate::generation::VoxelGenerator;
use crate::voxel::svo::{ChunkKey, Svo};

/// Kind of tree change a classified cell needs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Split,
    Merge,
}

/// A classified operation; `key` is the cell created, split or merged into
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PendingOp {
    pub kind: OpKind,
    pub key: ChunkKey,
    /// Viewer distance to the cell centre
    pub distance: f64,
}

/// What one tick did
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TickReport {
    /// Root shift in half-sides, if the root moved
    pub root_shift: Option<IVec3>,
    pub classified: usize,
    pub finalized: usize,
    pub submitted_ops: usize,
    pub submitted_jobs: usize,
    pub in_flight: usize,
}

/// Drives an [`Svo`] from viewer movement using a worker pool.
pub struct StreamingPipeline {
    config: StreamingConfig,
    svo: Svo,
    workers: WorkerPool,
    in_flight: usize,
    stats: StreamingStats,
}

impl StreamingPipeline {
    pub fn new(config: StreamingConfig, generator: Arc<dyn VoxelGenerator>) -> Result<Self> {
        let svo = Svo::new(&config)?;
        let workers = WorkerPool::new(config.resolved_worker_threads(), generator)?;
        Ok(Self {
            config,
            svo,
            workers,
            in_flight: 0,
            stats: StreamingStats::default(),
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn svo(&self) -> &Svo {
        &self.svo
    }

    /// Mutable tree access for edits and dirty-flag consumers
    pub fn svo_mut(&mut self) -> &mut Svo {
        &mut self.svo
    }

    pub fn stats(&self) -> &StreamingStats {
        &self.stats
    }

    /// Jobs submitted but not yet finalized
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Run one streaming step for a viewer at `viewer`.
    pub fn tick(&mut self, viewer: DVec3) -> TickReport {
        let start = Instant::now();
        self.stats.ticks += 1;

        let root_shift = self.svo.root_move(viewer);
        if root_shift.is_some() {
            self.stats.root_moves += 1;
        }

        let ops = self.classify(viewer);
        let finalized = self.finalize(self.config.finalize_per_tick);
        let (submitted_ops, submitted_jobs) = self.submit(&ops);

        let report = TickReport {
            root_shift,
            classified: ops.len(),
            finalized,
            submitted_ops,
            submitted_jobs,
            in_flight: self.in_flight,
        };
        if submitted_ops > 0 || finalized > 0 {
            log::debug!(
                "Tick {}: {} finalized, {} ops ({} jobs) submitted, {} in flight, {:.2}ms",
                self.stats.ticks,
                finalized,
                submitted_ops,
                submitted_jobs,
                self.in_flight,
                start.elapsed().as_secs_f32() * 1000.0
            );
        }
        report
    }

    /// Nearest-first list of operations the tree needs, truncated to the
    /// per-tick budget.
    pub fn classify(&self, viewer: DVec3) -> Vec<PendingOp> {
        let mut ops = Vec::new();
        self.classify_creates(viewer, &mut ops);
        self.classify_lod(viewer, &mut ops);

        ops.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        ops.truncate(self.config.ops_per_tick);
        ops
    }

    /// Top-level cells inside the load radius and the root with nothing
    /// resident or pending.
    fn classify_creates(&self, viewer: DVec3, ops: &mut Vec<PendingOp>) {
        let top = self.config.max_chunk_scale;
        let side = 1i64 << top;
        let root = self.svo.root().key();
        let radius = self.config.load_radius;

        let range = |axis: usize| {
            let lo = ((viewer[axis] - radius) / side as f64).floor() as i64 * side;
            let hi = ((viewer[axis] + radius) / side as f64).floor() as i64 * side;
            let root_min = root.position[axis] as i64;
            let root_max = root_min + root.side() as i64 - side;
            (lo.max(root_min), hi.min(root_max))
        };
        let (x0, x1) = range(0);
        let (y0, y1) = range(1);
        let (z0, z1) = range(2);

        for z in (z0..=z1).step_by(side as usize) {
            for y in (y0..=y1).step_by(side as usize) {
                for x in (x0..=x1).step_by(side as usize) {
                    let key = ChunkKey::new(IVec3::new(x as i32, y as i32, z as i32), top);
                    let distance = key.center().distance(viewer);
                    if distance > radius
                        || self.svo.is_pending_create(&key)
                        || !self.svo.is_unloaded(key)
                    {
                        continue;
                    }
                    ops.push(PendingOp {
                        kind: OpKind::Create,
                        key,
                        distance,
                    });
                }
            }
        }
    }

    /// Resident chunks whose scale disagrees with the LOD at their position.
    fn classify_lod(&self, viewer: DVec3, ops: &mut Vec<PendingOp>) {
        let min = self.config.min_chunk_scale;
        let max = self.config.max_chunk_scale;
        let lod = &self.config.lod;

        for chunk in self.svo.chunks() {
            let key = chunk.key();
            if self.svo.is_locked(&key) {
                continue;
            }

            let distance = key.center().distance(viewer);
            if key.scale > min && desired_chunk_scale(distance, lod, min, max) < key.scale {
                ops.push(PendingOp {
                    kind: OpKind::Split,
                    key,
                    distance,
                });
                continue;
            }

            // Each sibling group is considered once, from its first child
            if key.scale >= max || key.octant_in_parent() != 0 {
                continue;
            }
            let parent = key.parent();
            let parent_distance = parent.center().distance(viewer);
            if desired_chunk_scale(parent_distance, lod, min, max) < parent.scale {
                continue;
            }
            let siblings_ready = parent
                .children()
                .iter()
                .all(|c| self.svo.is_resident(c) && !self.svo.is_locked(c));
            if siblings_ready {
                ops.push(PendingOp {
                    kind: OpKind::Merge,
                    key: parent,
                    distance: parent_distance,
                });
            }
        }
    }

    /// Apply up to `budget` completed jobs to the tree.
    fn finalize(&mut self, budget: usize) -> usize {
        let mut finalized = 0;
        while finalized < budget {
            let Some(done) = self.workers.try_recv() else {
                break;
            };
            self.apply(done);
            finalized += 1;
        }
        finalized
    }

    fn apply(&mut self, done: CompletedJob) {
        self.in_flight -= 1;
        let CompletedJob {
            kind,
            chunk,
            timing,
        } = done;
        let outcome = match kind {
            JobKind::Create => self.svo.complete_create(chunk),
            JobKind::Split { parent } => self.svo.complete_split_child(parent, chunk),
            JobKind::Merge => self.svo.complete_merge(chunk),
        };
        self.stats.record(kind, &timing, outcome);
    }

    /// Start jobs for `ops` while the in-flight limit allows. Each op is
    /// re-validated against the tree first. Returns (ops, jobs) submitted.
    fn submit(&mut self, ops: &[PendingOp]) -> (usize, usize) {
        let mut submitted_ops = 0;
        let mut submitted_jobs = 0;

        for op in ops {
            let jobs = if op.kind == OpKind::Split { 8 } else { 1 };
            if self.in_flight + jobs > self.config.max_in_flight {
                break;
            }

            let started = match op.kind {
                OpKind::Create => self.svo.begin_create(op.key),
                OpKind::Split => self.svo.begin_split(op.key),
                OpKind::Merge => self.svo.begin_merge(op.key),
            };
            if !started {
                continue;
            }

            match op.kind {
                OpKind::Create => self.dispatch(JobKind::Create, op.key),
                OpKind::Split => {
                    for child in op.key.children() {
                        self.dispatch(JobKind::Split { parent: op.key }, child);
                    }
                }
                OpKind::Merge => self.dispatch(JobKind::Merge, op.key),
            }
            submitted_ops += 1;
            submitted_jobs += jobs;
        }
        (submitted_ops, submitted_jobs)
    }

    fn dispatch(&mut self, kind: JobKind, key: ChunkKey) {
        let chunk = self.svo.alloc_leaf(key);
        match self.workers.submit(Job::new(kind, chunk, self.config.seed)) {
            Ok(()) => {
                self.in_flight += 1;
                self.stats.submitted_jobs += 1;
            }
            Err(job) => {
                log::error!("Dropping {:?} job for {}", kind, key);
                self.svo.free_chunk(job.chunk);
            }
        }
    }

    /// No jobs in flight and nothing left to do for this viewer position
    pub fn is_settled(&self, viewer: DVec3) -> bool {
        self.in_flight == 0 && self.classify(viewer).is_empty()
    }

    /// Block until every in-flight job is finalized or `timeout` passes.
    /// Returns true if nothing is left in flight.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.workers.recv_timeout(remaining) {
                Some(done) => self.apply(done),
                None => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::UniformGenerator;
    use crate::streaming::lod::LodConfig;
    use crate::voxel::voxel::Voxel;

    fn config() -> StreamingConfig {
        StreamingConfig {
            root_scale: 9,
            chunk_depth: 3,
            min_chunk_scale: 4,
            max_chunk_scale: 6,
            lod: LodConfig {
                start: 0.0,
                unit: 32.0,
            },
            load_radius: 100.0,
            root_hysteresis: 16.0,
            ops_per_tick: 64,
            finalize_per_tick: 64,
            max_in_flight: 256,
            worker_threads: Some(2),
            max_chunks: 2048,
            max_nodes_per_chunk: 4096,
            ..Default::default()
        }
    }

    fn pipeline(config: StreamingConfig) -> StreamingPipeline {
        StreamingPipeline::new(config, Arc::new(UniformGenerator(Voxel(1)))).unwrap()
    }

    /// Tick until nothing is left to do, failing after ~10s
    fn settle(pipeline: &mut StreamingPipeline, viewer: DVec3) {
        for _ in 0..2000 {
            pipeline.tick(viewer);
            if pipeline.is_settled(viewer) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("pipeline did not settle at {}", viewer);
    }

    fn assert_lod_consistent(pipeline: &StreamingPipeline, viewer: DVec3) {
        let config = pipeline.config();
        for chunk in pipeline.svo().chunks() {
            let key = chunk.key();
            let desired = desired_chunk_scale(
                key.center().distance(viewer),
                &config.lod,
                config.min_chunk_scale,
                config.max_chunk_scale,
            );
            assert!(desired >= key.scale, "chunk {} wants scale {}", key, desired);
        }
    }

    #[test]
    fn test_classify_sorted_and_truncated() {
        let pipeline = pipeline(StreamingConfig {
            ops_per_tick: 4,
            ..config()
        });
        let ops = pipeline.classify(DVec3::new(10.0, 10.0, 10.0));
        assert_eq!(ops.len(), 4);
        assert!(ops.iter().all(|op| op.kind == OpKind::Create && op.key.scale == 6));
        assert!(ops.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert_eq!(ops[0].key, ChunkKey::new(IVec3::ZERO, 6));
    }

    #[test]
    fn test_streams_in_around_viewer() {
        let mut pipeline = pipeline(config());
        let viewer = DVec3::new(1.0, 1.0, 1.0);
        settle(&mut pipeline, viewer);

        let svo = pipeline.svo();
        assert_eq!(svo.read(IVec3::ZERO), Voxel(1));
        assert_eq!(svo.chunk_at(IVec3::ZERO).map(|c| c.scale()), Some(4));
        assert_eq!(svo.read(IVec3::new(-40, 20, -60)), Voxel(1));
        assert_eq!(svo.read(IVec3::new(250, 0, 0)), Voxel::UNLOADED);
        assert_lod_consistent(&pipeline, viewer);

        let stats = pipeline.stats();
        assert_eq!(stats.creates, 8);
        assert!(stats.splits > 0);
        assert_eq!(stats.finalized_jobs, stats.submitted_jobs);
        assert_eq!(svo.stats().pending_splits, 0);
    }

    #[test]
    fn test_split_never_exposes_holes() {
        let generator = |key: ChunkKey, resolution: u8, _seed: u32| {
            std::thread::sleep(Duration::from_millis(1));
            let side = 1usize << resolution;
            vec![Voxel(key.scale as u16); side * side * side]
        };
        let mut pipeline = StreamingPipeline::new(config(), Arc::new(generator)).unwrap();
        let viewer = DVec3::new(1.0, 1.0, 1.0);

        let mut samples = Vec::new();
        for z in (-60..60).step_by(13) {
            for y in (-60..60).step_by(13) {
                for x in (-60..60).step_by(13) {
                    samples.push(IVec3::new(x, y, z));
                }
            }
        }
        let mut loaded = vec![false; samples.len()];

        for _ in 0..2000 {
            pipeline.tick(viewer);
            for (i, &p) in samples.iter().enumerate() {
                let value = pipeline.svo().read(p);
                if loaded[i] {
                    assert_ne!(value, Voxel::UNLOADED, "{} went unloaded mid-split", p);
                }
                loaded[i] |= value != Voxel::UNLOADED;
            }
            if pipeline.is_settled(viewer) {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(pipeline.is_settled(viewer));
        assert!(loaded.iter().all(|&l| l));
        // Near the viewer the finest chunks won
        assert_eq!(pipeline.svo().read(IVec3::ZERO), Voxel(4));
    }

    #[test]
    fn test_merges_when_viewer_leaves() {
        let mut pipeline = pipeline(config());
        settle(&mut pipeline, DVec3::splat(1.0));
        let fine = pipeline.svo().chunk_at(IVec3::ZERO).map(|c| c.scale());
        assert_eq!(fine, Some(4));

        let viewer = DVec3::new(120.0, 1.0, 1.0);
        settle(&mut pipeline, viewer);
        assert!(pipeline.stats().merges > 0);
        assert!(pipeline.svo().chunk_at(IVec3::ZERO).map(|c| c.scale()) > fine);
        assert_lod_consistent(&pipeline, viewer);
    }

    #[test]
    fn test_root_follows_viewer() {
        let mut pipeline = pipeline(config());
        settle(&mut pipeline, DVec3::splat(1.0));

        let viewer = DVec3::new(300.0, 1.0, 1.0);
        let report = pipeline.tick(viewer);
        assert_eq!(report.root_shift, Some(IVec3::new(1, 0, 0)));
        assert_eq!(pipeline.svo().root().position(), IVec3::new(0, -256, -256));
        assert_eq!(pipeline.svo().read(IVec3::new(-10, 0, 0)), Voxel::UNLOADED);

        settle(&mut pipeline, viewer);
        assert_eq!(pipeline.svo().read(IVec3::new(300, 0, 0)), Voxel(1));
        assert_eq!(pipeline.stats().root_moves, 1);
    }

    #[test]
    fn test_root_nodes_bounded_while_viewer_moves() {
        use crate::voxel::svo::INLINE_NODES;

        let mut pipeline = pipeline(config());
        let mut viewer = DVec3::new(1.0, 1.0, 1.0);
        let mut seed = 0x2545_f491_u32;
        let mut step = || {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            if seed >> 31 == 0 { 100.0 } else { -100.0 }
        };

        for tick in 0..3000 {
            if tick % 7 == 0 {
                viewer.x += step();
                viewer.z += step();
            }
            pipeline.tick(viewer);

            let root = pipeline.svo().root();
            assert!(
                root.node_count() <= 2 * root.live_nodes() + INLINE_NODES as u32,
                "tick {}: {} root nodes, {} live",
                tick,
                root.node_count(),
                root.live_nodes()
            );
            assert!(root.node_count() < 1024, "tick {}: root grew to {}", tick, root.node_count());
        }

        assert!(pipeline.wait_idle(Duration::from_secs(10)));
        assert!(pipeline.stats().root_moves > 0);
        let root = pipeline.svo().root();
        assert!(root.node_count() <= 2 * root.live_nodes() + INLINE_NODES as u32);
    }

    #[test]
    fn test_in_flight_limit() {
        let mut pipeline = pipeline(StreamingConfig {
            max_in_flight: 3,
            ..config()
        });
        let report = pipeline.tick(DVec3::splat(1.0));
        assert_eq!(report.submitted_jobs, 3);
        assert!(pipeline.in_flight() <= 3);
        assert!(pipeline.wait_idle(Duration::from_secs(10)));
        assert_eq!(pipeline.svo().resident_count(), 3);
    }
}
