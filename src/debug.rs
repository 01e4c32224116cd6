//! Engine side of the debug server: value snapshots of the streaming state.
//!
//! The engine thread builds a [`DiagnosticsSnapshot`] and hands it to a
//! [`DebugPublisher`]; the TCP server answers queries from the last
//! published snapshot and never touches the tree itself.

use std::sync::Arc;

use svostream_debug::protocol::{
    ChunkSnapshot, DiagnosticsSnapshot, PoolSnapshot, StreamingSnapshot, TreeSnapshot,
};
use svostream_debug::{DebugHandler, SnapshotHandler};
use tokio::sync::Mutex;

use crate::streaming::StreamingPipeline;
use crate::voxel::svo::Chunk;

/// Capture the pipeline's current state
pub fn snapshot(pipeline: &StreamingPipeline) -> DiagnosticsSnapshot {
    let svo = pipeline.svo();
    let tree = svo.stats();
    let stats = pipeline.stats();

    DiagnosticsSnapshot {
        tick: stats.ticks,
        pool: PoolSnapshot {
            capacity: tree.pool.capacity,
            live: tree.pool.live,
            committed_header_pages: tree.pool.committed_header_pages,
            committed_node_pages: tree.pool.committed_node_pages,
        },
        tree: TreeSnapshot {
            root_position: tree.root_position.to_array(),
            root_scale: tree.root_scale,
            resident_chunks: tree.resident_chunks as u32,
            root_nodes: tree.root_nodes,
            total_nodes: tree.total_nodes,
            dead_nodes: tree.dead_nodes,
        },
        streaming: StreamingSnapshot {
            in_flight: pipeline.in_flight() as u32,
            pending_creates: tree.pending_creates as u32,
            pending_splits: tree.pending_splits as u32,
            pending_merges: tree.pending_merges as u32,
            submitted: stats.submitted_jobs,
            finalized: stats.finalized_jobs,
            discarded: stats.discarded_jobs,
            creates: stats.creates,
            splits: stats.splits,
            merges: stats.merges,
            avg_job_ms: stats.avg_job_ms(),
        },
        chunks: svo.chunks().map(chunk_snapshot).collect(),
    }
}

fn chunk_snapshot(chunk: &Chunk) -> ChunkSnapshot {
    ChunkSnapshot {
        position: chunk.position().to_array(),
        scale: chunk.scale(),
        node_count: chunk.node_count(),
        committed_nodes: chunk.committed_nodes(),
        dead_nodes: chunk.dead_nodes(),
        spilled: chunk.is_spilled(),
        dirty: chunk.is_dirty(),
    }
}

/// Shares snapshots with a running debug server.
#[derive(Clone, Default)]
pub struct DebugPublisher {
    handler: Arc<Mutex<SnapshotHandler>>,
}

impl DebugPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler to pass to [`svostream_debug::DebugServer::bind`]
    pub fn handler(&self) -> Arc<Mutex<dyn DebugHandler>> {
        self.handler.clone()
    }

    /// Replace the published snapshot. Never blocks: if a client request
    /// holds the handler, this snapshot is skipped and the next one lands.
    pub fn publish(&self, snapshot: DiagnosticsSnapshot) -> bool {
        match self.handler.try_lock() {
            Ok(mut handler) => {
                handler.publish(snapshot);
                true
            }
            Err(_) => {
                log::trace!("Debug handler busy, snapshot skipped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StreamingConfig;
    use crate::generation::UniformGenerator;
    use crate::voxel::voxel::Voxel;
    use glam::DVec3;
    use std::time::Duration;
    use svostream_debug::protocol::{DebugCommand, DebugResponse, ResponseData};

    fn config() -> StreamingConfig {
        StreamingConfig {
            root_scale: 9,
            chunk_depth: 3,
            min_chunk_scale: 4,
            max_chunk_scale: 6,
            load_radius: 60.0,
            worker_threads: Some(1),
            max_chunks: 512,
            max_nodes_per_chunk: 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_snapshot_reflects_pipeline() {
        let mut pipeline =
            StreamingPipeline::new(config(), Arc::new(UniformGenerator(Voxel(1)))).unwrap();
        pipeline.tick(DVec3::ZERO);
        assert!(pipeline.wait_idle(Duration::from_secs(10)));
        pipeline.tick(DVec3::ZERO);

        let snap = snapshot(&pipeline);
        assert_eq!(snap.tick, 2);
        assert_eq!(snap.tree.root_position, [-256, -256, -256]);
        assert_eq!(snap.tree.resident_chunks as usize, snap.chunks.len());
        assert_eq!(snap.pool.live as usize, snap.chunks.len() + 1 + snap.streaming.in_flight as usize);
        assert!(snap.streaming.creates > 0);
        assert!(snap.chunks.iter().all(|c| c.node_count >= 1));
    }

    #[test]
    fn test_publisher_feeds_handler() {
        let publisher = DebugPublisher::new();
        let snap = DiagnosticsSnapshot {
            tick: 42,
            ..Default::default()
        };
        assert!(publisher.publish(snap));

        let handler = publisher.handler();
        let response = handler.blocking_lock().handle_command(DebugCommand::GetStats);
        match response {
            DebugResponse::Ok {
                data: ResponseData::Stats { tick, .. },
            } => assert_eq!(tick, 42),
            other => panic!("unexpected response {:?}", other),
        }
    }
}
