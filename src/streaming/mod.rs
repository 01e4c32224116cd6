//! LOD streaming: decides which chunks should exist around a viewer and
//! builds them on worker threads.

pub mod lod;
pub mod job;
pub mod worker;
pub mod stats;
pub mod pipeline;

pub use lod::{LodConfig, desired_chunk_scale, lod_from_distance};
pub use job::{CompletedJob, Job, JobKind, JobTiming};
pub use worker::WorkerPool;
pub use stats::StreamingStats;
pub use pipeline::{OpKind, PendingOp, StreamingPipeline, TickReport};
