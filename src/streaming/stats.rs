//! Streaming counters

use std::time::Duration;

use super::job::{JobKind, JobTiming};
use crate::voxel::svo::Finalized;

/// Running totals for the streaming pipeline
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamingStats {
    pub ticks: u64,
    pub root_moves: u64,
    pub submitted_jobs: u64,
    pub finalized_jobs: u64,
    /// Results thrown away because their target changed
    pub discarded_jobs: u64,
    /// Completed operations
    pub creates: u64,
    pub splits: u64,
    pub merges: u64,
    pub total_queue_time: Duration,
    pub total_work_time: Duration,
}

impl StreamingStats {
    /// Account for one finalized job
    pub fn record(&mut self, kind: JobKind, timing: &JobTiming, outcome: Finalized) {
        self.finalized_jobs += 1;
        self.total_queue_time += timing.queued;
        self.total_work_time += timing.work();

        match outcome {
            Finalized::Discarded => self.discarded_jobs += 1,
            Finalized::Inserted => self.creates += 1,
            Finalized::Promoted => self.splits += 1,
            Finalized::Merged => self.merges += 1,
            Finalized::Stashed { .. } => {}
        }
        if outcome == Finalized::Discarded {
            log::trace!("Discarded {:?} result", kind);
        }
    }

    /// Mean generate + build time per job in milliseconds
    pub fn avg_job_ms(&self) -> f32 {
        if self.finalized_jobs == 0 {
            return 0.0;
        }
        self.total_work_time.as_secs_f32() * 1000.0 / self.finalized_jobs as f32
    }

    /// Mean time jobs waited for a worker in milliseconds
    pub fn avg_queue_ms(&self) -> f32 {
        if self.finalized_jobs == 0 {
            return 0.0;
        }
        self.total_queue_time.as_secs_f32() * 1000.0 / self.finalized_jobs as f32
    }
}
