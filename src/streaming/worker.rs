//! Worker pool for chunk generation.
//!
//! A dedicated rayon pool hosts one long-running loop per thread. Each loop
//! blocks on the job channel, runs the job and sends the result back. The
//! main thread never blocks: it submits with an unbounded send and polls
//! results with `try_recv`.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};

use super::job::{CompletedJob, Job, execute};
use crate::core::error::{Error, Result};
use crate::generation::VoxelGenerator;

/// Niceness applied to worker threads
#[cfg(target_os = "linux")]
const WORKER_NICE: libc::c_int = 10;

/// Fixed set of generation workers.
pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    results: Receiver<CompletedJob>,
    threads: usize,
    _pool: rayon::ThreadPool,
}

impl WorkerPool {
    /// Start `threads` workers running jobs against `generator`.
    pub fn new(threads: usize, generator: Arc<dyn VoxelGenerator>) -> Result<Self> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("svo-worker-{}", i))
            .start_handler(|_| lower_thread_priority())
            .build()
            .map_err(|e| Error::WorkerPool(e.to_string()))?;

        let (job_tx, job_rx) = unbounded::<Job>();
        let (result_tx, result_rx) = unbounded::<CompletedJob>();

        for _ in 0..threads {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let generator = generator.clone();
            pool.spawn(move || worker_loop(jobs, results, generator));
        }

        log::info!("Started {} streaming workers", threads);

        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            threads,
            _pool: pool,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Queue a job. Never blocks. If the workers are gone the job is handed
    /// back so its chunk can be freed.
    pub fn submit(&self, job: Job) -> std::result::Result<(), Job> {
        let Some(jobs) = &self.jobs else {
            return Err(job);
        };
        jobs.send(job).map_err(|e| {
            log::error!("Streaming workers have shut down");
            e.into_inner()
        })
    }

    /// Take one finished job if any is ready
    pub fn try_recv(&self) -> Option<CompletedJob> {
        match self.results.try_recv() {
            Ok(done) => Some(done),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                log::error!("Streaming workers disconnected");
                None
            }
        }
    }

    /// Wait up to `timeout` for a finished job
    pub fn recv_timeout(&self, timeout: Duration) -> Option<CompletedJob> {
        self.results.recv_timeout(timeout).ok()
    }

    /// Jobs waiting for a free worker
    pub fn queued(&self) -> usize {
        self.jobs.as_ref().map_or(0, Sender::len)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the job channel ends every worker loop
        self.jobs.take();
    }
}

fn worker_loop(jobs: Receiver<Job>, results: Sender<CompletedJob>, generator: Arc<dyn VoxelGenerator>) {
    while let Ok(job) = jobs.recv() {
        let done = execute(job, generator.as_ref());
        if results.send(done).is_err() {
            break;
        }
    }
    log::trace!("Streaming worker exiting");
}

#[cfg(target_os = "linux")]
fn lower_thread_priority() {
    // On Linux, PRIO_PROCESS with who = 0 applies to the calling thread only
    // SAFETY: setpriority has no memory-safety preconditions.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, WORKER_NICE) };
    if rc != 0 {
        log::debug!(
            "Could not lower worker priority: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn lower_thread_priority() {}
