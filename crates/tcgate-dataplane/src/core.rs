//! Worker Engine
//!
//! Run-to-completion packet processing on a fixed pool of threads sharing one
//! [`Dataplane`]. Each worker owns a bounded queue and jobs are sharded by
//! flow hash, so packets of one flow are processed in submission order. Every
//! job comes back on the result channel with its (possibly rewritten) frame
//! and decision.
//!
//! A NAT reply carries the post-NAT tuple and may hash to a different worker
//! than the packets that opened the flow. Frames that are not IPv4 or do not
//! parse all go to worker 0.
//!
//! ```text
//!  submit ─ flow hash ─┬─► [jobs 0] ──► tcgate-worker-0 ──┐
//!                      └─► [jobs N] ──► tcgate-worker-N ──┴──► [results] ──► caller
//! ```

use bytes::BytesMut;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tcgate_common::{AttachPoint, SkbMeta};

use crate::decision::Decision;
use crate::packet::{self, ParseOutcome};
use crate::pipeline::Dataplane;
use crate::stats::DataplaneStatsSnapshot;
use crate::DEFAULT_QUEUE_DEPTH;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker threads
    pub num_workers: usize,
    /// Capacity of each worker's job queue
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Get number of CPUs (simplified)
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// One frame to classify
#[derive(Debug)]
pub struct PacketJob {
    /// Caller-chosen correlation id
    pub id: u64,
    /// Ethernet frame
    pub frame: BytesMut,
    /// Ingress metadata
    pub meta: SkbMeta,
    /// Hook the frame was seen on
    pub attach: AttachPoint,
}

/// A processed job
#[derive(Debug)]
pub struct PacketResult {
    /// Id of the job
    pub id: u64,
    /// Frame after any in-place rewrite
    pub frame: BytesMut,
    /// Metadata after marking
    pub meta: SkbMeta,
    /// Verdict for the frame
    pub decision: Decision,
}

/// Multi-threaded front end over a shared [`Dataplane`]
pub struct Engine {
    config: EngineConfig,
    dataplane: Arc<Dataplane>,
    running: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
    /// One queue per worker, empty while stopped
    jobs: Vec<Sender<PacketJob>>,
    results_tx: Sender<PacketResult>,
    results_rx: Receiver<PacketResult>,
}

/// Per-worker handle
struct WorkerHandle {
    thread: Option<thread::JoinHandle<()>>,
    worker_id: usize,
}

impl Engine {
    /// Create a stopped engine
    pub fn new(config: EngineConfig, dataplane: Arc<Dataplane>) -> Self {
        let (results_tx, results_rx) = unbounded();
        Self {
            config,
            dataplane,
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            jobs: Vec::new(),
            results_tx,
            results_rx,
        }
    }

    /// Spawn the workers
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyRunning);
        }
        if self.config.num_workers == 0 || self.config.queue_depth == 0 {
            return Err(EngineError::ConfigError(
                "num_workers and queue_depth must be non-zero".to_string(),
            ));
        }

        self.running.store(true, Ordering::Release);

        let mut queues = Vec::with_capacity(self.config.num_workers);
        for worker_id in 0..self.config.num_workers {
            let (jobs_tx, jobs_rx) = bounded(self.config.queue_depth);
            queues.push(jobs_tx);
            let worker = Worker {
                worker_id,
                dataplane: self.dataplane.clone(),
                jobs: jobs_rx,
                results: self.results_tx.clone(),
            };

            let spawned = thread::Builder::new()
                .name(format!("tcgate-worker-{}", worker_id))
                .spawn(move || worker.run());

            match spawned {
                Ok(handle) => self.workers.push(WorkerHandle {
                    thread: Some(handle),
                    worker_id,
                }),
                Err(e) => {
                    drop(queues);
                    self.stop();
                    return Err(EngineError::SpawnFailed(e.to_string()));
                }
            }
        }

        self.jobs = queues;
        tracing::info!(
            workers = self.config.num_workers,
            queue_depth = self.config.queue_depth,
            "engine started"
        );
        Ok(())
    }

    /// Close the queues, let workers drain them and join them
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.jobs.clear();

        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                if handle.join().is_err() {
                    tracing::error!(worker = worker.worker_id, "worker panicked");
                }
            }
        }

        if !self.workers.is_empty() {
            self.workers.clear();
            tracing::info!("engine stopped");
        }
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue a job on its flow's worker, blocking while that queue is full
    pub fn submit(&self, job: PacketJob) -> Result<(), EngineError> {
        let jobs = self.queue_for(&job)?;
        jobs.send(job).map_err(|_| EngineError::Disconnected)
    }

    /// Queue a job without blocking
    pub fn try_submit(&self, job: PacketJob) -> Result<(), EngineError> {
        let jobs = self.queue_for(&job)?;
        jobs.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => EngineError::QueueFull,
            TrySendError::Disconnected(_) => EngineError::Disconnected,
        })
    }

    fn queue_for(&self, job: &PacketJob) -> Result<&Sender<PacketJob>, EngineError> {
        if self.jobs.is_empty() {
            return Err(EngineError::NotRunning);
        }
        let shard = shard_of(&job.frame, self.jobs.len());
        self.jobs.get(shard).ok_or(EngineError::Disconnected)
    }

    /// Processed jobs, in completion order
    pub fn results(&self) -> &Receiver<PacketResult> {
        &self.results_rx
    }

    /// Shared dataplane
    pub fn dataplane(&self) -> &Arc<Dataplane> {
        &self.dataplane
    }

    /// Get dataplane stats
    pub fn stats(&self) -> DataplaneStatsSnapshot {
        self.dataplane.stats().snapshot()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker index for a frame: both directions of a flow map to the same one
fn shard_of(frame: &[u8], workers: usize) -> usize {
    match packet::parse(frame) {
        Ok(ParseOutcome::Ipv4(pkt)) => (pkt.tuple.flow_hash() % workers as u64) as usize,
        _ => 0,
    }
}

/// Worker thread state
struct Worker {
    worker_id: usize,
    dataplane: Arc<Dataplane>,
    jobs: Receiver<PacketJob>,
    results: Sender<PacketResult>,
}

impl Worker {
    /// Main worker loop; ends once the queue is closed and empty
    fn run(self) {
        tracing::debug!(worker = self.worker_id, "worker starting");

        for mut job in self.jobs.iter() {
            let decision = self.dataplane.process(&mut job.frame, &mut job.meta, job.attach);
            let result = PacketResult {
                id: job.id,
                frame: job.frame,
                meta: job.meta,
                decision,
            };
            if self.results.send(result).is_err() {
                break;
            }
        }

        tracing::debug!(worker = self.worker_id, "worker stopped");
    }
}

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `start` called twice
    #[error("engine already running")]
    AlreadyRunning,

    /// `start` has not been called, or the engine was stopped
    #[error("engine not running")]
    NotRunning,

    /// A worker thread could not be spawned
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// Invalid [`EngineConfig`]
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// `try_submit` found the worker's queue full
    #[error("job queue full")]
    QueueFull,

    /// The worker behind the queue is gone
    #[error("job queue disconnected")]
    Disconnected,
}
