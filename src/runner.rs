//! # Test Orchestration Module
//!
//! Turns a [`TestConfig`] into running workers, waits for them, and hands
//! back everything they measured.
//!
//! ## Execution Flow
//!
//! 1. **Setup**: Calibrate the delay primitive, then open every connection
//!    (or listening socket) up front. A failure here aborts the run before
//!    any traffic is generated.
//! 2. **Spawn**: One OS thread per worker, optionally pinned to a CPU core.
//!    Sender/receiver pairs share their connection through split halves.
//! 3. **Release**: Synchronized workers are released together through the
//!    start barrier; the release time becomes the run's start.
//! 4. **Join**: Every worker is joined, including failed ones. A panicking
//!    worker is reported as failed instead of aborting the run.
//!
//! ## Cancellation
//!
//! The runner's [`CancelToken`] reaches every worker. Tripping it (the binary
//! does so on Ctrl-C) makes each worker stop at its next blocking boundary,
//! after which the run completes normally with partial results.

use crate::cli::Role;
use crate::clock;
use crate::config::{TestConfig, TestConfigDisplay};
use crate::coordination::{CancelToken, StartBarrier};
use crate::metrics::{LatencySummary, Sample, ThroughputMetrics};
use crate::roles::{
    Acceptor, Receiver, Sender, SyncWorker, Worker, WorkerContext, WorkerKind, WorkerReport,
};
use crate::utils::spawn_with_affinity;
use crate::wire::connection::{connect, listen};
use crate::wire::split;
use anyhow::{Context, Result};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one complete run.
#[derive(Debug)]
pub struct RunOutcome {
    pub role: Role,
    /// Clock reading the run's sample times are measured from.
    pub started_at: u64,
    /// Start barrier release time, for synchronized runs.
    pub released_at: Option<u64>,
    pub duration: Duration,
    pub workers: Vec<WorkerReport>,
}

impl RunOutcome {
    /// Total replies received across all originating workers.
    pub fn replies(&self) -> u64 {
        self.workers.iter().map(WorkerReport::replies).sum()
    }

    pub fn failures(&self) -> usize {
        self.workers.iter().filter(|w| w.status.is_failure()).count()
    }

    /// Every sample with the id of the worker that recorded it.
    pub fn samples(&self) -> impl Iterator<Item = (usize, &Sample)> + '_ {
        self.workers
            .iter()
            .flat_map(|w| w.samples.iter().map(move |s| (w.id, s)))
    }

    pub fn latency_summary(&self, percentiles: &[f64]) -> Option<LatencySummary> {
        LatencySummary::from_samples(self.samples().map(|(_, s)| s), percentiles)
    }

    /// Frames and bytes moved in both directions over the run.
    pub fn throughput(&self) -> ThroughputMetrics {
        let frames = self
            .workers
            .iter()
            .map(|w| w.frames_sent + w.frames_received)
            .sum();
        let bytes = self
            .workers
            .iter()
            .map(|w| w.bytes_sent + w.bytes_received)
            .sum();
        ThroughputMetrics::new(frames, bytes, self.duration.as_nanos() as u64)
    }
}

struct Spawned {
    id: usize,
    kind: WorkerKind,
    handle: JoinHandle<WorkerReport>,
}

/// Spawns and joins the workers for one run.
pub struct TestRunner {
    config: Arc<TestConfig>,
    cancel: CancelToken,
    next_slot: usize,
}

impl TestRunner {
    pub fn new(config: TestConfig) -> Self {
        Self {
            config: Arc::new(config),
            cancel: CancelToken::new(),
            next_slot: 0,
        }
    }

    /// Use an existing token, e.g. one already wired to a signal handler.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Execute the configured role to completion.
    ///
    /// Setup failures (resolution, bind, connect, thread spawn) are returned
    /// as errors. Worker failures are not: they show up in the outcome's
    /// reports alongside the results of the workers that succeeded.
    pub fn run(mut self) -> Result<RunOutcome> {
        info!("\n{}", TestConfigDisplay(&self.config));
        clock::calibrate();

        let role = self.config.role;
        let (started_at, released_at, workers) = match role {
            Role::Pair => self.run_pairs()?,
            Role::Sync => self.run_synchronized()?,
            Role::Replier => self.run_repliers()?,
        };
        let duration = Duration::from_nanos(clock::now().saturating_sub(started_at));

        let outcome = RunOutcome {
            role,
            started_at,
            released_at,
            duration,
            workers,
        };
        info!(
            "Run finished in {:?}: {} replies, {} failed workers",
            outcome.duration,
            outcome.replies(),
            outcome.failures()
        );
        Ok(outcome)
    }

    fn run_pairs(&mut self) -> Result<(u64, Option<u64>, Vec<WorkerReport>)> {
        let threads = self.config.worker_count();
        let started_at = clock::now();
        let mut spawned = Vec::with_capacity(threads * 2);

        for id in 0..threads {
            let setup = self.connect_worker(id).and_then(|stream| {
                let (reader, writer) =
                    split(stream).context("Failed to split connection into halves")?;
                let receiver = Receiver::new(self.context(id, WorkerKind::Receiver), reader);
                spawned.push(self.spawn(receiver)?);
                let sender = Sender::new(self.context(id, WorkerKind::Sender), writer);
                spawned.push(self.spawn(sender)?);
                Ok(())
            });
            if let Err(e) = setup {
                self.abort(spawned);
                return Err(e);
            }
        }

        Ok((started_at, None, self.join_all(spawned)))
    }

    fn run_synchronized(&mut self) -> Result<(u64, Option<u64>, Vec<WorkerReport>)> {
        let threads = self.config.worker_count();
        let mut streams = Vec::with_capacity(threads);
        for id in 0..threads {
            streams.push(self.connect_worker(id)?);
        }

        let barrier = Arc::new(StartBarrier::new(threads));
        let mut spawned = Vec::with_capacity(threads);
        for (id, stream) in streams.into_iter().enumerate() {
            let worker = SyncWorker::new(
                self.context(id, WorkerKind::Synchronized),
                stream,
                barrier.clone(),
            );
            match self.spawn(worker) {
                Ok(s) => spawned.push(s),
                Err(e) => {
                    self.abort(spawned);
                    return Err(e);
                }
            }
        }

        let released_at = barrier.release(&self.cancel);
        match released_at {
            Some(_) => info!("Released {} synchronized workers", threads),
            None => warn!("Cancelled before all synchronized workers were ready"),
        }
        let started_at = released_at.unwrap_or_else(clock::now);
        Ok((started_at, released_at, self.join_all(spawned)))
    }

    fn run_repliers(&mut self) -> Result<(u64, Option<u64>, Vec<WorkerReport>)> {
        let endpoints = self.config.endpoints.clone();
        let started_at = clock::now();
        let mut spawned = Vec::with_capacity(endpoints.len());

        for (id, endpoint) in endpoints.iter().enumerate() {
            let setup = listen(endpoint.remote, crate::defaults::LISTEN_BACKLOG).and_then(|listener| {
                let acceptor = Acceptor::new(self.context(id, WorkerKind::Acceptor), listener);
                self.spawn(acceptor)
            });
            match setup {
                Ok(s) => spawned.push(s),
                Err(e) => {
                    self.abort(spawned);
                    return Err(e);
                }
            }
        }

        Ok((started_at, None, self.join_all(spawned)))
    }

    fn connect_worker(&self, id: usize) -> Result<TcpStream> {
        let endpoint = self
            .config
            .endpoint_for(id)
            .context("No endpoint to connect to")?;
        connect(endpoint, &self.config.socket)
            .with_context(|| format!("Worker {} could not connect", id))
    }

    fn context(&self, id: usize, kind: WorkerKind) -> WorkerContext {
        WorkerContext::new(id, kind, self.config.clone(), self.cancel.clone())
    }

    fn spawn<W: Worker>(&mut self, worker: W) -> Result<Spawned> {
        let (id, kind) = (worker.id(), worker.kind());
        let core = if self.config.cpu_affinity.is_empty() {
            None
        } else {
            let cores = &self.config.cpu_affinity;
            Some(cores[self.next_slot % cores.len()])
        };
        self.next_slot += 1;

        let handle = spawn_with_affinity(format!("{}-{}", kind, id), core, move || worker.run())?;
        debug!("Spawned {} worker {} (core {:?})", kind, id, core);
        Ok(Spawned { id, kind, handle })
    }

    fn join_all(&self, spawned: Vec<Spawned>) -> Vec<WorkerReport> {
        spawned
            .into_iter()
            .map(|Spawned { id, kind, handle }| {
                handle.join().unwrap_or_else(|_| {
                    warn!("{} worker {} panicked", kind, id);
                    WorkerReport::failed(id, kind, "worker thread panicked")
                })
            })
            .collect()
    }

    /// Stop and reap workers already started when setup fails part way.
    fn abort(&self, spawned: Vec<Spawned>) {
        self.cancel.cancel();
        let reaped = self.join_all(spawned);
        debug!("Reaped {} workers after setup failure", reaped.len());
    }
}
