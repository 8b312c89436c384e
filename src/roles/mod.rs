//! # Role State Machines
//!
//! Every worker thread runs exactly one role over one connection (or one
//! listening socket, for the acceptor).
//!
//! ## Key Components
//!
//! - **Sender**: Writes request frames; asks for a reply on every Nth one
//! - **Receiver**: Reads the replies to a paired Sender on the same connection
//! - **Replier**: Answers requests on an accepted connection
//! - **Acceptor**: Accepts connections and starts one detached Replier each
//! - **SyncWorker**: Strict request/reply after a common start barrier
//!
//! ## Shared Behaviour
//!
//! Each worker owns a [`WorkerContext`] with its sequence counters, anomaly
//! counts and samples, and turns it into a [`WorkerReport`] when it exits.
//! Ordering and timestamp anomalies are logged and counted but never stop a
//! worker; I/O errors, protocol violations and correlation failures end it.

use crate::clock;
use crate::config::TestConfig;
use crate::coordination::CancelToken;
use crate::metrics::Sample;
use crate::wire::{Frame, WireError, HEADER_SIZE};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub mod acceptor;
pub mod receiver;
pub mod replier;
pub mod sender;
pub mod synchronized;

pub use acceptor::Acceptor;
pub use receiver::Receiver;
pub use replier::{Replier, Tally};
pub use sender::Sender;
pub use synchronized::SyncWorker;

/// A unit of work that runs to completion on its own thread.
pub trait Worker: Send + 'static {
    fn kind(&self) -> WorkerKind;

    fn id(&self) -> usize;

    /// Run until done, the peer closes, a fatal error, or cancellation.
    fn run(self) -> WorkerReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Sender,
    Receiver,
    Replier,
    Acceptor,
    Synchronized,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerKind::Sender => "sender",
            WorkerKind::Receiver => "receiver",
            WorkerKind::Replier => "replier",
            WorkerKind::Acceptor => "acceptor",
            WorkerKind::Synchronized => "sync",
        };
        write!(f, "{}", name)
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Finished the configured number of exchanges.
    Completed,
    /// The peer closed the connection on a frame boundary.
    PeerClosed,
    Cancelled,
    Failed(String),
}

impl WorkerStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, WorkerStatus::Failed(_))
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Completed => write!(f, "completed"),
            WorkerStatus::PeerClosed => write!(f, "peer closed"),
            WorkerStatus::Cancelled => write!(f, "cancelled"),
            WorkerStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Non-fatal ordering and timing anomalies seen by one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnomalyCounts {
    /// Frames whose seqno was not the expected next value.
    pub sequence: u64,
    /// Frames whose ts1 was older than the previous frame's.
    pub ts_backwards: u64,
    /// Replies with ts3 < ts2.
    pub negative_server_time: u64,
}

impl AnomalyCounts {
    pub fn total(&self) -> u64 {
        self.sequence + self.ts_backwards + self.negative_server_time
    }

    pub fn merge(&mut self, other: &AnomalyCounts) {
        self.sequence += other.sequence;
        self.ts_backwards += other.ts_backwards;
        self.negative_server_time += other.negative_server_time;
    }
}

/// Everything a worker hands back to the orchestrator when joined.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub id: usize,
    pub kind: WorkerKind,
    pub status: WorkerStatus,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Connections accepted (acceptor only).
    pub connections: u64,
    pub anomalies: AnomalyCounts,
    #[serde(skip)]
    pub samples: Vec<Sample>,
}

impl WorkerReport {
    pub fn new(id: usize, kind: WorkerKind) -> Self {
        Self {
            id,
            kind,
            status: WorkerStatus::Completed,
            frames_sent: 0,
            frames_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            connections: 0,
            anomalies: AnomalyCounts::default(),
            samples: Vec::new(),
        }
    }

    /// Report for a worker that never produced one of its own.
    pub fn failed(id: usize, kind: WorkerKind, reason: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Failed(reason.into()),
            ..Self::new(id, kind)
        }
    }

    /// Replies this worker received and measured.
    pub fn replies(&self) -> u64 {
        match self.kind {
            WorkerKind::Receiver | WorkerKind::Synchronized => self.frames_received,
            _ => 0,
        }
    }
}

/// Per-worker protocol state: sequence counters, the last `ts1` seen, and the
/// report under construction.
pub struct WorkerContext {
    pub id: usize,
    pub config: Arc<TestConfig>,
    pub cancel: CancelToken,
    send_seq: u64,
    recv_seq: u64,
    last_ts1: u64,
    report: WorkerReport,
}

impl WorkerContext {
    pub fn new(id: usize, kind: WorkerKind, config: Arc<TestConfig>, cancel: CancelToken) -> Self {
        Self {
            id,
            config,
            cancel,
            send_seq: 0,
            recv_seq: 0,
            last_ts1: 0,
            report: WorkerReport::new(id, kind),
        }
    }

    /// Fresh context sharing this one's configuration and cancel token.
    pub fn spawn_child(&self, id: usize, kind: WorkerKind) -> Self {
        Self::new(id, kind, self.config.clone(), self.cancel.clone())
    }

    pub fn kind(&self) -> WorkerKind {
        self.report.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn next_send_seq(&mut self) -> u64 {
        let seq = self.send_seq;
        self.send_seq += 1;
        seq
    }

    /// Compare an inbound seqno against the expected next value. The expected
    /// value advances either way, so a drop or duplicate keeps reporting.
    pub fn check_seqno(&mut self, seqno: u64) {
        let expected = self.recv_seq;
        self.recv_seq += 1;
        if seqno != expected {
            self.report.anomalies.sequence += 1;
            warn!(
                worker = self.id,
                role = %self.kind(),
                expected,
                actual = seqno,
                "seqno out of order"
            );
        }
    }

    pub fn check_ts1(&mut self, ts1: u64) {
        if ts1 < self.last_ts1 {
            self.report.anomalies.ts_backwards += 1;
            warn!(
                worker = self.id,
                role = %self.kind(),
                previous = self.last_ts1,
                actual = ts1,
                "ts1 went backwards"
            );
        }
        self.last_ts1 = ts1;
    }

    pub fn check_server_time(&mut self, frame: &Frame) {
        if frame.responder_time().is_none() {
            self.report.anomalies.negative_server_time += 1;
            warn!(
                worker = self.id,
                role = %self.kind(),
                ts2 = frame.ts2,
                ts3 = frame.ts3,
                "reply ts3 precedes ts2"
            );
        }
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.report.frames_sent += 1;
        self.report.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.report.frames_received += 1;
        self.report.bytes_received += bytes as u64;
    }

    pub fn record_connection(&mut self) {
        self.report.connections += 1;
    }

    pub fn record_sample(&mut self, sample: Sample) {
        self.report.samples.push(sample);
    }

    pub fn report(&self) -> &WorkerReport {
        &self.report
    }

    pub(crate) fn report_mut(&mut self) -> &mut WorkerReport {
        &mut self.report
    }

    /// Close out the report with the worker's outcome, logging fatal errors.
    pub fn finish(self, outcome: Result<WorkerStatus, WireError>) -> WorkerReport {
        let mut report = self.report;
        report.status = match outcome {
            Ok(status) => {
                debug!(
                    worker = report.id,
                    role = %report.kind,
                    sent = report.frames_sent,
                    received = report.frames_received,
                    "worker {}",
                    status
                );
                status
            }
            Err(WireError::Cancelled) => {
                debug!(worker = report.id, role = %report.kind, "worker cancelled");
                WorkerStatus::Cancelled
            }
            Err(e) => {
                error!(worker = report.id, role = %report.kind, "worker failed: {}", e);
                WorkerStatus::Failed(e.to_string())
            }
        };
        report
    }
}

/// Shapes request frames for the originating roles.
pub struct RequestBuilder {
    rng: StdRng,
    buf: Vec<u8>,
    index: u64,
}

impl RequestBuilder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            buf: vec![0u8; max_message_size.max(HEADER_SIZE)],
            index: 0,
        }
    }

    /// Shape the next request and return it with the send delay to apply
    /// before writing it. `ts1` is stamped last.
    pub fn next_request(&mut self, ctx: &mut WorkerContext, reply_interval: u32) -> (Frame, u32) {
        let config = &ctx.config;
        let send_size = config.send_size.sample(&mut self.rng);
        let reply_size = config.reply_size.sample(&mut self.rng);
        let send_delay = config.send_delay.sample(&mut self.rng);
        let reply_delay = config.reply_delay.sample(&mut self.rng);

        let wants_reply = reply_interval > 0 && self.index % u64::from(reply_interval) == 0;
        self.index += 1;

        let mut frame = Frame {
            send_size,
            reply_size: if wants_reply { reply_size } else { 0 },
            reply_delay: if wants_reply { reply_delay } else { 0 },
            ..Frame::default()
        };
        frame.seqno = ctx.next_send_seq();
        frame.ts1 = clock::now();
        (frame, send_delay)
    }

    /// Wire image of `frame`: the header followed by zero padding up to
    /// `send_size`.
    pub fn encode(&mut self, frame: &Frame) -> &[u8] {
        let len = (frame.send_size as usize).clamp(HEADER_SIZE, self.buf.len());
        frame.encode_into(&mut self.buf);
        &self.buf[..len]
    }
}
