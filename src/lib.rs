//! # seqtest Library
//!
//! A TCP sequencing and latency stress tester. It drives framed traffic
//! through a TCP path (typically a proxy or middlebox), verifies that byte
//! ordering and message boundaries survive transit, and measures round-trip
//! latency under configurable load shapes.
//!
//! ## Roles
//!
//! - **Pair**: Each worker connection runs a sender thread and a receiver
//!   thread; the sender asks for a reply on every Nth request
//! - **Replier**: Listens and answers requests, one thread per connection
//! - **Sync**: Strict request/reply per connection, with every worker released
//!   at the same instant through a start barrier
//!
//! ## Architecture Overview
//!
//! - `clock`: Monotonic nanosecond clock and the hybrid sleep/spin delay
//! - `wire`: Frame codec, stream reassembler and connection plumbing
//! - `roles`: The worker state machines
//! - `coordination`: Cancellation token and start barrier
//! - `runner`: Spawns, releases and joins workers
//! - `metrics`: Latency statistics and percentiles
//! - `results`: Run report, console summary and sample dump
//! - `cli` / `config`: Command line and the validated run configuration
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use seqtest::{Endpoint, Role, SizeRange, TestConfig, TestRunner};
//!
//! fn main() -> anyhow::Result<()> {
//!     let endpoints = Endpoint::resolve("127.0.0.1:7000")?;
//!     let config = TestConfig::new(Role::Sync, endpoints)
//!         .with_threads(4)
//!         .with_count(10_000)
//!         .with_send_size(SizeRange::fixed(64))
//!         .with_reply_size(SizeRange::fixed(64));
//!
//!     let outcome = TestRunner::new(config).run()?;
//!     println!("{} replies", outcome.replies());
//!     Ok(())
//! }
//! ```
//!
//! ## Threading Model
//!
//! One OS thread per worker, blocking I/O, no event loop in the engine.
//! Workers share only the read-only configuration, the cancellation token and
//! (for synchronized runs) the start barrier. Samples are handed back when
//! the worker is joined.

/// Command-line interface
///
/// Argument parsing with clap, including the role selector and the
/// `--x` / `--x-min` / `--x-max` range options.
pub mod cli;

/// Monotonic clock and delay primitive
pub mod clock;

/// Validated, shared run configuration
///
/// Holds the resolved endpoints and the normalized size and delay ranges
/// every worker samples from.
pub mod config;

pub mod coordination;

pub mod logging;

/// Latency statistics
///
/// Sorting, mean, population variance, interpolated percentiles, and
/// human-readable formatting.
pub mod metrics;

/// Run report and output
///
/// JSON report with system metadata, the console summary, and the
/// per-sample dump file.
pub mod results;

pub mod roles;

/// Worker orchestration
pub mod runner;

pub mod utils;

/// Wire protocol
pub mod wire;

pub use cli::{Args, Role};
pub use config::{DelayRange, Endpoint, SizeRange, SocketOptions, TestConfig};
pub use coordination::{CancelToken, StartBarrier};
pub use metrics::{LatencySummary, Sample};
pub use results::RunReport;
pub use roles::{WorkerKind, WorkerReport, WorkerStatus};
pub use runner::{RunOutcome, TestRunner};
pub use wire::{Frame, WireError, HEADER_SIZE};

/// The current version of seqtest, recorded in every report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Largest frame either side accepts, in bytes.
    pub const MAX_MESSAGE_SIZE: usize = 8000;

    /// Every request asks for a reply.
    pub const REPLY_INTERVAL: u32 = 1;

    pub const THREADS: usize = 1;

    /// Requests per worker; 0 runs until interrupted.
    pub const COUNT: u64 = 0;

    pub const LISTEN_BACKLOG: i32 = 128;

    /// Socket read/write timeout. Blocked workers re-check cancellation
    /// this often.
    pub const IO_POLL_INTERVAL: Duration = Duration::from_millis(250);

    /// Sleep between polls of a non-blocking listener.
    pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
}
