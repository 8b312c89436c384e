use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// seqtest - TCP sequencing and latency stress tester
///
/// Drives framed traffic through a TCP path (usually a proxy) and checks that
/// ordering and message boundaries survive, while measuring round-trip
/// latency.
#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Addresses to connect to (or listen on, for the replier), as host:port
    /// or [v6addr]:port, optionally followed by @bindhost:bindport
    #[clap(required = true, num_args = 1.., help_heading = "Core Options")]
    pub addresses: Vec<String>,

    /// Role to run
    #[clap(short = 'm', long, value_enum, default_value_t = Role::Pair, help_heading = "Core Options")]
    pub role: Role,

    /// Worker threads (0 = one per resolved address; ignored by the replier)
    #[clap(short = 't', long, default_value_t = crate::defaults::THREADS, help_heading = "Core Options")]
    pub threads: usize,

    /// Request frames per worker (0 = run until interrupted)
    #[clap(short = 'n', long, default_value_t = crate::defaults::COUNT, help_heading = "Core Options")]
    pub count: u64,

    /// Ask for a reply on every Nth request (0 = never)
    #[clap(short = 'i', long, default_value_t = crate::defaults::REPLY_INTERVAL, help_heading = "Core Options")]
    pub reply_interval: u32,

    /// Request size in bytes, header included (sets min and max)
    #[clap(short = 's', long, help_heading = "Frame Shape")]
    pub send_size: Option<u16>,

    #[clap(long, help_heading = "Frame Shape")]
    pub send_size_min: Option<u16>,

    #[clap(long, help_heading = "Frame Shape")]
    pub send_size_max: Option<u16>,

    /// Reply size in bytes, header included (sets min and max)
    #[clap(short = 'r', long, help_heading = "Frame Shape")]
    pub reply_size: Option<u16>,

    #[clap(long, help_heading = "Frame Shape")]
    pub reply_size_min: Option<u16>,

    #[clap(long, help_heading = "Frame Shape")]
    pub reply_size_max: Option<u16>,

    /// Delay in ns before each request is written (sets min and max)
    #[clap(long, help_heading = "Timing")]
    pub send_delay: Option<u32>,

    #[clap(long, help_heading = "Timing")]
    pub send_delay_min: Option<u32>,

    #[clap(long, help_heading = "Timing")]
    pub send_delay_max: Option<u32>,

    /// Delay in ns the replier waits before each reply (sets min and max)
    #[clap(long, help_heading = "Timing")]
    pub reply_delay: Option<u32>,

    #[clap(long, help_heading = "Timing")]
    pub reply_delay_min: Option<u32>,

    #[clap(long, help_heading = "Timing")]
    pub reply_delay_max: Option<u32>,

    /// Largest frame either side will accept
    #[clap(long, default_value_t = crate::defaults::MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Disable TCP_NODELAY on worker connections
    #[clap(long, default_value_t = false)]
    pub no_nodelay: bool,

    /// Pin worker threads round-robin to these CPU cores (e.g. 0,2,4)
    #[clap(long, value_delimiter = ',')]
    pub cpu_affinity: Vec<usize>,

    /// Write every latency sample to this file, one line per sample
    #[clap(short = 'd', long, help_heading = "Output")]
    pub dump_file: Option<PathBuf>,

    /// Write the run report as JSON to this file
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output")]
    pub quiet: bool,
}

/// What the process does with its addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Connect and run a sender and a receiver on each connection
    #[default]
    #[clap(name = "pair")]
    Pair,

    /// Listen and answer requests
    #[clap(name = "replier")]
    Replier,

    /// Connect and run strict request/reply exchanges released together
    #[clap(name = "sync")]
    Sync,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Pair => write!(f, "Sender/Receiver Pair"),
            Role::Replier => write!(f, "Replier"),
            Role::Sync => write!(f, "Synchronized Sender-Receiver"),
        }
    }
}

/// Combine a `--x` / `--x-min` / `--x-max` triple into `(min, max)`.
///
/// The specific bound wins over the shared value, which wins over `default`.
pub fn resolve_range<T: Copy>(single: Option<T>, min: Option<T>, max: Option<T>, default: T) -> (T, T) {
    (
        min.or(single).unwrap_or(default),
        max.or(single).unwrap_or(default),
    )
}
