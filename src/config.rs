//! # Test Configuration
//!
//! The read-only record every worker is built from. It is assembled once
//! (from the command line, or directly in tests) and shared through an
//! `Arc`; workers never mutate it.
//!
//! ## Key Components
//!
//! - **TestConfig**: Role, endpoints, frame shape, timing, and output sinks
//! - **SizeRange / DelayRange**: Inclusive uniform ranges sampled per frame
//! - **Endpoint**: A resolved remote address plus optional local bind address
//! - **SocketOptions**: Per-connection socket settings
//!
//! Size ranges are normalized whenever they change: both bounds are clamped
//! into `[HEADER_SIZE, max_message_size]` and the maximum is raised to at
//! least the minimum. Delay ranges only get the second rule.

use crate::cli::{resolve_range, Args, Role};
use crate::wire::HEADER_SIZE;
use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Inclusive range of frame sizes in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeRange {
    pub min: u16,
    pub max: u16,
}

impl SizeRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn fixed(size: u16) -> Self {
        Self::new(size, size)
    }

    fn normalized(self, max_message_size: usize) -> Self {
        let ceiling = max_message_size as u16;
        let floor = HEADER_SIZE as u16;
        let min = self.min.min(ceiling).max(floor);
        let max = self.max.min(ceiling).max(min);
        Self { min, max }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u16 {
        rng.gen_range(self.min..=self.max)
    }
}

impl fmt::Display for SizeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{} bytes", self.min)
        } else {
            write!(f, "{}-{} bytes", self.min, self.max)
        }
    }
}

/// Inclusive range of delays in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DelayRange {
    pub min: u32,
    pub max: u32,
}

impl DelayRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn fixed(ns: u32) -> Self {
        Self::new(ns, ns)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        if self.max == 0 {
            return 0;
        }
        rng.gen_range(self.min..=self.max)
    }
}

impl fmt::Display for DelayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{} ns", self.min)
        } else {
            write!(f, "{}-{} ns", self.min, self.max)
        }
    }
}

/// Socket settings applied to every worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SocketOptions {
    pub nodelay: bool,
    /// Read/write timeout; each expiry is a chance to observe cancellation.
    pub io_timeout: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            io_timeout: crate::defaults::IO_POLL_INTERVAL,
        }
    }
}

/// A resolved peer address with an optional local address to bind first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
}

impl Endpoint {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            local: None,
        }
    }

    /// Resolve `host:port[@bindhost:bindport]` into one endpoint per address
    /// the resolver returns for `host`.
    ///
    /// An empty host means the wildcard address. The bind address must
    /// resolve to the same family as each remote address.
    pub fn resolve(address: &str) -> Result<Vec<Endpoint>> {
        let (remote_part, bind_part) = match address.split_once('@') {
            Some((remote, bind)) => (remote, Some(bind)),
            None => (address, None),
        };

        let remotes = resolve_host_port(remote_part)
            .with_context(|| format!("Failed to resolve address '{}'", remote_part))?;
        let binds = match bind_part {
            Some(bind) => resolve_host_port(bind)
                .with_context(|| format!("Failed to resolve bind address '{}'", bind))?,
            None => Vec::new(),
        };

        remotes
            .into_iter()
            .map(|remote| {
                let local = if bind_part.is_some() {
                    let same_family = binds.iter().find(|b| b.is_ipv4() == remote.is_ipv4());
                    match same_family {
                        Some(local) => Some(*local),
                        None => bail!(
                            "Bind address '{}' has no {} address to pair with {}",
                            bind_part.unwrap_or_default(),
                            if remote.is_ipv4() { "IPv4" } else { "IPv6" },
                            remote
                        ),
                    }
                } else {
                    None
                };
                Ok(Endpoint { remote, local })
            })
            .collect()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local {
            Some(local) => write!(f, "{}@{}", self.remote, local),
            None => write!(f, "{}", self.remote),
        }
    }
}

fn resolve_host_port(address: &str) -> Result<Vec<SocketAddr>> {
    let address = address.trim();
    let owned;
    let address = if address.starts_with(':') {
        owned = format!("0.0.0.0{}", address);
        owned.as_str()
    } else {
        address
    };
    if !address.contains(':') {
        bail!("missing port in '{}'", address);
    }

    let mut addrs: Vec<SocketAddr> = address.to_socket_addrs()?.collect();
    addrs.dedup();
    if addrs.is_empty() {
        bail!("'{}' resolved to no addresses", address);
    }
    Ok(addrs)
}

/// Everything a run needs, shared read-only by all workers.
#[derive(Debug, Clone, Serialize)]
pub struct TestConfig {
    pub role: Role,
    pub endpoints: Vec<Endpoint>,
    /// Worker count for the connecting roles.
    pub threads: usize,
    pub send_size: SizeRange,
    pub reply_size: SizeRange,
    pub send_delay: DelayRange,
    pub reply_delay: DelayRange,
    pub reply_interval: u32,
    /// Requests per worker, 0 for unbounded.
    pub count: u64,
    pub max_message_size: usize,
    pub socket: SocketOptions,
    pub cpu_affinity: Vec<usize>,
    pub dump_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
}

impl TestConfig {
    /// A configuration with default frame shape and timing.
    pub fn new(role: Role, endpoints: Vec<Endpoint>) -> Self {
        let header = HEADER_SIZE as u16;
        Self {
            role,
            endpoints,
            threads: crate::defaults::THREADS,
            send_size: SizeRange::fixed(header),
            reply_size: SizeRange::fixed(header),
            send_delay: DelayRange::default(),
            reply_delay: DelayRange::default(),
            reply_interval: crate::defaults::REPLY_INTERVAL,
            count: crate::defaults::COUNT,
            max_message_size: crate::defaults::MAX_MESSAGE_SIZE,
            socket: SocketOptions::default(),
            cpu_affinity: Vec::new(),
            dump_file: None,
            output_file: None,
        }
    }

    /// Build and validate a configuration from parsed arguments, resolving
    /// every address.
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.addresses.is_empty() {
            bail!("At least one address is required");
        }
        validate_max_message_size(args.max_message_size)?;

        let mut endpoints = Vec::new();
        for address in &args.addresses {
            endpoints.extend(Endpoint::resolve(address)?);
        }

        let header = HEADER_SIZE as u16;
        let (send_min, send_max) = resolve_range(
            args.send_size,
            args.send_size_min,
            args.send_size_max,
            header,
        );
        let (reply_min, reply_max) = resolve_range(
            args.reply_size,
            args.reply_size_min,
            args.reply_size_max,
            header,
        );
        let (sdly_min, sdly_max) =
            resolve_range(args.send_delay, args.send_delay_min, args.send_delay_max, 0);
        let (rdly_min, rdly_max) = resolve_range(
            args.reply_delay,
            args.reply_delay_min,
            args.reply_delay_max,
            0,
        );

        let threads = if args.threads == 0 {
            endpoints.len()
        } else {
            args.threads
        };

        let config = Self::new(args.role, endpoints)
            .with_threads(threads)
            .with_max_message_size(args.max_message_size)
            .with_send_size(SizeRange::new(send_min, send_max))
            .with_reply_size(SizeRange::new(reply_min, reply_max))
            .with_send_delay(DelayRange::new(sdly_min, sdly_max))
            .with_reply_delay(DelayRange::new(rdly_min, rdly_max))
            .with_reply_interval(args.reply_interval)
            .with_count(args.count)
            .with_socket_options(SocketOptions {
                nodelay: !args.no_nodelay,
                ..SocketOptions::default()
            })
            .with_cpu_affinity(args.cpu_affinity.clone())
            .with_dump_file(args.dump_file.clone())
            .with_output_file(args.output_file.clone());
        Ok(config)
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Values outside `[HEADER_SIZE, u16::MAX]` are clamped.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size.clamp(HEADER_SIZE, u16::MAX as usize);
        self.send_size = self.send_size.normalized(self.max_message_size);
        self.reply_size = self.reply_size.normalized(self.max_message_size);
        self
    }

    pub fn with_send_size(mut self, range: SizeRange) -> Self {
        self.send_size = range.normalized(self.max_message_size);
        self
    }

    pub fn with_reply_size(mut self, range: SizeRange) -> Self {
        self.reply_size = range.normalized(self.max_message_size);
        self
    }

    pub fn with_send_delay(mut self, range: DelayRange) -> Self {
        self.send_delay = DelayRange::new(range.min, range.max);
        self
    }

    pub fn with_reply_delay(mut self, range: DelayRange) -> Self {
        self.reply_delay = DelayRange::new(range.min, range.max);
        self
    }

    pub fn with_reply_interval(mut self, reply_interval: u32) -> Self {
        self.reply_interval = reply_interval;
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    pub fn with_socket_options(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_cpu_affinity(mut self, cores: Vec<usize>) -> Self {
        self.cpu_affinity = cores;
        self
    }

    pub fn with_dump_file(mut self, path: Option<PathBuf>) -> Self {
        self.dump_file = path;
        self
    }

    pub fn with_output_file(mut self, path: Option<PathBuf>) -> Self {
        self.output_file = path;
        self
    }

    /// Number of top-level workers the role spawns: one Acceptor per
    /// endpoint for the replier, `threads` otherwise.
    pub fn worker_count(&self) -> usize {
        match self.role {
            Role::Replier => self.endpoints.len(),
            Role::Pair | Role::Sync => self.threads,
        }
    }

    /// Endpoint worker `id` connects to.
    pub fn endpoint_for(&self, id: usize) -> Option<&Endpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        self.endpoints.get(id % self.endpoints.len())
    }

    /// Reply interval actually used: synchronized workers want every reply.
    pub fn effective_reply_interval(&self) -> u32 {
        match self.role {
            Role::Sync => 1,
            Role::Pair | Role::Replier => self.reply_interval,
        }
    }

    /// Replies one connecting worker should receive, `None` when unbounded.
    pub fn expected_replies(&self) -> Option<u64> {
        let interval = u64::from(self.effective_reply_interval());
        if interval == 0 {
            return Some(0);
        }
        if self.count == 0 {
            return None;
        }
        Some((self.count + interval - 1) / interval)
    }
}

/// Display wrapper printed at the start of a run.
pub struct TestConfigDisplay<'a>(pub &'a TestConfig);

impl fmt::Display for TestConfigDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.0;
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting seqtest run: {}", config.role)?;
        for endpoint in &config.endpoints {
            writeln!(f, "  Endpoint:           {}", endpoint)?;
        }
        writeln!(f, "  Workers:            {}", config.worker_count())?;
        if config.role != Role::Replier {
            writeln!(f, "  Send Size:          {}", config.send_size)?;
            writeln!(f, "  Reply Size:         {}", config.reply_size)?;
            writeln!(f, "  Send Delay:         {}", config.send_delay)?;
            writeln!(f, "  Reply Delay:        {}", config.reply_delay)?;
            writeln!(
                f,
                "  Reply Interval:     {}",
                config.effective_reply_interval()
            )?;
            if config.count == 0 {
                writeln!(f, "  Count:              unbounded")?;
            } else {
                writeln!(f, "  Count:              {}", config.count)?;
            }
        }
        writeln!(f, "  Max Message Size:   {} bytes", config.max_message_size)?;
        writeln!(f, "  TCP_NODELAY:        {}", config.socket.nodelay)?;
        if !config.cpu_affinity.is_empty() {
            writeln!(f, "  CPU Affinity:       {:?}", config.cpu_affinity)?;
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

fn validate_max_message_size(size: usize) -> Result<()> {
    if size < HEADER_SIZE {
        bail!(
            "Max message size {} is smaller than the {}-byte frame header",
            size,
            HEADER_SIZE
        );
    }
    if size > u16::MAX as usize {
        bail!(
            "Max message size {} does not fit the 16-bit size fields (max {})",
            size,
            u16::MAX
        );
    }
    Ok(())
}
