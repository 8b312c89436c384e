//! # Utility Functions and Helper Module
//!
//! Small helpers shared by the runner, the report and the binary.
//!
//! ## Key Functionality Categories
//!
//! - **Formatting**: Human-readable durations and byte counts
//! - **Threads**: Spawning named worker threads pinned to a CPU core
//! - **System Information**: CPU core detection and validation
//!
//! ## Usage Examples
//!
//! ```rust
//! use seqtest::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_bytes(1536), "1.50 KB");
//! ```

use anyhow::{bail, Context, Result};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Generate a unique identifier for a run
///
/// ## Returns
/// String representation of a UUID v4, recorded in the run report so results
/// from several hosts or repeated runs can be told apart.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a duration in a human-readable way
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: Longer runs (e.g., "5m 30s", "2h 15m 30s")
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a byte count with binary (1024-based) units
pub fn format_bytes(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Get the number of available CPU cores
///
/// The `num_cpus` crate handles edge cases and provides reliable detection
/// across different platforms and virtualization environments.
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Check that every requested core exists on this machine
///
/// ## Parameters
/// - `cores`: Core indices as given on the command line
///
/// ## Errors
/// Fails on the first index at or beyond the number of available cores.
pub fn validate_cpu_cores(cores: &[usize]) -> Result<()> {
    let available = get_cpu_cores();
    for &core in cores {
        if core >= available {
            bail!(
                "CPU core {} does not exist (this machine has {} cores)",
                core,
                available
            );
        }
    }
    Ok(())
}

/// Spawn a named thread, optionally pinned to one CPU core
///
/// Pinning happens on the new thread before `f` runs. A failed pin is logged
/// and the thread keeps running unpinned.
///
/// ## Parameters
/// - `name`: Thread name, visible in debuggers and `top -H`
/// - `core`: Core index to pin to, or `None` to leave scheduling to the OS
/// - `f`: Thread body
pub fn spawn_with_affinity<F, T>(name: String, core: Option<usize>, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            if let Some(id) = core {
                if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                    warn!("Failed to pin {} to CPU core {}", name, id);
                }
            }
            f()
        })
        .context("Failed to spawn worker thread")
}
