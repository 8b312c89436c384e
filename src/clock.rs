//! # Clock and Delay Primitive
//!
//! Every timestamp carried in a frame and every latency sample comes from
//! [`now`]. The delay primitive shapes inter-message timing below the
//! granularity the OS scheduler can honour on its own.
//!
//! ## Time Source
//!
//! All readings are derived from a single `Instant` anchored on first use, so
//! the clock can never step backwards. On Unix the anchor is offset by the
//! `CLOCK_MONOTONIC` reading taken at that moment, which makes stamps from
//! different processes on the same host directly comparable (useful when
//! lining results up against a packet capture).
//!
//! ## Delay Strategy
//!
//! [`delay`] sleeps while more than [`SPIN_THRESHOLD_NS`] remains and then
//! busy-spins on a cheap pseudo-random draw. The number of draws per pass is
//! derived from [`calibrate`], which keeps the clock from being polled in a
//! tight loop. Overshoot is unbounded; returning early never happens.

use rand::Rng;
use std::hint::black_box;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Below this much remaining time the delay stops sleeping and spins.
pub const SPIN_THRESHOLD_NS: u64 = 1_000_000;

/// Number of draws timed during calibration (2^20).
const CALIBRATION_SHIFT: u32 = 20;

struct Anchor {
    at: Instant,
    offset_ns: u64,
}

static ANCHOR: OnceLock<Anchor> = OnceLock::new();
static SPIN_COST_NS: OnceLock<u64> = OnceLock::new();

fn anchor() -> &'static Anchor {
    ANCHOR.get_or_init(|| Anchor {
        at: Instant::now(),
        offset_ns: host_monotonic_ns().unwrap_or(0),
    })
}

#[cfg(unix)]
fn host_monotonic_ns() -> Option<u64> {
    use nix::time::{clock_gettime, ClockId};

    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .ok()
        .map(|ts| (ts.tv_sec() as u64) * 1_000_000_000 + ts.tv_nsec() as u64)
}

#[cfg(not(unix))]
fn host_monotonic_ns() -> Option<u64> {
    None
}

/// Current monotonic time in nanoseconds.
pub fn now() -> u64 {
    let anchor = anchor();
    anchor.offset_ns + anchor.at.elapsed().as_nanos() as u64
}

/// Per-draw cost of the spin computation in nanoseconds, never below 1.
///
/// Measured once per process; later calls return the cached value. Call it
/// during startup so the first delayed message does not pay for it.
pub fn calibrate() -> u64 {
    *SPIN_COST_NS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let start = now();
        for _ in 0..(1u32 << CALIBRATION_SHIFT) {
            black_box(rng.gen::<u32>());
        }
        let elapsed = now().saturating_sub(start);
        let per_draw = (elapsed >> CALIBRATION_SHIFT).max(1);
        tracing::debug!("Delay calibration: {}ns per spin draw", per_draw);
        per_draw
    })
}

/// Block the calling thread for at least `target_ns` nanoseconds.
pub fn delay(target_ns: u64) {
    if target_ns == 0 {
        return;
    }

    let end = now().saturating_add(target_ns);
    let per_draw = calibrate();
    let mut rng = rand::thread_rng();

    loop {
        let current = now();
        if current >= end {
            break;
        }
        let remaining = end - current;
        if remaining > SPIN_THRESHOLD_NS {
            // Oversleeping is fine, the spin branch only exists for the tail.
            std::thread::sleep(Duration::from_nanos(remaining));
            continue;
        }
        for _ in 0..(remaining / per_draw).max(1) {
            black_box(rng.gen::<u32>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let mut last = now();
        for _ in 0..10_000 {
            let current = now();
            assert!(current >= last, "clock went backwards: {} < {}", current, last);
            last = current;
        }
    }

    #[test]
    fn test_calibrate_is_cached_and_positive() {
        let first = calibrate();
        assert!(first >= 1);
        assert_eq!(calibrate(), first);
    }

    #[test]
    fn test_zero_delay_returns_immediately() {
        let start = Instant::now();
        delay(0);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    /// Spin branch only: the target is below the sleep threshold.
    #[test]
    fn test_short_delay_never_returns_early() {
        for target in [1_000u64, 50_000, 500_000] {
            let start = now();
            delay(target);
            let elapsed = now() - start;
            assert!(elapsed >= target, "delay({}) returned after {}ns", target, elapsed);
        }
    }

    /// Sleep branch followed by the spin tail.
    #[test]
    fn test_long_delay_never_returns_early() {
        let target = 5_000_000;
        let start = now();
        delay(target);
        let elapsed = now() - start;
        assert!(elapsed >= target);
        // Generous upper bound for loaded CI machines.
        assert!(elapsed < target + 500_000_000);
    }
}
