//! # Worker Coordination Module
//!
//! Shared state that crosses worker threads. Everything else a worker touches
//! is owned by that worker alone.
//!
//! ## Key Components
//!
//! - **CancelToken**: Run-wide stop flag checked at every blocking boundary
//!   (before a delay, on each I/O timeout tick, while polling accept, while
//!   waiting on the barrier)
//! - **StartBarrier**: Rendezvous that holds synchronized workers until every
//!   one of them is connected and ready, then releases them together so
//!   their latency samples start from a common instant
//!
//! ```text
//!  worker 0 ──wait()──┐
//!  worker 1 ──wait()──┤   arrived == expected   ┌──▶ all workers transmit
//!  worker N ──wait()──┘ ──────────────────────▶ │
//!  orchestrator ──release()─────────────────────┘   (returns release time)
//! ```

use crate::clock;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How often barrier waiters wake up to look at the cancel token.
const BARRIER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative cancellation flag shared by the orchestrator and all workers.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this token to stop at its next blocking boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    released_at: Option<u64>,
}

/// One-shot start barrier for synchronized workers.
///
/// Workers call [`StartBarrier::wait`]; the orchestrator calls
/// [`StartBarrier::release`] exactly once, which blocks until `expected`
/// workers have arrived and then wakes all of them.
#[derive(Debug)]
pub struct StartBarrier {
    expected: usize,
    state: Mutex<BarrierState>,
    arrivals: Condvar,
    released: Condvar,
}

impl StartBarrier {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            state: Mutex::new(BarrierState::default()),
            arrivals: Condvar::new(),
            released: Condvar::new(),
        }
    }

    /// Number of workers that have reached the barrier so far.
    pub fn arrived(&self) -> usize {
        self.state.lock().arrived
    }

    /// Release timestamp, once the barrier has been released.
    pub fn released_at(&self) -> Option<u64> {
        self.state.lock().released_at
    }

    /// Register as ready and block until released.
    ///
    /// Returns `false` if the token was cancelled before the release.
    pub fn wait(&self, cancel: &CancelToken) -> bool {
        let mut state = self.state.lock();
        state.arrived += 1;
        self.arrivals.notify_all();

        while state.released_at.is_none() {
            if cancel.is_cancelled() {
                return false;
            }
            self.released.wait_for(&mut state, BARRIER_POLL_INTERVAL);
        }
        true
    }

    /// Wait for every expected worker, then release them all.
    ///
    /// Returns the release timestamp (see [`clock::now`]), or `None` if the
    /// token was cancelled first. Calling it again after a release returns
    /// the original timestamp.
    pub fn release(&self, cancel: &CancelToken) -> Option<u64> {
        let mut state = self.state.lock();
        if let Some(at) = state.released_at {
            return Some(at);
        }

        while state.arrived < self.expected {
            if cancel.is_cancelled() {
                return None;
            }
            self.arrivals.wait_for(&mut state, BARRIER_POLL_INTERVAL);
        }

        let at = clock::now();
        state.released_at = Some(at);
        self.released.notify_all();
        debug!("Start barrier released {} workers", state.arrived);
        Some(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_barrier_holds_workers_until_release() {
        let barrier = Arc::new(StartBarrier::new(3));
        let cancel = CancelToken::new();
        let passed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let barrier = barrier.clone();
                let cancel = cancel.clone();
                let passed = passed.clone();
                thread::spawn(move || {
                    assert!(barrier.wait(&cancel));
                    passed.fetch_add(1, Ordering::SeqCst);
                    clock::now()
                })
            })
            .collect();

        while barrier.arrived() < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(passed.load(Ordering::SeqCst), 0);

        let released_at = barrier.release(&cancel).unwrap();
        for handle in handles {
            let woke_at = handle.join().unwrap();
            assert!(woke_at >= released_at);
        }
        assert_eq!(passed.load(Ordering::SeqCst), 3);
        assert_eq!(barrier.release(&cancel), Some(released_at));
    }

    #[test]
    fn test_cancel_unblocks_waiters_and_releaser() {
        let barrier = Arc::new(StartBarrier::new(2));
        let cancel = CancelToken::new();

        let waiter = {
            let barrier = barrier.clone();
            let cancel = cancel.clone();
            thread::spawn(move || barrier.wait(&cancel))
        };
        let releaser = {
            let barrier = barrier.clone();
            let cancel = cancel.clone();
            thread::spawn(move || barrier.release(&cancel))
        };

        thread::sleep(Duration::from_millis(50));
        cancel.cancel();

        assert!(!waiter.join().unwrap());
        assert_eq!(releaser.join().unwrap(), None);
        assert_eq!(barrier.released_at(), None);
    }
}
