//! Shared fixtures for the loopback integration tests.

#![allow(dead_code)]

use seqtest::roles::{Acceptor, Tally, Worker, WorkerContext, WorkerKind};
use seqtest::wire::connection::listen;
use seqtest::{CancelToken, Endpoint, Role, TestConfig, WorkerReport};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A replier listening on a free loopback port.
pub struct ReplierFixture {
    pub addr: SocketAddr,
    pub cancel: CancelToken,
    pub tally: Arc<Tally>,
    handle: JoinHandle<WorkerReport>,
}

impl ReplierFixture {
    pub fn start() -> Self {
        Self::start_with(|config| config)
    }

    pub fn start_with(tune: impl FnOnce(TestConfig) -> TestConfig) -> Self {
        let listener = listen("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = listener.local_addr().unwrap();
        let config = tune(TestConfig::new(Role::Replier, vec![Endpoint::new(addr)]));
        let cancel = CancelToken::new();
        let ctx = WorkerContext::new(0, WorkerKind::Acceptor, Arc::new(config), cancel.clone());
        let acceptor = Acceptor::new(ctx, listener);
        let tally = acceptor.tally();
        let handle = thread::spawn(move || acceptor.run());
        Self {
            addr,
            cancel,
            tally,
            handle,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.addr)
    }

    /// Wait until every replier started so far has finished.
    pub fn wait_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.tally.active.load(Ordering::SeqCst) > 0 {
            assert!(Instant::now() < deadline, "repliers still running");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Wait until finished repliers have folded in at least `frames` requests.
    pub fn wait_received(&self, frames: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.tally.frames_received.load(Ordering::SeqCst) < frames {
            assert!(Instant::now() < deadline, "replier totals never reached {}", frames);
            thread::sleep(Duration::from_millis(5));
        }
        self.wait_idle();
    }

    /// Stop accepting and return the acceptor's report.
    pub fn stop(self) -> WorkerReport {
        self.cancel.cancel();
        self.handle.join().unwrap()
    }
}
