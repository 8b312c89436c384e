use super::{Replier, Tally, Worker, WorkerContext, WorkerKind, WorkerReport, WorkerStatus};
use crate::wire::connection::configure_stream;
use crate::wire::WireError;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Accepts connections on one listening socket and starts a detached
/// [`Replier`] for each.
///
/// The listener is non-blocking and polled, so cancellation is noticed within
/// one poll interval. Repliers are not joined; their totals reach the
/// acceptor's report through a shared [`Tally`].
pub struct Acceptor {
    ctx: WorkerContext,
    listener: TcpListener,
    tally: Arc<Tally>,
}

impl Acceptor {
    pub fn new(ctx: WorkerContext, listener: TcpListener) -> Self {
        Self {
            ctx,
            listener,
            tally: Arc::new(Tally::default()),
        }
    }

    pub fn tally(&self) -> Arc<Tally> {
        self.tally.clone()
    }

    fn accept_loop(&mut self) -> Result<WorkerStatus, WireError> {
        let poll = crate::defaults::ACCEPT_POLL_INTERVAL;
        let mut next_child = 0usize;

        loop {
            if self.ctx.is_cancelled() {
                return Err(WireError::Cancelled);
            }
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(poll);
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(WireError::Io(e)),
            };

            if let Err(e) = configure_stream(&stream, &self.ctx.config.socket) {
                warn!(worker = self.ctx.id, %peer, "dropping connection, socket setup failed: {}", e);
                continue;
            }

            self.ctx.record_connection();
            let child_id = next_child;
            next_child += 1;
            let replier = Replier::new(self.ctx.spawn_child(child_id, WorkerKind::Replier), stream)
                .with_tally(self.tally.clone());

            self.tally.active.fetch_add(1, Ordering::Relaxed);
            let spawned = thread::Builder::new()
                .name(format!("replier-{}-{}", self.ctx.id, child_id))
                .spawn(move || replier.run());
            match spawned {
                Ok(_detached) => info!(worker = self.ctx.id, %peer, "accepted connection"),
                Err(e) => {
                    self.tally.active.fetch_sub(1, Ordering::Relaxed);
                    self.tally.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(worker = self.ctx.id, %peer, "failed to start replier: {}", e);
                }
            }
        }
    }
}

impl Worker for Acceptor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Acceptor
    }

    fn id(&self) -> usize {
        self.ctx.id
    }

    fn run(mut self) -> WorkerReport {
        if let Ok(addr) = self.listener.local_addr() {
            info!(worker = self.ctx.id, "listening on {}", addr);
        }
        let outcome = self.accept_loop();
        let Acceptor { mut ctx, listener, tally } = self;
        drop(listener);

        let active = tally.active.load(Ordering::Relaxed);
        if active > 0 {
            debug!(worker = ctx.id, "{} repliers still running", active);
        }
        tally.fill(ctx.report_mut());
        ctx.finish(outcome)
    }
}
