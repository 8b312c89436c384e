use super::{RequestBuilder, Worker, WorkerContext, WorkerKind, WorkerReport, WorkerStatus};
use crate::clock;
use crate::coordination::StartBarrier;
use crate::metrics::Sample;
use crate::wire::{write_full, FrameReader, SizeField, WireError};
use std::net::TcpStream;
use std::sync::Arc;
use tracing::trace;

/// Strict request/reply over one connection: request `i + 1` is never
/// written before the reply to request `i` has been read in full.
///
/// Transmission starts only once the shared [`StartBarrier`] is released.
pub struct SyncWorker {
    ctx: WorkerContext,
    reader: FrameReader<TcpStream>,
    barrier: Arc<StartBarrier>,
}

impl SyncWorker {
    pub fn new(ctx: WorkerContext, stream: TcpStream, barrier: Arc<StartBarrier>) -> Self {
        let reader = FrameReader::new(stream, SizeField::Reply, ctx.config.max_message_size)
            .with_cancel(ctx.cancel.clone());
        Self {
            ctx,
            reader,
            barrier,
        }
    }

    fn exchange_all(&mut self) -> Result<WorkerStatus, WireError> {
        if !self.barrier.wait(&self.ctx.cancel) {
            return Err(WireError::Cancelled);
        }

        let count = self.ctx.config.count;
        let mut builder = RequestBuilder::new(self.ctx.config.max_message_size);
        let mut i = 0u64;
        while count == 0 || i < count {
            if self.ctx.is_cancelled() {
                return Err(WireError::Cancelled);
            }
            let (request, send_delay) = builder.next_request(&mut self.ctx, 1);
            clock::delay(u64::from(send_delay));

            let bytes = builder.encode(&request);
            write_full(self.reader.get_mut(), bytes, &self.ctx.cancel)?;
            self.ctx.record_sent(bytes.len());

            let Some(reply) = self.reader.next_frame()? else {
                return Ok(WorkerStatus::PeerClosed);
            };
            let frame = reply.frame;
            if frame.seqno != request.seqno || frame.ts1 != request.ts1 {
                return Err(WireError::Correlation {
                    expected_seqno: request.seqno,
                    expected_ts1: request.ts1,
                    seqno: frame.seqno,
                    ts1: frame.ts1,
                });
            }
            self.ctx.check_server_time(&frame);

            let latency_ns = frame.round_trip_latency(reply.arrived_at);
            self.ctx.record_received(reply.size);
            self.ctx.record_sample(Sample {
                observed_at: request.ts1,
                latency_ns,
                send_size: request.send_size,
                reply_size: request.reply_size,
            });
            trace!(worker = self.ctx.id, seqno = frame.seqno, latency_ns, "<>");
            i += 1;
        }
        Ok(WorkerStatus::Completed)
    }
}

impl Worker for SyncWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Synchronized
    }

    fn id(&self) -> usize {
        self.ctx.id
    }

    fn run(mut self) -> WorkerReport {
        let outcome = self.exchange_all();
        self.ctx.finish(outcome)
    }
}
