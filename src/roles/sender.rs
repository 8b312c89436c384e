use super::{RequestBuilder, Worker, WorkerContext, WorkerKind, WorkerReport, WorkerStatus};
use crate::clock;
use crate::wire::{write_full, ConnWriter, WireError};
use tracing::trace;

/// Writes request frames on the write half of a connection.
///
/// Dropping the write half on exit half-closes the connection, which lets
/// the replier drain, answer the last request and close in turn.
pub struct Sender {
    ctx: WorkerContext,
    writer: ConnWriter,
}

impl Sender {
    pub fn new(ctx: WorkerContext, writer: ConnWriter) -> Self {
        Self { ctx, writer }
    }

    fn send_all(&mut self) -> Result<WorkerStatus, WireError> {
        let count = self.ctx.config.count;
        let reply_interval = self.ctx.config.effective_reply_interval();
        let mut builder = RequestBuilder::new(self.ctx.config.max_message_size);

        let mut i = 0u64;
        while count == 0 || i < count {
            if self.ctx.is_cancelled() {
                return Err(WireError::Cancelled);
            }
            let (frame, send_delay) = builder.next_request(&mut self.ctx, reply_interval);
            clock::delay(u64::from(send_delay));

            let bytes = builder.encode(&frame);
            write_full(&mut self.writer, bytes, &self.ctx.cancel)?;
            self.ctx.record_sent(bytes.len());
            trace!(worker = self.ctx.id, seqno = frame.seqno, size = bytes.len(), ">");
            i += 1;
        }
        Ok(WorkerStatus::Completed)
    }
}

impl Worker for Sender {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Sender
    }

    fn id(&self) -> usize {
        self.ctx.id
    }

    fn run(mut self) -> WorkerReport {
        let outcome = self.send_all();
        let Sender { ctx, writer } = self;
        drop(writer);
        ctx.finish(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Role;
    use crate::config::{Endpoint, SizeRange, TestConfig};
    use crate::coordination::CancelToken;
    use crate::wire::{split, FrameReader, SizeField};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    #[test]
    fn test_sender_writes_count_frames_then_half_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let config = TestConfig::new(Role::Pair, vec![Endpoint::new(addr)])
            .with_count(25)
            .with_reply_interval(5)
            .with_send_size(SizeRange::new(40, 300));
        let ctx = WorkerContext::new(0, WorkerKind::Sender, Arc::new(config), CancelToken::new());
        let (_reader, writer) = split(client).unwrap();

        let report = Sender::new(ctx, writer).run();
        assert_eq!(report.status, WorkerStatus::Completed);
        assert_eq!(report.frames_sent, 25);

        let mut reader = FrameReader::new(server, SizeField::Send, 8000);
        let mut seen = 0u64;
        while let Some(received) = reader.next_frame().unwrap() {
            assert_eq!(received.frame.seqno, seen);
            assert_eq!(received.size, received.frame.send_size as usize);
            assert_eq!(received.frame.reply_size != 0, seen % 5 == 0);
            seen += 1;
        }
        assert_eq!(seen, 25);
    }
}
