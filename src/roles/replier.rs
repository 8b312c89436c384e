use super::{AnomalyCounts, Worker, WorkerContext, WorkerKind, WorkerReport, WorkerStatus};
use crate::clock;
use crate::wire::{frame_len, write_full, Frame, FrameReader, SizeField, WireError, HEADER_SIZE};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Running totals across every replier an acceptor started.
///
/// Repliers are detached, so they fold their final counts in here instead of
/// being joined.
#[derive(Debug, Default)]
pub struct Tally {
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub sequence_anomalies: AtomicU64,
    pub ts_backwards: AtomicU64,
    pub failures: AtomicU64,
    pub active: AtomicU64,
}

impl Tally {
    fn absorb(&self, report: &WorkerReport) {
        self.frames_received
            .fetch_add(report.frames_received, Ordering::Relaxed);
        self.frames_sent.fetch_add(report.frames_sent, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(report.bytes_received, Ordering::Relaxed);
        self.bytes_sent.fetch_add(report.bytes_sent, Ordering::Relaxed);
        self.sequence_anomalies
            .fetch_add(report.anomalies.sequence, Ordering::Relaxed);
        self.ts_backwards
            .fetch_add(report.anomalies.ts_backwards, Ordering::Relaxed);
        if report.status.is_failure() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy the totals into an acceptor's report.
    pub fn fill(&self, report: &mut WorkerReport) {
        report.frames_received = self.frames_received.load(Ordering::Relaxed);
        report.frames_sent = self.frames_sent.load(Ordering::Relaxed);
        report.bytes_received = self.bytes_received.load(Ordering::Relaxed);
        report.bytes_sent = self.bytes_sent.load(Ordering::Relaxed);
        report.anomalies.merge(&AnomalyCounts {
            sequence: self.sequence_anomalies.load(Ordering::Relaxed),
            ts_backwards: self.ts_backwards.load(Ordering::Relaxed),
            negative_server_time: 0,
        });
    }
}

/// Answers requests on one accepted connection.
pub struct Replier {
    ctx: WorkerContext,
    reader: FrameReader<TcpStream>,
    reply_buf: Vec<u8>,
    tally: Option<Arc<Tally>>,
}

impl Replier {
    pub fn new(ctx: WorkerContext, stream: TcpStream) -> Self {
        let max = ctx.config.max_message_size;
        let reader = FrameReader::new(stream, SizeField::Send, max).with_cancel(ctx.cancel.clone());
        Self {
            ctx,
            reader,
            reply_buf: vec![0u8; max.max(HEADER_SIZE)],
            tally: None,
        }
    }

    pub fn with_tally(mut self, tally: Arc<Tally>) -> Self {
        self.tally = Some(tally);
        self
    }

    fn serve(&mut self) -> Result<WorkerStatus, WireError> {
        let max = self.ctx.config.max_message_size;
        loop {
            let Some(request) = self.reader.next_frame()? else {
                return Ok(WorkerStatus::PeerClosed);
            };
            let frame = request.frame;
            self.ctx.record_received(request.size);
            self.ctx.check_seqno(frame.seqno);
            self.ctx.check_ts1(frame.ts1);
            trace!(worker = self.ctx.id, seqno = frame.seqno, "-");

            if frame.reply_size == 0 {
                continue;
            }
            let reply_len = frame_len(frame.reply_size, SizeField::Reply, max)?;

            if self.ctx.is_cancelled() {
                return Err(WireError::Cancelled);
            }
            clock::delay(u64::from(frame.reply_delay));

            let reply = Frame {
                seqno: self.ctx.next_send_seq(),
                ts1: frame.ts1,
                ts2: request.arrived_at,
                ts3: clock::now(),
                reply_delay: frame.reply_delay,
                send_size: frame.send_size,
                reply_size: frame.reply_size,
            };
            reply.encode_into(&mut self.reply_buf);
            write_full(
                self.reader.get_mut(),
                &self.reply_buf[..reply_len],
                &self.ctx.cancel,
            )?;
            self.ctx.record_sent(reply_len);
            trace!(worker = self.ctx.id, seqno = reply.seqno, "+");
        }
    }
}

impl Worker for Replier {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Replier
    }

    fn id(&self) -> usize {
        self.ctx.id
    }

    fn run(mut self) -> WorkerReport {
        let outcome = self.serve();
        let Replier { ctx, reader, tally, .. } = self;
        // Close the socket before the report is published.
        drop(reader);
        let report = ctx.finish(outcome);
        if let Some(tally) = tally {
            tally.absorb(&report);
            tally.active.fetch_sub(1, Ordering::Relaxed);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Role;
    use crate::config::{Endpoint, TestConfig};
    use crate::coordination::CancelToken;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn replier_pair() -> (TcpStream, thread::JoinHandle<WorkerReport>, Arc<Tally>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let config = TestConfig::new(Role::Replier, vec![Endpoint::new(addr)]);
        let ctx = WorkerContext::new(0, WorkerKind::Replier, Arc::new(config), CancelToken::new());
        let tally = Arc::new(Tally::default());
        tally.active.fetch_add(1, Ordering::Relaxed);
        let replier = Replier::new(ctx, server).with_tally(tally.clone());
        (client, thread::spawn(move || replier.run()), tally)
    }

    fn request(seqno: u64, send_size: u16, reply_size: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; send_size as usize];
        Frame {
            seqno,
            ts1: clock::now(),
            reply_delay: 1_000,
            send_size,
            reply_size,
            ..Frame::default()
        }
        .encode_into(&mut bytes);
        bytes
    }

    #[test]
    fn test_replier_answers_only_when_asked() {
        let (mut client, handle, tally) = replier_pair();
        let requests = [request(0, 100, 80), request(1, 40, 0), request(2, 64, 40)];
        for bytes in &requests {
            client.write_all(bytes).unwrap();
        }
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).unwrap();
        assert_eq!(replies.len(), 80 + 40);

        let first = Frame::decode(&replies[..80]).unwrap();
        let second = Frame::decode(&replies[80..]).unwrap();
        let sent = Frame::decode(&requests[0]).unwrap();
        assert_eq!(first.seqno, 0);
        assert_eq!(second.seqno, 1);
        assert_eq!(first.ts1, sent.ts1);
        assert_eq!(first.send_size, 100);
        assert_eq!(first.reply_size, 80);
        assert_eq!(first.reply_delay, 1_000);
        assert!(first.ts2 > 0);
        assert!(first.ts3 >= first.ts2 + 1_000);

        let report = handle.join().unwrap();
        assert_eq!(report.status, WorkerStatus::PeerClosed);
        assert_eq!(report.frames_received, 3);
        assert_eq!(report.frames_sent, 2);
        assert_eq!(tally.frames_received.load(Ordering::Relaxed), 3);
        assert_eq!(tally.active.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_oversize_request_is_a_protocol_violation() {
        let (mut client, handle, tally) = replier_pair();
        let mut bytes = request(0, 64, 40);
        bytes[36..38].copy_from_slice(&9000u16.to_ne_bytes());
        client.write_all(&bytes).unwrap();

        let report = handle.join().unwrap();
        match report.status {
            WorkerStatus::Failed(reason) => assert!(reason.contains("protocol violation")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(tally.failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_invalid_reply_size_is_a_protocol_violation() {
        let (mut client, handle, _tally) = replier_pair();
        client.write_all(&request(0, 64, 12)).unwrap();
        let report = handle.join().unwrap();
        assert!(report.status.is_failure());
        assert_eq!(report.frames_sent, 0);
    }
}
