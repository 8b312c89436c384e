use super::{Worker, WorkerContext, WorkerKind, WorkerReport, WorkerStatus};
use crate::metrics::Sample;
use crate::wire::{ConnReader, FrameReader, SizeField, WireError};
use tracing::trace;

/// Reads the replies to a paired [`Sender`](super::Sender) and records one
/// latency sample per reply.
pub struct Receiver {
    ctx: WorkerContext,
    reader: FrameReader<ConnReader>,
}

impl Receiver {
    pub fn new(ctx: WorkerContext, reader: ConnReader) -> Self {
        let reader = FrameReader::new(reader, SizeField::Reply, ctx.config.max_message_size)
            .with_cancel(ctx.cancel.clone());
        Self { ctx, reader }
    }

    fn receive_all(&mut self) -> Result<WorkerStatus, WireError> {
        let expected = self.ctx.config.expected_replies();
        let mut received = 0u64;

        loop {
            if expected.map_or(false, |n| received >= n) {
                return Ok(WorkerStatus::Completed);
            }
            let Some(reply) = self.reader.next_frame()? else {
                return Ok(WorkerStatus::PeerClosed);
            };

            let frame = reply.frame;
            self.ctx.check_seqno(frame.seqno);
            self.ctx.check_ts1(frame.ts1);
            self.ctx.check_server_time(&frame);

            let latency_ns = frame.round_trip_latency(reply.arrived_at);
            self.ctx.record_received(reply.size);
            self.ctx.record_sample(Sample {
                observed_at: frame.ts1,
                latency_ns,
                send_size: frame.send_size,
                reply_size: frame.reply_size,
            });
            trace!(worker = self.ctx.id, seqno = frame.seqno, latency_ns, "<");
            received += 1;
        }
    }
}

impl Worker for Receiver {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Receiver
    }

    fn id(&self) -> usize {
        self.ctx.id
    }

    fn run(mut self) -> WorkerReport {
        let outcome = self.receive_all();
        // A fatal read error ends the connection for the paired sender too.
        if matches!(&outcome, Err(e) if !matches!(e, WireError::Cancelled)) {
            self.reader.get_mut().shutdown();
        }
        self.ctx.finish(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Role;
    use crate::config::{Endpoint, TestConfig};
    use crate::coordination::CancelToken;
    use crate::wire::{split, write_full, ConnWriter, Frame};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    fn reply(seqno: u64, ts1: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        Frame {
            seqno,
            ts1,
            ts2: ts1 + 10,
            ts3: ts1 + 15,
            send_size: 40,
            reply_size: 64,
            ..Frame::default()
        }
        .encode_into(&mut bytes);
        bytes
    }

    fn receiver_over_loopback(count: u64, interval: u32) -> (Receiver, TcpStream) {
        let (receiver, _writer, server) = paired_over_loopback(count, interval);
        (receiver, server)
    }

    fn paired_over_loopback(count: u64, interval: u32) -> (Receiver, ConnWriter, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let config = TestConfig::new(Role::Pair, vec![Endpoint::new(addr)])
            .with_count(count)
            .with_reply_interval(interval);
        let ctx = WorkerContext::new(3, WorkerKind::Receiver, Arc::new(config), CancelToken::new());
        let (reader, writer) = split(client).unwrap();
        (Receiver::new(ctx, reader), writer, server)
    }

    #[test]
    fn test_receiver_stops_after_expected_replies() {
        let (receiver, mut server) = receiver_over_loopback(10, 3);
        // 10 requests with every 3rd answered: 0, 3, 6, 9.
        for seqno in 0..4 {
            server.write_all(&reply(seqno, 1_000 + seqno)).unwrap();
        }
        let report = receiver.run();
        assert_eq!(report.status, WorkerStatus::Completed);
        assert_eq!(report.replies(), 4);
        assert_eq!(report.samples.len(), 4);
        assert_eq!(report.anomalies.total(), 0);
        assert!(report.samples.iter().all(|s| s.reply_size == 64));
    }

    #[test]
    fn test_receiver_logs_gaps_and_keeps_going() {
        let (receiver, mut server) = receiver_over_loopback(0, 1);
        let cancel = CancelToken::new();
        for (seqno, ts1) in [(0, 100), (2, 200), (3, 150)] {
            write_full(&mut server, &reply(seqno, ts1), &cancel).unwrap();
        }
        drop(server);

        let report = receiver.run();
        assert_eq!(report.status, WorkerStatus::PeerClosed);
        assert_eq!(report.frames_received, 3);
        assert_eq!(report.anomalies.sequence, 2);
        assert_eq!(report.anomalies.ts_backwards, 1);
    }

    #[test]
    fn test_receiver_violation_closes_the_write_half() {
        let (receiver, mut writer, mut server) = paired_over_loopback(0, 1);
        // The header alone declares a reply larger than the 8000 byte limit.
        let header = Frame {
            seqno: 0,
            ts1: 100,
            send_size: 40,
            reply_size: 9000,
            ..Frame::default()
        }
        .encode();
        server.write_all(&header).unwrap();

        let report = receiver.run();
        assert!(matches!(report.status, WorkerStatus::Failed(ref r) if r.contains("9000")));

        let cancel = CancelToken::new();
        let err = write_full(&mut writer, &reply(1, 200), &cancel).unwrap_err();
        assert!(matches!(err, WireError::Io(_)));
    }
}
