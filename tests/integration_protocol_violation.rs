//! A malformed peer only costs its own connection.

mod common;

use common::ReplierFixture;
use seqtest::wire::{FrameReader, SizeField};
use seqtest::{
    Endpoint, Frame, Role, SizeRange, TestConfig, TestRunner, WorkerKind, WorkerStatus,
    HEADER_SIZE,
};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn request(seqno: u64, send_size: u16, reply_size: u16) -> Vec<u8> {
    let mut bytes = vec![0u8; usize::from(send_size).max(HEADER_SIZE)];
    Frame {
        seqno,
        send_size,
        reply_size,
        ..Frame::default()
    }
    .encode_into(&mut bytes);
    bytes
}

fn client(fixture: &ReplierFixture) -> TcpStream {
    let stream = TcpStream::connect(fixture.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

#[test]
fn oversized_request_closes_only_that_connection() {
    let replier = ReplierFixture::start();
    let mut good = client(&replier);
    let mut bad = client(&replier);

    // Declares 60000 bytes against the default 8000 byte limit.
    bad.write_all(&request(0, 60_000, 40)[..HEADER_SIZE]).unwrap();
    let mut buf = [0u8; 64];
    match bad.read(&mut buf) {
        Ok(0) => {}
        Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
        other => panic!("expected the violating connection to close, got {:?}", other),
    }

    for seqno in 0..5 {
        good.write_all(&request(seqno, 64, 48)).unwrap();
        let mut reply = [0u8; 48];
        good.read_exact(&mut reply).unwrap();
        let frame = Frame::decode(&reply).unwrap();
        assert_eq!(frame.seqno, seqno);
        assert_eq!(frame.reply_size, 48);
    }
    good.shutdown(std::net::Shutdown::Write).unwrap();
    let mut rest = Vec::new();
    good.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    replier.wait_received(5);
    assert_eq!(replier.tally.failures.load(Ordering::SeqCst), 1);
    let report = replier.stop();
    assert_eq!(report.connections, 2);
    assert_eq!(report.frames_sent, 5);
}

#[test]
fn undersized_reply_request_is_rejected() {
    let replier = ReplierFixture::start();
    let mut bad = client(&replier);

    // A reply smaller than the header cannot be built.
    bad.write_all(&request(0, 40, 12)).unwrap();
    let mut buf = [0u8; 64];
    match bad.read(&mut buf) {
        Ok(0) => {}
        Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
        other => panic!("expected the connection to close, got {:?}", other),
    }

    replier.wait_idle();
    assert_eq!(replier.tally.failures.load(Ordering::SeqCst), 1);
    replier.stop();
}

/// Answers the first request with a header declaring an oversized reply, then
/// keeps answering with valid full-size replies until the connection fails.
fn spawn_lying_replier() -> (Endpoint, thread::JoinHandle<u64>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = Endpoint::new(listener.local_addr().unwrap());
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut requests = FrameReader::new(stream, SizeField::Send, 8000);
        let mut reply = vec![0u8; 8000];
        let mut answered = 0u64;

        while let Ok(Some(request)) = requests.next_frame() {
            let frame = Frame {
                ts2: request.arrived_at,
                ts3: request.arrived_at,
                reply_size: if answered == 0 { 9000 } else { 8000 },
                ..request.frame
            };
            frame.encode_into(&mut reply);
            let len = if answered == 0 { HEADER_SIZE } else { reply.len() };
            if writer.write_all(&reply[..len]).is_err() {
                break;
            }
            answered += 1;
        }
        answered
    });
    (endpoint, handle)
}

#[test]
fn receiver_violation_ends_the_pair_and_the_run() {
    let (endpoint, replier) = spawn_lying_replier();
    let config = TestConfig::new(Role::Pair, vec![endpoint])
        .with_count(5000)
        .with_reply_interval(1)
        .with_send_size(SizeRange::fixed(8000))
        .with_reply_size(SizeRange::fixed(8000));
    let runner = TestRunner::new(config);
    let cancel = runner.cancel_token();

    let (done, finished) = mpsc::channel();
    thread::spawn(move || {
        let _ = done.send(runner.run());
    });
    let outcome = match finished.recv_timeout(Duration::from_secs(20)) {
        Ok(result) => result.unwrap(),
        Err(_) => {
            cancel.cancel();
            panic!("pair run did not finish after the receiver failed");
        }
    };

    assert_eq!(outcome.failures(), 2);
    for worker in &outcome.workers {
        match (&worker.kind, &worker.status) {
            (WorkerKind::Receiver, WorkerStatus::Failed(reason)) => {
                assert!(reason.contains("9000"), "unexpected reason: {}", reason)
            }
            (WorkerKind::Sender, WorkerStatus::Failed(reason)) => {
                assert!(reason.contains("I/O error"), "unexpected reason: {}", reason);
                assert!(worker.frames_sent < 5000);
            }
            (kind, status) => panic!("{} worker ended with {}", kind, status),
        }
    }
    assert!(!cancel.is_cancelled());
    replier.join().unwrap();
}
