use test_env_log::test;

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::beamline::beam::{Beam, BlockMode};
use crate::beamline::chunk::{Brigade, Chunk, ChunkKind};
use crate::beamline::common::Error;
use crate::beamline::scope::Scope;
use crate::tests::common::*;

fn spawn_receiver(b: Beam) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let rscope = Scope::new("receiver");
        let mut got = Vec::new();
        loop {
            let mut out = Brigade::new();
            match b.receive(RECEIVER, &mut out, &rscope, BlockMode::Block, 0) {
                Ok(_) => {
                    let done = out.iter().any(|c| c.kind() == ChunkKind::Eos);
                    got.extend_from_slice(&data_of(&out));
                    if done {
                        break;
                    }
                }
                Err(e) if e == Error::eof() => break,
                Err(e) => panic!("receive failed: {}", e),
            }
        }
        got
    })
}

#[test]
fn test_fifo_order_under_backpressure() {
    let scope = Scope::new("sender");
    let b = beam_with(&scope, 64);

    let mut expected = Vec::new();
    let receiver = spawn_receiver(b.clone());

    for i in 0..50u32 {
        let len = (i % 13 + 1) as usize;
        let byte = (i % 251) as u8;
        let data = vec![byte; len];
        expected.extend_from_slice(&data);
        let mut input = brigade(vec![Chunk::Heap(Bytes::from(data))]);
        b.send(SENDER, &mut input, BlockMode::Block).unwrap();
    }
    let mut tail = brigade(vec![Chunk::Eos]);
    b.send(SENDER, &mut tail, BlockMode::Block).unwrap();
    b.close(SENDER).unwrap();

    let got = receiver.join().unwrap();
    assert_eq!(got, expected);
}

#[test]
fn test_send_timeout() {
    let scope = Scope::new("sender");
    let b = beam_with(&scope, 8);
    b.set_timeout(Some(Duration::from_millis(30)));

    let mut input = brigade(vec![heap(b"12345678")]);
    b.send(SENDER, &mut input, BlockMode::Block).unwrap();

    let started = Instant::now();
    let mut more = brigade(vec![heap(b"9")]);
    let err = b.send(SENDER, &mut more, BlockMode::Block).unwrap_err();
    assert_eq!(err, Error::timeout());
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(more.len(), 1);
}

#[test]
fn test_receive_timeout() {
    let scope = Scope::new("sender");
    let rscope = Scope::new("receiver");
    let b = beam_with(&scope, 0);
    b.set_timeout(Some(Duration::from_millis(30)));

    let mut out = Brigade::new();
    let err = b
        .receive(RECEIVER, &mut out, &rscope, BlockMode::Block, 0)
        .unwrap_err();
    assert_eq!(err, Error::timeout());
    assert!(out.is_empty());
}

#[test]
fn test_abort_wakes_blocked_receiver() {
    let scope = Scope::new("sender");
    let b = beam_with(&scope, 0);

    let b2 = b.clone();
    let receiver = thread::spawn(move || {
        let rscope = Scope::new("receiver");
        let mut out = Brigade::new();
        b2.receive(RECEIVER, &mut out, &rscope, BlockMode::Block, 0)
    });

    thread::sleep(Duration::from_millis(30));
    b.abort(SENDER).unwrap();
    let result = receiver.join().unwrap();
    assert_eq!(result.unwrap_err(), Error::aborted());
}

#[test]
fn test_blocked_sender_resumes_after_receive() {
    let scope = Scope::new("sender");
    let b = beam_with(&scope, 16);

    let receiver = spawn_receiver(b.clone());

    // 48 bytes through a 16 byte window forces the sender to wait
    let mut input = brigade(vec![
        Chunk::Heap(Bytes::from(vec![b'x'; 48])),
        Chunk::Eos,
    ]);
    b.send(SENDER, &mut input, BlockMode::Block).unwrap();
    b.close(SENDER).unwrap();

    let got = receiver.join().unwrap();
    assert_eq!(got, vec![b'x'; 48]);
}

#[test]
fn test_send_block_callback_fires_before_wait() {
    let scope = Scope::new("sender");
    let b = beam_with(&scope, 8);

    let blocked = Arc::new(AtomicU32::new(0));
    let bl = blocked.clone();
    let b_inner = b.clone();
    b.on_send_block(Some(Arc::new(move || {
        // re-entering the beam here must not deadlock
        let _ = b_inner.buffered_data_len();
        bl.fetch_add(1, Relaxed);
    })));

    let b2 = b.clone();
    let receiver = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        let rscope = Scope::new("receiver");
        let mut out = Brigade::new();
        let mut got = 0usize;
        while got < 16 {
            b2.receive(RECEIVER, &mut out, &rscope, BlockMode::Block, 0)
                .unwrap();
            got = data_of(&out).len();
        }
    });

    let mut input = brigade(vec![Chunk::Heap(Bytes::from(vec![b'y'; 16]))]);
    b.send(SENDER, &mut input, BlockMode::Block).unwrap();
    receiver.join().unwrap();
    assert!(blocked.load(Relaxed) >= 1);
}

#[test]
fn test_wait_empty() {
    let scope = Scope::new("sender");
    let b = beam_with(&scope, 0);

    let mut input = brigade(vec![Chunk::Heap(Bytes::from(vec![b'z'; 32]))]);
    b.send(SENDER, &mut input, BlockMode::Block).unwrap();
    assert_eq!(
        b.wait_empty(BlockMode::NonBlock).unwrap_err(),
        Error::would_block()
    );

    let b2 = b.clone();
    let receiver = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        let rscope = Scope::new("receiver");
        let mut out = Brigade::new();
        b2.receive(RECEIVER, &mut out, &rscope, BlockMode::Block, 0)
            .unwrap();
        data_of(&out).len()
    });

    b.wait_empty(BlockMode::Block).unwrap();
    assert!(b.is_empty());
    assert_eq!(receiver.join().unwrap(), 32);
}
