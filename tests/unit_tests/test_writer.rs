// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, duplex},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use ws_fabric_rs::conn::{FrameWriter, SendResult};

const HIGH_WATER: usize = 1024;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_send_drains_in_fifo_order() {
    let (local, mut peer) = duplex(64 * 1024);
    let (_, wr) = tokio::io::split(local);
    let kill = CancellationToken::new();
    let writer = FrameWriter::spawn(wr, HIGH_WATER, IO_TIMEOUT, kill);

    assert_eq!(writer.send_bytes(Bytes::from_static(b"one")), SendResult::Sent);
    writer.send_bytes(Bytes::from_static(b"two"));
    writer.send_bytes(Bytes::from_static(b"three"));

    let mut got = vec![0u8; 11];
    peer.read_exact(&mut got).await.expect("read failed");
    assert_eq!(&got, b"onetwothree");
}

#[tokio::test]
async fn test_control_lane_overtakes_queued_data() {
    // An 8-byte pipe: the first write blocks the drain mid-frame, so the
    // later enqueues are ordered purely by lane.
    let (local, mut peer) = duplex(8);
    let (_, wr) = tokio::io::split(local);
    let kill = CancellationToken::new();
    let writer = FrameWriter::spawn(wr, 1 << 20, IO_TIMEOUT, kill);

    writer.send_bytes(Bytes::from(vec![b'a'; 32]));
    // Give the drain a moment to start (and block on) the first frame.
    tokio::time::sleep(Duration::from_millis(20)).await;
    writer.send_bytes(Bytes::from_static(b"data2"));
    writer.send_control(Bytes::from_static(b"PONG!"));

    let mut got = vec![0u8; 32 + 5 + 5];
    peer.read_exact(&mut got).await.expect("read failed");
    assert_eq!(&got[..32], &[b'a'; 32][..]);
    assert_eq!(&got[32..37], b"PONG!");
    assert_eq!(&got[37..], b"data2");
}

#[tokio::test]
async fn test_close_rejects_later_sends_and_half_closes() {
    let (local, mut peer) = duplex(64 * 1024);
    let (_, wr) = tokio::io::split(local);
    let kill = CancellationToken::new();
    let writer = FrameWriter::spawn(wr, HIGH_WATER, IO_TIMEOUT, kill);

    writer.send_bytes(Bytes::from_static(b"before"));
    assert_eq!(
        writer.send_close_bytes(Bytes::from_static(b"CLOSE")),
        SendResult::Sent
    );
    assert!(writer.is_closing());
    assert_eq!(
        writer.send_bytes(Bytes::from_static(b"after")),
        SendResult::Closed
    );
    assert_eq!(
        writer.send_close_bytes(Bytes::from_static(b"CLOSE2")),
        SendResult::Closed
    );

    // Data queued before the close drains, then the close, then EOF.
    let mut got = Vec::new();
    peer.read_to_end(&mut got).await.expect("read failed");
    assert_eq!(&got, b"beforeCLOSE");
}

#[tokio::test]
async fn test_overflow_is_terminal_and_kills_the_connection() {
    // A tiny pipe nobody reads: the drain blocks, the queue grows.
    let (local, _peer_kept_alive) = duplex(16);
    let (_, wr) = tokio::io::split(local);
    let kill = CancellationToken::new();
    let writer = FrameWriter::spawn(wr, 256, IO_TIMEOUT, kill.clone());

    let chunk = Bytes::from(vec![0u8; 128]);
    let mut saw_closed = false;
    for _ in 0..8 {
        if writer.send_bytes(chunk.clone()) == SendResult::Closed {
            saw_closed = true;
            break;
        }
    }
    assert!(saw_closed, "writer never reported overflow");
    assert!(kill.is_cancelled(), "overflow must kill the connection");
    assert_eq!(writer.send_bytes(chunk), SendResult::Closed);
}

#[tokio::test]
async fn test_buffered_result_reports_pending_bytes() {
    let (local, mut peer) = duplex(8);
    let (_, wr) = tokio::io::split(local);
    let kill = CancellationToken::new();
    let writer = FrameWriter::spawn(wr, 1 << 20, IO_TIMEOUT, kill);

    // First frame may report Sent (empty queue); once the drain is stuck,
    // results must be Buffered with a growing byte count.
    writer.send_bytes(Bytes::from(vec![0u8; 64]));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let first = writer.send_bytes(Bytes::from(vec![0u8; 64]));
    let second = writer.send_bytes(Bytes::from(vec![0u8; 64]));
    match (first, second) {
        (SendResult::Buffered(a), SendResult::Buffered(b)) => {
            assert!(b > a, "pending bytes must grow: {a} -> {b}");
        },
        other => panic!("expected Buffered results, got {other:?}"),
    }

    // Unblock and drain everything.
    let mut sink = vec![0u8; 192];
    timeout(IO_TIMEOUT, peer.read_exact(&mut sink))
        .await
        .expect("drain timed out")
        .expect("read failed");
}
