// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, duplex},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use ws_fabric_rs::{
    cfg::config::Config,
    conn::{Connection, FrameWriter},
    fiber::Fiber,
    models::{
        codec::{FrameDecoder, Role},
        opcode::Opcode,
    },
    session::heartbeat::Heartbeat,
    utils::Entropy,
};

fn test_conn(
    wr: tokio::io::WriteHalf<tokio::io::DuplexStream>,
) -> Arc<Connection> {
    let cfg = Config::default().fabric;
    let kill = CancellationToken::new();
    let writer = FrameWriter::spawn(wr, cfg.writer_high_water, cfg.io_timeout, kill.clone());
    Connection::new(
        writer,
        Role::Server,
        "test".to_string(),
        cfg,
        Arc::new(Entropy::new(Some(1))),
        kill,
    )
}

#[tokio::test]
async fn test_heartbeat_emits_pings_then_stops() {
    let (local, mut peer) = duplex(64 * 1024);
    let (_, wr) = tokio::io::split(local);
    let conn = test_conn(wr);
    let fiber = Fiber::spawn("hb");

    let hb = Heartbeat::new();
    hb.start(&fiber, Arc::clone(&conn), Duration::from_millis(30));

    // Collect two pings off the wire.
    let decoder = FrameDecoder::new(Role::Client, 1024);
    let mut buf = BytesMut::new();
    let mut pings = 0;
    while pings < 2 {
        if let Some(frame) = decoder.decode(&mut buf).expect("bad frame") {
            assert_eq!(frame.opcode, Opcode::Ping);
            pings += 1;
            continue;
        }
        let n = timeout(Duration::from_secs(5), peer.read_buf(&mut buf))
            .await
            .expect("no ping arrived")
            .expect("read failed");
        assert!(n > 0);
    }

    hb.stop();
    assert!(hb.is_stopped());
    // Idempotent: a second stop is a no-op.
    hb.stop();

    // A tick already queued at stop time may still flush; drain until the
    // pipe goes quiet, then require it to stay quiet.
    sleep(Duration::from_millis(100)).await;
    while timeout(Duration::from_millis(50), peer.read_buf(&mut buf))
        .await
        .is_ok()
    {}
    let quiet = timeout(Duration::from_millis(150), peer.read_buf(&mut buf)).await;
    assert!(quiet.is_err(), "heartbeat kept pinging after stop");

    fiber.stop();
}

#[tokio::test]
async fn test_zero_interval_disables_heartbeat() {
    let (local, mut peer) = duplex(1024);
    let (_, wr) = tokio::io::split(local);
    let conn = test_conn(wr);
    let fiber = Fiber::spawn("hb-off");

    let hb = Heartbeat::new();
    hb.start(&fiber, conn, Duration::ZERO);

    let mut buf = [0u8; 16];
    let quiet = timeout(Duration::from_millis(100), peer.read(&mut buf)).await;
    assert!(quiet.is_err(), "disabled heartbeat wrote bytes");
    fiber.stop();
}
