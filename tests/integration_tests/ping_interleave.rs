// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;
use tokio::{io::AsyncWriteExt, net::TcpListener};
use ws_fabric_rs::{
    models::{
        codec::{Role, encode_to_bytes},
        frame::Frame,
        opcode::Opcode,
    },
    session::client,
};

use super::common::{
    RawFrames, Recorder, RecordingHandler, WAIT, accept_upgrade, test_config,
};

#[tokio::test]
async fn test_ping_inside_fragment_sequence_gets_ponged() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let port = listener.local_addr().expect("no addr").port();

    let server = tokio::spawn(async move {
        let (mut stream, leftover) = accept_upgrade(&listener).await;

        let frames = [
            Frame {
                fin: false,
                opcode: Opcode::Text,
                payload: Bytes::from_static(b"AB"),
            },
            Frame::ping(Bytes::from_static(b"x")),
            Frame {
                fin: true,
                opcode: Opcode::Continuation,
                payload: Bytes::from_static(b"CD"),
            },
        ];
        for frame in &frames {
            stream
                .write_all(&encode_to_bytes(frame, None))
                .await
                .expect("write failed");
        }

        // The pong must come back without waiting for the fragment sequence
        // to be answered in any way.
        let mut raw = RawFrames::new(Role::Server, leftover);
        loop {
            let frame = raw.next(&mut stream).await;
            match frame.opcode {
                Opcode::Pong => {
                    assert_eq!(&frame.payload[..], b"x", "pong must echo the ping");
                    return;
                },
                Opcode::Close => panic!("close before pong"),
                other => panic!("unexpected frame before pong: {other:?}"),
            }
        }
    });

    let rec = Recorder::new();
    let handle = client::open(
        "127.0.0.1",
        port,
        "/interleave",
        test_config(),
        RecordingHandler::new(Arc::clone(&rec)),
    );
    handle.wait_open(WAIT).await.expect("no open session");

    rec.wait_entry("msg:ABCD").await;
    assert_eq!(rec.count_prefix("msg:"), 1);

    server.await.expect("server task failed");
    handle.stop();
}
