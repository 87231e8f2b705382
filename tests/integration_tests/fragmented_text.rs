// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    time::timeout,
};
use ws_fabric_rs::{
    models::{codec::encode_to_bytes, frame::Frame, opcode::Opcode},
    session::client,
};

use super::common::{Recorder, RecordingHandler, WAIT, accept_upgrade, test_config};

#[tokio::test]
async fn test_fragmented_text_delivers_exactly_one_message() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let port = listener.local_addr().expect("no addr").port();

    let server = tokio::spawn(async move {
        let (mut stream, _leftover) = accept_upgrade(&listener).await;

        let fragments = [
            (false, Opcode::Text, &b"he"[..]),
            (false, Opcode::Continuation, &b"ll"[..]),
            (true, Opcode::Continuation, &b"o"[..]),
        ];
        for (fin, opcode, payload) in fragments {
            let frame = Frame {
                fin,
                opcode,
                payload: Bytes::from_static(payload),
            };
            stream
                .write_all(&encode_to_bytes(&frame, None))
                .await
                .expect("write failed");
        }

        // Hold the socket open until the client hangs up.
        let mut scratch = [0u8; 64];
        let _ = timeout(WAIT, stream.read(&mut scratch)).await;
    });

    let rec = Recorder::new();
    let handle = client::open(
        "127.0.0.1",
        port,
        "/frag",
        test_config(),
        RecordingHandler::new(Arc::clone(&rec)),
    );
    handle.wait_open(WAIT).await.expect("no open session");

    rec.wait_entry("msg:hello").await;
    assert_eq!(rec.count_prefix("msg:"), 1, "message delivered more than once");

    handle.stop();
    server.await.expect("server task failed");
}
