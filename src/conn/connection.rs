// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The transport-level connection: an encoded-frame send surface plus the
//! read loop that feeds decoder, assembler and event sink.
//!
//! A `Connection` is shared by the session above it and by the fabric
//! internals (heartbeat, registry fan-out). Teardown is signalled through
//! one kill token: the writer cancels it on overflow or write failure, the
//! read loop exits when it fires, and the session observes the end exactly
//! once through `ConnEvents::on_end`.

use std::sync::Arc;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::config::FabricConfig,
    conn::{FrameWriter, SendResult, io_cancellable, io_with_timeout},
    models::{
        assembler::{FragmentAssembler, Message},
        codec::{FrameDecoder, FrameError, Role, encode_to_bytes},
        frame::Frame,
        opcode::Opcode,
    },
    utils::Entropy,
};

/// Callbacks the read loop raises; implemented by the session layer, which
/// forwards them onto its serializing fiber.
pub trait ConnEvents: Send + Sync + 'static {
    fn on_message(&self, msg: Message);
    /// A protocol violation; the close frame with the matching code has
    /// already been queued.
    fn on_protocol_error(&self, err: &FrameError);
    /// A transport failure (I/O error, idle-read timeout).
    fn on_exception(&self, err: anyhow::Error);
    /// Peer-initiated close; the echo reply has already been queued.
    fn on_peer_close(&self, close: Option<(u16, String)>);
    /// The transport is gone. Raised exactly once, last.
    fn on_end(&self);
}

/// Why the read loop ended; logging only.
#[derive(Debug)]
enum CloseCause {
    PeerClose,
    Protocol,
    Eof,
    Killed,
    Transport,
}

pub struct Connection {
    peer: String,
    role: Role,
    writer: FrameWriter,
    kill: CancellationToken,
    cfg: FabricConfig,
    entropy: Arc<Entropy>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("writer", &self.writer)
            .finish()
    }
}

impl Connection {
    pub fn new(
        writer: FrameWriter,
        role: Role,
        peer: String,
        cfg: FabricConfig,
        entropy: Arc<Entropy>,
        kill: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            role,
            writer,
            kill,
            cfg,
            entropy,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Hard stop: aborts reader and drain immediately.
    pub fn kill_now(&self) {
        self.kill.cancel();
    }

    pub fn send_text(&self, text: &str) -> SendResult {
        self.send_frame(&Frame::text(Bytes::copy_from_slice(text.as_bytes())))
    }

    pub fn send_binary(&self, data: Bytes) -> SendResult {
        self.send_frame(&Frame::binary(data))
    }

    pub fn send_ping(&self, payload: Bytes) -> SendResult {
        self.send_frame(&Frame::ping(payload))
    }

    /// Data-lane send of an already-built frame.
    pub fn send_frame(&self, frame: &Frame) -> SendResult {
        self.writer.send_bytes(encode_to_bytes(frame, self.mask()))
    }

    /// Pong answering a ping: jumps the data lane.
    pub fn send_pong(&self, payload: Bytes) -> SendResult {
        self.writer
            .send_control(encode_to_bytes(&Frame::pong(payload), self.mask()))
    }

    /// Queues a close frame; the writer drains and half-closes afterwards.
    pub fn send_close(&self, code: u16, reason: &str) -> SendResult {
        self.writer
            .send_close_bytes(encode_to_bytes(&Frame::close(code, reason), self.mask()))
    }

    /// Raw bytes on the data lane; used for the HTTP upgrade exchange.
    pub fn send_raw(&self, bytes: Bytes) -> SendResult {
        self.writer.send_bytes(bytes)
    }

    pub fn is_closing(&self) -> bool {
        self.writer.is_closing() || self.kill.is_cancelled()
    }

    pub fn buffered(&self) -> usize {
        self.writer.buffered()
    }

    fn mask(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(self.entropy.mask_key()),
            Role::Server => None,
        }
    }
}

/// Drives the connection until the transport dies.
///
/// `leftover` carries bytes that arrived behind the upgrade head. Events
/// fire in wire order; `on_end` fires exactly once at exit.
pub async fn read_loop<R>(
    conn: Arc<Connection>,
    mut rd: R,
    leftover: BytesMut,
    events: Arc<dyn ConnEvents>,
) where
    R: AsyncRead + Unpin + Send,
{
    let decoder = FrameDecoder::new(conn.role, conn.cfg.max_frame_payload);
    let mut assembler = FragmentAssembler::new(conn.cfg.max_message_size);
    let mut buf = leftover;

    let cause = 'outer: loop {
        if conn.kill.is_cancelled() {
            break CloseCause::Killed;
        }

        let mut decoded = 0usize;
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(frame)) => {
                    match handle_frame(&conn, &mut assembler, &events, frame) {
                        Ok(true) => {},
                        Ok(false) => break 'outer CloseCause::PeerClose,
                        Err(()) => break 'outer CloseCause::Protocol,
                    }
                    decoded += 1;
                    if decoded >= conn.cfg.max_frames_per_read {
                        // Let other sessions on the worker make progress
                        // before draining the rest of the buffer.
                        tokio::task::yield_now().await;
                        decoded = 0;
                        if conn.kill.is_cancelled() {
                            break 'outer CloseCause::Killed;
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    events.on_protocol_error(&e);
                    let _ = conn.send_close(e.close_code(), &e.to_string());
                    break 'outer CloseCause::Protocol;
                },
            }
        }

        match fill(&conn, &mut rd, &mut buf).await {
            Ok(0) => break CloseCause::Eof,
            Ok(_) => {},
            Err(e) => {
                if conn.kill.is_cancelled() {
                    break CloseCause::Killed;
                }
                events.on_exception(e);
                break CloseCause::Transport;
            },
        }
    };

    debug!(peer = %conn.peer, ?cause, "read loop exited");

    // On the graceful paths a close frame is still queued; the drain writes
    // it and half-closes on its own. Killing now would race that flush, so
    // the hard stop becomes a grace timer instead.
    let graceful = matches!(cause, CloseCause::PeerClose | CloseCause::Protocol);
    if graceful && !conn.kill.is_cancelled() {
        let grace = Arc::clone(&conn);
        tokio::spawn(async move {
            tokio::time::sleep(grace.cfg.io_timeout).await;
            grace.kill.cancel();
        });
    } else {
        conn.kill.cancel();
    }
    events.on_end();
}

/// Returns `Ok(true)` to continue, `Ok(false)` on peer close, `Err(())`
/// after a protocol violation was reported.
fn handle_frame(
    conn: &Connection,
    assembler: &mut FragmentAssembler,
    events: &Arc<dyn ConnEvents>,
    frame: Frame,
) -> Result<bool, ()> {
    match frame.opcode {
        Opcode::Ping => {
            let _ = conn.send_pong(frame.payload);
            Ok(true)
        },
        // Unsolicited pongs are accepted and ignored.
        Opcode::Pong => Ok(true),
        Opcode::Close => {
            let parsed = Frame::parse_close(&frame.payload);
            if !conn.writer.is_closing() {
                let reply = match &parsed {
                    Some((code, _)) => Frame::close(*code, ""),
                    None => Frame::close_empty(),
                };
                let _ = conn
                    .writer
                    .send_close_bytes(encode_to_bytes(&reply, conn.mask()));
            }
            events.on_peer_close(parsed);
            Ok(false)
        },
        _ => match assembler.push(frame) {
            Ok(Some(msg)) => {
                events.on_message(msg);
                Ok(true)
            },
            Ok(None) => Ok(true),
            Err(e) => {
                events.on_protocol_error(&e);
                let _ = conn.send_close(e.close_code(), &e.to_string());
                Err(())
            },
        },
    }
}

async fn fill<R>(conn: &Connection, rd: &mut R, buf: &mut BytesMut) -> Result<usize>
where R: AsyncRead + Unpin + Send {
    buf.reserve(conn.cfg.read_buffer_size);
    let idle = conn.cfg.idle_read_timeout;
    if idle.is_zero() {
        io_cancellable("read", rd.read_buf(buf), &conn.kill).await
    } else {
        io_with_timeout("read", rd.read_buf(buf), idle, &conn.kill).await
    }
}
