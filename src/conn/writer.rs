// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Outbound byte queue with back-pressure accounting.
//!
//! Producers (handler fibers, the heartbeat scheduler, the registry fan-out)
//! enqueue already-encoded frames; a single drain task owns the socket write
//! half and empties the queues FIFO. Two lanes exist: a priority lane for
//! pongs answering pings, and the data lane for everything else including
//! the close frame, so a close never overtakes data queued before it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::conn::io_with_timeout;

/// Outcome of a send attempt.
///
/// `Sent` means the frame went to an empty queue; `Buffered(n)` reports the
/// total bytes pending after the enqueue; `Closed` means the writer no
/// longer accepts frames (close queued, overflow, or dead transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Sent,
    Buffered(usize),
    Closed,
}

enum Outbound {
    Data(Bytes),
    /// Encoded close frame; the drain half-closes the socket after writing
    /// it.
    Close(Bytes),
}

struct WriterState {
    /// Bytes enqueued and not yet written to the socket.
    pending: AtomicUsize,
    /// Set once a close frame is queued; the writer is draining-only after.
    closing: AtomicBool,
    /// Connection kill switch shared with the read loop.
    kill: CancellationToken,
}

/// Producer half of the per-connection write path.
pub struct FrameWriter {
    data_tx: mpsc::UnboundedSender<Outbound>,
    ctrl_tx: mpsc::UnboundedSender<Bytes>,
    state: Arc<WriterState>,
    high_water: usize,
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("pending", &self.buffered())
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl FrameWriter {
    /// Creates the writer and spawns its drain task over `sink`.
    pub fn spawn<W>(
        sink: W,
        high_water: usize,
        io_timeout: Duration,
        kill: CancellationToken,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let state = Arc::new(WriterState {
            pending: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            kill,
        });

        tokio::spawn(drain(sink, data_rx, ctrl_rx, Arc::clone(&state), io_timeout));

        Self {
            data_tx,
            ctrl_tx,
            state,
            high_water,
        }
    }

    /// Enqueues bytes on the data lane.
    pub fn send_bytes(&self, bytes: Bytes) -> SendResult {
        if self.is_closing() || self.state.kill.is_cancelled() {
            return SendResult::Closed;
        }

        let len = bytes.len();
        let pending = self.state.pending.fetch_add(len, Ordering::SeqCst) + len;
        if pending > self.high_water {
            warn!(
                pending,
                high_water = self.high_water,
                "writer overflow, killing connection"
            );
            self.state.kill.cancel();
            return SendResult::Closed;
        }

        if self.data_tx.send(Outbound::Data(bytes)).is_err() {
            return SendResult::Closed;
        }
        if pending == len {
            SendResult::Sent
        } else {
            SendResult::Buffered(pending)
        }
    }

    /// Enqueues bytes on the priority lane, ahead of pending data frames.
    pub fn send_control(&self, bytes: Bytes) -> SendResult {
        if self.is_closing() || self.state.kill.is_cancelled() {
            return SendResult::Closed;
        }
        let len = bytes.len();
        self.state.pending.fetch_add(len, Ordering::SeqCst);
        if self.ctrl_tx.send(bytes).is_err() {
            return SendResult::Closed;
        }
        SendResult::Sent
    }

    /// Queues the encoded close frame and flips the writer to draining-only.
    /// Everything enqueued earlier still goes out; everything after is
    /// rejected with `Closed`.
    pub fn send_close_bytes(&self, bytes: Bytes) -> SendResult {
        if self.state.kill.is_cancelled() {
            return SendResult::Closed;
        }
        if self.state.closing.swap(true, Ordering::SeqCst) {
            return SendResult::Closed;
        }
        self.state.pending.fetch_add(bytes.len(), Ordering::SeqCst);
        if self.data_tx.send(Outbound::Close(bytes)).is_err() {
            return SendResult::Closed;
        }
        SendResult::Sent
    }

    /// Bytes enqueued and not yet written.
    pub fn buffered(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.state.closing.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.kill.is_cancelled()
    }
}

async fn drain<W>(
    mut sink: W,
    mut data_rx: mpsc::UnboundedReceiver<Outbound>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Bytes>,
    state: Arc<WriterState>,
    io_timeout: Duration,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = state.kill.cancelled() => break,
            ctrl = ctrl_rx.recv() => match ctrl {
                Some(bytes) => Outbound::Data(bytes),
                None => break,
            },
            data = data_rx.recv() => match data {
                Some(out) => out,
                None => break,
            },
        };

        let (bytes, is_close) = match item {
            Outbound::Data(b) => (b, false),
            Outbound::Close(b) => (b, true),
        };

        let wrote = io_with_timeout(
            "write frame",
            sink.write_all(&bytes),
            io_timeout,
            &state.kill,
        )
        .await;
        state.pending.fetch_sub(bytes.len(), Ordering::SeqCst);

        if let Err(e) = wrote {
            debug!("writer drain stopped: {e}");
            state.kill.cancel();
            break;
        }

        if is_close {
            // Close handshake: data queued before the close has drained;
            // half-close our write side and let the reader await the peer.
            let _ = sink.shutdown().await;
            break;
        }
    }
}
