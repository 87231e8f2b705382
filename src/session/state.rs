// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The session lifecycle as a tagged variant with every legal transition in
//! one place.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport yet.
    NotConnected,
    /// Connecting side only: TCP SYN in flight.
    AwaitingConnect,
    /// HTTP upgrade posted, response (or request) pending.
    Handshaking,
    /// Framed traffic flowing.
    Open,
    /// A close frame went out or came in; writes are draining.
    Closing,
    /// Transport gone. Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// `start()` on the connecting side.
    ConnectStarted,
    /// The TCP connect completed; handshake bytes queued.
    TcpEstablished,
    /// The upgrade exchange parsed successfully.
    UpgradeAccepted,
    /// A close frame was queued locally or received from the peer.
    CloseStarted,
    /// Socket error, overflow, EOF, or drained close handshake.
    TransportClosed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no transition from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

/// Applies one event. Illegal combinations are rejected, never coerced.
pub fn step(
    from: SessionState,
    event: SessionEvent,
) -> Result<SessionState, InvalidTransition> {
    use SessionEvent::*;
    use SessionState::*;

    let next = match (from, event) {
        (NotConnected, ConnectStarted) => AwaitingConnect,
        (AwaitingConnect, TcpEstablished) => Handshaking,
        (Handshaking, UpgradeAccepted) => Open,
        (Open, CloseStarted) => Closing,
        // A local close racing a remote close both land here.
        (Closing, CloseStarted) => Closing,
        // Any state collapses to Closed on transport loss; re-entering
        // Closed is a no-op so late error paths stay idempotent.
        (_, TransportClosed) => Closed,
        (from, event) => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}
