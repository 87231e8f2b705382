// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, Bytes, BytesMut};

use crate::models::opcode::Opcode;

/// Close codes used by the fabric (RFC 6455 § 7.4.1).
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (broker shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error (bad reserved bits, oversize control frame, ...).
    pub const PROTOCOL: u16 = 1002;
    /// Invalid payload data (text frame that is not UTF-8).
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Message too big for the configured receive limit.
    pub const TOO_BIG: u16 = 1009;
    /// Internal error on the sending endpoint.
    pub const INTERNAL: u16 = 1011;
}

/// A single decoded WebSocket frame.
///
/// Masking is a transport concern and never survives decoding: the payload
/// here is always the unmasked bytes. Fragments keep their original opcode
/// (`Continuation` for every frame after the first one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Ping,
            payload: payload.into(),
        }
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            payload: payload.into(),
        }
    }

    /// Close frame carrying a status code and an optional UTF-8 reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut p = BytesMut::with_capacity(2 + reason.len());
        p.put_u16(code);
        p.put_slice(reason.as_bytes());
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload: p.freeze(),
        }
    }

    /// Close frame with an empty body (status code left unsaid).
    pub fn close_empty() -> Self {
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload: Bytes::new(),
        }
    }

    /// Extracts `(code, reason)` from a close payload.
    ///
    /// Returns `None` for an empty body; a one-byte or non-UTF-8 body is
    /// ill-formed per RFC 6455 § 5.5.1 and also yields `None`, in which case
    /// the close reply echoes no code.
    pub fn parse_close(payload: &[u8]) -> Option<(u16, String)> {
        if payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = std::str::from_utf8(&payload[2..]).ok()?;
        Some((code, reason.to_string()))
    }
}
