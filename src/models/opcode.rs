// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Helpers for encoding / decoding the first two bytes of every WebSocket
//! frame header.
//!
//! The byte layout is defined by RFC 6455 § 5.2:
//!
//! ```text
//!  7   6   5   4   3   2   1   0      bit position
//! +---+---+---+---+---------------+
//! | F | R | R | R |    OPCODE     |  ← first header octet
//! +---+---+---+---+---------------+
//! | M |      PAYLOAD LEN (7)      |  ← second header octet
//! +---+---------------------------+
//! ```
//!
//! * **F** – *FIN* flag. Set on the final (or only) frame of a message.
//! * **R** – three reserved bits. Non-zero without a negotiated extension is
//!   a protocol violation.
//! * **M** – *MASK* flag. Set on every client-to-server frame.
//! * **OPCODE** – 4-bit operation code identifying the frame type.

use std::convert::TryFrom;

use thiserror::Error;

/// Mask that selects the **FIN** bit from the first header octet.
pub const FIN_MASK: u8 = 0b1000_0000;
/// Mask that selects the three reserved bits from the first header octet.
pub const RSV_MASK: u8 = 0b0111_0000;
/// Mask that selects the lower 4 bits (**OPCODE**) from the first octet.
pub const OPCODE_MASK: u8 = 0b0000_1111;
/// Mask that selects the **MASK** bit from the second header octet.
pub const MASK_BIT: u8 = 0b1000_0000;
/// Mask that selects the 7-bit payload length from the second octet.
pub const LEN_MASK: u8 = 0b0111_1111;

/// Largest payload a control frame (close/ping/pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// All opcodes defined by RFC 6455 § 5.2.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    #[default]
    Text = 0x1,
    Binary = 0x2,
    /* 0x3–0x7 reserved for data frames */
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
    /* 0xB–0xF reserved for control frames */
}

impl Opcode {
    #[inline]
    pub fn from_u4(v: u8) -> Option<Self> {
        Some(match v {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return None,
        })
    }

    /// Close, ping and pong. Control frames are length-limited and must not
    /// be fragmented.
    #[inline]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Text and binary, the opcodes that may open a fragment sequence.
    #[inline]
    pub const fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

/// Returned when the lower four bits contain an undefined opcode.
#[derive(Debug, Error)]
#[error("invalid opcode: 0x{0:x}")]
pub struct UnknownOpcode(pub u8);

/// Typed representation of the first header octet.
///
/// * `fin`    – high-order **FIN** bit.
/// * `opcode` – 4-bit opcode. Reserved bits must be zero, enforced by the
///   decoder before this conversion runs.
#[derive(Debug, PartialEq, Eq, Default)]
pub struct FrameHead {
    pub fin: bool,
    pub opcode: Opcode,
}

impl TryFrom<u8> for FrameHead {
    type Error = UnknownOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        let fin = (byte & FIN_MASK) != 0;
        let code = byte & OPCODE_MASK;
        let opcode = Opcode::from_u4(code).ok_or(UnknownOpcode(code))?;
        Ok(Self { fin, opcode })
    }
}

impl From<&FrameHead> for u8 {
    fn from(h: &FrameHead) -> u8 {
        let mut raw = h.opcode as u8;
        if h.fin {
            raw |= FIN_MASK;
        }
        raw
    }
}
