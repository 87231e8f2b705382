// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Incremental RFC 6455 frame parser and encoder.
//!
//! The decoder consumes a growable read buffer fed by the connection read
//! loop. Header fields are validated as soon as they are complete, so a
//! malformed or oversize frame is rejected before its payload is buffered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::models::{
    frame::{Frame, close_code},
    opcode::{
        FIN_MASK, LEN_MASK, MASK_BIT, MAX_CONTROL_PAYLOAD, Opcode, OPCODE_MASK,
        RSV_MASK,
    },
};

/// Which end of the connection this codec serves.
///
/// The accepting side requires the mask bit on every inbound frame and never
/// masks outbound; the connecting side is the mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Protocol violations detected while parsing or reassembling frames.
///
/// Every variant maps onto the close code the peer is told before the
/// connection is torn down.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("non-zero reserved bits: 0x{0:02x}")]
    ReservedBits(u8),
    #[error("unknown opcode: 0x{0:x}")]
    UnknownOpcode(u8),
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(usize),
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("unmasked frame from connecting side")]
    MaskRequired,
    #[error("masked frame from accepting side")]
    UnexpectedMask,
    #[error("payload of {len} bytes exceeds limit of {max}")]
    TooBig { len: u64, max: usize },
    #[error("continuation frame without an open fragment sequence")]
    UnexpectedContinuation,
    #[error("new data frame while a fragment sequence is open")]
    FragmentOverlap,
    #[error("text message is not valid UTF-8")]
    BadUtf8,
}

impl FrameError {
    /// The RFC 6455 status code carried in the close frame this error
    /// triggers.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::TooBig { .. } => close_code::TOO_BIG,
            Self::BadUtf8 => close_code::INVALID_PAYLOAD,
            _ => close_code::PROTOCOL,
        }
    }
}

/// Streaming frame decoder.
///
/// `decode` returns `Ok(None)` until a whole frame is buffered, never
/// consuming partial input, so the caller can keep appending socket reads to
/// the same buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    role: Role,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self { role, max_payload }
    }

    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];

        let rsv = b0 & RSV_MASK;
        if rsv != 0 {
            return Err(FrameError::ReservedBits(rsv));
        }
        let code = b0 & OPCODE_MASK;
        let opcode = Opcode::from_u4(code).ok_or(FrameError::UnknownOpcode(code))?;
        let fin = (b0 & FIN_MASK) != 0;

        let masked = (b1 & MASK_BIT) != 0;
        match self.role {
            Role::Server if !masked => return Err(FrameError::MaskRequired),
            Role::Client if masked => return Err(FrameError::UnexpectedMask),
            _ => {},
        }

        if opcode.is_control() && !fin {
            return Err(FrameError::FragmentedControl);
        }

        let len7 = b1 & LEN_MASK;
        let (len, ext) = match len7 {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 2usize)
            },
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(raw), 8usize)
            },
            n => (u64::from(n), 0usize),
        };

        if opcode.is_control() && len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlTooLong(len as usize));
        }
        if len > self.max_payload as u64 {
            return Err(FrameError::TooBig {
                len,
                max: self.max_payload,
            });
        }
        let len = len as usize;

        let header_len = 2 + ext + if masked { 4 } else { 0 };
        let total = header_len + len;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(2 + ext);
        let payload = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[..4]);
            buf.advance(4);
            let mut data = buf.split_to(len);
            for (i, b) in data.iter_mut().enumerate() {
                *b ^= key[i % 4];
            }
            data.freeze()
        } else {
            buf.split_to(len).freeze()
        };

        Ok(Some(Frame {
            fin,
            opcode,
            payload,
        }))
    }
}

/// Encodes one frame, masking the payload when `mask` is supplied.
///
/// The connecting side passes a fresh key per frame; the accepting side
/// passes `None`.
pub fn encode(frame: &Frame, mask: Option<[u8; 4]>, out: &mut BytesMut) {
    let len = frame.payload.len();
    out.reserve(encoded_overhead(len) + len);

    let head = crate::models::opcode::FrameHead {
        fin: frame.fin,
        opcode: frame.opcode,
    };
    out.put_u8(u8::from(&head));

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if len <= 125 {
        out.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(mask_bit | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            out.put_slice(&key);
            let start = out.len();
            out.put_slice(&frame.payload);
            for (i, b) in out[start..].iter_mut().enumerate() {
                *b ^= key[i % 4];
            }
        },
        None => out.put_slice(&frame.payload),
    }
}

/// Convenience wrapper returning the encoded frame as freshly owned bytes.
pub fn encode_to_bytes(frame: &Frame, mask: Option<[u8; 4]>) -> Bytes {
    let mut out = BytesMut::new();
    encode(frame, mask, &mut out);
    out.freeze()
}

/// Header bytes needed in front of a payload of `len` bytes (without mask
/// key).
#[inline]
fn encoded_overhead(len: usize) -> usize {
    if len <= 125 {
        6
    } else if len <= u16::MAX as usize {
        8
    } else {
        14
    }
}
