// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, Bytes, BytesMut};

use crate::models::{codec::FrameError, frame::Frame, opcode::Opcode};

/// A fully reassembled application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accumulates data-frame fragments into whole messages.
///
/// Control frames never pass through here: the read loop answers pings and
/// handles close directly, which is what lets them interleave a fragment
/// sequence without disturbing it. The accumulator enforces the RFC 6455
/// sequencing rules (a sequence opens with text/binary, continues with
/// continuation opcodes, ends on FIN) and the configured message size cap.
#[derive(Debug)]
pub struct FragmentAssembler {
    max_message: usize,
    pending: Option<(Opcode, BytesMut)>,
}

impl FragmentAssembler {
    pub fn new(max_message: usize) -> Self {
        Self {
            max_message,
            pending: None,
        }
    }

    /// Feeds one data frame; returns a message once the final fragment lands.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, FrameError> {
        match (frame.opcode, &mut self.pending) {
            (Opcode::Continuation, None) => Err(FrameError::UnexpectedContinuation),
            (Opcode::Continuation, Some((_, acc))) => {
                let total = acc.len() + frame.payload.len();
                if total > self.max_message {
                    return Err(FrameError::TooBig {
                        len: total as u64,
                        max: self.max_message,
                    });
                }
                acc.put_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                let (opcode, acc) = self.pending.take().unwrap_or_default();
                Self::finish(opcode, acc.freeze()).map(Some)
            },
            (op, Some(_)) if op.is_data() => Err(FrameError::FragmentOverlap),
            (op, None) if op.is_data() => {
                if !frame.fin {
                    self.pending =
                        Some((op, BytesMut::from(frame.payload.as_ref())));
                    return Ok(None);
                }
                Self::finish(op, frame.payload).map(Some)
            },
            // Control opcodes are routed around the assembler by the caller.
            (op, _) => {
                debug_assert!(!op.is_control(), "control frame fed to assembler");
                Err(FrameError::UnknownOpcode(op as u8))
            },
        }
    }

    /// True while a fragment sequence is open.
    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    fn finish(opcode: Opcode, payload: Bytes) -> Result<Message, FrameError> {
        match opcode {
            Opcode::Text => match String::from_utf8(payload.to_vec()) {
                Ok(s) => Ok(Message::Text(s)),
                Err(_) => Err(FrameError::BadUtf8),
            },
            _ => Ok(Message::Binary(payload)),
        }
    }
}
