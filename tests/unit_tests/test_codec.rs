// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::BytesMut;
use ws_fabric_rs::models::{
    assembler::{FragmentAssembler, Message},
    codec::{FrameDecoder, FrameError, Role, encode_to_bytes},
    frame::Frame,
    opcode::Opcode,
};

const MAX: usize = 2 * 1024 * 1024;

fn decode_one(role: Role, bytes: &[u8]) -> Result<Option<Frame>, FrameError> {
    let decoder = FrameDecoder::new(role, MAX);
    let mut buf = BytesMut::from(bytes);
    decoder.decode(&mut buf)
}

#[test]
fn test_round_trip_all_lengths() {
    // Lengths straddling every header-size boundary.
    let lengths = [0usize, 125, 126, 65535, 65536, 1024 * 1024];
    let opcodes = [Opcode::Text, Opcode::Binary];

    for &len in &lengths {
        for &opcode in &opcodes {
            let frame = Frame {
                fin: true,
                opcode,
                payload: vec![0xA5u8; len].into(),
            };

            // Unmasked: decoded by the connecting side.
            let wire = encode_to_bytes(&frame, None);
            let got = decode_one(Role::Client, &wire)
                .expect("decode failed")
                .expect("frame incomplete");
            assert_eq!(got, frame, "unmasked len={len} opcode={opcode:?}");

            // Masked: decoded by the accepting side.
            let wire = encode_to_bytes(&frame, Some([0x11, 0x22, 0x33, 0x44]));
            let got = decode_one(Role::Server, &wire)
                .expect("decode failed")
                .expect("frame incomplete");
            assert_eq!(got, frame, "masked len={len} opcode={opcode:?}");
        }
    }
}

#[test]
fn test_round_trip_control_frames() {
    for frame in [
        Frame::ping(&b"x"[..]),
        Frame::pong(&b""[..]),
        Frame::close(1000, "bye"),
    ] {
        let wire = encode_to_bytes(&frame, None);
        let got = decode_one(Role::Client, &wire)
            .expect("decode failed")
            .expect("frame incomplete");
        assert_eq!(got, frame);
    }
}

#[test]
fn test_incremental_feed_byte_at_a_time() {
    let frame = Frame::text(&b"incremental"[..]);
    let wire = encode_to_bytes(&frame, Some([9, 8, 7, 6]));

    let decoder = FrameDecoder::new(Role::Server, MAX);
    let mut buf = BytesMut::new();
    for (i, byte) in wire.iter().enumerate() {
        buf.extend_from_slice(&[*byte]);
        let got = decoder.decode(&mut buf).expect("decode failed");
        if i + 1 < wire.len() {
            assert!(got.is_none(), "frame complete too early at byte {i}");
        } else {
            assert_eq!(got.expect("last byte must complete the frame"), frame);
        }
    }
    assert!(buf.is_empty(), "decoder must consume the whole frame");
}

#[test]
fn test_two_frames_in_one_buffer() {
    let a = Frame::text(&b"one"[..]);
    let b = Frame::binary(&b"two"[..]);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&encode_to_bytes(&a, None));
    buf.extend_from_slice(&encode_to_bytes(&b, None));

    let decoder = FrameDecoder::new(Role::Client, MAX);
    assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), a);
    assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), b);
    assert!(decoder.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_reserved_bits_rejected() {
    let mut wire = BytesMut::from(&encode_to_bytes(&Frame::text(&b"x"[..]), None)[..]);
    wire[0] |= 0b0100_0000;
    let err = decode_one(Role::Client, &wire).expect_err("rsv must fail");
    assert!(matches!(err, FrameError::ReservedBits(_)));
    assert_eq!(err.close_code(), 1002);
}

#[test]
fn test_unknown_opcode_rejected() {
    // Opcode 0x3 is reserved.
    let wire = [0x83u8, 0x00];
    let err = decode_one(Role::Client, &wire).expect_err("opcode must fail");
    assert!(matches!(err, FrameError::UnknownOpcode(0x3)));
}

#[test]
fn test_fragmented_control_rejected() {
    // Ping without FIN.
    let wire = [0x09u8, 0x00];
    let err = decode_one(Role::Client, &wire).expect_err("must fail");
    assert!(matches!(err, FrameError::FragmentedControl));
}

#[test]
fn test_oversize_control_rejected() {
    let frame = Frame::ping(vec![0u8; 200]);
    let wire = encode_to_bytes(&frame, None);
    let err = decode_one(Role::Client, &wire).expect_err("must fail");
    assert!(matches!(err, FrameError::ControlTooLong(200)));
    assert_eq!(err.close_code(), 1002);
}

#[test]
fn test_accepting_side_requires_mask() {
    let wire = encode_to_bytes(&Frame::text(&b"x"[..]), None);
    let err = decode_one(Role::Server, &wire).expect_err("must fail");
    assert!(matches!(err, FrameError::MaskRequired));
}

#[test]
fn test_connecting_side_rejects_mask() {
    let wire = encode_to_bytes(&Frame::text(&b"x"[..]), Some([1, 2, 3, 4]));
    let err = decode_one(Role::Client, &wire).expect_err("must fail");
    assert!(matches!(err, FrameError::UnexpectedMask));
}

#[test]
fn test_payload_limit_enforced_before_buffering() {
    let decoder = FrameDecoder::new(Role::Client, 16);
    // Header announcing 32 bytes; no payload attached yet.
    let mut buf = BytesMut::from(&[0x82u8, 32][..]);
    let err = decoder.decode(&mut buf).expect_err("must fail");
    assert!(matches!(err, FrameError::TooBig { len: 32, max: 16 }));
    assert_eq!(err.close_code(), 1009);
}

#[test]
fn test_assembler_concatenates_fragments() {
    let mut asm = FragmentAssembler::new(MAX);
    assert!(
        asm.push(Frame {
            fin: false,
            opcode: Opcode::Text,
            payload: (&b"he"[..]).into(),
        })
        .unwrap()
        .is_none()
    );
    assert!(asm.in_progress());
    assert!(
        asm.push(Frame {
            fin: false,
            opcode: Opcode::Continuation,
            payload: (&b"ll"[..]).into(),
        })
        .unwrap()
        .is_none()
    );
    let msg = asm
        .push(Frame {
            fin: true,
            opcode: Opcode::Continuation,
            payload: (&b"o"[..]).into(),
        })
        .unwrap()
        .expect("final fragment completes the message");
    assert_eq!(msg, Message::Text("hello".to_string()));
    assert!(!asm.in_progress());
}

#[test]
fn test_assembler_rejects_stray_continuation() {
    let mut asm = FragmentAssembler::new(MAX);
    let err = asm
        .push(Frame {
            fin: true,
            opcode: Opcode::Continuation,
            payload: (&b"x"[..]).into(),
        })
        .expect_err("must fail");
    assert!(matches!(err, FrameError::UnexpectedContinuation));
}

#[test]
fn test_assembler_rejects_overlapping_message() {
    let mut asm = FragmentAssembler::new(MAX);
    asm.push(Frame {
        fin: false,
        opcode: Opcode::Text,
        payload: (&b"a"[..]).into(),
    })
    .unwrap();
    let err = asm.push(Frame::text(&b"b"[..])).expect_err("must fail");
    assert!(matches!(err, FrameError::FragmentOverlap));
}

#[test]
fn test_assembler_rejects_bad_utf8() {
    let mut asm = FragmentAssembler::new(MAX);
    let err = asm
        .push(Frame {
            fin: true,
            opcode: Opcode::Text,
            payload: vec![0xFF, 0xFE].into(),
        })
        .expect_err("must fail");
    assert!(matches!(err, FrameError::BadUtf8));
    assert_eq!(err.close_code(), 1007);
}

#[test]
fn test_assembler_enforces_message_limit() {
    let mut asm = FragmentAssembler::new(4);
    asm.push(Frame {
        fin: false,
        opcode: Opcode::Binary,
        payload: vec![0u8; 3].into(),
    })
    .unwrap();
    let err = asm
        .push(Frame {
            fin: true,
            opcode: Opcode::Continuation,
            payload: vec![0u8; 3].into(),
        })
        .expect_err("must fail");
    assert!(matches!(err, FrameError::TooBig { .. }));
}

#[test]
fn test_close_payload_round_trip() {
    let frame = Frame::close(1001, "going away");
    assert_eq!(
        Frame::parse_close(&frame.payload),
        Some((1001, "going away".to_string()))
    );
    assert_eq!(Frame::parse_close(b""), None);
    assert_eq!(Frame::parse_close(&[0x03]), None);
}
