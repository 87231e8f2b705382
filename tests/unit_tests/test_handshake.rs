// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use ws_fabric_rs::handshake::{
    HandshakeError, HttpHead, accept_key, reject_response, upgrade_request,
    upgrade_response, validate_upgrade, validate_upgrade_response,
};

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

fn request_head(extra: &str) -> HttpHead {
    let raw = format!(
        "GET /fabric HTTP/1.1\r\n\
         Host: example.test\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         {extra}\r\n"
    );
    let (head, used) = HttpHead::parse(raw.as_bytes(), "request")
        .expect("parse failed")
        .expect("head incomplete");
    assert_eq!(used, raw.len());
    head
}

#[test]
fn test_accept_key_rfc_vector() {
    // The worked example from RFC 6455 § 1.3.
    assert_eq!(accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
}

#[test]
fn test_parse_waits_for_terminator() {
    let partial = b"GET / HTTP/1.1\r\nHost: a\r\n";
    assert!(HttpHead::parse(partial, "request").unwrap().is_none());
}

#[test]
fn test_parse_reports_consumed_length_with_trailing_bytes() {
    let raw = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n\x81\x00";
    let (_, used) = HttpHead::parse(raw, "request").unwrap().unwrap();
    assert_eq!(used, raw.len() - 2, "frame bytes stay in the buffer");
}

#[test]
fn test_headers_case_insensitive_last_wins() {
    let raw = b"GET / HTTP/1.1\r\nX-Tag: first\r\nx-tag: second\r\n\r\n";
    let (head, _) = HttpHead::parse(raw, "request").unwrap().unwrap();
    assert_eq!(head.header("X-TAG"), Some("second"));
    assert_eq!(head.header("x-tag"), Some("second"));
}

#[test]
fn test_header_token_list_matching() {
    let raw = b"GET / HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\n\r\n";
    let (head, _) = HttpHead::parse(raw, "request").unwrap().unwrap();
    assert!(head.header_contains("connection", "upgrade"));
    assert!(!head.header_contains("connection", "close"));
}

#[test]
fn test_validate_upgrade_accepts_well_formed_request() {
    let upgrade = validate_upgrade(request_head("")).expect("must validate");
    assert_eq!(upgrade.path, "/fabric");
    assert_eq!(upgrade.key, SAMPLE_KEY);
}

#[test]
fn test_validate_upgrade_rejects_non_get() {
    let raw = format!(
        "POST / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    let (head, _) = HttpHead::parse(raw.as_bytes(), "request").unwrap().unwrap();
    assert!(matches!(
        validate_upgrade(head),
        Err(HandshakeError::BadMethod(m)) if m == "POST"
    ));
}

#[test]
fn test_validate_upgrade_rejects_wrong_version() {
    let raw = format!(
        "GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\nSec-WebSocket-Version: 12\r\n\r\n"
    );
    let (head, _) = HttpHead::parse(raw.as_bytes(), "request").unwrap().unwrap();
    assert!(matches!(
        validate_upgrade(head),
        Err(HandshakeError::BadVersion)
    ));
}

#[test]
fn test_validate_upgrade_rejects_missing_upgrade_header() {
    let raw = format!(
        "GET / HTTP/1.1\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    let (head, _) = HttpHead::parse(raw.as_bytes(), "request").unwrap().unwrap();
    assert!(matches!(
        validate_upgrade(head),
        Err(HandshakeError::BadHeader("Upgrade"))
    ));
}

#[test]
fn test_validate_upgrade_rejects_short_key() {
    let raw = "GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
               Sec-WebSocket-Key: c2hvcnQ=\r\nSec-WebSocket-Version: 13\r\n\r\n";
    let (head, _) = HttpHead::parse(raw.as_bytes(), "request").unwrap().unwrap();
    assert!(matches!(validate_upgrade(head), Err(HandshakeError::BadKey)));
}

#[test]
fn test_upgrade_response_carries_accept_hash() {
    let response = upgrade_response(SAMPLE_KEY);
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    assert!(response.ends_with("\r\n\r\n"));
}

#[test]
fn test_client_round_trip_validation() {
    let request = upgrade_request("example.test:9100", "/fabric", SAMPLE_KEY);
    let (head, _) = HttpHead::parse(request.as_bytes(), "request").unwrap().unwrap();
    let upgrade = validate_upgrade(head).expect("our own request must validate");

    let response = upgrade_response(&upgrade.key);
    let (head, _) = HttpHead::parse(response.as_bytes(), "status").unwrap().unwrap();
    validate_upgrade_response(&head, SAMPLE_KEY).expect("accept must match");
}

#[test]
fn test_client_rejects_wrong_status() {
    let raw = b"HTTP/1.1 200 OK\r\nUpgrade: websocket\r\n\r\n";
    let (head, _) = HttpHead::parse(raw, "status").unwrap().unwrap();
    assert!(matches!(
        validate_upgrade_response(&head, SAMPLE_KEY),
        Err(HandshakeError::BadStatus(_))
    ));
}

#[test]
fn test_client_rejects_wrong_accept() {
    let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                Connection: Upgrade\r\nSec-WebSocket-Accept: bm90LXRoZS1oYXNo\r\n\r\n";
    let (head, _) = HttpHead::parse(&raw[..], "status").unwrap().unwrap();
    assert!(matches!(
        validate_upgrade_response(&head, SAMPLE_KEY),
        Err(HandshakeError::BadAccept)
    ));
}

#[test]
fn test_reject_response_shape() {
    let response = reject_response(404, "Not Found");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.ends_with("\r\n\r\n"));
}
