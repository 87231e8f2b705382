// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HTTP/1.1 upgrade handshake (RFC 6455 § 4).
//!
//! The fabric speaks just enough HTTP to convert a fresh TCP stream into a
//! framed WebSocket stream: request-line plus headers on the accepting side,
//! status-line plus headers on the connecting side. Anything beyond the
//! upgrade (content negotiation, bodies, static resources) belongs to an
//! external collaborator.

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed GUID appended to the client key before hashing (RFC 6455 § 4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Longest head (request/status line + headers) we are willing to buffer.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed {0} line")]
    BadStartLine(&'static str),
    #[error("malformed header line: {0}")]
    BadHeaderLine(String),
    #[error("request head exceeds the buffering limit")]
    HeadTooLarge,
    #[error("method must be GET, got {0}")]
    BadMethod(String),
    #[error("missing or invalid header: {0}")]
    BadHeader(&'static str),
    #[error("Sec-WebSocket-Version must be 13")]
    BadVersion,
    #[error("Sec-WebSocket-Key must be 16 base64 bytes")]
    BadKey,
    #[error("expected 101 Switching Protocols, got: {0}")]
    BadStatus(String),
    #[error("Sec-WebSocket-Accept mismatch")]
    BadAccept,
    #[error("no route for path {0}")]
    NoRoute(String),
    #[error("upgrade rejected by accept predicate")]
    Rejected,
}

/// Parsed request or status head.
///
/// Header names are folded to lowercase; a repeated header keeps the last
/// value seen (last-wins).
#[derive(Debug, Clone)]
pub struct HttpHead {
    pub start_line: String,
    headers: HashMap<String, String>,
}

impl HttpHead {
    /// Attempts to parse a complete head out of `buf`.
    ///
    /// Returns `Ok(None)` until the blank-line terminator arrives; on
    /// success, the second tuple element is the number of bytes consumed, so
    /// the caller can hand any trailing bytes to the frame decoder.
    pub fn parse(
        buf: &[u8],
        kind: &'static str,
    ) -> Result<Option<(Self, usize)>, HandshakeError> {
        let Some(end) = find_terminator(buf) else {
            if buf.len() > MAX_HEAD_BYTES {
                return Err(HandshakeError::HeadTooLarge);
            }
            return Ok(None);
        };

        let head = std::str::from_utf8(&buf[..end])
            .map_err(|_| HandshakeError::BadStartLine(kind))?;
        let mut lines = head.split("\r\n");
        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(HandshakeError::BadStartLine(kind))?
            .to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HandshakeError::BadHeaderLine(line.to_string()))?;
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Some((
            Self {
                start_line,
                headers,
            },
            end + 4,
        )))
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// True when the comma-separated header contains `token`
    /// (ASCII case-insensitive).
    pub fn header_contains(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }
}

/// A validated inbound upgrade request.
#[derive(Debug)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub head: HttpHead,
}

/// Validates an inbound request head per RFC 6455 § 4.2.1.
pub fn validate_upgrade(head: HttpHead) -> Result<UpgradeRequest, HandshakeError> {
    let mut parts = head.start_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("/").to_string();
    if method != "GET" {
        return Err(HandshakeError::BadMethod(method.to_string()));
    }

    if !head.header_contains("upgrade", "websocket") {
        return Err(HandshakeError::BadHeader("Upgrade"));
    }
    if !head.header_contains("connection", "upgrade") {
        return Err(HandshakeError::BadHeader("Connection"));
    }
    if head.header("sec-websocket-version") != Some("13") {
        return Err(HandshakeError::BadVersion);
    }

    let key = head
        .header("sec-websocket-key")
        .ok_or(HandshakeError::BadKey)?
        .to_string();
    match BASE64.decode(&key) {
        Ok(raw) if raw.len() == 16 => {},
        _ => return Err(HandshakeError::BadKey),
    }

    Ok(UpgradeRequest { path, key, head })
}

/// `Sec-WebSocket-Accept` for a given client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The 101 response completing a valid upgrade.
pub fn upgrade_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
}

/// A plain error response sent before closing a connection that never made
/// it past the handshake.
pub fn reject_response(status: u16, reason: &str) -> String {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Connection: close\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

/// The outbound upgrade request for the connecting side.
pub fn upgrade_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Validates the 101 response on the connecting side.
pub fn validate_upgrade_response(
    head: &HttpHead,
    sent_key: &str,
) -> Result<(), HandshakeError> {
    let mut parts = head.start_line.split_whitespace();
    let _version = parts.next();
    if parts.next() != Some("101") {
        return Err(HandshakeError::BadStatus(head.start_line.clone()));
    }
    if !head.header_contains("upgrade", "websocket") {
        return Err(HandshakeError::BadHeader("Upgrade"));
    }
    if head.header("sec-websocket-accept") != Some(accept_key(sent_key).as_str()) {
        return Err(HandshakeError::BadAccept);
    }
    Ok(())
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
