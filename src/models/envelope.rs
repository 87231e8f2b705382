// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The fabric line protocol carried inside WebSocket text frames.
//!
//! One envelope per message, verb first, space separated:
//!
//! ```text
//! SUB <topic>
//! UNSUB <topic>
//! PUB <topic> <payload...>
//! REQ <id> <topic> <payload...>
//! REP <id> <payload...>
//! ERR <id> <reason...>
//! ```
//!
//! Topic names are non-empty and never contain whitespace; payloads run to
//! the end of the message and may contain anything. Correlation ids are
//! decimal u64, unique per requesting session.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("empty message")]
    Empty,
    #[error("unknown verb: {0}")]
    UnknownVerb(String),
    #[error("missing topic")]
    MissingTopic,
    #[error("topic contains whitespace")]
    BadTopic,
    #[error("missing or malformed correlation id")]
    BadCorrelationId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, payload: String },
    Request { id: u64, topic: String, payload: String },
    Reply { id: u64, payload: String },
    Error { id: u64, reason: String },
}

impl Envelope {
    pub fn parse(line: &str) -> Result<Self, EnvelopeError> {
        let mut parts = line.splitn(2, ' ');
        let verb = parts.next().filter(|v| !v.is_empty()).ok_or(EnvelopeError::Empty)?;
        let rest = parts.next().unwrap_or("");

        match verb {
            "SUB" => Ok(Self::Subscribe {
                topic: parse_topic(rest)?,
            }),
            "UNSUB" => Ok(Self::Unsubscribe {
                topic: parse_topic(rest)?,
            }),
            "PUB" => {
                let (topic, payload) = split_topic_payload(rest)?;
                Ok(Self::Publish { topic, payload })
            },
            "REQ" => {
                let (id, tail) = split_id(rest)?;
                let (topic, payload) = split_topic_payload(tail)?;
                Ok(Self::Request { id, topic, payload })
            },
            "REP" => {
                let (id, payload) = split_id(rest)?;
                Ok(Self::Reply {
                    id,
                    payload: payload.to_string(),
                })
            },
            "ERR" => {
                let (id, reason) = split_id(rest)?;
                Ok(Self::Error {
                    id,
                    reason: reason.to_string(),
                })
            },
            other => Err(EnvelopeError::UnknownVerb(other.to_string())),
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe { topic } => write!(f, "SUB {topic}"),
            Self::Unsubscribe { topic } => write!(f, "UNSUB {topic}"),
            Self::Publish { topic, payload } => write!(f, "PUB {topic} {payload}"),
            Self::Request { id, topic, payload } => {
                write!(f, "REQ {id} {topic} {payload}")
            },
            Self::Reply { id, payload } => write!(f, "REP {id} {payload}"),
            Self::Error { id, reason } => write!(f, "ERR {id} {reason}"),
        }
    }
}

fn parse_topic(s: &str) -> Result<String, EnvelopeError> {
    if s.is_empty() {
        return Err(EnvelopeError::MissingTopic);
    }
    if s.contains(char::is_whitespace) {
        return Err(EnvelopeError::BadTopic);
    }
    Ok(s.to_string())
}

fn split_topic_payload(s: &str) -> Result<(String, String), EnvelopeError> {
    let mut parts = s.splitn(2, ' ');
    let topic = parse_topic(parts.next().unwrap_or(""))?;
    Ok((topic, parts.next().unwrap_or("").to_string()))
}

fn split_id(s: &str) -> Result<(u64, &str), EnvelopeError> {
    let mut parts = s.splitn(2, ' ');
    let id = parts
        .next()
        .and_then(|raw| raw.parse::<u64>().ok())
        .ok_or(EnvelopeError::BadCorrelationId)?;
    Ok((id, parts.next().unwrap_or("")))
}
