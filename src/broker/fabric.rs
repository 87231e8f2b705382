// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The stock broker-side handler: interprets the fabric line protocol
//! against the registry.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    broker::registry::Registry,
    models::envelope::Envelope,
    session::{Session, handler::SessionHandler},
};

/// Answers correlated requests arriving on a topic.
pub trait RequestResponder: Send + Sync + 'static {
    /// `Ok` becomes a `REP`, `Err` becomes an `ERR` to the requester.
    fn respond(&self, topic: &str, payload: &str) -> Result<String, String>;
}

/// Echoes the request payload back; the default responder.
#[derive(Debug, Default)]
pub struct EchoResponder;

impl RequestResponder for EchoResponder {
    fn respond(&self, _topic: &str, payload: &str) -> Result<String, String> {
        Ok(payload.to_string())
    }
}

pub struct FabricHandler {
    registry: Arc<Registry>,
    responder: Arc<dyn RequestResponder>,
}

impl FabricHandler {
    pub fn new(registry: Arc<Registry>, responder: Arc<dyn RequestResponder>) -> Self {
        Self {
            registry,
            responder,
        }
    }
}

impl SessionHandler for FabricHandler {
    fn on_message(&self, session: &Arc<Session>, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(env) => env,
            Err(e) => {
                // A malformed envelope is an application-level problem, not
                // a transport one: report it and keep the session.
                warn!(session = session.id(), "bad envelope: {e}");
                let _ = session.reply_error(0, &e.to_string());
                return;
            },
        };

        match envelope {
            Envelope::Subscribe { topic } => {
                self.registry.subscribe(session, &topic);
            },
            Envelope::Unsubscribe { topic } => {
                self.registry.unsubscribe(session, &topic);
            },
            Envelope::Publish { topic, payload } => {
                let n = self.registry.broadcast(&topic, &payload);
                debug!(session = session.id(), topic = %topic, delivered = n, "publish");
            },
            Envelope::Request { id, topic, payload } => {
                match self.responder.respond(&topic, &payload) {
                    Ok(reply) => {
                        let _ = session.reply(id, &reply);
                    },
                    Err(reason) => {
                        let _ = session.reply_error(id, &reason);
                    },
                }
            },
            // Reply envelopes only travel broker → client.
            Envelope::Reply { id, .. } | Envelope::Error { id, .. } => {
                debug!(session = session.id(), id, "ignoring reply envelope");
            },
        }
    }
}
