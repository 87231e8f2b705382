// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Topic → sessions fan-out with a reverse index on each session.
//!
//! Invariant: a session id is in `topics[t]` iff `t` is in that session's
//! subscription set. Both sides of a transition are applied together while
//! the caller runs on the session's fiber, which is what makes membership
//! checks from other threads safe.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{conn::SendResult, session::Session};

/// Observer events for operators (first-subscriber semantics, cleanup).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Subscribe { topic: String, session_id: u64 },
    Unsubscribe { topic: String },
}

pub struct Registry {
    topics: DashMap<String, DashSet<u64>>,
    sessions: DashMap<u64, Arc<Session>>,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("topics", &self.topics.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl Registry {
    /// Returns the registry and the receiving end of its event channel.
    pub fn create() -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                topics: DashMap::new(),
                sessions: DashMap::new(),
                events,
            }),
            rx,
        )
    }

    pub fn insert_session(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    /// Detaches a session: every topic membership is removed first, so the
    /// bidirectional invariant holds throughout.
    pub fn remove_session(&self, id: u64) {
        let Some((_, session)) = self.sessions.remove(&id) else {
            return;
        };
        for topic in session.subscriptions() {
            self.detach(&session, &topic);
        }
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| Arc::clone(&s))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Adds `topic` to the session's set and the session to the topic's
    /// fan-out set; emits `Subscribe` for the observers. Re-subscribing is
    /// a no-op.
    pub fn subscribe(&self, session: &Arc<Session>, topic: &str) {
        if !session.sub_insert(topic) {
            return;
        }
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(session.id());
        let _ = self.events.send(RegistryEvent::Subscribe {
            topic: topic.to_string(),
            session_id: session.id(),
        });
    }

    /// The reverse transition; emits `Unsubscribe`.
    pub fn unsubscribe(&self, session: &Arc<Session>, topic: &str) {
        if !session.sub_remove(topic) {
            return;
        }
        self.detach(session, topic);
        let _ = self.events.send(RegistryEvent::Unsubscribe {
            topic: topic.to_string(),
        });
    }

    /// Sends `payload` on `topic` to one session iff it is subscribed;
    /// dropped silently otherwise.
    pub fn publish_to(
        &self,
        session: &Arc<Session>,
        topic: &str,
        payload: &str,
    ) -> SendResult {
        if !session.is_subscribed(topic) {
            debug!(session = session.id(), topic, "publish dropped: not subscribed");
            return SendResult::Sent;
        }
        session.publish(topic, payload)
    }

    /// Fans `payload` out to every subscriber of `topic`; returns how many
    /// sessions it was handed to.
    pub fn broadcast(&self, topic: &str, payload: &str) -> usize {
        // Snapshot ids first: no shard guard is held while enqueuing.
        let ids: Vec<u64> = match self.topics.get(topic) {
            Some(set) => set.iter().map(|id| *id).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for id in ids {
            if let Some(session) = self.session(id)
                && self.publish_to(&session, topic, payload) != SendResult::Closed
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Current subscribers of a topic (test and operator surface).
    pub fn subscribers(&self, topic: &str) -> Vec<u64> {
        match self.topics.get(topic) {
            Some(set) => {
                let mut ids: Vec<u64> = set.iter().map(|id| *id).collect();
                ids.sort_unstable();
                ids
            },
            None => Vec::new(),
        }
    }

    fn detach(&self, session: &Arc<Session>, topic: &str) {
        if let Some(set) = self.topics.get(topic) {
            set.remove(&session.id());
            if set.is_empty() {
                drop(set);
                self.topics
                    .remove_if(topic, |_, members| members.is_empty());
            }
        }
    }
}
