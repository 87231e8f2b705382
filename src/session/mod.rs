// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A session is the logical presence above one transport connection: an
//! identity, a subscription set, a correlated-request table, a heartbeat and
//! the serializing fiber its callbacks run on.

use std::{
    any::Any,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use bytes::{Bytes, BytesMut};
use dashmap::{DashMap, DashSet};
use once_cell::sync::OnceCell;
use tokio::{io::AsyncRead, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::FabricConfig,
    conn::{ConnEvents, Connection, SendResult, connection::read_loop},
    fiber::Fiber,
    handshake::HttpHead,
    models::{
        assembler::Message,
        codec::FrameError,
        envelope::Envelope,
        frame::close_code,
    },
    session::{
        handler::SessionHandler,
        heartbeat::Heartbeat,
        state::{SessionEvent, SessionState, step},
    },
};

pub mod client;
pub mod handler;
pub mod heartbeat;
pub mod state;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

type CloseHook = Box<dyn FnOnce(u64) + Send + 'static>;

pub struct Session {
    id: u64,
    conn: Arc<Connection>,
    fiber: Arc<Fiber>,
    handler: Arc<dyn SessionHandler>,
    /// Peer handshake headers captured at upgrade time.
    head: HttpHead,
    cfg: FabricConfig,
    state: Mutex<SessionState>,
    /// `on_close` dispatch gate.
    finished: AtomicBool,
    /// `stop()` latch: once cancelled, sends fail and reconnect never fires.
    logged_out: CancellationToken,
    /// Cancelled when the session reaches `Closed`.
    closed: CancellationToken,
    heartbeat: Heartbeat,
    /// Topics this session is subscribed to; kept in lockstep with the
    /// registry's reverse index.
    subs: DashSet<String>,
    /// Correlated requests awaiting their reply.
    pending: DashMap<u64, oneshot::Sender<Result<String, String>>>,
    correlation: AtomicU64,
    close_hooks: Mutex<Vec<CloseHook>>,
    /// Whether the fiber is dedicated to this session (connecting side) and
    /// stops with it, or shared with other sessions (accepting side).
    owns_fiber: bool,
    attachment: OnceCell<Box<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.conn.peer())
            .field("state", &self.current_state())
            .finish()
    }
}

impl Session {
    /// Creates the session in `Open` state; called once the upgrade
    /// succeeded on either side.
    pub fn new(
        conn: Arc<Connection>,
        fiber: Arc<Fiber>,
        handler: Arc<dyn SessionHandler>,
        head: HttpHead,
        cfg: FabricConfig,
        owns_fiber: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            conn,
            fiber,
            handler,
            head,
            cfg,
            state: Mutex::new(SessionState::Open),
            finished: AtomicBool::new(false),
            logged_out: CancellationToken::new(),
            closed: CancellationToken::new(),
            heartbeat: Heartbeat::new(),
            subs: DashSet::new(),
            pending: DashMap::new(),
            correlation: AtomicU64::new(0),
            close_hooks: Mutex::new(Vec::new()),
            owns_fiber,
            attachment: OnceCell::new(),
        })
    }

    /// Posts `on_open`, starts the heartbeat and spawns the read loop.
    pub fn activate<R>(self: &Arc<Self>, rd: R, leftover: BytesMut)
    where R: AsyncRead + Unpin + Send + 'static {
        let sess = Arc::clone(self);
        let _ = self.fiber.execute(async move {
            let opened = Arc::clone(&sess);
            sess.handler.on_open(&opened, &opened.head);
        });

        self.heartbeat.start(
            &self.fiber,
            Arc::clone(&self.conn),
            self.cfg.heartbeat_interval,
        );

        let events: Arc<dyn ConnEvents> = Arc::new(SessionEvents {
            sess: Arc::clone(self),
        });
        tokio::spawn(read_loop(Arc::clone(&self.conn), rd, leftover, events));
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        self.conn.peer()
    }

    pub fn head(&self) -> &HttpHead {
        &self.head
    }

    pub fn current_state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Cancelled when the session reaches `Closed`.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Sends a text frame.
    pub fn send(&self, text: &str) -> SendResult {
        if !self.sendable() {
            return SendResult::Closed;
        }
        self.conn.send_text(text)
    }

    /// Sends a binary frame.
    pub fn send_binary(&self, data: Bytes) -> SendResult {
        if !self.sendable() {
            return SendResult::Closed;
        }
        self.conn.send_binary(data)
    }

    /// Starts the close handshake; everything sent afterwards is rejected
    /// with `Closed`.
    pub fn send_close(&self, code: u16, reason: &str) -> SendResult {
        self.heartbeat.stop();
        self.transition(SessionEvent::CloseStarted);
        let res = self.conn.send_close(code, reason);
        self.arm_close_grace();
        res
    }

    /// Stops the session: latches the logged-out flag (a pending reconnect
    /// never fires), then runs the close handshake.
    pub fn stop(&self) {
        self.logged_out.cancel();
        let _ = self.send_close(close_code::NORMAL, "");
    }

    /// True once `stop()` was called.
    pub fn is_stopped(&self) -> bool {
        self.logged_out.is_cancelled()
    }

    /// Hard stop: aborts the transport without a close handshake.
    pub fn kill_now(&self) {
        self.conn.kill_now();
    }

    /// Convenience publishers for the fabric line protocol.
    pub fn subscribe(&self, topic: &str) -> SendResult {
        self.send(&Envelope::Subscribe { topic: topic.to_string() }.to_string())
    }

    pub fn unsubscribe(&self, topic: &str) -> SendResult {
        self.send(&Envelope::Unsubscribe { topic: topic.to_string() }.to_string())
    }

    pub fn publish(&self, topic: &str, payload: &str) -> SendResult {
        self.send(
            &Envelope::Publish {
                topic: topic.to_string(),
                payload: payload.to_string(),
            }
            .to_string(),
        )
    }

    /// Replies to a correlated request received on this session.
    pub fn reply(&self, id: u64, payload: &str) -> SendResult {
        self.send(
            &Envelope::Reply {
                id,
                payload: payload.to_string(),
            }
            .to_string(),
        )
    }

    pub fn reply_error(&self, id: u64, reason: &str) -> SendResult {
        self.send(
            &Envelope::Error {
                id,
                reason: reason.to_string(),
            }
            .to_string(),
        )
    }

    /// Issues a correlated request and awaits its reply.
    pub async fn request(
        &self,
        topic: &str,
        payload: &str,
        wait: Duration,
    ) -> Result<String> {
        let id = self.correlation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let env = Envelope::Request {
            id,
            topic: topic.to_string(),
            payload: payload.to_string(),
        };
        if self.send(&env.to_string()) == SendResult::Closed {
            self.pending.remove(&id);
            bail!("session closed");
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(reason))) => bail!("request {id} failed: {reason}"),
            Ok(Err(_)) => bail!("session closed before reply to request {id}"),
            Err(_) => {
                self.pending.remove(&id);
                bail!("request {id} timed out");
            },
        }
    }

    // --- subscription set (kept in lockstep by the registry) ---

    pub(crate) fn sub_insert(&self, topic: &str) -> bool {
        self.subs.insert(topic.to_string())
    }

    pub(crate) fn sub_remove(&self, topic: &str) -> bool {
        self.subs.remove(topic).is_some()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subs.contains(topic)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subs.iter().map(|t| t.key().clone()).collect()
    }

    // --- user state ---

    /// Attaches application state; the first call wins.
    pub fn attach<T: Any + Send + Sync>(&self, value: T) -> bool {
        self.attachment.set(Box::new(value)).is_ok()
    }

    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.attachment.get().and_then(|b| b.downcast_ref())
    }

    /// Registers a hook run once with the session id when the transport
    /// ends; the broker uses this for registry cleanup.
    pub fn on_finish<H>(&self, hook: H)
    where H: FnOnce(u64) + Send + 'static {
        if self.finished.load(Ordering::SeqCst) {
            hook(self.id);
            return;
        }
        let mut hooks = lock(&self.close_hooks);
        // Re-check under the lock so a racing finish cannot strand the hook.
        if self.finished.load(Ordering::SeqCst) {
            drop(hooks);
            hook(self.id);
            return;
        }
        hooks.push(Box::new(hook));
    }

    fn sendable(&self) -> bool {
        !self.logged_out.is_cancelled()
            && self.current_state() == SessionState::Open
    }

    fn transition(&self, event: SessionEvent) {
        let mut st = lock(&self.state);
        match step(*st, event) {
            Ok(next) => *st = next,
            Err(e) => debug!(session = self.id, "{e}"),
        }
    }

    /// Kills the transport if the peer never completes the close handshake.
    fn arm_close_grace(&self) {
        let conn = Arc::clone(&self.conn);
        let _ = self
            .fiber
            .schedule(self.cfg.io_timeout, async move { conn.kill_now() });
    }

    /// Single point of teardown; safe to hit from multiple paths.
    fn finish(self: &Arc<Self>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.heartbeat.stop();
        self.transition(SessionEvent::TransportClosed);

        // Outstanding correlated requests can never complete now.
        let waiting: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in waiting {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err("session closed".to_string()));
            }
        }

        let hooks = std::mem::take(&mut *lock(&self.close_hooks));
        for hook in hooks {
            hook(self.id);
        }

        let sess = Arc::clone(self);
        let _ = self.fiber.execute(async move {
            let closing = Arc::clone(&sess);
            sess.handler.on_close(&closing);
        });
        if self.owns_fiber {
            let fiber = Arc::clone(&self.fiber);
            let _ = self.fiber.execute(async move { fiber.stop() });
        }

        self.closed.cancel();
    }

    fn dispatch_message(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::Text(text) => {
                if let Some(done) = self.try_resolve_reply(&text) {
                    if let Some(reason) = done {
                        self.handler.on_error(self, &reason);
                    }
                    return;
                }
                self.handler.on_message(self, &text);
            },
            Message::Binary(data) => self.handler.on_binary_message(self, &data),
        }
    }

    /// Intercepts `REP`/`ERR` envelopes aimed at the pending-call table.
    ///
    /// Returns `None` to deliver the message normally, `Some(None)` when a
    /// pending request consumed it, and `Some(Some(reason))` for a reply
    /// nothing was waiting for.
    fn try_resolve_reply(&self, text: &str) -> Option<Option<String>> {
        if !text.starts_with("REP ") && !text.starts_with("ERR ") {
            return None;
        }
        let env = Envelope::parse(text).ok()?;
        let (id, outcome) = match env {
            Envelope::Reply { id, payload } => (id, Ok(payload)),
            Envelope::Error { id, reason } => (id, Err(reason)),
            _ => return None,
        };
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
                Some(None)
            },
            None => Some(Some(format!("unmatched reply for correlation id {id}"))),
        }
    }
}

/// Bridges the read loop onto the session fiber.
struct SessionEvents {
    sess: Arc<Session>,
}

impl ConnEvents for SessionEvents {
    fn on_message(&self, msg: Message) {
        let sess = Arc::clone(&self.sess);
        let _ = self
            .sess
            .fiber
            .execute(async move { sess.dispatch_message(msg) });
    }

    fn on_protocol_error(&self, err: &FrameError) {
        self.sess.transition(SessionEvent::CloseStarted);
        let reason = err.to_string();
        let sess = Arc::clone(&self.sess);
        let _ = self.sess.fiber.execute(async move {
            let erring = Arc::clone(&sess);
            sess.handler.on_error(&erring, &reason);
        });
    }

    fn on_exception(&self, err: anyhow::Error) {
        warn!(session = self.sess.id, "transport error: {err}");
        let sess = Arc::clone(&self.sess);
        let _ = self.sess.fiber.execute(async move {
            let failing = Arc::clone(&sess);
            sess.handler.on_exception(&failing, &err);
        });
    }

    fn on_peer_close(&self, close: Option<(u16, String)>) {
        if let Some((code, reason)) = &close {
            debug!(session = self.sess.id, code = *code, reason = %reason, "peer close");
        }
        self.sess.transition(SessionEvent::CloseStarted);
    }

    fn on_end(&self) {
        self.sess.finish();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
