// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use crate::{handshake::HttpHead, session::Session};

/// Application callbacks for one session.
///
/// All callbacks run on the session's fiber, in posting order: `on_open`
/// first, then message/error callbacks in wire order, then `on_close`
/// exactly once. Callbacks are synchronous; long-running work belongs on a
/// task the handler spawns itself. A panic inside a callback is contained
/// by the fiber and does not tear down the session.
pub trait SessionHandler: Send + Sync + 'static {
    /// The upgrade completed; `head` carries the peer's handshake headers.
    fn on_open(&self, _session: &Arc<Session>, _head: &HttpHead) {}

    /// A complete (reassembled) text message.
    fn on_message(&self, _session: &Arc<Session>, _text: &str) {}

    /// A complete (reassembled) binary message.
    fn on_binary_message(&self, _session: &Arc<Session>, _data: &[u8]) {}

    /// The session reached `Closed`. Fired exactly once.
    fn on_close(&self, _session: &Arc<Session>) {}

    /// A protocol-level problem (the close with the matching RFC code is
    /// already on its way out), or an unmatched correlated reply.
    fn on_error(&self, _session: &Arc<Session>, _reason: &str) {}

    /// A transport failure; the session transitions to `Closed` next.
    fn on_exception(&self, _session: &Arc<Session>, _error: &anyhow::Error) {}
}

/// Handler that ignores everything; useful as a default and in tests.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl SessionHandler for NoopHandler {}
