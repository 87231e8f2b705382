// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use once_cell::sync::OnceCell;

use crate::{conn::Connection, fiber::{Fiber, TimerHandle}};

/// Periodic ping scheduler for one session.
///
/// Pings ride the data lane of the send fiber, so a heartbeat enqueued
/// before a publish is transmitted before it. Once the writer starts
/// closing, the scheduled task becomes a no-op. `stop` is gated by a
/// compare-and-set so the underlying timer cancel is dispatched exactly
/// once no matter how many times it is called.
pub struct Heartbeat {
    stopped: AtomicBool,
    handle: OnceCell<TimerHandle>,
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .field("started", &self.handle.get().is_some())
            .finish()
    }
}

impl Heartbeat {
    /// Created inert; `start` arms it.
    pub fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            handle: OnceCell::new(),
        }
    }

    /// Schedules the fixed-delay ping task. A zero interval disables the
    /// heartbeat entirely.
    pub fn start(&self, fiber: &Arc<Fiber>, conn: Arc<Connection>, interval: Duration) {
        if interval.is_zero() || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let handle = fiber.schedule_with_fixed_delay(interval, interval, move || {
            let conn = Arc::clone(&conn);
            async move {
                if conn.is_closing() {
                    return;
                }
                let _ = conn.send_ping(Bytes::new());
            }
        });
        if let Err(extra) = self.handle.set(handle) {
            // Second start; the new timer must not leak.
            tracing::debug!("heartbeat already started");
            extra.cancel();
        } else if self.stopped.load(Ordering::SeqCst) {
            // A racing stop may have missed the handle; re-issue the cancel
            // (cancelling twice is a no-op).
            if let Some(h) = self.handle.get() {
                h.cancel();
            }
        }
    }

    /// Idempotent; dispatches the timer cancel exactly once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.get() {
            handle.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}
