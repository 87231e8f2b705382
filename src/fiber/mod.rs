// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Serializing execution domains ("fibers").
//!
//! A fiber owns an unbounded FIFO of tasks and a driver that runs them to
//! completion one at a time, in posting order, on the shared runtime worker
//! pool. All handler callbacks, state transitions and timers for a session
//! go through its fiber, so handler code never races with itself.
//!
//! Timers fire by enqueuing onto the fiber queue, which keeps them ordered
//! with respect to ordinary tasks. Cancel handles are idempotent; cancelling
//! after the timer fired or after the fiber stopped is a no-op.

use std::{
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type StopHook = Box<dyn FnOnce() + Send + 'static>;

/// Posting to a fiber whose driver has stopped.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("fiber is stopped")]
pub struct FiberClosed;

/// Idempotent cancel handle returned by the scheduling methods.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancel: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A single-consumer serializing executor backed by the runtime worker pool.
pub struct Fiber {
    name: String,
    tx: mpsc::UnboundedSender<Task>,
    stopped: CancellationToken,
    hooks: Mutex<Vec<StopHook>>,
    hooks_run: AtomicBool,
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &self.name)
            .field("stopped", &self.stopped.is_cancelled())
            .finish()
    }
}

impl Fiber {
    /// Creates the fiber and spawns its driver.
    pub fn spawn(name: impl Into<String>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let fiber = Arc::new(Self {
            name: name.into(),
            tx,
            stopped: CancellationToken::new(),
            hooks: Mutex::new(Vec::new()),
            hooks_run: AtomicBool::new(false),
        });

        let driver = Arc::clone(&fiber);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = driver.stopped.cancelled() => break,
                    task = rx.recv() => match task {
                        // Run each task on its own join handle so a panic in
                        // handler code is contained instead of killing the
                        // driver; serialization is preserved by awaiting it.
                        Some(task) => match tokio::spawn(task).await {
                            Ok(()) => {},
                            Err(e) if e.is_panic() => {
                                tracing::error!(
                                    fiber = %driver.name,
                                    "task panicked: {e}"
                                );
                            },
                            Err(_) => {},
                        },
                        None => break,
                    },
                }
            }
            debug!(fiber = %driver.name, "fiber driver exited");
            driver.run_stop_hooks();
        });

        fiber
    }

    /// Enqueues a task; tasks run in posting order, one at a time.
    pub fn execute<F>(&self, fut: F) -> Result<(), FiberClosed>
    where F: Future<Output = ()> + Send + 'static {
        if self.stopped.is_cancelled() {
            return Err(FiberClosed);
        }
        self.tx.send(Box::pin(fut)).map_err(|_| FiberClosed)
    }

    /// Runs `fut` on the fiber after `delay`.
    pub fn schedule<F>(self: &Arc<Self>, delay: Duration, fut: F) -> TimerHandle
    where F: Future<Output = ()> + Send + 'static {
        let cancel = self.stopped.child_token();
        let token = cancel.clone();
        let fiber = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {},
                _ = sleep(delay) => {
                    // Dropped silently when the fiber stopped in the meantime.
                    let _ = fiber.execute(fut);
                },
            }
        });
        TimerHandle { cancel }
    }

    /// Repeats `make()` on the fiber; each period starts only after the
    /// previous run completed (fixed delay, not fixed rate).
    pub fn schedule_with_fixed_delay<M, F>(
        self: &Arc<Self>,
        initial: Duration,
        period: Duration,
        mut make: M,
    ) -> TimerHandle
    where
        M: FnMut() -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.stopped.child_token();
        let token = cancel.clone();
        let fiber = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(initial) => {},
            }
            loop {
                let (done_tx, done_rx) = oneshot::channel::<()>();
                let run = make();
                let posted = fiber.execute(async move {
                    run.await;
                    let _ = done_tx.send(());
                });
                if posted.is_err() {
                    return;
                }
                // A dropped ack means the queue was discarded at stop.
                if done_rx.await.is_err() {
                    return;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep(period) => {},
                }
            }
        });
        TimerHandle { cancel }
    }

    /// Registers a hook that runs exactly once when the fiber stops. A hook
    /// registered after the stop runs immediately.
    pub fn on_stop<H>(&self, hook: H)
    where H: FnOnce() + Send + 'static {
        if self.hooks_run.load(Ordering::Acquire) {
            hook();
            return;
        }
        let mut hooks = match self.hooks.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Re-check under the lock so a racing stop cannot strand the hook.
        if self.hooks_run.load(Ordering::Acquire) {
            drop(hooks);
            hook();
            return;
        }
        hooks.push(Box::new(hook));
    }

    /// Stops the driver after the task currently running, discards queued
    /// tasks and pending timers, and fires the stop hooks.
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn run_stop_hooks(&self) {
        if self.hooks_run.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = {
            let mut guard = match self.hooks.lock() {
                Ok(h) => h,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for hook in hooks {
            hook();
        }
    }
}
