// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::mpsc, time::{Instant, sleep}};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    broker::{
        acceptor::{AcceptCtx, accept_loop},
        fabric::{FabricHandler, RequestResponder},
        registry::{Registry, RegistryEvent},
        router::Router,
    },
    cfg::config::Config,
    fiber::Fiber,
    models::frame::close_code,
    utils::Entropy,
};

pub mod acceptor;
pub mod fabric;
pub mod registry;
pub mod router;

/// A running broker: listener, reader fiber pool, registry.
pub struct Broker {
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    fibers: Vec<Arc<Fiber>>,
    acceptor_fiber: Arc<Fiber>,
    shutdown: CancellationToken,
    cfg: Config,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.registry.session_count())
            .finish()
    }
}

impl Broker {
    /// Binds the listener and starts accepting with the given route table.
    /// The second return value observes subscription traffic.
    pub async fn bind(
        cfg: Config,
        router: Router,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RegistryEvent>)> {
        let (registry, events) = Registry::create();
        let broker = Self::bind_with_registry(cfg, router, registry).await?;
        Ok((broker, events))
    }

    /// Binds a broker whose single route carries the stock fabric handler
    /// on `path`.
    pub async fn bind_fabric(
        cfg: Config,
        path: &str,
        responder: Arc<dyn RequestResponder>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RegistryEvent>)> {
        let (registry, events) = Registry::create();
        let handler = Arc::new(FabricHandler::new(Arc::clone(&registry), responder));

        let mut router = Router::new();
        router.add_path(path, handler);

        let broker = Self::bind_with_registry(cfg, router, registry).await?;
        Ok((broker, events))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn request_timeout(&self) -> Duration {
        self.cfg.broker.request_timeout
    }

    /// Graceful shutdown: stop accepting, close every session with 1001,
    /// wait for the registry to drain, then hard-stop what remains.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        for session in self.registry.sessions() {
            let _ = session.send_close(close_code::GOING_AWAY, "shutting down");
        }

        let deadline = Instant::now() + self.cfg.fabric.io_timeout;
        while self.registry.session_count() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        for session in self.registry.sessions() {
            session.kill_now();
        }

        self.acceptor_fiber.stop();
        for fiber in &self.fibers {
            fiber.stop();
        }
        info!("broker stopped");
    }

    async fn bind_with_registry(
        cfg: Config,
        router: Router,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&cfg.broker.listen)
            .await
            .with_context(|| format!("failed to bind {}", cfg.broker.listen))?;
        let local_addr = listener.local_addr()?;

        let fibers: Vec<Arc<Fiber>> = (0..cfg.broker.reader_fibers)
            .map(|i| Fiber::spawn(format!("reader-{i}")))
            .collect();
        let acceptor_fiber = Fiber::spawn("acceptor");
        let shutdown = CancellationToken::new();
        let entropy = Arc::new(Entropy::new(cfg.fabric.rng_seed));

        let ctx = Arc::new(AcceptCtx {
            router,
            registry: Arc::clone(&registry),
            fibers: fibers.clone(),
            cfg: cfg.clone(),
            entropy,
        });

        acceptor_fiber
            .execute(accept_loop(listener, ctx, shutdown.clone()))
            .ok()
            .context("acceptor fiber rejected the accept loop")?;
        info!(%local_addr, "broker listening");

        Ok(Self {
            local_addr,
            registry,
            fibers,
            acceptor_fiber,
            shutdown,
            cfg,
        })
    }
}
