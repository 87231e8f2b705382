// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Accepting side: listener loop, upgrade exchange, session wiring.
//!
//! The accept loop runs on the acceptor's own fiber. Each accepted
//! connection is round-robined onto a reader fiber, which serializes every
//! callback for the sessions assigned to it.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, tcp::{OwnedReadHalf, OwnedWriteHalf}},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    broker::{registry::Registry, router::{Resolution, Router}},
    cfg::config::Config,
    conn::{Connection, FrameWriter},
    fiber::Fiber,
    handshake::{
        HttpHead, UpgradeRequest, reject_response, upgrade_response, validate_upgrade,
    },
    models::codec::Role,
    session::Session,
    utils::Entropy,
};

/// Everything an accepted connection needs to become a session.
pub(crate) struct AcceptCtx {
    pub router: Router,
    pub registry: Arc<Registry>,
    pub fibers: Vec<Arc<Fiber>>,
    pub cfg: Config,
    pub entropy: Arc<Entropy>,
}

pub(crate) async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<AcceptCtx>,
    shutdown: CancellationToken,
) {
    let mut next = 0usize;
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let fiber = Arc::clone(&ctx.fibers[next % ctx.fibers.len()]);
                next = next.wrapping_add(1);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_accept(stream, fiber, ctx).await {
                        warn!(%peer, "accept failed: {e:#}");
                    }
                });
            },
            Err(e) => {
                // Transient accept errors (EMFILE and friends); keep serving.
                warn!("accept error: {e}");
            },
        }
    }
    debug!("accept loop exited");
}

async fn handle_accept(
    stream: TcpStream,
    fiber: Arc<Fiber>,
    ctx: Arc<AcceptCtx>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (mut rd, mut wr) = stream.into_split();

    let (head, leftover) = read_request_head(&mut rd, &ctx.cfg).await?;

    let upgrade = match validate_upgrade(head) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            reject(&mut wr, 400, "Bad Request").await;
            bail!("invalid upgrade from {peer}: {e}");
        },
    };

    let route = match ctx.router.resolve(&upgrade) {
        Resolution::Matched(route) => route,
        Resolution::Denied => {
            reject(&mut wr, 403, "Forbidden").await;
            bail!("upgrade denied for {peer} on {}", upgrade.path);
        },
        Resolution::NotFound => {
            reject(&mut wr, 404, "Not Found").await;
            bail!("no route for {peer} on {}", upgrade.path);
        },
    };

    wr.write_all(upgrade_response(&upgrade.key).as_bytes())
        .await
        .context("failed to write 101")?;

    let session = build_session(
        rd,
        wr,
        leftover,
        upgrade,
        route.handler(),
        fiber,
        peer.clone(),
        &ctx,
    );
    info!(session = session.id(), %peer, "session open");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_session(
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
    leftover: BytesMut,
    upgrade: UpgradeRequest,
    handler: Arc<dyn crate::session::handler::SessionHandler>,
    fiber: Arc<Fiber>,
    peer: String,
    ctx: &AcceptCtx,
) -> Arc<Session> {
    let kill = CancellationToken::new();
    let writer = FrameWriter::spawn(
        wr,
        ctx.cfg.fabric.writer_high_water,
        ctx.cfg.fabric.io_timeout,
        kill.clone(),
    );
    let conn = Connection::new(
        writer,
        Role::Server,
        peer,
        ctx.cfg.fabric.clone(),
        Arc::clone(&ctx.entropy),
        kill,
    );

    let session = Session::new(
        conn,
        fiber,
        handler,
        upgrade.head,
        ctx.cfg.fabric.clone(),
        /* owns_fiber */ false,
    );

    let registry = Arc::clone(&ctx.registry);
    session.on_finish(move |id| registry.remove_session(id));
    ctx.registry.insert_session(Arc::clone(&session));

    session.activate(rd, leftover);
    session
}

async fn read_request_head(
    rd: &mut OwnedReadHalf,
    cfg: &Config,
) -> Result<(HttpHead, BytesMut)> {
    let mut buf = BytesMut::with_capacity(cfg.fabric.read_buffer_size);
    loop {
        if let Some((head, used)) = HttpHead::parse(&buf, "request")? {
            buf.advance(used);
            return Ok((head, buf));
        }
        let n = tokio::time::timeout(cfg.fabric.io_timeout, rd.read_buf(&mut buf))
            .await
            .context("handshake read timeout")??;
        if n == 0 {
            bail!("eof before upgrade request");
        }
    }
}

async fn reject(wr: &mut OwnedWriteHalf, status: u16, reason: &str) {
    let _ = wr.write_all(reject_response(status, reason).as_bytes()).await;
    let _ = wr.shutdown().await;
}
