// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connecting-side facade: dial, upgrade, run, reconnect.

use std::{sync::{Arc, Mutex}, time::Duration};

use anyhow::{Context, Result, bail};
use bytes::{Buf, Bytes, BytesMut};
use tokio::{io::AsyncReadExt, net::TcpStream, time::{Instant, sleep, timeout}};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    conn::{Connection, FrameWriter, SendResult, io_with_timeout},
    fiber::Fiber,
    handshake::{HttpHead, upgrade_request, validate_upgrade_response},
    models::codec::Role,
    session::{
        Session,
        handler::SessionHandler,
        state::{SessionEvent, SessionState, step},
    },
    utils::Entropy,
};

/// Handle returned by [`open`]; stays valid across reconnects.
pub struct ClientHandle {
    current: Mutex<Option<Arc<Session>>>,
    stopped: CancellationToken,
}

/// Dials `host:port`, upgrades on `path` and hands the session to
/// `handler`. Returns immediately; the connect runs in the background and
/// retries per the reconnect policy until [`ClientHandle::stop`] latches.
pub fn open(
    host: &str,
    port: u16,
    path: &str,
    cfg: Config,
    handler: Arc<dyn SessionHandler>,
) -> Arc<ClientHandle> {
    let handle = Arc::new(ClientHandle {
        current: Mutex::new(None),
        stopped: CancellationToken::new(),
    });

    let entropy = Arc::new(Entropy::new(cfg.fabric.rng_seed));
    let host = host.to_string();
    let path = path.to_string();
    let conn_handle = Arc::clone(&handle);

    tokio::spawn(async move {
        loop {
            if conn_handle.stopped.is_cancelled() {
                break;
            }

            match connect_once(&host, port, &path, &cfg, &entropy, Arc::clone(&handler))
                .await
            {
                Ok(session) => {
                    set_current(&conn_handle, Some(Arc::clone(&session)));
                    let closed = session.closed_token();
                    tokio::select! {
                        _ = conn_handle.stopped.cancelled() => {
                            session.stop();
                            // Give the close handshake a moment to drain.
                            let _ = timeout(
                                cfg.fabric.io_timeout,
                                closed.cancelled(),
                            )
                            .await;
                        },
                        _ = closed.cancelled() => {},
                    }
                    set_current(&conn_handle, None);
                    // stop() latched directly on the session also disables
                    // the reconnect.
                    if session.is_stopped() {
                        break;
                    }
                },
                Err(e) => warn!("connect to {host}:{port} failed: {e:#}"),
            }

            if conn_handle.stopped.is_cancelled() || !cfg.client.reconnect.as_bool() {
                break;
            }
            debug!(
                delay = ?cfg.client.reconnect_delay,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = conn_handle.stopped.cancelled() => break,
                _ = sleep(cfg.client.reconnect_delay) => {},
            }
        }
        debug!("connector for {host}:{port} exited");
    });

    handle
}

impl ClientHandle {
    /// The currently open session, if any.
    pub fn session(&self) -> Option<Arc<Session>> {
        match self.current.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn send(&self, text: &str) -> SendResult {
        match self.session() {
            Some(s) => s.send(text),
            None => SendResult::Closed,
        }
    }

    pub fn send_binary(&self, data: Bytes) -> SendResult {
        match self.session() {
            Some(s) => s.send_binary(data),
            None => SendResult::Closed,
        }
    }

    /// Starts the close handshake on the current session without disabling
    /// the reconnect policy.
    pub fn send_close(&self) -> SendResult {
        match self.session() {
            Some(s) => s.send_close(crate::models::frame::close_code::NORMAL, ""),
            None => SendResult::Closed,
        }
    }

    /// Issues a correlated request on the current session.
    pub async fn request(
        &self,
        topic: &str,
        payload: &str,
        wait: Duration,
    ) -> Result<String> {
        let session = self.session().context("not connected")?;
        session.request(topic, payload, wait).await
    }

    /// Stops the connector for good: the current session closes and no
    /// reconnect ever fires, even one already scheduled.
    pub fn stop(&self) {
        self.stopped.cancel();
        if let Some(s) = self.session() {
            s.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Waits until a session is open, polling; connectors race the caller
    /// in tests and short scripts.
    pub async fn wait_open(&self, wait: Duration) -> Result<Arc<Session>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(s) = self.session()
                && s.current_state() == SessionState::Open
            {
                return Ok(s);
            }
            if Instant::now() >= deadline {
                bail!("no open session after {wait:?}");
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
}

fn set_current(handle: &ClientHandle, session: Option<Arc<Session>>) {
    match handle.current.lock() {
        Ok(mut g) => *g = session,
        Err(poisoned) => *poisoned.into_inner() = session,
    }
}

/// One connect attempt: TCP, upgrade, session activation.
async fn connect_once(
    host: &str,
    port: u16,
    path: &str,
    cfg: &Config,
    entropy: &Arc<Entropy>,
    handler: Arc<dyn SessionHandler>,
) -> Result<Arc<Session>> {
    let mut st = SessionState::NotConnected;
    st = step(st, SessionEvent::ConnectStarted)?;

    let addr = format!("{host}:{port}");
    let stream = timeout(cfg.client.connect_timeout, TcpStream::connect(&addr))
        .await
        .context("connect timeout")?
        .context("connect failed")?;
    stream.set_nodelay(true)?;
    st = step(st, SessionEvent::TcpEstablished)?;

    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| addr.clone());
    let (mut rd, wr) = stream.into_split();

    let kill = CancellationToken::new();
    let writer = FrameWriter::spawn(
        wr,
        cfg.fabric.writer_high_water,
        cfg.fabric.io_timeout,
        kill.clone(),
    );
    let conn = Connection::new(
        writer,
        Role::Client,
        peer,
        cfg.fabric.clone(),
        Arc::clone(entropy),
        kill.clone(),
    );

    let key = entropy.ws_key();
    if conn.send_raw(Bytes::from(upgrade_request(&addr, path, &key)))
        == SendResult::Closed
    {
        bail!("transport closed before upgrade request");
    }

    let mut buf = BytesMut::with_capacity(cfg.fabric.read_buffer_size);
    let head = loop {
        if let Some((head, used)) = HttpHead::parse(&buf, "status")? {
            buf.advance(used);
            break head;
        }
        let n = io_with_timeout(
            "read upgrade response",
            rd.read_buf(&mut buf),
            cfg.client.connect_timeout,
            &kill,
        )
        .await?;
        if n == 0 {
            kill.cancel();
            bail!("eof during upgrade");
        }
    };

    if let Err(e) = validate_upgrade_response(&head, &key) {
        kill.cancel();
        return Err(e.into());
    }
    let _open = step(st, SessionEvent::UpgradeAccepted)?;

    let fiber = Fiber::spawn(format!("client-{addr}"));
    let session = Session::new(
        conn,
        fiber,
        handler,
        head,
        cfg.fabric.clone(),
        /* owns_fiber */ true,
    );
    session.activate(rd, buf);
    Ok(session)
}
