// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use ws_fabric_rs::{
    broker::{Broker, fabric::EchoResponder},
    cfg::{config::Config, logger::init_logger},
};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_logger("config_logger.yaml")?;

    let explicit = std::env::args().nth(1);
    let cfg = Config::discover(explicit.as_deref())
        .context("failed to resolve or load config")?;

    let (broker, mut events) =
        Broker::bind_fabric(cfg, "/fabric", Arc::new(EchoResponder)).await?;
    info!(addr = %broker.local_addr(), "fabric broker up");

    // Surface subscription traffic for operators until we are told to stop.
    let observer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(?event, "registry");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    broker.shutdown().await;
    observer.abort();

    Ok(())
}
