// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{cfg::enums::YesNo, models::opcode::MAX_CONTROL_PAYLOAD};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Knobs shared by every connection regardless of side.
    pub fabric: FabricConfig,
    /// Connecting-side behaviour (connect timeout, reconnect policy).
    pub client: ClientConfig,
    /// Accepting-side behaviour (listen address, reader fiber pool).
    pub broker: BrokerConfig,
}

/// Per-connection limits and timers.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FabricConfig {
    #[serde(rename = "ReadBufferSize")]
    /// Initial capacity of the per-connection read buffer.
    pub read_buffer_size: usize,

    #[serde(rename = "MaxFramePayload")]
    /// Largest single-frame payload accepted before closing with 1009.
    pub max_frame_payload: usize,

    #[serde(rename = "MaxMessageSize")]
    /// Largest reassembled message accepted before closing with 1009.
    pub max_message_size: usize,

    #[serde(rename = "MaxFramesPerRead")]
    /// Frames decoded from one buffer fill before the read loop yields.
    pub max_frames_per_read: usize,

    #[serde(rename = "WriterHighWater")]
    /// Soft limit on buffered outbound bytes; exceeding it is terminal for
    /// the connection.
    pub writer_high_water: usize,

    #[serde(rename = "HeartbeatInterval", with = "serde_secs")]
    /// Fixed delay between heartbeat pings; zero disables the scheduler.
    pub heartbeat_interval: Duration,

    #[serde(rename = "IdleReadTimeout", with = "serde_secs")]
    /// Close the session when no bytes arrive for this long; zero disables.
    pub idle_read_timeout: Duration,

    #[serde(rename = "IoTimeout", with = "serde_secs")]
    /// Upper bound on a single blocked socket write.
    pub io_timeout: Duration,

    #[serde(rename = "RngSeed", default, skip_serializing_if = "Option::is_none")]
    /// Seed for masking keys and handshake nonces; unset means OS entropy.
    pub rng_seed: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientConfig {
    #[serde(rename = "ConnectTimeout", with = "serde_secs")]
    /// Timeout for establishing the TCP connection and the upgrade.
    pub connect_timeout: Duration,

    #[serde(rename = "Reconnect")]
    /// Whether a dropped session schedules a new connect.
    pub reconnect: YesNo,

    #[serde(rename = "ReconnectDelay", with = "serde_secs")]
    /// Delay before the scheduled reconnect fires.
    pub reconnect_delay: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BrokerConfig {
    #[serde(rename = "Listen")]
    /// Listen address, e.g. `127.0.0.1:9100`.
    pub listen: String,

    #[serde(rename = "ReaderFibers")]
    /// Number of reader fibers accepted connections are round-robined over.
    pub reader_fibers: usize,

    #[serde(rename = "RequestTimeout", with = "serde_secs")]
    /// How long a correlated request waits for its reply.
    pub request_timeout: Duration,
}

/// Environment variable consulted when no config path is given explicitly.
pub const CONFIG_ENV: &str = "WS_FABRIC_CONFIG";

impl Config {
    /// Finds and loads the configuration: an explicit path wins, then
    /// [`CONFIG_ENV`], then `config.yaml` in the working directory.
    pub fn discover(explicit: Option<&str>) -> Result<Self> {
        let candidate = match explicit {
            Some(path) => PathBuf::from(path),
            None => match env::var_os(CONFIG_ENV) {
                Some(path) => PathBuf::from(path),
                None => PathBuf::from("config.yaml"),
            },
        };
        let path = candidate
            .canonicalize()
            .with_context(|| format!("config file not found: {candidate:?}"))?;
        Self::load_from_file(path)
    }

    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.fabric.max_frame_payload > MAX_CONTROL_PAYLOAD,
            "MaxFramePayload must exceed the control-frame limit"
        );
        ensure!(
            self.fabric.max_message_size >= self.fabric.max_frame_payload,
            "MaxMessageSize must be >= MaxFramePayload"
        );
        ensure!(
            self.fabric.read_buffer_size > 0,
            "ReadBufferSize must be > 0"
        );
        if self.fabric.max_frames_per_read == 0 {
            self.fabric.max_frames_per_read = 1;
        }
        ensure!(
            self.fabric.writer_high_water > self.fabric.max_frame_payload,
            "WriterHighWater must exceed MaxFramePayload"
        );
        ensure!(
            self.fabric.io_timeout > Duration::ZERO,
            "IoTimeout must be > 0"
        );
        ensure!(
            self.client.connect_timeout > Duration::ZERO,
            "ConnectTimeout must be > 0"
        );
        ensure!(self.broker.reader_fibers >= 1, "ReaderFibers must be >= 1");
        ensure!(
            self.broker.request_timeout > Duration::ZERO,
            "RequestTimeout must be > 0"
        );
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fabric: FabricConfig {
                read_buffer_size: 8 * 1024,
                max_frame_payload: 1024 * 1024,
                max_message_size: 4 * 1024 * 1024,
                max_frames_per_read: 16,
                writer_high_water: 8 * 1024 * 1024,
                heartbeat_interval: Duration::from_secs(30),
                idle_read_timeout: Duration::from_secs(90),
                io_timeout: Duration::from_secs(10),
                rng_seed: None,
            },
            client: ClientConfig {
                connect_timeout: Duration::from_secs(10),
                reconnect: YesNo::No,
                reconnect_delay: Duration::from_secs(5),
            },
            broker: BrokerConfig {
                listen: "127.0.0.1:9100".to_string(),
                reader_fibers: 4,
                request_timeout: Duration::from_secs(10),
            },
        }
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
