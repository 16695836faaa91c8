// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Address and bind/connect parameters shared by server and client.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NetworkConfig {
    #[serde(rename = "Address")]
    pub address: String,
}

/// Worker-pool and session sizing.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConcurrencyConfig {
    #[serde(rename = "NumOfThreads")]
    pub num_of_threads: usize,
    #[serde(rename = "NumOfChannels")]
    pub num_of_channels: usize,
    #[serde(rename = "QueueCapacity")]
    pub queue_capacity: usize,
}

/// I/O and liveness timing, all expressed in whole seconds on the wire.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimeoutConfig {
    #[serde(rename = "ReadTimeout", with = "serde_secs")]
    pub read_timeout: Duration,
    #[serde(rename = "WriteTimeout", with = "serde_secs")]
    pub write_timeout: Duration,
    #[serde(rename = "Heartbeat", with = "serde_secs")]
    pub heartbeat: Duration,
    #[serde(rename = "HeartbeatTimeout", with = "serde_secs")]
    pub heartbeat_timeout: Duration,
}

/// Bounds guarding against pathological configuration or malicious peers.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LimitsConfig {
    #[serde(rename = "TransportLimit")]
    pub transport_limit: usize,
    #[serde(rename = "MaxCallDepth")]
    pub max_call_depth: u16,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub concurrency: ConcurrencyConfig,
    pub timeouts: TimeoutConfig,
    pub limits: LimitsConfig,
    #[serde(rename = "MaxNodeDepth")]
    pub max_node_depth: usize,
    #[serde(default, rename = "Debug")]
    pub debug: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BufferConfig {
    #[serde(rename = "ReadBufferSize")]
    pub read_buffer_size: usize,
    #[serde(rename = "WriteBufferSize")]
    pub write_buffer_size: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientConfig {
    pub network: NetworkConfig,
    pub buffers: BufferConfig,
    pub timeouts: TimeoutConfig,
    pub limits: LimitsConfig,
    #[serde(default, rename = "Debug")]
    pub debug: bool,
}

impl ServerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: ServerConfig =
            serde_yaml::from_str(&s).context("failed to parse server config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.concurrency.num_of_threads >= 1, "NumOfThreads must be >= 1");
        ensure!(self.concurrency.num_of_channels >= 1, "NumOfChannels must be >= 1");
        ensure!(self.concurrency.queue_capacity >= 1, "QueueCapacity must be >= 1");
        ensure!(
            self.limits.transport_limit >= crate::codec::HEADER_LEN,
            "TransportLimit must be able to hold at least a header"
        );
        ensure!(self.max_node_depth >= 1, "MaxNodeDepth must be >= 1");
        ensure!(self.limits.max_call_depth >= 1, "MaxCallDepth must be >= 1");
        ensure!(
            self.timeouts.heartbeat_timeout > self.timeouts.heartbeat,
            "HeartbeatTimeout must exceed Heartbeat"
        );
        Ok(())
    }
}

impl ClientConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: ClientConfig =
            serde_yaml::from_str(&s).context("failed to parse client config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.buffers.read_buffer_size >= 1, "ReadBufferSize must be >= 1");
        ensure!(self.buffers.write_buffer_size >= 1, "WriteBufferSize must be >= 1");
        ensure!(
            self.limits.transport_limit >= crate::codec::HEADER_LEN,
            "TransportLimit must be able to hold at least a header"
        );
        ensure!(self.limits.max_call_depth >= 1, "MaxCallDepth must be >= 1");
        ensure!(
            self.timeouts.heartbeat_timeout > self.timeouts.heartbeat,
            "HeartbeatTimeout must exceed Heartbeat"
        );
        Ok(())
    }
}

/// Serde helper representing a `Duration` as a whole number of seconds.
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
