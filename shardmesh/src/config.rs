/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fleet configuration.
//!
//! Configuration is loaded from YAML with [`FleetConfig::from_yaml`], then
//! selectively overridden from the environment with
//! [`FleetConfig::apply_env`]. Every field has a default, so a document
//! only needs to name what it changes.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use shardmesh_ipc::config::override_from_env;
use shardmesh_ipc::ChannelAddr;
use shardmesh_ipc::ChannelConfig;

use crate::Error;

/// Environment override for [`FleetConfig::shard_count`].
pub const SHARD_COUNT_ENV: &str = "SHARDMESH_SHARD_COUNT";
/// Environment override for [`FleetConfig::cluster_count`].
pub const CLUSTER_COUNT_ENV: &str = "SHARDMESH_CLUSTER_COUNT";
/// Environment override for [`FleetConfig::token`].
pub const TOKEN_ENV: &str = "SHARDMESH_TOKEN";
/// Environment override for [`FleetConfig::ipc_addr`].
pub const IPC_ADDR_ENV: &str = "SHARDMESH_IPC_ADDR";

/// The total number of shards: fixed, or recommended by the session
/// endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ShardCountRepr", into = "ShardCountRepr")]
pub enum ShardCount {
    /// Ask the session endpoint.
    #[default]
    Auto,
    /// Exactly this many shards.
    Fixed(u32),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ShardCountRepr {
    Count(u32),
    Keyword(String),
}

impl TryFrom<ShardCountRepr> for ShardCount {
    type Error = anyhow::Error;

    fn try_from(repr: ShardCountRepr) -> Result<Self, Self::Error> {
        match repr {
            ShardCountRepr::Count(count) => Ok(ShardCount::Fixed(count)),
            ShardCountRepr::Keyword(keyword) => keyword.parse(),
        }
    }
}

impl From<ShardCount> for ShardCountRepr {
    fn from(count: ShardCount) -> Self {
        match count {
            ShardCount::Auto => ShardCountRepr::Keyword("auto".to_string()),
            ShardCount::Fixed(count) => ShardCountRepr::Count(count),
        }
    }
}

impl FromStr for ShardCount {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ShardCount::Auto);
        }
        s.parse::<u32>()
            .map(ShardCount::Fixed)
            .with_context(|| format!("invalid shard count {:?}: expected \"auto\" or a number", s))
    }
}

impl fmt::Display for ShardCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardCount::Auto => write!(f, "auto"),
            ShardCount::Fixed(count) => write!(f, "{}", count),
        }
    }
}

/// How workers that fail to start are retried.
///
/// The default retries forever at a constant 500ms interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Give up on a worker after this many retries. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay between retries.
    pub max_backoff_ms: u64,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff_ms: 500,
            max_backoff_ms: 500,
            multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Whether retry number `attempt` (starting at 1) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// The delay before retry number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Configuration of a fleet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// The worker executable.
    pub program: PathBuf,
    /// Arguments passed to every worker.
    pub args: Vec<String>,
    /// Extra environment passed to every worker.
    pub env: BTreeMap<String, String>,
    /// Total number of shards.
    pub shard_count: ShardCount,
    /// Number of workers. Clamped to the shard count.
    pub cluster_count: usize,
    /// Guilds per shard, used to derive the shard count from the session
    /// endpoint's recommendation and to scale readiness timeouts.
    pub guilds_per_shard: u32,
    /// Restart workers that exit.
    pub respawn: bool,
    /// Per-shard readiness timeout, at 1000 guilds per shard.
    pub ready_timeout_ms: u64,
    /// Pause after each worker becomes ready during the initial spawn.
    pub spawn_delay_ms: u64,
    /// Pause between killing and relaunching a worker on restart.
    pub respawn_delay_ms: u64,
    /// Where the IPC hub listens.
    pub ipc_addr: ChannelAddr,
    /// Bot token for the session endpoint.
    pub token: Option<String>,
    /// Base URL of the session endpoint.
    pub gateway_url: String,
    /// Allow workers and the supervisor to evaluate arbitrary scripts.
    pub eval: bool,
    /// Retry policy for workers that fail to start.
    pub retry: RetryPolicy,
    /// Transport configuration.
    pub channel: ChannelConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            shard_count: ShardCount::Auto,
            cluster_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            guilds_per_shard: 1000,
            respawn: true,
            ready_timeout_ms: 30_000,
            spawn_delay_ms: 5_000,
            respawn_delay_ms: 500,
            ipc_addr: ChannelAddr::Unix(PathBuf::from("/tmp/shardmesh.sock")),
            token: None,
            gateway_url: "https://discord.com/api/v10".to_string(),
            eval: false,
            retry: RetryPolicy::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let mut file =
            File::open(path).with_context(|| format!("opening config {}", path.display()))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_yaml_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml_str(contents: &str) -> Result<Self, anyhow::Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Apply `SHARDMESH_*` overrides, including the transport's.
    pub fn apply_env(&mut self) {
        override_from_env(SHARD_COUNT_ENV, &mut self.shard_count);
        override_from_env(CLUSTER_COUNT_ENV, &mut self.cluster_count);
        override_from_env(IPC_ADDR_ENV, &mut self.ipc_addr);
        let mut token = String::new();
        if override_from_env(TOKEN_ENV, &mut token) {
            self.token = Some(token);
        }
        self.channel.apply_env();
    }

    /// Check the configuration for values the fleet cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.program.as_os_str().is_empty() {
            return Err(Error::Config(anyhow!("no worker program given")));
        }
        if self.cluster_count == 0 {
            return Err(Error::Config(anyhow!("cluster_count must be positive")));
        }
        if self.shard_count == ShardCount::Fixed(0) {
            return Err(Error::Config(anyhow!("shard_count must be positive")));
        }
        if self.guilds_per_shard == 0 {
            return Err(Error::Config(anyhow!("guilds_per_shard must be positive")));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(Error::Config(anyhow!(
                "retry multiplier must be at least 1, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }

    /// How long a worker hosting `shards` shards is given to become ready:
    /// the per-shard timeout, times the number of shards, scaled by guilds
    /// per shard relative to 1000.
    pub fn ready_deadline(&self, shards: usize) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
            .mul_f64(shards as f64 * self.guilds_per_shard as f64 / 1000.0)
    }

    /// Spawn delay.
    pub fn spawn_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_delay_ms)
    }

    /// Respawn delay.
    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }
}
