/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Transport configuration.
//!
//! Defaults may be overridden from the environment with [`ChannelConfig::from_env`],
//! or embedded in a larger serde-deserialized configuration.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Environment override for [`ChannelConfig::request_timeout`].
pub const REQUEST_TIMEOUT_ENV: &str = "SHARDMESH_IPC_REQUEST_TIMEOUT_MS";
/// Environment override for [`ChannelConfig::connect_timeout`].
pub const CONNECT_TIMEOUT_ENV: &str = "SHARDMESH_IPC_CONNECT_TIMEOUT_MS";
/// Environment override for [`ChannelConfig::handshake_timeout`].
pub const HANDSHAKE_TIMEOUT_ENV: &str = "SHARDMESH_IPC_HANDSHAKE_TIMEOUT_MS";
/// Environment override for [`ChannelConfig::max_frame_length`].
pub const MAX_FRAME_LENGTH_ENV: &str = "SHARDMESH_IPC_MAX_FRAME_LENGTH";

/// Timeouts and limits for hub and peer connections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// How long a request waits for its reply.
    pub request_timeout_ms: u64,
    /// How long a peer waits to establish its connection.
    pub connect_timeout_ms: u64,
    /// How long the hub waits for a new connection to introduce itself.
    pub handshake_timeout_ms: u64,
    /// Frames longer than this are rejected and close the connection.
    pub max_frame_length: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            max_frame_length: 8 * 1024 * 1024,
        }
    }
}

impl ChannelConfig {
    /// Defaults, overridden by any `SHARDMESH_IPC_*` variables set in the
    /// environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `SHARDMESH_IPC_*` overrides on top of this configuration.
    /// Unparsable values are logged and ignored.
    pub fn apply_env(&mut self) {
        override_from_env(REQUEST_TIMEOUT_ENV, &mut self.request_timeout_ms);
        override_from_env(CONNECT_TIMEOUT_ENV, &mut self.connect_timeout_ms);
        override_from_env(HANDSHAKE_TIMEOUT_ENV, &mut self.handshake_timeout_ms);
        override_from_env(MAX_FRAME_LENGTH_ENV, &mut self.max_frame_length);
    }

    /// Request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Replace `slot` with the parsed value of the environment variable `key`,
/// if it is set and parses. Returns whether the slot was replaced.
pub fn override_from_env<T>(key: &str, slot: &mut T) -> bool
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Ok(val) = env::var(key) else {
        return false;
    };
    match val.parse::<T>() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(err) => {
            tracing::warn!("ignoring {}={:?}: {}", key, val, err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_frame_length, 8 * 1024 * 1024);
    }

    #[test]
    fn test_override_from_env() {
        let key = "SHARDMESH_IPC_TEST_OVERRIDE_FROM_ENV";
        let mut slot = 7u64;

        assert!(!override_from_env(key, &mut slot));
        assert_eq!(slot, 7);

        env::set_var(key, "not a number");
        assert!(!override_from_env(key, &mut slot));
        assert_eq!(slot, 7);

        env::set_var(key, "1500");
        assert!(override_from_env(key, &mut slot));
        assert_eq!(slot, 1500);

        env::remove_var(key);
    }

    #[test]
    fn test_partial_document() {
        let config: ChannelConfig =
            serde_json::from_str(r#"{"request_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }
}
