/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Worker-side startup. The supervisor describes each worker's place in
//! the fleet through environment variables; [`bootstrap`] reads them and
//! connects the worker to the supervisor's hub.

use std::env;
use std::sync::Arc;

use shardmesh_ipc::ChannelAddr;
use shardmesh_ipc::ChannelConfig;

use crate::ClusterClient;
use crate::ClusterId;
use crate::Error;
use crate::Evaluator;

pub const CLUSTER_ID_ENV: &str = "SHARDMESH_CLUSTER_ID";
/// Comma-separated shard ids hosted by the worker.
pub const CLUSTER_SHARDS_ENV: &str = "SHARDMESH_CLUSTER_SHARDS";
pub const TOTAL_SHARDS_ENV: &str = "SHARDMESH_TOTAL_SHARDS";
pub const TOTAL_CLUSTERS_ENV: &str = "SHARDMESH_TOTAL_CLUSTERS";
pub const HUB_ADDR_ENV: &str = "SHARDMESH_HUB_ADDR";
/// Set to `1` when script evaluation is enabled.
pub const EVAL_ENV: &str = "SHARDMESH_EVAL";

/// Errors reading a worker's bootstrap environment.
#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    #[error("{0} is not set; was this process launched by a shardmesh supervisor?")]
    Missing(&'static str),
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// A worker's place in the fleet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub cluster_id: ClusterId,
    /// The shards this worker hosts, ascending.
    pub shards: Vec<u32>,
    /// Shards across the whole fleet.
    pub total_shards: u32,
    /// Workers in the fleet.
    pub total_clusters: usize,
    pub hub_addr: ChannelAddr,
    pub eval: bool,
}

impl BootstrapConfig {
    /// The environment that conveys this configuration to a worker.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let shards = self
            .shards
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        vec![
            (CLUSTER_ID_ENV, self.cluster_id.to_string()),
            (CLUSTER_SHARDS_ENV, shards),
            (TOTAL_SHARDS_ENV, self.total_shards.to_string()),
            (TOTAL_CLUSTERS_ENV, self.total_clusters.to_string()),
            (HUB_ADDR_ENV, self.hub_addr.to_string()),
            (EVAL_ENV, if self.eval { "1" } else { "0" }.to_string()),
        ]
    }

    /// Read the configuration from this process's environment.
    pub fn from_env() -> Result<Self, BootstrapError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read the configuration through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BootstrapError> {
        let get = |key: &'static str| lookup(key).ok_or(BootstrapError::Missing(key));
        let invalid = |key: &'static str, value: &str, reason: String| BootstrapError::Invalid {
            key,
            value: value.to_string(),
            reason,
        };

        let cluster_id = get(CLUSTER_ID_ENV)?;
        let cluster_id = cluster_id
            .parse()
            .map_err(|err| invalid(CLUSTER_ID_ENV, &cluster_id, format!("{}", err)))?;

        let shards_value = get(CLUSTER_SHARDS_ENV)?;
        let shards = shards_value
            .split(',')
            .map(|shard| shard.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| invalid(CLUSTER_SHARDS_ENV, &shards_value, format!("{}", err)))?;

        let total_shards = get(TOTAL_SHARDS_ENV)?;
        let total_shards = total_shards
            .parse()
            .map_err(|err| invalid(TOTAL_SHARDS_ENV, &total_shards, format!("{}", err)))?;

        let total_clusters = get(TOTAL_CLUSTERS_ENV)?;
        let total_clusters = total_clusters
            .parse()
            .map_err(|err| invalid(TOTAL_CLUSTERS_ENV, &total_clusters, format!("{}", err)))?;

        let hub_addr = get(HUB_ADDR_ENV)?;
        let hub_addr = hub_addr
            .parse()
            .map_err(|err| invalid(HUB_ADDR_ENV, &hub_addr, format!("{}", err)))?;

        let eval = matches!(lookup(EVAL_ENV).as_deref(), Some("1" | "true"));

        Ok(Self {
            cluster_id,
            shards,
            total_shards,
            total_clusters,
            hub_addr,
            eval,
        })
    }
}

/// Connect this worker to its supervisor. `make_evaluator` builds the
/// evaluator that serves the supervisor's evaluation requests, given the
/// worker's place in the fleet.
pub async fn bootstrap<F>(make_evaluator: F) -> Result<ClusterClient, Error>
where
    F: FnOnce(&BootstrapConfig) -> Arc<dyn Evaluator>,
{
    let config = BootstrapConfig::from_env()?;
    let evaluator = make_evaluator(&config);
    tracing::info!(
        "cluster {} bootstrapping shards {:?} against {}",
        config.cluster_id,
        config.shards,
        config.hub_addr
    );
    ClusterClient::connect(config, ChannelConfig::from_env(), evaluator).await
}

/// Like [`bootstrap`], but exit the process on failure. The process also
/// exits if its connection to the supervisor is later lost, so workers do
/// not outlive their supervisor.
pub async fn bootstrap_or_die<F>(make_evaluator: F) -> ClusterClient
where
    F: FnOnce(&BootstrapConfig) -> Arc<dyn Evaluator>,
{
    let client = match bootstrap(make_evaluator).await {
        Ok(client) => client,
        Err(err) => {
            tracing::error!("failed to bootstrap worker: {}", err);
            std::process::exit(1);
        }
    };
    tokio::spawn({
        let peer = client.peer().clone();
        async move {
            peer.closed().await;
            tracing::error!(
                "lost connection to the supervisor at {}, exiting",
                peer.hub_addr()
            );
            std::process::exit(1);
        }
    });
    client
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::*;

    fn config() -> BootstrapConfig {
        BootstrapConfig {
            cluster_id: 2,
            shards: vec![7, 8, 9],
            total_shards: 10,
            total_clusters: 3,
            hub_addr: ChannelAddr::Unix(PathBuf::from("/tmp/hub.sock")),
            eval: true,
        }
    }

    #[test]
    fn test_env_round_trip() {
        let vars: HashMap<_, _> = config().env_vars().into_iter().collect();
        assert_eq!(vars[CLUSTER_SHARDS_ENV], "7,8,9");
        assert_eq!(vars[HUB_ADDR_ENV], "unix:/tmp/hub.sock");
        let parsed = BootstrapConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
        assert_eq!(parsed, config());
    }

    #[test]
    fn test_missing_and_invalid() {
        let mut vars: HashMap<_, _> = config().env_vars().into_iter().collect();
        vars.remove(TOTAL_SHARDS_ENV);
        match BootstrapConfig::from_lookup(|key| vars.get(key).cloned()) {
            Err(BootstrapError::Missing(key)) => assert_eq!(key, TOTAL_SHARDS_ENV),
            other => panic!("unexpected {:?}", other),
        }

        let mut vars: HashMap<_, _> = config().env_vars().into_iter().collect();
        vars.insert(CLUSTER_SHARDS_ENV, "1,two".to_string());
        match BootstrapConfig::from_lookup(|key| vars.get(key).cloned()) {
            Err(BootstrapError::Invalid { key, value, .. }) => {
                assert_eq!(key, CLUSTER_SHARDS_ENV);
                assert_eq!(value, "1,two");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_eval_defaults_off() {
        let mut vars: HashMap<_, _> = config().env_vars().into_iter().collect();
        vars.remove(EVAL_ENV);
        let parsed = BootstrapConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
        assert!(!parsed.eval);
    }
}
