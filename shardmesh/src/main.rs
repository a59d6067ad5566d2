/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Run a fleet of workers until interrupted.
//!
//! ```text
//! shardmesh --config fleet.yaml --shards 10 --clusters 3 -- ./bot --verbose
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use shardmesh::logging::initialize_logging;
use shardmesh::ChannelAddr;
use shardmesh::Fleet;
use shardmesh::FleetConfig;
use shardmesh::FleetEvent;
use shardmesh::ShardCount;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "shardmesh", about = "Supervise a fleet of sharded worker processes")]
struct Args {
    /// YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Total shard count, or "auto" to ask the session endpoint.
    #[arg(long)]
    shards: Option<ShardCount>,

    /// Number of worker processes.
    #[arg(long)]
    clusters: Option<usize>,

    /// Address the IPC hub listens on: a socket path, a port, or a typed
    /// address such as "tcp:127.0.0.1:7000".
    #[arg(long)]
    ipc: Option<ChannelAddr>,

    /// Do not restart workers that exit.
    #[arg(long)]
    no_respawn: bool,

    /// Allow script evaluation.
    #[arg(long)]
    eval: bool,

    /// The worker program and its arguments.
    #[arg(last = true)]
    program: Vec<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<FleetConfig> {
        let mut config = match &self.config {
            Some(path) => FleetConfig::from_yaml(path)?,
            None => FleetConfig::default(),
        };
        config.apply_env();

        if let Some(shards) = self.shards {
            config.shard_count = shards;
        }
        if let Some(clusters) = self.clusters {
            config.cluster_count = clusters;
        }
        if let Some(ipc) = self.ipc {
            config.ipc_addr = ipc;
        }
        if self.no_respawn {
            config.respawn = false;
        }
        if self.eval {
            config.eval = true;
        }
        let mut program = self.program.into_iter();
        if let Some(path) = program.next() {
            config.program = PathBuf::from(path);
            config.args = program.collect();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    initialize_logging();
    let config = Args::parse().into_config()?;
    let fleet = Fleet::builder(config)
        .listen()
        .await
        .context("starting fleet")?;

    // Events are mirrored to the log as they are published; drain them so
    // that lag is reported.
    let mut events = fleet.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(FleetEvent::Ready { cluster }) => {
                    tracing::debug!("cluster {} is serving", cluster)
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("event log lagged; {} events missed", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let interrupted = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    };
    tokio::pin!(interrupted);

    tokio::select! {
        _ = &mut interrupted => {
            tracing::info!("interrupted while spawning; shutting down");
            fleet.shutdown().await;
            return Ok(());
        }
        result = fleet.spawn_fleet() => {
            if let Err(err) = result {
                tracing::error!("fleet did not fully start: {}", err);
            } else {
                tracing::info!("all {} clusters ready", fleet.workers().len());
            }
        }
    }

    interrupted.await;
    tracing::info!("shutting down");
    fleet.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args() {
        Args::command().debug_assert();

        let args = Args::try_parse_from([
            "shardmesh",
            "--shards",
            "auto",
            "--clusters",
            "3",
            "--ipc",
            "7000",
            "--no-respawn",
            "--",
            "./bot",
            "--verbose",
        ])
        .unwrap();
        let config = args.into_config().unwrap();
        assert_eq!(config.shard_count, ShardCount::Auto);
        assert_eq!(config.cluster_count, 3);
        assert_eq!(config.ipc_addr, ChannelAddr::loopback(7000));
        assert!(!config.respawn);
        assert_eq!(config.program, PathBuf::from("./bot"));
        assert_eq!(config.args, vec!["--verbose".to_string()]);
    }
}
