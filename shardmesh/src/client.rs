/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The worker's view of the fleet.

use std::sync::Arc;

use serde_json::json;
use serde_json::Value;
use shardmesh_ipc::ChannelConfig;
use shardmesh_ipc::CloseEvent;
use shardmesh_ipc::DispatchTable;
use shardmesh_ipc::EntityKind;
use shardmesh_ipc::Envelope;
use shardmesh_ipc::EvalRequest;
use shardmesh_ipc::Op;
use shardmesh_ipc::Peer;
use shardmesh_ipc::SendOptions;
use shardmesh_ipc::ShardEvent;

use crate::bootstrap::BootstrapConfig;
use crate::eval;
use crate::ClusterId;
use crate::Error;
use crate::Evaluator;

/// The name a worker registers with the hub under.
pub fn peer_name(cluster: ClusterId) -> String {
    format!("Cluster {}", cluster)
}

/// The cluster a hub peer name belongs to, if it is a worker's.
pub fn cluster_of(peer: &str) -> Option<ClusterId> {
    peer.strip_prefix("Cluster ")?.parse().ok()
}

/// A worker's connection to its supervisor. Used to report shard
/// lifecycle, and to reach the rest of the fleet through the supervisor.
///
/// The client serves the supervisor's evaluation requests with the
/// [`Evaluator`] it was connected with. Clones share the connection.
#[derive(Clone)]
pub struct ClusterClient {
    peer: Peer,
    config: Arc<BootstrapConfig>,
}

impl ClusterClient {
    /// Connect to the hub named in `config`, and serve evaluation requests
    /// with `evaluator`.
    pub async fn connect(
        config: BootstrapConfig,
        channel: ChannelConfig,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<Self, Error> {
        let (peer, inbound) =
            Peer::connect(peer_name(config.cluster_id), &config.hub_addr, channel).await?;

        let eval_enabled = config.eval;
        let table = DispatchTable::builder()
            .on(Op::Eval, move |incoming| {
                let evaluator = Arc::clone(&evaluator);
                async move {
                    // Evaluations may be slow; keep the inbound queue moving.
                    tokio::spawn(async move {
                        eval::answer(&*evaluator, incoming, eval_enabled).await;
                    });
                }
            })
            .build_requiring(&[Op::Eval])?;
        tokio::spawn(table.serve(inbound));

        Ok(Self {
            peer,
            config: Arc::new(config),
        })
    }

    /// This worker's id.
    pub fn id(&self) -> ClusterId {
        self.config.cluster_id
    }

    /// The shards this worker hosts.
    pub fn shards(&self) -> &[u32] {
        &self.config.shards
    }

    pub fn total_shards(&self) -> u32 {
        self.config.total_shards
    }

    pub fn total_clusters(&self) -> usize {
        self.config.total_clusters
    }

    /// The bootstrap configuration this client was connected with.
    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// The underlying transport.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    async fn call(&self, op: Op, d: Value) -> Result<Value, Error> {
        let reply = self.peer.request(Envelope::new(op, d)).await?;
        Ok(reply.into_result()?)
    }

    /// Evaluate `request` on every worker, including this one. Results are
    /// in cluster registration order. Fails with the first worker's error if
    /// any worker fails.
    pub async fn broadcast(&self, request: EvalRequest) -> Result<Vec<Value>, Error> {
        let value = self
            .call(Op::Broadcast, serde_json::to_value(&request)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Evaluate a script on every worker.
    pub async fn broadcast_eval(&self, code: impl Into<String>) -> Result<Vec<Value>, Error> {
        self.broadcast(EvalRequest::Script { code: code.into() })
            .await
    }

    /// Read a client property from every worker.
    pub async fn fetch_client_values(&self, path: impl Into<String>) -> Result<Vec<Value>, Error> {
        self.broadcast(EvalRequest::Property { path: path.into() })
            .await
    }

    /// Evaluate `request` in the supervisor.
    pub async fn master_evaluate(&self, request: EvalRequest) -> Result<Value, Error> {
        self.call(Op::MasterEval, serde_json::to_value(&request)?)
            .await
    }

    /// Evaluate a script in the supervisor.
    pub async fn master_eval(&self, code: impl Into<String>) -> Result<Value, Error> {
        self.master_evaluate(EvalRequest::Script { code: code.into() })
            .await
    }

    async fn fetch(&self, kind: EntityKind, id: &str) -> Result<Value, Error> {
        let op = match kind {
            EntityKind::User => Op::FetchUser,
            EntityKind::Channel => Op::FetchChannel,
            EntityKind::Guild => Op::FetchGuild,
        };
        self.call(op, json!(id))
            .await
            .map_err(|err| not_found_or(err, kind, id))
    }

    /// Find a user on whichever worker has it.
    pub async fn fetch_user(&self, id: &str) -> Result<Value, Error> {
        self.fetch(EntityKind::User, id).await
    }

    /// Find a channel on whichever worker has it.
    pub async fn fetch_channel(&self, id: &str) -> Result<Value, Error> {
        self.fetch(EntityKind::Channel, id).await
    }

    /// Find a guild on whichever worker has it.
    pub async fn fetch_guild(&self, id: &str) -> Result<Value, Error> {
        self.fetch(EntityKind::Guild, id).await
    }

    /// Ask the supervisor to restart worker `cluster`, and wait for the
    /// restart to complete.
    pub async fn restart(&self, cluster: ClusterId) -> Result<(), Error> {
        self.call(Op::Restart, json!(cluster))
            .await
            .map_err(|err| not_found_or(err, "cluster", cluster))?;
        Ok(())
    }

    /// Ask the supervisor to restart every worker, this one included. Does
    /// not wait.
    pub async fn restart_all(&self) -> Result<(), Error> {
        Ok(self.peer.post(Envelope::bare(Op::RestartAll)).await?)
    }

    /// Same as [`ClusterClient::restart_all`].
    pub async fn respawn_all(&self) -> Result<(), Error> {
        self.restart_all().await
    }

    /// Send an arbitrary message to the supervisor. An object with a valid
    /// `op` is sent as that op with its `d` as payload; anything else is
    /// relayed as a [`Op::Message`] and published as a fleet event.
    /// Receptive sends return the supervisor's reply.
    pub async fn send(&self, value: Value, options: SendOptions) -> Result<Option<Value>, Error> {
        let envelope = match value.get("op").and_then(Op::from_wire) {
            Some(op) => Envelope::new(op, value.get("d").cloned().unwrap_or(Value::Null)),
            None => Envelope::new(Op::Message, value),
        };
        match self.peer.send(envelope, options).await? {
            Some(reply) => Ok(Some(reply.into_result()?)),
            None => Ok(None),
        }
    }

    /// Report that this worker is ready.
    pub async fn ready(&self) -> Result<(), Error> {
        Ok(self
            .peer
            .post(Envelope::new(Op::Ready, json!(self.id())))
            .await?)
    }

    async fn report(&self, op: Op, event: ShardEvent) -> Result<(), Error> {
        Ok(self.peer.post(Envelope::with_payload(op, &event)?).await?)
    }

    fn shard_event(&self, shard: u32) -> ShardEvent {
        ShardEvent {
            cluster: self.id(),
            shard,
            replayed: None,
            close_event: None,
        }
    }

    pub async fn shard_ready(&self, shard: u32) -> Result<(), Error> {
        self.report(Op::ShardReady, self.shard_event(shard)).await
    }

    pub async fn shard_reconnect(&self, shard: u32) -> Result<(), Error> {
        self.report(Op::ShardReconnect, self.shard_event(shard))
            .await
    }

    /// Report a resumed shard session that replayed `replayed` events.
    pub async fn shard_resume(&self, shard: u32, replayed: u64) -> Result<(), Error> {
        let event = ShardEvent {
            replayed: Some(replayed),
            ..self.shard_event(shard)
        };
        self.report(Op::ShardResume, event).await
    }

    pub async fn shard_disconnect(
        &self,
        shard: u32,
        close_event: Option<CloseEvent>,
    ) -> Result<(), Error> {
        let event = ShardEvent {
            close_event,
            ..self.shard_event(shard)
        };
        self.report(Op::ShardDisconnect, event).await
    }
}

/// Map a remote `NotFound` to a local [`Error::NotFound`].
fn not_found_or(err: Error, kind: impl ToString, id: impl ToString) -> Error {
    match err {
        Error::Remote(remote) if remote.descriptor().name == "NotFound" => {
            Error::not_found(kind, id)
        }
        other => other,
    }
}
