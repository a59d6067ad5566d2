/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The supervisor. A [`Fleet`] partitions the shard range, launches one
//! worker per partition, keeps them running, and serves the requests
//! workers send to the hub.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::future::Future;
use std::future::Ready;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;

use serde_json::Value;
use shardmesh_ipc::DispatchError;
use shardmesh_ipc::DispatchTable;
use shardmesh_ipc::EntityKind;
use shardmesh_ipc::Envelope;
use shardmesh_ipc::ErrorDescriptor;
use shardmesh_ipc::EvalRequest;
use shardmesh_ipc::Hub;
use shardmesh_ipc::Incoming;
use shardmesh_ipc::Op;
use shardmesh_ipc::RemoteError;
use shardmesh_ipc::Reply;
use shardmesh_ipc::ShardEvent;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::cluster_of;
use crate::eval;
use crate::events::Events;
use crate::events::FleetEvent;
use crate::partition::partition;
use crate::partition::recommended_shard_count;
use crate::session::GatewaySession;
use crate::session::SessionSource;
use crate::worker::Control;
use crate::worker::WorkerContext;
use crate::ClusterId;
use crate::Error;
use crate::Evaluator;
use crate::FleetConfig;
use crate::ShardCount;
use crate::Worker;
use crate::WorkerError;

/// Ops the hub must handle. Evaluation requests only flow from the hub
/// to workers.
const HUB_OPS: [Op; 13] = [
    Op::Message,
    Op::Broadcast,
    Op::Ready,
    Op::ShardReady,
    Op::ShardReconnect,
    Op::ShardResume,
    Op::ShardDisconnect,
    Op::MasterEval,
    Op::RestartAll,
    Op::Restart,
    Op::FetchUser,
    Op::FetchChannel,
    Op::FetchGuild,
];

/// Builds a [`Fleet`].
pub struct FleetBuilder {
    config: FleetConfig,
    session: Option<Arc<dyn SessionSource>>,
    evaluator: Option<Arc<dyn Evaluator>>,
}

impl FleetBuilder {
    /// Query `session` for the shard count and session start allowance.
    /// Defaults to the gateway when a token is configured.
    pub fn session(mut self, session: impl SessionSource) -> Self {
        self.session = Some(Arc::new(session));
        self
    }

    /// Serve master evaluations with `evaluator`.
    pub fn evaluator(mut self, evaluator: impl Evaluator) -> Self {
        self.evaluator = Some(Arc::new(evaluator));
        self
    }

    /// Validate the configuration and start the hub. Workers are not
    /// launched until [`Fleet::spawn_fleet`].
    pub async fn listen(self) -> Result<Fleet, Error> {
        let FleetBuilder {
            config,
            session,
            evaluator,
        } = self;
        config.validate()?;
        let session = session.or_else(|| {
            config.token.as_deref().map(|token| {
                Arc::new(GatewaySession::new(config.gateway_url.clone(), token))
                    as Arc<dyn SessionSource>
            })
        });

        let (hub, inbound) = Hub::listen(&config.ipc_addr, config.channel.clone()).await?;
        let (control, control_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(FleetInner {
            config: Arc::new(config),
            hub,
            events: Events::new(),
            workers: OnceLock::new(),
            control,
            session,
            evaluator,
            shutdown: CancellationToken::new(),
        });

        let table = dispatch_table(&Arc::downgrade(&inner))?;
        tokio::spawn(table.serve(inbound));
        tokio::spawn(control_loop(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            control_rx,
        ));
        inner
            .events
            .debug(format!("hub listening on {}", inner.hub.addr()));

        Ok(Fleet { inner })
    }
}

struct FleetInner {
    config: Arc<FleetConfig>,
    hub: Hub,
    events: Events,
    /// Set once, by `spawn_fleet`. Ids are stable for the fleet's lifetime.
    workers: OnceLock<BTreeMap<ClusterId, Arc<Worker>>>,
    control: mpsc::UnboundedSender<Control>,
    session: Option<Arc<dyn SessionSource>>,
    evaluator: Option<Arc<dyn Evaluator>>,
    shutdown: CancellationToken,
}

impl Drop for FleetInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A supervised fleet of workers. Clones share the fleet.
#[derive(Clone)]
pub struct Fleet {
    inner: Arc<FleetInner>,
}

impl Fleet {
    pub fn builder(config: FleetConfig) -> FleetBuilder {
        FleetBuilder {
            config,
            session: None,
            evaluator: None,
        }
    }

    fn upgrade(weak: &Weak<FleetInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }

    /// The hub workers connect to.
    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    /// Subscribe to fleet events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.events.subscribe()
    }

    /// The workers, by id. Empty until the fleet is spawned.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.inner
            .workers
            .get()
            .map(|workers| workers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn worker(&self, cluster: ClusterId) -> Option<Arc<Worker>> {
        self.inner.workers.get()?.get(&cluster).cloned()
    }

    fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Run `fut`, abandoning it if the fleet shuts down.
    async fn cancellable<T>(
        &self,
        fut: impl Future<Output = Result<T, WorkerError>>,
    ) -> Result<T, Error> {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(Error::ShutDown),
            result = fut => Ok(result?),
        }
    }

    /// Determine the total shard count, and check that enough session
    /// starts remain to launch that many shards.
    async fn resolve_shard_count(&self) -> Result<u32, Error> {
        let config = self.config();
        let Some(session) = &self.inner.session else {
            return match config.shard_count {
                ShardCount::Fixed(shards) => Ok(shards),
                ShardCount::Auto => Err(Error::NoSessionSource),
            };
        };
        let info = session.fetch().await?;
        let shards = match config.shard_count {
            ShardCount::Fixed(shards) => shards,
            ShardCount::Auto => {
                let shards = recommended_shard_count(info.shards, config.guilds_per_shard);
                self.inner.events.debug(format!(
                    "session endpoint recommends {} shards; using {} at {} guilds per shard",
                    info.shards, shards, config.guilds_per_shard
                ));
                shards
            }
        };
        let remaining = info.session_start_limit.remaining;
        if remaining < shards {
            return Err(Error::SessionLimit {
                remaining,
                required: shards,
            });
        }
        Ok(shards)
    }

    /// Partition the shards, and launch the workers one after another,
    /// each only once the previous one is ready or has failed. Workers
    /// that fail are retried once the pass completes.
    pub async fn spawn_fleet(&self) -> Result<(), Error> {
        if self.inner.workers.get().is_some() {
            return Err(Error::AlreadySpawned);
        }
        let total_shards = self.resolve_shard_count().await?;
        let clusters = self.config().cluster_count.min(total_shards as usize);
        if clusters < self.config().cluster_count {
            self.inner.events.debug(format!(
                "only {} shards; reducing cluster count from {} to {}",
                total_shards,
                self.config().cluster_count,
                clusters
            ));
        }
        let groups = partition(total_shards, clusters)?;

        let ctx = Arc::new(WorkerContext {
            config: Arc::clone(&self.inner.config),
            hub: self.inner.hub.clone(),
            events: self.inner.events.clone(),
            control: self.inner.control.clone(),
            total_shards,
            total_clusters: clusters,
        });
        let workers = groups
            .into_iter()
            .enumerate()
            .map(|(id, shards)| (id, Arc::new(Worker::new(id, shards, Arc::clone(&ctx)))))
            .collect();
        self.inner
            .workers
            .set(workers)
            .map_err(|_| Error::AlreadySpawned)?;
        self.inner.events.debug(format!(
            "spawning {} clusters hosting {} shards",
            clusters, total_shards
        ));

        let spawn_delay = self.config().spawn_delay();
        let mut failed = Vec::new();
        for worker in self.workers() {
            match self.cancellable(worker.spawn()).await {
                Ok(()) => {
                    if !spawn_delay.is_zero() {
                        tokio::select! {
                            _ = self.inner.shutdown.cancelled() => return Err(Error::ShutDown),
                            _ = tokio::time::sleep(spawn_delay) => {}
                        }
                    }
                }
                Err(Error::ShutDown) => return Err(Error::ShutDown),
                Err(err) => {
                    self.inner.events.error(format!(
                        "Cluster {} failed to start: {}",
                        worker.id(),
                        err
                    ));
                    failed.push(worker.id());
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        self.retry_failed(failed).await
    }

    /// Respawn each of `clusters` in turn until all are ready, requeueing
    /// those that fail again. Gives up on a worker once the retry policy
    /// is exhausted, and fails with the workers given up on.
    pub async fn retry_failed(&self, clusters: Vec<ClusterId>) -> Result<(), Error> {
        let retry = &self.config().retry;
        let mut queue: VecDeque<(ClusterId, u32)> =
            clusters.into_iter().map(|cluster| (cluster, 1)).collect();
        let mut exhausted = Vec::new();

        while let Some((cluster, attempt)) = queue.pop_front() {
            let worker = self
                .worker(cluster)
                .ok_or_else(|| Error::not_found("cluster", cluster))?;
            // It may have come up late.
            if worker.is_ready() {
                continue;
            }
            if !retry.allows(attempt) {
                self.inner.events.error(format!(
                    "Cluster {} failed to start after {} retries; giving up",
                    cluster,
                    attempt - 1
                ));
                exhausted.push(cluster);
                continue;
            }

            let backoff = retry.backoff(attempt);
            self.inner.events.debug(format!(
                "retrying cluster {} (attempt {}) in {:?}",
                cluster, attempt, backoff
            ));
            match self.cancellable(worker.respawn(backoff)).await {
                Ok(()) => {}
                Err(Error::ShutDown) => return Err(Error::ShutDown),
                Err(err) => {
                    self.inner.events.error(format!(
                        "Cluster {} failed to start: {}",
                        cluster, err
                    ));
                    queue.push_back((cluster, attempt + 1));
                }
            }
        }

        if exhausted.is_empty() {
            Ok(())
        } else {
            exhausted.sort_unstable();
            Err(Error::RetriesExhausted {
                clusters: exhausted,
            })
        }
    }

    /// Respawn a worker that died after becoming ready, retrying if it
    /// does not come back.
    async fn recover(&self, worker: Arc<Worker>) {
        self.inner
            .events
            .debug(format!("respawning cluster {}", worker.id()));
        let result = self
            .cancellable(worker.respawn(self.config().respawn_delay()))
            .await;
        match result {
            Ok(()) | Err(Error::ShutDown) => {}
            Err(err) => {
                self.inner.events.error(format!(
                    "Cluster {} failed to respawn: {}",
                    worker.id(),
                    err
                ));
                if let Err(err) = self.retry_failed(vec![worker.id()]).await {
                    self.inner.events.error(err.to_string());
                }
            }
        }
    }

    /// Respawn worker `cluster`.
    pub async fn restart(&self, cluster: ClusterId) -> Result<(), Error> {
        let worker = self
            .worker(cluster)
            .ok_or_else(|| Error::not_found("cluster", cluster))?;
        self.inner
            .events
            .debug(format!("restarting cluster {}", cluster));
        self.cancellable(worker.respawn(self.config().respawn_delay()))
            .await
    }

    /// Respawn every worker, one at a time. Workers that fail to come back
    /// are retried.
    pub async fn restart_all(&self) -> Result<(), Error> {
        let mut failed = Vec::new();
        for worker in self.workers() {
            match self.restart(worker.id()).await {
                Ok(()) => {}
                Err(Error::ShutDown) => return Err(Error::ShutDown),
                Err(err) => {
                    self.inner.events.error(format!(
                        "Cluster {} failed to restart: {}",
                        worker.id(),
                        err
                    ));
                    failed.push(worker.id());
                }
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        self.retry_failed(failed).await
    }

    /// Evaluate `request` on every connected worker. Results are in
    /// cluster id order; any failure fails the whole broadcast with the
    /// first failing worker's error.
    pub async fn broadcast_request(&self, request: EvalRequest) -> Result<Vec<Value>, Error> {
        let envelope = Envelope::with_payload(Op::Eval, &request)?;
        let mut replies = self.inner.hub.broadcast(envelope).await;
        // Workers that first connected late (after a failed start) sit
        // behind their successors in the hub.
        replies.sort_by_key(|(peer, _)| cluster_of(peer).unwrap_or(ClusterId::MAX));
        let mut values = Vec::with_capacity(replies.len());
        for (peer, reply) in replies {
            match reply.into_result() {
                Ok(value) => values.push(value),
                Err(error) => return Err(Error::Broadcast { peer, error }),
            }
        }
        Ok(values)
    }

    /// Evaluate a script on every worker. Requires evaluation to be
    /// enabled.
    pub async fn broadcast(&self, code: impl Into<String>) -> Result<Vec<Value>, Error> {
        if !self.config().eval {
            return Err(Error::EvalDisabled);
        }
        self.broadcast_request(EvalRequest::Script { code: code.into() })
            .await
    }

    /// Read a client property from every worker.
    pub async fn fetch_client_values(&self, path: impl Into<String>) -> Result<Vec<Value>, Error> {
        self.broadcast_request(EvalRequest::Property { path: path.into() })
            .await
    }

    /// Evaluate `request` with the supervisor's own evaluator.
    pub async fn master_evaluate(&self, request: EvalRequest) -> Result<Value, Error> {
        let evaluator = self.inner.evaluator.as_ref().ok_or(Error::NoEvaluator)?;
        eval::evaluate(&**evaluator, request, self.config().eval)
            .await
            .map_err(|descriptor| Error::Remote(RemoteError(descriptor)))
    }

    /// Evaluate a script with the supervisor's own evaluator.
    pub async fn master_eval(&self, code: impl Into<String>) -> Result<Value, Error> {
        self.master_evaluate(EvalRequest::Script { code: code.into() })
            .await
    }

    /// Look `id` up on every worker, and return the first result found.
    pub async fn fetch_entity(&self, kind: EntityKind, id: &str) -> Result<Value, Error> {
        let request = EvalRequest::Lookup {
            entity: kind,
            id: id.to_string(),
        };
        self.broadcast_request(request)
            .await?
            .into_iter()
            .find(|value| !value.is_null())
            .ok_or_else(|| Error::not_found(kind, id))
    }

    pub async fn fetch_user(&self, id: &str) -> Result<Value, Error> {
        self.fetch_entity(EntityKind::User, id).await
    }

    pub async fn fetch_channel(&self, id: &str) -> Result<Value, Error> {
        self.fetch_entity(EntityKind::Channel, id).await
    }

    pub async fn fetch_guild(&self, id: &str) -> Result<Value, Error> {
        self.fetch_entity(EntityKind::Guild, id).await
    }

    /// Stop retrying and respawning, kill every worker, and close the hub.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for worker in self.workers() {
            worker.kill().await;
        }
        self.inner.hub.close();
        self.inner.events.debug("fleet shut down");
    }

    fn on_ready(&self, incoming: Incoming) {
        match incoming.payload_as::<ClusterId>() {
            Ok(cluster) => {
                let _ = self.inner.control.send(Control::Ready(cluster));
            }
            Err(err) => self.inner.events.debug(format!(
                "malformed READY from {}: {}",
                incoming.from(),
                err
            )),
        }
    }

    fn on_shard_event(&self, op: Op, incoming: Incoming) {
        let ShardEvent {
            cluster,
            shard,
            replayed,
            close_event,
        } = match incoming.payload_as() {
            Ok(event) => event,
            Err(err) => {
                self.inner.events.debug(format!(
                    "malformed {} from {}: {}",
                    op,
                    incoming.from(),
                    err
                ));
                return;
            }
        };
        let event = match op {
            Op::ShardReady => FleetEvent::ShardReady { cluster, shard },
            Op::ShardReconnect => FleetEvent::ShardReconnect { cluster, shard },
            Op::ShardResume => FleetEvent::ShardResume {
                cluster,
                shard,
                replayed: replayed.unwrap_or_default(),
            },
            _ => FleetEvent::ShardDisconnect {
                cluster,
                shard,
                close_event,
            },
        };
        self.inner.events.emit(event);
    }

    fn on_message(&self, incoming: Incoming) {
        self.inner
            .events
            .emit(FleetEvent::Message(incoming.payload().clone()));
        if incoming.is_receptive() {
            incoming.reply(Reply::ok(Value::Null));
        }
    }

    async fn on_broadcast(self, incoming: Incoming) {
        let reply = match incoming.payload_as::<EvalRequest>() {
            Ok(request) => reply_with(self.broadcast_request(request).await.map(Value::Array)),
            Err(err) => invalid_request(err),
        };
        incoming.reply(reply);
    }

    async fn on_master_eval(self, incoming: Incoming) {
        let reply = match incoming.payload_as::<EvalRequest>() {
            Ok(request) => reply_with(self.master_evaluate(request).await),
            Err(err) => invalid_request(err),
        };
        incoming.reply(reply);
    }

    async fn on_restart(self, incoming: Incoming) {
        let reply = match incoming.payload_as::<ClusterId>() {
            Ok(cluster) => reply_with(self.restart(cluster).await.map(|()| Value::Null)),
            Err(err) => invalid_request(err),
        };
        incoming.reply(reply);
    }

    async fn on_restart_all(self, _incoming: Incoming) {
        if let Err(err) = self.restart_all().await {
            self.inner
                .events
                .error(format!("restarting all clusters failed: {}", err));
        }
    }

    async fn on_fetch(self, kind: EntityKind, incoming: Incoming) {
        let reply = match incoming.payload() {
            Value::String(id) => reply_with(self.fetch_entity(kind, id).await),
            Value::Number(id) => reply_with(self.fetch_entity(kind, &id.to_string()).await),
            other => Reply::err(ErrorDescriptor::new(
                "InvalidRequest",
                format!("invalid {} id: {}", kind, other),
            )),
        };
        incoming.reply(reply);
    }
}

fn reply_with(result: Result<Value, Error>) -> Reply {
    match result {
        Ok(value) => Reply::ok(value),
        Err(err) => Reply::err(err.descriptor()),
    }
}

fn invalid_request(err: serde_json::Error) -> Reply {
    Reply::err(ErrorDescriptor::new(
        "InvalidRequest",
        format!("malformed request: {}", err),
    ))
}

/// A handler that runs `handler` to completion before the next message is
/// dispatched.
fn inline<F>(
    weak: &Weak<FleetInner>,
    handler: F,
) -> impl Fn(Incoming) -> Ready<()> + Send + Sync + 'static
where
    F: Fn(&Fleet, Incoming) + Send + Sync + 'static,
{
    let weak = weak.clone();
    move |incoming| {
        if let Some(fleet) = Fleet::upgrade(&weak) {
            handler(&fleet, incoming);
        }
        std::future::ready(())
    }
}

/// A handler that runs `handler` on its own task, so that slow operations
/// do not hold up the hub's inbound queue.
fn spawned<F, Fut>(
    weak: &Weak<FleetInner>,
    handler: F,
) -> impl Fn(Incoming) -> Ready<()> + Send + Sync + 'static
where
    F: Fn(Fleet, Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = weak.clone();
    move |incoming| {
        if let Some(fleet) = Fleet::upgrade(&weak) {
            tokio::spawn(handler(fleet, incoming));
        }
        std::future::ready(())
    }
}

fn dispatch_table(weak: &Weak<FleetInner>) -> Result<DispatchTable, DispatchError> {
    DispatchTable::builder()
        .on(Op::Message, inline(weak, Fleet::on_message))
        .on(Op::Ready, inline(weak, Fleet::on_ready))
        .on(
            Op::ShardReady,
            inline(weak, |fleet, incoming| {
                fleet.on_shard_event(Op::ShardReady, incoming)
            }),
        )
        .on(
            Op::ShardReconnect,
            inline(weak, |fleet, incoming| {
                fleet.on_shard_event(Op::ShardReconnect, incoming)
            }),
        )
        .on(
            Op::ShardResume,
            inline(weak, |fleet, incoming| {
                fleet.on_shard_event(Op::ShardResume, incoming)
            }),
        )
        .on(
            Op::ShardDisconnect,
            inline(weak, |fleet, incoming| {
                fleet.on_shard_event(Op::ShardDisconnect, incoming)
            }),
        )
        .on(Op::Broadcast, spawned(weak, Fleet::on_broadcast))
        .on(Op::MasterEval, spawned(weak, Fleet::on_master_eval))
        .on(Op::Restart, spawned(weak, Fleet::on_restart))
        .on(Op::RestartAll, spawned(weak, Fleet::on_restart_all))
        .on(
            Op::FetchUser,
            spawned(weak, |fleet, incoming| {
                fleet.on_fetch(EntityKind::User, incoming)
            }),
        )
        .on(
            Op::FetchChannel,
            spawned(weak, |fleet, incoming| {
                fleet.on_fetch(EntityKind::Channel, incoming)
            }),
        )
        .on(
            Op::FetchGuild,
            spawned(weak, |fleet, incoming| {
                fleet.on_fetch(EntityKind::Guild, incoming)
            }),
        )
        .build_requiring(&HUB_OPS)
}

/// Apply worker state transitions. Workers that exit after becoming
/// ready are respawned when the fleet allows it; workers that exit while
/// starting are left to whoever is waiting on them.
async fn control_loop(
    weak: Weak<FleetInner>,
    shutdown: CancellationToken,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = control.recv() => next,
        };
        let Some(next) = next else { break };
        let Some(fleet) = Fleet::upgrade(&weak) else {
            break;
        };
        match next {
            Control::Ready(cluster) => match fleet.worker(cluster) {
                Some(worker) => {
                    if !worker.mark_ready() {
                        fleet.inner.events.debug(format!(
                            "ignoring READY from cluster {} in state {:?}",
                            cluster,
                            worker.status()
                        ));
                    }
                }
                None => fleet
                    .inner
                    .events
                    .debug(format!("READY from unknown cluster {}", cluster)),
            },
            Control::Exited {
                cluster,
                generation,
                reason,
            } => {
                let Some(worker) = fleet.worker(cluster) else {
                    continue;
                };
                let Some(exit) = worker.mark_exited(generation, reason.clone()).await else {
                    continue;
                };
                let events = &fleet.inner.events;
                events.error(format!("Cluster {} {}", cluster, reason));
                if !exit.stdout.is_empty() || !exit.stderr.is_empty() {
                    events.debug(exit.describe(cluster, &reason));
                }
                if exit.previous.is_ready() && fleet.config().respawn && !fleet.is_shut_down() {
                    tokio::spawn(async move { fleet.recover(worker).await });
                }
            }
        }
    }
}
