/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Worker handles. A [`Worker`] owns at most one OS process at a time,
//! running the fleet's worker program for a fixed set of shards.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use shardmesh_ipc::ChannelError;
use shardmesh_ipc::Envelope;
use shardmesh_ipc::EvalRequest;
use shardmesh_ipc::Hub;
use shardmesh_ipc::Op;
use shardmesh_ipc::RemoteError;
use shardmesh_ipc::Reply;
use shardmesh_ipc::SendOptions;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrapConfig;
use crate::client::peer_name;
use crate::events::Events;
use crate::events::FleetEvent;
use crate::logtailer::LogTailer;
use crate::ClusterId;
use crate::FleetConfig;

/// Lines of worker output kept for post-mortems.
const MAX_TAIL_LOG_LINES: usize = 100;

/// How long to wait for a worker's output to drain once it has exited.
const TAIL_GRACE: Duration = Duration::from_secs(1);

/// Why a worker process stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Exited successfully.
    Stopped,
    /// Exited with a failure code.
    Exited(i32),
    /// Killed by a signal; whether it dumped core.
    Killed(i32, bool),
    /// The exit status could not be determined.
    Unknown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Stopped => write!(f, "stopped"),
            ExitReason::Exited(code) => write!(f, "exited with code {}", code),
            ExitReason::Killed(signal, true) => {
                write!(f, "killed by signal {} (core dumped)", signal)
            }
            ExitReason::Killed(signal, false) => write!(f, "killed by signal {}", signal),
            ExitReason::Unknown => write!(f, "stopped for an unknown reason"),
        }
    }
}

fn exit_status_to_reason(result: io::Result<ExitStatus>) -> ExitReason {
    match result {
        Ok(status) if status.success() => ExitReason::Stopped,
        Ok(status) => {
            if let Some(signal) = status.signal() {
                ExitReason::Killed(signal, status.core_dumped())
            } else if let Some(code) = status.code() {
                ExitReason::Exited(code)
            } else {
                ExitReason::Unknown
            }
        }
        Err(e) => {
            tracing::error!("error waiting for worker process: {}", e);
            ExitReason::Unknown
        }
    }
}

/// Where a worker is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Never spawned.
    Unspawned,
    /// Launched, waiting for the worker to report ready.
    Spawning,
    /// Reported ready.
    Ready,
    /// Did not report ready in time. The process may still be running,
    /// and may yet report ready.
    ReadinessTimedOut,
    /// The process exited on its own.
    Exited(ExitReason),
    /// The process was killed through [`Worker::kill`].
    Killed,
}

impl WorkerStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, WorkerStatus::Ready)
    }
}

/// Errors from worker operations.
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("failed to launch cluster {cluster}: {source}")]
    Spawn {
        cluster: ClusterId,
        #[source]
        source: io::Error,
    },

    #[error("cluster {0} is already running")]
    AlreadyRunning(ClusterId),

    #[error("cluster {cluster} did not become ready within {after:?}")]
    ReadinessTimeout { cluster: ClusterId, after: Duration },

    #[error("cluster {cluster} {reason} before becoming ready")]
    Exited {
        cluster: ClusterId,
        reason: ExitReason,
    },

    #[error("cluster {0} was killed before becoming ready")]
    Killed(ClusterId),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The worker failed to evaluate a request.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

/// State transitions signalled to the fleet, which applies them.
#[derive(Debug)]
pub(crate) enum Control {
    /// The worker reported ready.
    Ready(ClusterId),
    /// A worker process exited on its own.
    Exited {
        cluster: ClusterId,
        generation: u64,
        reason: ExitReason,
    },
}

/// What every worker in a fleet shares.
pub(crate) struct WorkerContext {
    pub(crate) config: Arc<FleetConfig>,
    pub(crate) hub: Hub,
    pub(crate) events: Events,
    pub(crate) control: mpsc::UnboundedSender<Control>,
    pub(crate) total_shards: u32,
    pub(crate) total_clusters: usize,
}

struct Process {
    pid: Option<u32>,
    generation: u64,
    stop: CancellationToken,
    monitor: JoinHandle<ExitReason>,
    stdout: Option<LogTailer>,
    stderr: Option<LogTailer>,
}

/// What was left of a process that exited on its own.
#[derive(Debug)]
pub(crate) struct Exit {
    /// The worker's status before the exit.
    pub(crate) previous: WorkerStatus,
    pub(crate) stdout: Vec<String>,
    pub(crate) stderr: Vec<String>,
}

impl Exit {
    /// Describe the exit of `cluster`, followed by its last output.
    pub(crate) fn describe(&self, cluster: ClusterId, reason: &ExitReason) -> String {
        let mut message = format!("Cluster {} {}", cluster, reason);
        for (stream, tail) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            if !tail.is_empty() {
                message.push_str(&format!("\nlast {} lines:\n{}", stream, tail.join("\n")));
            }
        }
        message
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// One worker of a fleet, identified by a stable id and hosting a fixed
/// set of shards across respawns.
pub struct Worker {
    id: ClusterId,
    shards: Vec<u32>,
    status: watch::Sender<WorkerStatus>,
    process: Mutex<Option<Process>>,
    generation: AtomicU64,
    ctx: Arc<WorkerContext>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("shards", &self.shards)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl Worker {
    pub(crate) fn new(id: ClusterId, shards: Vec<u32>, ctx: Arc<WorkerContext>) -> Self {
        let (status, _) = watch::channel(WorkerStatus::Unspawned);
        Self {
            id,
            shards,
            status,
            process: Mutex::new(None),
            generation: AtomicU64::new(0),
            ctx,
        }
    }

    pub fn id(&self) -> ClusterId {
        self.id
    }

    /// The shards this worker hosts.
    pub fn shards(&self) -> &[u32] {
        &self.shards
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.status.borrow().is_ready()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    /// The current process's id, if one is running.
    pub async fn pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(|process| process.pid)
    }

    fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            cluster_id: self.id,
            shards: self.shards.clone(),
            total_shards: self.ctx.total_shards,
            total_clusters: self.ctx.total_clusters,
            hub_addr: self.ctx.hub.addr().clone(),
            eval: self.ctx.config.eval,
        }
    }

    /// Launch a process and wait for it to report ready, for at most the
    /// deadline derived from the number of hosted shards. On timeout the
    /// process is left running.
    pub async fn spawn(&self) -> Result<(), WorkerError> {
        {
            let mut slot = self.process.lock().await;
            if slot
                .as_ref()
                .is_some_and(|process| !process.monitor.is_finished())
            {
                return Err(WorkerError::AlreadyRunning(self.id));
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let process = self.launch(generation)?;
            self.ctx.events.emit(FleetEvent::Spawn {
                cluster: self.id,
                pid: process.pid,
            });
            *slot = Some(process);
            self.status.send_replace(WorkerStatus::Spawning);
        }

        let deadline = self.ctx.config.ready_deadline(self.shards.len());
        let mut status = self.status.subscribe();
        let settled = tokio::time::timeout(
            deadline,
            status.wait_for(|status| *status != WorkerStatus::Spawning),
        )
        .await;
        match settled {
            Ok(Ok(settled)) => match (*settled).clone() {
                WorkerStatus::Exited(reason) => Err(WorkerError::Exited {
                    cluster: self.id,
                    reason,
                }),
                WorkerStatus::Killed => Err(WorkerError::Killed(self.id)),
                _ => Ok(()),
            },
            // The sender lives as long as `self`.
            Ok(Err(_)) => Err(WorkerError::Killed(self.id)),
            Err(_) => {
                self.status.send_if_modified(|status| {
                    if *status == WorkerStatus::Spawning {
                        *status = WorkerStatus::ReadinessTimedOut;
                        true
                    } else {
                        false
                    }
                });
                if self.is_ready() {
                    return Ok(());
                }
                Err(WorkerError::ReadinessTimeout {
                    cluster: self.id,
                    after: deadline,
                })
            }
        }
    }

    fn launch(&self, generation: u64) -> Result<Process, WorkerError> {
        let config = &self.ctx.config;
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(&config.env)
            .envs(self.bootstrap_config().env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            cluster: self.id,
            source,
        })?;
        let pid = child.id();
        let prefix = format!("[{}] ", peer_name(self.id));
        let stdout = child.stdout.take().map(|stream| {
            LogTailer::tee(
                MAX_TAIL_LOG_LINES,
                prefix.clone(),
                stream,
                tokio::io::stdout(),
            )
        });
        let stderr = child.stderr.take().map(|stream| {
            LogTailer::tee(MAX_TAIL_LOG_LINES, prefix, stream, tokio::io::stderr())
        });

        let stop = CancellationToken::new();
        let monitor = tokio::spawn({
            let stop = stop.clone();
            let control = self.ctx.control.clone();
            let cluster = self.id;
            async move {
                tokio::select! {
                    _ = stop.cancelled() => {
                        match child.kill().await {
                            Err(e) => {
                                tracing::error!("error killing cluster {}: {}", cluster, e);
                                ExitReason::Unknown
                            }
                            Ok(_) => exit_status_to_reason(child.wait().await),
                        }
                    }
                    result = child.wait() => {
                        let reason = exit_status_to_reason(result);
                        let _ = control.send(Control::Exited {
                            cluster,
                            generation,
                            reason: reason.clone(),
                        });
                        reason
                    }
                }
            }
        });
        tracing::debug!(
            "launched cluster {} (generation {}) with pid {:?}",
            self.id,
            generation,
            pid
        );

        Ok(Process {
            pid,
            generation,
            stop,
            monitor,
            stdout,
            stderr,
        })
    }

    /// Terminate the current process, without triggering a respawn. Does
    /// nothing when no process is running.
    pub async fn kill(&self) {
        let mut slot = self.process.lock().await;
        let Some(mut process) = slot.take() else {
            return;
        };
        process.stop.cancel();
        let reason = match (&mut process.monitor).await {
            Ok(reason) => reason,
            Err(err) => {
                tracing::warn!("cluster {} monitor failed: {}", self.id, err);
                ExitReason::Unknown
            }
        };
        self.status.send_replace(WorkerStatus::Killed);
        tracing::info!("cluster {} killed: {}", self.id, reason);
    }

    /// Kill the current process, if any, wait `delay`, and spawn again.
    pub async fn respawn(&self, delay: Duration) -> Result<(), WorkerError> {
        self.kill().await;
        tokio::time::sleep(delay).await;
        self.spawn().await
    }

    /// Record that the worker reported ready, publishing a ready event on
    /// the transition. Returns whether this changed its status.
    pub(crate) fn mark_ready(&self) -> bool {
        self.status.send_if_modified(|status| match status {
            WorkerStatus::Spawning | WorkerStatus::ReadinessTimedOut => {
                *status = WorkerStatus::Ready;
                // Published before waiters in `spawn` are woken.
                self.ctx
                    .events
                    .emit(FleetEvent::Ready { cluster: self.id });
                true
            }
            _ => false,
        })
    }

    /// Record that the process of `generation` exited, releasing it, and
    /// collect its last output. Returns `None` if that process is no longer
    /// this worker's.
    pub(crate) async fn mark_exited(&self, generation: u64, reason: ExitReason) -> Option<Exit> {
        let (previous, stdout, stderr) = {
            let mut slot = self.process.lock().await;
            if slot.as_ref()?.generation != generation {
                return None;
            }
            let mut process = slot.take()?;
            let previous = self.status.send_replace(WorkerStatus::Exited(reason.clone()));
            (previous, process.stdout.take(), process.stderr.take())
        };

        let stdout = match stdout {
            Some(tailer) => tailer.finish(TAIL_GRACE).await,
            None => Vec::new(),
        };
        let stderr = match stderr {
            Some(tailer) => tailer.finish(TAIL_GRACE).await,
            None => Vec::new(),
        };
        if reason != ExitReason::Stopped && !stderr.is_empty() {
            tracing::error!(
                "cluster {} {}; last stderr lines:\n{}",
                self.id,
                reason,
                stderr.join("\n")
            );
        }
        Some(Exit {
            previous,
            stdout,
            stderr,
        })
    }

    /// Evaluate `request` in the worker.
    pub async fn evaluate(&self, request: EvalRequest) -> Result<Value, WorkerError> {
        let envelope = Envelope::with_payload(Op::Eval, &request)?;
        let reply = self
            .ctx
            .hub
            .request_to(&peer_name(self.id), envelope)
            .await?;
        Ok(reply.into_result()?)
    }

    /// Evaluate a script in the worker.
    pub async fn eval(&self, code: impl Into<String>) -> Result<Value, WorkerError> {
        self.evaluate(EvalRequest::Script { code: code.into() })
            .await
    }

    /// Read a client property of the worker.
    pub async fn fetch_client_value(&self, path: impl Into<String>) -> Result<Value, WorkerError> {
        self.evaluate(EvalRequest::Property { path: path.into() })
            .await
    }

    /// Send an envelope to the worker. Receptive sends return its reply.
    pub async fn send(
        &self,
        envelope: Envelope,
        options: SendOptions,
    ) -> Result<Option<Reply>, WorkerError> {
        Ok(self
            .ctx
            .hub
            .send_to(&peer_name(self.id), envelope, options)
            .await?)
    }
}
