/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fleet lifecycle events.

use std::fmt;

use serde_json::Value;
use shardmesh_ipc::CloseEvent;
use tokio::sync::broadcast;

use crate::ClusterId;

const EVENT_CAPACITY: usize = 1024;

/// Something that happened in the fleet.
#[derive(Clone, Debug, PartialEq)]
pub enum FleetEvent {
    /// Diagnostic detail.
    Debug(String),
    /// A failure that did not stop the fleet.
    Error(String),
    /// A worker process was launched.
    Spawn {
        /// The worker.
        cluster: ClusterId,
        /// Its process id.
        pid: Option<u32>,
    },
    /// A worker reported ready.
    Ready {
        /// The worker.
        cluster: ClusterId,
    },
    /// A shard became ready.
    ShardReady {
        /// The hosting worker.
        cluster: ClusterId,
        /// The shard.
        shard: u32,
    },
    /// A shard is reconnecting.
    ShardReconnect {
        /// The hosting worker.
        cluster: ClusterId,
        /// The shard.
        shard: u32,
    },
    /// A shard resumed its session.
    ShardResume {
        /// The hosting worker.
        cluster: ClusterId,
        /// The shard.
        shard: u32,
        /// Events replayed on resume.
        replayed: u64,
    },
    /// A shard disconnected.
    ShardDisconnect {
        /// The hosting worker.
        cluster: ClusterId,
        /// The shard.
        shard: u32,
        /// The close frame, if any.
        close_event: Option<CloseEvent>,
    },
    /// An application message sent by a worker.
    Message(Value),
}

impl fmt::Display for FleetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetEvent::Debug(message) | FleetEvent::Error(message) => write!(f, "{}", message),
            FleetEvent::Spawn { cluster, pid } => match pid {
                Some(pid) => write!(f, "Cluster {} spawned with pid {}", cluster, pid),
                None => write!(f, "Cluster {} spawned", cluster),
            },
            FleetEvent::Ready { cluster } => write!(f, "Cluster {} became ready", cluster),
            FleetEvent::ShardReady { cluster, shard } => {
                write!(f, "Shard {} of cluster {} became ready", shard, cluster)
            }
            FleetEvent::ShardReconnect { cluster, shard } => {
                write!(f, "Shard {} of cluster {} is reconnecting", shard, cluster)
            }
            FleetEvent::ShardResume {
                cluster,
                shard,
                replayed,
            } => write!(
                f,
                "Shard {} of cluster {} resumed, replaying {} events",
                shard, cluster, replayed
            ),
            FleetEvent::ShardDisconnect {
                cluster,
                shard,
                close_event,
            } => match close_event {
                Some(close) => write!(
                    f,
                    "Shard {} of cluster {} disconnected with code {} ({})",
                    shard, cluster, close.code, close.reason
                ),
                None => write!(f, "Shard {} of cluster {} disconnected", shard, cluster),
            },
            FleetEvent::Message(value) => write!(f, "message: {}", value),
        }
    }
}

/// Publishes [`FleetEvent`]s to any number of subscribers, and mirrors
/// each one to the log.
///
/// Subscribers that fall more than 1024 events behind miss the oldest
/// ones and observe a lagged receive.
#[derive(Clone)]
pub struct Events {
    tx: broadcast::Sender<FleetEvent>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    /// A publisher with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Publish `event`.
    pub fn emit(&self, event: FleetEvent) {
        match &event {
            FleetEvent::Debug(_) | FleetEvent::Message(_) => tracing::debug!("{}", event),
            FleetEvent::Error(_) => tracing::error!("{}", event),
            FleetEvent::ShardDisconnect { .. } | FleetEvent::ShardReconnect { .. } => {
                tracing::warn!("{}", event)
            }
            _ => tracing::info!("{}", event),
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Publish a debug event.
    pub fn debug(&self, message: impl Into<String>) {
        self.emit(FleetEvent::Debug(message.into()));
    }

    /// Publish an error event.
    pub fn error(&self, message: impl Into<String>) {
        self.emit(FleetEvent::Error(message.into()));
    }
}
