/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Shardmesh supervises a fleet of worker processes ("clusters"), each of
//! which hosts a contiguous range of shards.
//!
//! The supervisor ([`Fleet`]) partitions the shard range across clusters,
//! launches the workers one at a time (waiting for each to report ready),
//! restarts workers that die, and retries workers that fail to come up.
//! Workers connect back to the supervisor's IPC hub using
//! [`bootstrap::bootstrap`], and interact with the fleet through a
//! [`ClusterClient`].

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod eval;
pub mod events;
pub mod fleet;
pub mod logging;
mod logtailer;
pub mod partition;
pub mod session;
pub mod worker;

pub use client::ClusterClient;
pub use config::FleetConfig;
pub use config::RetryPolicy;
pub use config::ShardCount;
pub use eval::Evaluator;
pub use events::FleetEvent;
pub use fleet::Fleet;
pub use fleet::FleetBuilder;
pub use shardmesh_ipc::ChannelAddr;
pub use shardmesh_ipc::EntityKind;
pub use shardmesh_ipc::ErrorDescriptor;
pub use shardmesh_ipc::EvalRequest;
pub use worker::Worker;
pub use worker::WorkerError;
pub use worker::WorkerStatus;
use shardmesh_ipc::ChannelError;
use shardmesh_ipc::DispatchError;
use shardmesh_ipc::RemoteError;

use crate::bootstrap::BootstrapError;
use crate::partition::PartitionError;
use crate::session::SessionError;

/// Identifies a worker within a fleet. Ids are dense, starting at zero.
pub type ClusterId = usize;

/// Errors raised by fleet operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The named worker or entity does not exist.
    #[error("no {kind} with id {id} found")]
    NotFound {
        /// What was looked up.
        kind: String,
        /// The id that was not found.
        id: String,
    },

    /// A broadcast failed because one of the workers failed.
    #[error("evaluation failed in {peer}: {error}")]
    Broadcast {
        /// The first failing worker, in registration order.
        peer: String,
        /// Its error.
        #[source]
        error: RemoteError,
    },

    /// The other side of a request reported an error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A worker operation failed.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// The transport failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A dispatch table was missing a handler.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The shard range could not be partitioned.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// The session endpoint could not be queried.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Fewer session starts remain than the fleet needs.
    #[error("session start limit exhausted: {remaining} remaining, {required} required")]
    SessionLimit {
        /// Remaining session starts.
        remaining: u32,
        /// Shards to be started.
        required: u32,
    },

    /// The shard count is automatic but there is no way to ask for it.
    #[error("shard count is auto but no session source is configured")]
    NoSessionSource,

    /// The fleet has already been spawned.
    #[error("fleet already spawned")]
    AlreadySpawned,

    /// The fleet is shutting down.
    #[error("fleet is shutting down")]
    ShutDown,

    /// Some workers never came up.
    #[error("clusters {clusters:?} failed to start after exhausting retries")]
    RetriesExhausted {
        /// The workers that were given up on.
        clusters: Vec<ClusterId>,
    },

    /// Script evaluation was requested but is not enabled.
    #[error("script evaluation is disabled")]
    EvalDisabled,

    /// A master evaluation was requested but the supervisor has no
    /// evaluator.
    #[error("no evaluator is installed in the supervisor")]
    NoEvaluator,

    /// A worker's bootstrap environment is incomplete.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// The configuration is invalid.
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),

    /// A payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// The descriptor sent in a failed reply. Errors that originated in
    /// another process keep their original descriptor.
    pub fn descriptor(&self) -> ErrorDescriptor {
        match self {
            Error::Broadcast { error, .. }
            | Error::Remote(error)
            | Error::Worker(WorkerError::Remote(error)) => error.descriptor().clone(),
            Error::NotFound { .. } => ErrorDescriptor::new("NotFound", self.to_string()),
            Error::EvalDisabled => ErrorDescriptor::new("EvalDisabled", self.to_string()),
            other => ErrorDescriptor::from_error(other),
        }
    }

    pub(crate) fn not_found(kind: impl ToString, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}
