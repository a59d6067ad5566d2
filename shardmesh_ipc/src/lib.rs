/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Inter-process transport between a supervisor [`Hub`] and its worker
//! [`Peer`]s.
//!
//! Every frame on the wire is an 8-byte big-endian length followed by a
//! JSON body. Bodies carry [`Envelope`]s (an op code plus an arbitrary
//! payload), and may be sent either one-way or as requests that expect a
//! correlated [`Reply`]. The hub additionally supports broadcasting a
//! request to every registered peer and collecting the replies in
//! registration order.

use std::io;
use std::time::Duration;

mod addr;
pub mod config;
mod conn;
mod dispatch;
mod envelope;
pub mod framed;
mod hub;
mod net;
mod peer;

pub use addr::ChannelAddr;
pub use addr::ChannelTransport;
pub use config::ChannelConfig;
pub use conn::Incoming;
pub use dispatch::Dispatch;
pub use dispatch::DispatchError;
pub use dispatch::DispatchTable;
pub use dispatch::DispatchTableBuilder;
pub use envelope::CloseEvent;
pub use envelope::EntityKind;
pub use envelope::Envelope;
pub use envelope::ErrorDescriptor;
pub use envelope::EvalRequest;
pub use envelope::Op;
pub use envelope::RawEnvelope;
pub use envelope::RemoteError;
pub use envelope::Reply;
pub use envelope::ShardEvent;
pub use hub::Hub;
pub use peer::Peer;

/// The type of error that can occur on channel operations.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    /// The hub could not listen on its address.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: ChannelAddr,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },

    /// The remote endpoint could not be reached.
    #[error("failed to connect to {addr}: {source}")]
    Connection {
        /// The address that was dialed.
        addr: ChannelAddr,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },

    /// No reply arrived within the allotted time.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The connection has been closed.
    #[error("channel closed")]
    Closed,

    /// The hub has no registered peer with the given name.
    #[error("no peer named {0:?} is registered")]
    NoSuchPeer(String),

    /// An address could not be parsed or bound.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A frame body could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] serde_json::Error),

    /// An I/O error occurred on the underlying stream.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The peer did not complete the hello exchange.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Capacity of the transport event channels. Slow subscribers observe
/// lagged receives rather than blocking the transport.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Connection lifecycle notifications published by hubs and peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection completed its handshake.
    Connect {
        /// The name of the remote endpoint.
        name: String,
    },
    /// A connection went away.
    Disconnect {
        /// The name of the remote endpoint.
        name: String,
    },
    /// A transport-level error that did not necessarily close the connection.
    Error {
        /// The name of the remote endpoint, if it was known at the time.
        name: Option<String>,
        /// A rendering of the error.
        message: String,
    },
}

/// Options for a single send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendOptions {
    /// Whether the sender expects a reply. Non-receptive sends complete as
    /// soon as the frame has been flushed.
    pub receptive: bool,
    /// Overrides the configured request timeout for this send.
    pub timeout: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            receptive: true,
            timeout: None,
        }
    }
}

impl SendOptions {
    /// Options for a one-way send.
    pub fn one_way() -> Self {
        Self {
            receptive: false,
            timeout: None,
        }
    }
}
