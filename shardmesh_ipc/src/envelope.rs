/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Envelopes, replies and the typed payloads carried between hub and peers.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json::Value;
use strum::IntoEnumIterator;

/// Operation codes. The numeric codes are part of the wire format and must
/// never be reordered; new codes are appended.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::EnumIter,
    strum::Display
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Op {
    /// Evaluate a request inside a worker.
    Eval = 0,
    /// An application message relayed to the supervisor's listeners.
    Message = 1,
    /// Evaluate a request in every worker.
    Broadcast = 2,
    /// A worker announces readiness.
    Ready = 3,
    /// A shard inside a worker became ready.
    ShardReady = 4,
    /// A shard inside a worker is reconnecting.
    ShardReconnect = 5,
    /// A shard inside a worker resumed its session.
    ShardResume = 6,
    /// A shard inside a worker disconnected.
    ShardDisconnect = 7,
    /// Evaluate a request in the supervisor.
    MasterEval = 8,
    /// Restart every worker.
    RestartAll = 9,
    /// Restart one worker.
    Restart = 10,
    /// Look up a user across all workers.
    FetchUser = 11,
    /// Look up a channel across all workers.
    FetchChannel = 12,
    /// Look up a guild across all workers.
    FetchGuild = 13,
}

impl Op {
    /// The numeric wire code.
    pub fn code(self) -> u64 {
        self as u64
    }

    /// The op with the given wire code, if any.
    pub fn from_code(code: u64) -> Option<Self> {
        Self::iter().find(|op| op.code() == code)
    }

    /// Interpret a raw wire value as an op. Non-numeric values and codes
    /// outside the known set yield `None`.
    pub fn from_wire(value: &Value) -> Option<Self> {
        value.as_u64().and_then(Self::from_code)
    }
}

impl Serialize for Op {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.code())
    }
}

impl<'de> Deserialize<'de> for Op {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u64::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown op code {}", code)))
    }
}

/// A validated envelope: an op and its payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The operation.
    pub op: Op,
    /// The payload. Absent payloads are `null`.
    #[serde(default)]
    pub d: Value,
}

impl Envelope {
    /// An envelope with the given payload.
    pub fn new(op: Op, d: Value) -> Self {
        Self { op, d }
    }

    /// An envelope with no payload.
    pub fn bare(op: Op) -> Self {
        Self::new(op, Value::Null)
    }

    /// An envelope carrying `payload` serialized to JSON.
    pub fn with_payload<T: Serialize>(op: Op, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(op, serde_json::to_value(payload)?))
    }

    /// Deserialize the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.d)
    }
}

/// An envelope as received, before its op has been validated. Senders may
/// put anything in `op`; receivers decide what to do with codes they do
/// not know.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    /// The raw op value.
    #[serde(default)]
    pub op: Value,
    /// The payload.
    #[serde(default)]
    pub d: Value,
}

impl RawEnvelope {
    /// The op, if it is a known numeric code.
    pub fn op(&self) -> Option<Op> {
        Op::from_wire(&self.op)
    }

    /// Validate into an [`Envelope`].
    pub fn into_envelope(self) -> Option<Envelope> {
        let op = self.op()?;
        Some(Envelope { op, d: self.d })
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        Self {
            op: Value::from(envelope.op.code()),
            d: envelope.d,
        }
    }
}

/// The reply to a receptive request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Whether the request succeeded.
    pub success: bool,
    /// The result on success; an [`ErrorDescriptor`] (or `null`) on failure.
    #[serde(default)]
    pub d: Value,
}

impl Reply {
    /// A successful reply.
    pub fn ok(d: Value) -> Self {
        Self { success: true, d }
    }

    /// A failed reply carrying an error descriptor.
    pub fn err(error: ErrorDescriptor) -> Self {
        Self {
            success: false,
            d: serde_json::to_value(error).unwrap_or(Value::Null),
        }
    }

    /// A failed reply with no further detail.
    pub fn failure() -> Self {
        Self {
            success: false,
            d: Value::Null,
        }
    }

    /// Convert into a result, recovering the error descriptor of a failed
    /// reply.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        if self.success {
            return Ok(self.d);
        }
        match ErrorDescriptor::deserialize(&self.d) {
            Ok(descriptor) => Err(RemoteError(descriptor)),
            Err(_) => Err(RemoteError(ErrorDescriptor::new(
                "Error",
                "remote operation failed",
            ))),
        }
    }
}

/// A serializable description of an error raised on the other side of a
/// connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// The error's kind.
    pub name: String,
    /// The error's message.
    pub message: String,
    /// Additional context; for local errors, the chain of sources.
    #[serde(default)]
    pub stack: String,
}

impl ErrorDescriptor {
    /// A descriptor with an empty stack.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: String::new(),
        }
    }

    /// Describe a local error. The name is the error's type name and the
    /// stack lists its sources, one per line.
    pub fn from_error<E: StdError>(error: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let name = type_name.rsplit("::").next().unwrap_or(type_name);
        let mut stack = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        Self {
            name: name.to_string(),
            message: error.to_string(),
            stack: stack.join("\n"),
        }
    }

    /// The descriptor used to fill the slot of a peer that did not reply in
    /// time.
    pub fn timeout(after: Duration) -> Self {
        Self::new("TimeoutError", format!("no reply within {:?}", after))
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// An error reported by the remote side of a request.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{0}")]
pub struct RemoteError(pub ErrorDescriptor);

impl RemoteError {
    /// The remote error's descriptor.
    pub fn descriptor(&self) -> &ErrorDescriptor {
        &self.0
    }
}

/// Entities that can be looked up across workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntityKind {
    /// A user.
    User,
    /// A channel.
    Channel,
    /// A guild.
    Guild,
}

/// A request evaluated by a worker, or by the supervisor for master
/// evaluations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalRequest {
    /// Read a named property of the worker's client state.
    Property {
        /// Dot-separated property path.
        path: String,
    },
    /// Look up an entity by id; evaluates to `null` when absent.
    Lookup {
        /// The entity kind.
        entity: EntityKind,
        /// The entity id.
        id: String,
    },
    /// Evaluate arbitrary code. Only honored when evaluation is enabled.
    Script {
        /// The code to evaluate.
        code: String,
    },
}

/// The close frame reported with a shard disconnect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseEvent {
    /// The close code.
    pub code: u16,
    /// The close reason.
    #[serde(default)]
    pub reason: String,
    /// Whether the connection closed cleanly.
    #[serde(default)]
    pub was_clean: bool,
}

/// Payload of the shard lifecycle ops.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEvent {
    /// The reporting worker.
    pub cluster: usize,
    /// The shard the event concerns.
    pub shard: u32,
    /// Number of replayed events, for resumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed: Option<u64>,
    /// The close frame, for disconnects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_event: Option<CloseEvent>,
}
