/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::Incoming;
use crate::Op;

type Handler = Arc<dyn Fn(Incoming) -> BoxFuture<'static, ()> + Send + Sync>;

/// Errors raised while assembling a dispatch table.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// An op the table must handle has no handler.
    #[error("no handler registered for {0}")]
    MissingHandler(Op),
}

/// The outcome of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The message was handed to the handler for this op.
    Handled(Op),
    /// The op is known, but this table has no handler for it.
    Unhandled(Op),
    /// The op is not numeric or not a known code.
    Malformed,
}

/// Routes incoming messages to per-op handlers.
///
/// Handlers run to completion in arrival order, so long-running work
/// should be spawned from inside the handler. Messages with ops the table
/// does not handle are ignored; receptive ones receive no reply.
#[derive(Clone)]
pub struct DispatchTable {
    handlers: HashMap<Op, Handler>,
}

/// Builder for [`DispatchTable`].
#[derive(Default)]
pub struct DispatchTableBuilder {
    handlers: HashMap<Op, Handler>,
}

impl DispatchTableBuilder {
    /// Handle `op` with `handler`, replacing any earlier handler for it.
    pub fn on<F, Fut>(mut self, op: Op, handler: F) -> Self
    where
        F: Fn(Incoming) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .insert(op, Arc::new(move |incoming| handler(incoming).boxed()));
        self
    }

    /// Build the table.
    pub fn build(self) -> DispatchTable {
        DispatchTable {
            handlers: self.handlers,
        }
    }

    /// Build the table, failing if any of `required` lacks a handler.
    pub fn build_requiring(self, required: &[Op]) -> Result<DispatchTable, DispatchError> {
        if let Some(op) = required.iter().find(|op| !self.handlers.contains_key(op)) {
            return Err(DispatchError::MissingHandler(*op));
        }
        Ok(self.build())
    }
}

impl DispatchTable {
    /// Start building a table.
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    /// Whether the table has a handler for `op`.
    pub fn handles(&self, op: Op) -> bool {
        self.handlers.contains_key(&op)
    }

    /// Route one message, waiting for its handler to finish.
    pub async fn dispatch(&self, incoming: Incoming) -> Dispatch {
        let Some(op) = incoming.op() else {
            tracing::debug!(
                "ignoring message with invalid op {} from {}",
                incoming.envelope().op,
                incoming.from()
            );
            return Dispatch::Malformed;
        };
        match self.handlers.get(&op) {
            Some(handler) => {
                handler(incoming).await;
                Dispatch::Handled(op)
            }
            None => {
                tracing::debug!("ignoring unhandled {} from {}", op, incoming.from());
                Dispatch::Unhandled(op)
            }
        }
    }

    /// Dispatch messages from `inbound` until it closes.
    pub async fn serve(self, mut inbound: mpsc::UnboundedReceiver<Incoming>) {
        while let Some(incoming) = inbound.recv().await {
            self.dispatch(incoming).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::conn::tests::pair;
    use crate::ChannelConfig;
    use crate::ChannelError;
    use crate::Envelope;
    use crate::RawEnvelope;
    use crate::Reply;

    #[test]
    fn test_build_requiring() {
        let err = DispatchTable::builder()
            .on(Op::Eval, |_| async {})
            .build_requiring(&[Op::Eval, Op::Ready])
            .err()
            .unwrap();
        assert_eq!(err, DispatchError::MissingHandler(Op::Ready));
        assert_eq!(err.to_string(), "no handler registered for READY");

        let table = DispatchTable::builder()
            .on(Op::Eval, |_| async {})
            .build_requiring(&[Op::Eval])
            .unwrap();
        assert!(table.handles(Op::Eval));
        assert!(!table.handles(Op::Ready));
    }

    #[tokio::test]
    async fn test_dispatch_routes_and_ignores() {
        let (a, mut b) = pair(&ChannelConfig::default());
        let evals = Arc::new(AtomicUsize::new(0));
        let table = DispatchTable::builder()
            .on(Op::Eval, {
                let evals = Arc::clone(&evals);
                move |incoming: Incoming| {
                    let evals = Arc::clone(&evals);
                    async move {
                        evals.fetch_add(1, Ordering::SeqCst);
                        incoming.reply(Reply::ok(json!("handled")));
                    }
                }
            })
            .build();

        // A known op with no handler: the request goes unanswered.
        let unanswered = tokio::spawn({
            let conn = a.conn.clone();
            async move {
                conn.request(Envelope::bare(Op::Restart), Some(Duration::from_millis(100)))
                    .await
            }
        });
        let incoming = b.inbound.recv().await.unwrap();
        assert_eq!(table.dispatch(incoming).await, Dispatch::Unhandled(Op::Restart));
        assert!(matches!(
            unanswered.await.unwrap(),
            Err(ChannelError::Timeout(_))
        ));

        let answered = tokio::spawn({
            let conn = a.conn.clone();
            async move { conn.request(Envelope::bare(Op::Eval), None).await }
        });
        let incoming = b.inbound.recv().await.unwrap();
        assert_eq!(table.dispatch(incoming).await, Dispatch::Handled(Op::Eval));
        assert_eq!(answered.await.unwrap().unwrap(), Reply::ok(json!("handled")));
        assert_eq!(evals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_malformed() {
        let (a, mut b) = pair(&ChannelConfig::default());
        let table = DispatchTable::builder().build();

        for op in [json!("0"), json!(99), json!(null)] {
            let message = RawEnvelope { op, d: json!(1) };
            // Only valid envelopes can be sent through the API, so go through
            // the serialized form of a hand-written message.
            a.conn.post_raw(message).await.unwrap();
            let incoming = b.inbound.recv().await.unwrap();
            assert_eq!(table.dispatch(incoming).await, Dispatch::Malformed);
        }
    }
}
