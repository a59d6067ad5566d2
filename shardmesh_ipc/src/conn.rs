/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A single framed connection, shared by both ends of the transport.
//!
//! Each connection runs a writer task that drains an outbound queue and a
//! reader task that routes inbound frames: replies complete the matching
//! pending request, requests and one-way messages are delivered as
//! [`Incoming`]s.

use std::io;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFuture;

use crate::framed::write_frame;
use crate::framed::FrameReader;
use crate::ChannelConfig;
use crate::ChannelError;
use crate::Envelope;
use crate::ErrorDescriptor;
use crate::Op;
use crate::RawEnvelope;
use crate::Reply;
use crate::SendOptions;
use crate::TransportEvent;

/// Frame bodies, tagged by `t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub(crate) enum Frame {
    /// The first frame a peer sends after connecting.
    Hello { name: String },
    /// A request expecting a reply correlated by `id`.
    Request {
        id: u64,
        #[serde(default)]
        op: Value,
        #[serde(default)]
        d: Value,
    },
    /// A one-way message.
    Message {
        #[serde(default)]
        op: Value,
        #[serde(default)]
        d: Value,
    },
    /// The reply to request `id`.
    Reply {
        id: u64,
        success: bool,
        #[serde(default)]
        d: Value,
    },
}

struct Outgoing {
    frame: Frame,
    flushed: Option<oneshot::Sender<Result<(), ChannelError>>>,
}

/// A request or one-way message received from the remote end.
#[derive(Debug)]
pub struct Incoming {
    from: String,
    envelope: RawEnvelope,
    responder: Option<Responder>,
}

#[derive(Debug)]
struct Responder {
    id: u64,
    outbound: mpsc::UnboundedSender<Outgoing>,
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outgoing")
            .field("frame", &self.frame)
            .finish_non_exhaustive()
    }
}

impl Incoming {
    /// The name of the sender.
    pub fn from(&self) -> &str {
        &self.from
    }

    /// The op, if it is a known code.
    pub fn op(&self) -> Option<Op> {
        self.envelope.op()
    }

    /// The envelope as received.
    pub fn envelope(&self) -> &RawEnvelope {
        &self.envelope
    }

    /// The raw payload.
    pub fn payload(&self) -> &Value {
        &self.envelope.d
    }

    /// Deserialize the payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.envelope.d)
    }

    /// Whether the sender expects a reply.
    pub fn is_receptive(&self) -> bool {
        self.responder.is_some()
    }

    /// Reply to the sender. Returns false if the message was one-way or the
    /// connection has since closed.
    pub fn reply(self, reply: Reply) -> bool {
        let Some(responder) = self.responder else {
            tracing::debug!(
                "dropping reply to one-way {:?} from {}",
                self.envelope.op,
                self.from
            );
            return false;
        };
        responder
            .outbound
            .send(Outgoing {
                frame: Frame::Reply {
                    id: responder.id,
                    success: reply.success,
                    d: reply.d,
                },
                flushed: None,
            })
            .is_ok()
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// A handle to a running connection. Clones share the connection.
#[derive(Clone)]
pub(crate) struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    remote: String,
    outbound: mpsc::UnboundedSender<Outgoing>,
    pending: DashMap<u64, oneshot::Sender<Reply>>,
    next_request: AtomicU64,
    request_timeout: Duration,
    closed: CancellationToken,
}

/// Removes a pending request when its waiter goes away, whether it was
/// answered, timed out or cancelled.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<Reply>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Connection {
    /// Start the reader and writer tasks for a connection to `remote`.
    pub(crate) fn start<R, W>(
        remote: String,
        reader: FrameReader<R>,
        writer: W,
        config: &ChannelConfig,
        inbound: mpsc::UnboundedSender<Incoming>,
        events: broadcast::Sender<TransportEvent>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let conn = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                remote,
                outbound,
                pending: DashMap::new(),
                next_request: AtomicU64::new(0),
                request_timeout: config.request_timeout(),
                closed: CancellationToken::new(),
            }),
        };
        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            config.max_frame_length,
            conn.inner.closed.clone(),
        ));
        tokio::spawn(read_loop(reader, conn.clone(), inbound, events));
        conn
    }

    /// A process-unique identifier for this connection.
    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// The name of the remote end.
    pub(crate) fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection has closed.
    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.closed.cancelled()
    }

    /// Close the connection. Outstanding requests fail with
    /// [`ChannelError::Closed`].
    pub(crate) fn close(&self) {
        self.inner.closed.cancel();
        self.inner.pending.clear();
    }

    /// Send a request and wait for its reply. Replies that arrive after
    /// the timeout are discarded.
    pub(crate) async fn request(
        &self,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<Reply, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let timeout = timeout.unwrap_or(self.inner.request_timeout);
        let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id,
        };
        // A close racing with the insert would otherwise leave us waiting
        // for the full timeout.
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let (flushed, flushed_rx) = oneshot::channel();
        self.inner
            .outbound
            .send(Outgoing {
                frame: Frame::Request {
                    id,
                    op: Value::from(envelope.op.code()),
                    d: envelope.d,
                },
                flushed: Some(flushed),
            })
            .map_err(|_| ChannelError::Closed)?;

        let outcome = tokio::time::timeout(timeout, async {
            // A request the writer rejects never reaches the remote end.
            flushed_rx.await.map_err(|_| ChannelError::Closed)??;
            rx.await.map_err(|_| ChannelError::Closed)
        })
        .await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(
                    "request {} ({}) to {} timed out after {:?}",
                    id,
                    envelope.op,
                    self.remote(),
                    timeout
                );
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// Send a one-way message, resolving once it has been flushed.
    pub(crate) async fn post(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.post_raw(envelope.into()).await
    }

    /// Send a one-way message whose op is not validated.
    pub(crate) async fn post_raw(&self, envelope: RawEnvelope) -> Result<(), ChannelError> {
        let (flushed, rx) = oneshot::channel();
        self.inner
            .outbound
            .send(Outgoing {
                frame: Frame::Message {
                    op: envelope.op,
                    d: envelope.d,
                },
                flushed: Some(flushed),
            })
            .map_err(|_| ChannelError::Closed)?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Send according to `options`: receptive sends return the reply,
    /// one-way sends return `None` once flushed.
    pub(crate) async fn send(
        &self,
        envelope: Envelope,
        options: SendOptions,
    ) -> Result<Option<Reply>, ChannelError> {
        if options.receptive {
            self.request(envelope, options.timeout).await.map(Some)
        } else {
            self.post(envelope).await.map(|()| None)
        }
    }

    fn complete(&self, id: u64, reply: Reply) {
        match self.inner.pending.remove(&id) {
            Some((_, waiter)) => {
                // The waiter may have given up in the meantime.
                let _ = waiter.send(reply);
            }
            None => tracing::debug!(
                "discarding reply {} from {}: no pending request",
                id,
                self.remote()
            ),
        }
    }

    fn deliver(
        &self,
        inbound: &mpsc::UnboundedSender<Incoming>,
        envelope: RawEnvelope,
        request: Option<u64>,
    ) {
        let incoming = Incoming {
            from: self.inner.remote.clone(),
            envelope,
            responder: request.map(|id| Responder {
                id,
                outbound: self.inner.outbound.clone(),
            }),
        };
        if inbound.send(incoming).is_err() {
            tracing::debug!("no receiver for messages from {}", self.remote());
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
    max_frame_length: usize,
    closed: CancellationToken,
) {
    loop {
        let outgoing = tokio::select! {
            _ = closed.cancelled() => break,
            outgoing = outbound.recv() => match outgoing {
                Some(outgoing) => outgoing,
                None => break,
            },
        };
        let mut result = write_one(&mut writer, &outgoing.frame, max_frame_length).await;
        // A reply the writer rejects is replaced by an error reply, so that
        // the requester does not wait out its timeout.
        let substitutes: Vec<Frame> = match (&result, &outgoing.frame) {
            (Err(err), Frame::Reply { id, .. }) if !is_fatal(&result) => {
                tracing::warn!("failed to send reply {}: {}", id, err);
                [Reply::err(ErrorDescriptor::from_error(err)), Reply::failure()]
                    .into_iter()
                    .map(|reply| Frame::Reply {
                        id: *id,
                        success: reply.success,
                        d: reply.d,
                    })
                    .collect()
            }
            (Err(err), _) => {
                tracing::warn!("failed to send frame: {}", err);
                Vec::new()
            }
            (Ok(()), _) => Vec::new(),
        };
        for frame in substitutes {
            result = write_one(&mut writer, &frame, max_frame_length).await;
            if result.is_ok() || is_fatal(&result) {
                break;
            }
        }
        let fatal = is_fatal(&result);
        if let Some(flushed) = outgoing.flushed {
            let _ = flushed.send(result);
        }
        if fatal {
            closed.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_one<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    max_frame_length: usize,
) -> Result<(), ChannelError> {
    let body = serde_json::to_vec(frame)?;
    Ok(write_frame(writer, &body, max_frame_length).await?)
}

/// Whether a write failure broke the stream. Oversized frames are rejected
/// before any byte is written, so the stream is still intact.
fn is_fatal(result: &Result<(), ChannelError>) -> bool {
    matches!(
        result,
        Err(ChannelError::Io(err)) if err.kind() != io::ErrorKind::InvalidData
    )
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    conn: Connection,
    inbound: mpsc::UnboundedSender<Incoming>,
    events: broadcast::Sender<TransportEvent>,
) {
    loop {
        let next = tokio::select! {
            _ = conn.closed() => break,
            next = reader.next() => next,
        };
        let body = match next {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!("read from {} failed: {}", conn.remote(), err);
                let _ = events.send(TransportEvent::Error {
                    name: Some(conn.remote().to_string()),
                    message: err.to_string(),
                });
                break;
            }
        };
        match serde_json::from_slice::<Frame>(&body) {
            Ok(Frame::Reply { id, success, d }) => conn.complete(id, Reply { success, d }),
            Ok(Frame::Request { id, op, d }) => {
                conn.deliver(&inbound, RawEnvelope { op, d }, Some(id))
            }
            Ok(Frame::Message { op, d }) => conn.deliver(&inbound, RawEnvelope { op, d }, None),
            Ok(Frame::Hello { name }) => {
                tracing::debug!("ignoring repeated hello ({}) from {}", name, conn.remote())
            }
            Err(err) => {
                tracing::warn!("dropping invalid frame from {}: {}", conn.remote(), err);
                let _ = events.send(TransportEvent::Error {
                    name: Some(conn.remote().to_string()),
                    message: format!("invalid frame: {}", err),
                });
            }
        }
    }
    conn.close();
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;
    use tokio::io::duplex;

    use super::*;
    use crate::framed::encode_frame;

    pub(crate) struct End {
        pub(crate) conn: Connection,
        pub(crate) inbound: mpsc::UnboundedReceiver<Incoming>,
        pub(crate) events: broadcast::Receiver<TransportEvent>,
    }

    fn end(
        remote: &str,
        stream: tokio::io::DuplexStream,
        config: &ChannelConfig,
    ) -> End {
        let (read, write) = tokio::io::split(stream);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (events_tx, events) = broadcast::channel(16);
        let conn = Connection::start(
            remote.to_string(),
            FrameReader::new(read, config.max_frame_length),
            write,
            config,
            inbound_tx,
            events_tx,
        );
        End {
            conn,
            inbound,
            events,
        }
    }

    pub(crate) fn pair(config: &ChannelConfig) -> (End, End) {
        let (a, b) = duplex(4096);
        (end("b", a, config), end("a", b, config))
    }

    #[tokio::test]
    async fn test_out_of_order_replies_correlate() {
        let (a, mut b) = pair(&ChannelConfig::default());

        let first = tokio::spawn({
            let conn = a.conn.clone();
            async move { conn.request(Envelope::new(Op::Eval, json!("first")), None).await }
        });
        let second = tokio::spawn({
            let conn = a.conn.clone();
            async move { conn.request(Envelope::new(Op::Eval, json!("second")), None).await }
        });

        let x = b.inbound.recv().await.unwrap();
        let y = b.inbound.recv().await.unwrap();
        assert!(x.is_receptive() && y.is_receptive());
        assert_eq!(x.from(), "a");

        // Answer in reverse arrival order; each reply echoes its request.
        for incoming in [y, x] {
            let echo = incoming.payload().clone();
            assert!(incoming.reply(Reply::ok(echo)));
        }

        assert_eq!(first.await.unwrap().unwrap(), Reply::ok(json!("first")));
        assert_eq!(second.await.unwrap().unwrap(), Reply::ok(json!("second")));
    }

    #[tokio::test]
    async fn test_late_reply_discarded() {
        let (a, mut b) = pair(&ChannelConfig::default());

        let err = a
            .conn
            .request(Envelope::bare(Op::Eval), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));

        let late = b.inbound.recv().await.unwrap();
        assert!(late.reply(Reply::ok(json!("late"))));

        // The connection stays usable and the late reply is not mistaken for
        // the next one.
        let next = tokio::spawn({
            let conn = a.conn.clone();
            async move { conn.request(Envelope::bare(Op::Eval), None).await }
        });
        let incoming = b.inbound.recv().await.unwrap();
        incoming.reply(Reply::ok(json!("fresh")));
        assert_eq!(next.await.unwrap().unwrap(), Reply::ok(json!("fresh")));
    }

    #[tokio::test]
    async fn test_oversized_frames_fail_fast() {
        let config = ChannelConfig {
            max_frame_length: 256,
            ..Default::default()
        };
        let (a, mut b) = pair(&config);
        let big = json!("x".repeat(1000));

        let started = tokio::time::Instant::now();
        let err = a
            .conn
            .request(Envelope::new(Op::Eval, big.clone()), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, ChannelError::Io(err) if err.kind() == io::ErrorKind::InvalidData),
            "{:?}",
            err
        );
        assert!(started.elapsed() < Duration::from_secs(5));

        // A reply too large to send becomes an error reply.
        let request = tokio::spawn({
            let conn = a.conn.clone();
            async move {
                conn.request(Envelope::bare(Op::Eval), Some(Duration::from_secs(5)))
                    .await
            }
        });
        let incoming = b.inbound.recv().await.unwrap();
        assert!(incoming.reply(Reply::ok(big)));
        let reply = request.await.unwrap().unwrap();
        let error = reply.into_result().unwrap_err();
        assert_eq!(error.descriptor().name, "ChannelError");
        assert!(error.descriptor().message.contains("exceeds maximum"));

        // Neither end gave up on the connection.
        assert!(!a.conn.is_closed() && !b.conn.is_closed());
    }

    #[tokio::test]
    async fn test_post_is_one_way() {
        let (a, mut b) = pair(&ChannelConfig::default());
        a.conn
            .post(Envelope::new(Op::Ready, json!(2)))
            .await
            .unwrap();
        let incoming = b.inbound.recv().await.unwrap();
        assert_eq!(incoming.op(), Some(Op::Ready));
        assert_eq!(incoming.payload_as::<usize>().unwrap(), 2);
        assert!(!incoming.is_receptive());
        assert!(!incoming.reply(Reply::ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_close_fails_pending_requests() {
        let (a, _b) = pair(&ChannelConfig::default());
        let pending = tokio::spawn({
            let conn = a.conn.clone();
            async move { conn.request(Envelope::bare(Op::Eval), None).await }
        });
        tokio::task::yield_now().await;
        a.conn.close();
        assert!(matches!(
            pending.await.unwrap().unwrap_err(),
            ChannelError::Closed
        ));
        assert!(matches!(
            a.conn.request(Envelope::bare(Op::Eval), None).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_remote_close_is_observed() {
        let (a, b) = pair(&ChannelConfig::default());
        b.conn.close();
        tokio::time::timeout(Duration::from_secs(5), a.conn.closed())
            .await
            .unwrap();
        assert!(a.conn.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_frame_is_dropped() {
        let config = ChannelConfig::default();
        let (raw, stream) = duplex(4096);
        let mut b = end("raw", stream, &config);
        let (mut raw_read, mut raw_write) = tokio::io::split(raw);

        raw_write
            .write_all(&encode_frame(b"{not json"))
            .await
            .unwrap();
        raw_write
            .write_all(&encode_frame(br#"{"t":"message","op":"x","d":1}"#))
            .await
            .unwrap();
        raw_write
            .write_all(&encode_frame(br#"{"t":"request","id":7,"op":0}"#))
            .await
            .unwrap();

        match b.events.recv().await.unwrap() {
            TransportEvent::Error { name, message } => {
                assert_eq!(name.as_deref(), Some("raw"));
                assert!(message.starts_with("invalid frame"), "{}", message);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // A message with a non-numeric op is still delivered; the receiver
        // decides to ignore it.
        let message = b.inbound.recv().await.unwrap();
        assert_eq!(message.op(), None);
        assert_eq!(message.envelope().op, json!("x"));

        let request = b.inbound.recv().await.unwrap();
        assert_eq!(request.op(), Some(Op::Eval));
        assert_eq!(request.payload(), &Value::Null);
        request.reply(Reply::ok(json!(1)));

        let mut reader = FrameReader::new(&mut raw_read, config.max_frame_length);
        let body = reader.next().await.unwrap().unwrap();
        let frame: Frame = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            frame,
            Frame::Reply {
                id: 7,
                success: true,
                d: json!(1)
            }
        );
        assert!(!b.conn.is_closed());
    }
}
