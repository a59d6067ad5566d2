/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;

use crate::conn::Connection;
use crate::conn::Frame;
use crate::framed::FrameReader;
use crate::net::BoxStream;
use crate::net::Listener;
use crate::ChannelAddr;
use crate::ChannelConfig;
use crate::ChannelError;
use crate::Envelope;
use crate::ErrorDescriptor;
use crate::Incoming;
use crate::Reply;
use crate::SendOptions;
use crate::TransportEvent;
use crate::EVENT_CAPACITY;

/// The supervisor end of the transport. A hub accepts peer connections,
/// registers each under the name it announces in its hello, and can
/// address peers individually or all at once.
///
/// Clones share the hub. The hub stops accepting, and closes every
/// connection, when [`Hub::close`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
    _guard: Arc<DropGuard>,
}

struct Shared {
    addr: ChannelAddr,
    config: ChannelConfig,
    /// Peer slots, in order of first registration.
    slots: Mutex<Vec<Slot>>,
    events: broadcast::Sender<TransportEvent>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Listen on `addr`. Messages from all peers are delivered on the
    /// returned receiver.
    pub async fn listen(
        addr: &ChannelAddr,
        config: ChannelConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Incoming>), ChannelError> {
        let bind_error = |source| ChannelError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = Listener::bind(addr).await.map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            addr: local,
            config,
            slots: Mutex::new(Vec::new()),
            events,
            shutdown: shutdown.clone(),
        });
        tokio::spawn(accept_loop(Arc::clone(&shared), listener, inbound_tx));
        tracing::debug!("hub listening on {}", shared.addr);

        Ok((
            Self {
                shared,
                _guard: Arc::new(shutdown.drop_guard()),
            },
            inbound,
        ))
    }

    /// The address the hub is listening on. For TCP, this includes the
    /// port actually bound.
    pub fn addr(&self) -> &ChannelAddr {
        &self.shared.addr
    }

    /// The configuration the hub was started with.
    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Names of the connected peers, in registration order.
    pub fn peers(&self) -> Vec<String> {
        self.shared
            .connections()
            .iter()
            .map(|conn| conn.remote().to_string())
            .collect()
    }

    /// Whether a peer named `name` is connected.
    pub fn is_connected(&self, name: &str) -> bool {
        self.shared
            .slots()
            .iter()
            .any(|slot| slot.name == name && slot.conn.is_some())
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn connection(&self, name: &str) -> Result<Connection, ChannelError> {
        self.shared
            .slots()
            .iter()
            .find(|slot| slot.name == name)
            .and_then(|slot| slot.conn.clone())
            .ok_or_else(|| ChannelError::NoSuchPeer(name.to_string()))
    }

    /// Send to the peer named `name`. Receptive sends return its reply.
    pub async fn send_to(
        &self,
        name: &str,
        envelope: Envelope,
        options: SendOptions,
    ) -> Result<Option<Reply>, ChannelError> {
        self.connection(name)?.send(envelope, options).await
    }

    /// Send a request to the peer named `name` and wait for its reply.
    pub async fn request_to(&self, name: &str, envelope: Envelope) -> Result<Reply, ChannelError> {
        self.connection(name)?.request(envelope, None).await
    }

    /// Send a one-way message to the peer named `name`.
    pub async fn post_to(&self, name: &str, envelope: Envelope) -> Result<(), ChannelError> {
        self.connection(name)?.post(envelope).await
    }

    /// Send `envelope` as a request to every connected peer and collect
    /// one reply per peer, in registration order. A peer that reconnects
    /// keeps the position of its first registration. A peer that fails to
    /// reply within the request timeout contributes a failed reply in its
    /// slot.
    pub async fn broadcast(&self, envelope: Envelope) -> Vec<(String, Reply)> {
        self.broadcast_with_timeout(envelope, self.shared.config.request_timeout())
            .await
    }

    /// Like [`Hub::broadcast`], with an explicit per-peer timeout.
    pub async fn broadcast_with_timeout(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Vec<(String, Reply)> {
        let peers = self.shared.connections();
        join_all(peers.into_iter().map(|conn| {
            let envelope = envelope.clone();
            async move {
                let reply = match conn.request(envelope, Some(timeout)).await {
                    Ok(reply) => reply,
                    Err(ChannelError::Timeout(after)) => {
                        Reply::err(ErrorDescriptor::timeout(after))
                    }
                    Err(err) => Reply::err(ErrorDescriptor::from_error(&err)),
                };
                (conn.remote().to_string(), reply)
            }
        }))
        .await
    }

    /// Stop accepting and close every connection.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
        for conn in self.shared.connections() {
            conn.close();
        }
    }
}

/// A registration position. The slot outlives its connection, so that a
/// peer that disconnects and registers again returns to the same place.
struct Slot {
    name: String,
    conn: Option<Connection>,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live connections, in registration order.
    fn connections(&self) -> Vec<Connection> {
        self.slots()
            .iter()
            .filter_map(|slot| slot.conn.clone())
            .collect()
    }

    /// Register `conn`. A peer that registers under a name seen before
    /// takes over that name's slot; a previous live connection is closed.
    fn register(&self, conn: Connection) {
        let replaced = {
            let mut slots = self.slots();
            match slots.iter_mut().find(|slot| slot.name == conn.remote()) {
                Some(slot) => slot.conn.replace(conn.clone()),
                None => {
                    slots.push(Slot {
                        name: conn.remote().to_string(),
                        conn: Some(conn.clone()),
                    });
                    None
                }
            }
        };
        if let Some(previous) = replaced {
            tracing::info!(
                "{} registered again; closing its previous connection",
                conn.remote()
            );
            previous.close();
        }
        tracing::debug!("{} connected", conn.remote());
        let _ = self.events.send(TransportEvent::Connect {
            name: conn.remote().to_string(),
        });
    }

    fn deregister(&self, conn: &Connection) {
        let removed = {
            let mut slots = self.slots();
            slots
                .iter_mut()
                .find(|slot| slot.conn.as_ref().is_some_and(|c| c.id() == conn.id()))
                .and_then(|slot| slot.conn.take())
                .is_some()
        };
        if removed {
            tracing::debug!("{} disconnected", conn.remote());
            let _ = self.events.send(TransportEvent::Disconnect {
                name: conn.remote().to_string(),
            });
        }
    }

    fn error(&self, name: Option<String>, err: &ChannelError) {
        let _ = self.events.send(TransportEvent::Error {
            name,
            message: err.to_string(),
        });
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: Listener,
    inbound: mpsc::UnboundedSender<Incoming>,
) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    tokio::spawn(admit(Arc::clone(&shared), stream, inbound.clone()));
                }
                Err(err) => {
                    tracing::error!("accept on {} failed: {}", shared.addr, err);
                    shared.error(None, &err.into());
                }
            },
        }
    }
    tracing::debug!("hub on {} stopped accepting", shared.addr);
}

async fn admit(
    shared: Arc<Shared>,
    stream: BoxStream,
    inbound: mpsc::UnboundedSender<Incoming>,
) {
    let (read, write) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read, shared.config.max_frame_length);
    let name = match handshake(&mut reader, shared.config.handshake_timeout()).await {
        Ok(name) => name,
        Err(err) => {
            tracing::warn!("rejecting connection on {}: {}", shared.addr, err);
            shared.error(None, &err);
            return;
        }
    };

    let conn = Connection::start(
        name,
        reader,
        write,
        &shared.config,
        inbound,
        shared.events.clone(),
    );
    shared.register(conn.clone());
    tokio::select! {
        _ = conn.closed() => {}
        _ = shared.shutdown.cancelled() => conn.close(),
    }
    shared.deregister(&conn);
}

async fn handshake<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    timeout: Duration,
) -> Result<String, ChannelError> {
    let body = match tokio::time::timeout(timeout, reader.next()).await {
        Err(_) => {
            return Err(ChannelError::Handshake(format!(
                "no hello within {:?}",
                timeout
            )));
        }
        Ok(Err(err)) => return Err(err.into()),
        Ok(Ok(None)) => return Err(ChannelError::Handshake("closed before hello".to_string())),
        Ok(Ok(Some(body))) => body,
    };
    match serde_json::from_slice::<Frame>(&body)? {
        Frame::Hello { name } => Ok(name),
        other => Err(ChannelError::Handshake(format!(
            "expected hello, got {:?}",
            other
        ))),
    }
}
