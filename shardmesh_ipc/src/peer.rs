/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::WaitForCancellationFuture;

use crate::conn::Connection;
use crate::conn::Frame;
use crate::framed::write_frame;
use crate::framed::FrameReader;
use crate::net;
use crate::ChannelAddr;
use crate::ChannelConfig;
use crate::ChannelError;
use crate::Envelope;
use crate::Incoming;
use crate::Reply;
use crate::SendOptions;
use crate::TransportEvent;
use crate::EVENT_CAPACITY;

/// The worker end of the transport: a single connection to a hub,
/// registered under the peer's name.
///
/// Clones share the connection, which closes when [`Peer::close`] is
/// called, the hub goes away, or the last clone is dropped.
#[derive(Clone)]
pub struct Peer {
    name: Arc<str>,
    hub: ChannelAddr,
    conn: Connection,
    events: broadcast::Sender<TransportEvent>,
    /// Subscribed before the connect event was sent; handed to the first
    /// subscriber.
    first: Arc<Mutex<Option<broadcast::Receiver<TransportEvent>>>>,
    _owner: Arc<CloseOnDrop>,
}

struct CloseOnDrop(Connection);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl Peer {
    /// Connect to the hub at `hub` and register as `name`. Requests and
    /// messages sent by the hub are delivered on the returned receiver.
    pub async fn connect(
        name: impl Into<String>,
        hub: &ChannelAddr,
        config: ChannelConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Incoming>), ChannelError> {
        let name = name.into();
        let connect_error = |source| ChannelError::Connection {
            addr: hub.clone(),
            source,
        };
        let stream = match tokio::time::timeout(config.connect_timeout(), net::dial(hub)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(connect_error(err)),
            Err(_) => {
                return Err(connect_error(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no connection within {:?}", config.connect_timeout()),
                )));
            }
        };

        let (read, mut write) = tokio::io::split(stream);
        let hello = serde_json::to_vec(&Frame::Hello { name: name.clone() })?;
        write_frame(&mut write, &hello, config.max_frame_length)
            .await
            .map_err(connect_error)?;

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (events, first) = broadcast::channel(EVENT_CAPACITY);
        let conn = Connection::start(
            hub.to_string(),
            FrameReader::new(read, config.max_frame_length),
            write,
            &config,
            inbound_tx,
            events.clone(),
        );
        let _ = events.send(TransportEvent::Connect {
            name: hub.to_string(),
        });
        tokio::spawn({
            let conn = conn.clone();
            let events = events.clone();
            async move {
                conn.closed().await;
                tracing::debug!("connection to hub at {} closed", conn.remote());
                let _ = events.send(TransportEvent::Disconnect {
                    name: conn.remote().to_string(),
                });
            }
        });
        tracing::debug!("{} connected to hub at {}", name, hub);

        Ok((
            Self {
                name: name.into(),
                hub: hub.clone(),
                _owner: Arc::new(CloseOnDrop(conn.clone())),
                conn,
                events,
                first: Arc::new(Mutex::new(Some(first))),
            },
            inbound,
        ))
    }

    /// The name this peer registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address of the hub.
    pub fn hub_addr(&self) -> &ChannelAddr {
        &self.hub
    }

    /// Send to the hub. Receptive sends return its reply.
    pub async fn send(
        &self,
        envelope: Envelope,
        options: SendOptions,
    ) -> Result<Option<Reply>, ChannelError> {
        self.conn.send(envelope, options).await
    }

    /// Send a request to the hub and wait for its reply.
    pub async fn request(&self, envelope: Envelope) -> Result<Reply, ChannelError> {
        self.conn.request(envelope, None).await
    }

    /// Send a one-way message to the hub.
    pub async fn post(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.conn.post(envelope).await
    }

    /// Subscribe to connection lifecycle events. The first subscriber
    /// also receives the connect event, and anything that followed it.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    /// Whether the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Resolves once the connection has closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.conn.closed()
    }

    /// Close the connection.
    pub fn close(&self) {
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        let dir = TempDir::new().unwrap();
        let addr = ChannelAddr::Unix(dir.path().join("nobody-home.sock"));
        let err = Peer::connect("Cluster 0", &addr, ChannelConfig::default())
            .await
            .err()
            .unwrap();
        match err {
            ChannelError::Connection { addr: failed, .. } => assert_eq!(failed, addr),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hub_shutdown_observed() {
        let dir = TempDir::new().unwrap();
        let (hub, _inbound) = crate::Hub::listen(
            &ChannelAddr::Unix(dir.path().join("hub.sock")),
            ChannelConfig::default(),
        )
        .await
        .unwrap();
        let (peer, _rx) = Peer::connect("Cluster 0", hub.addr(), ChannelConfig::default())
            .await
            .unwrap();
        let mut events = peer.subscribe();
        assert_eq!(peer.name(), "Cluster 0");
        assert_eq!(
            events.try_recv().unwrap(),
            TransportEvent::Connect {
                name: hub.addr().to_string()
            }
        );
        // Later subscribers only see what happens from then on.
        let mut later = peer.subscribe();
        assert!(later.try_recv().is_err());

        drop(hub);
        tokio::time::timeout(Duration::from_secs(5), peer.closed())
            .await
            .unwrap();
        assert!(peer.is_closed());
        // A read error may be reported before the disconnect.
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Disconnect { .. } => break,
                TransportEvent::Error { .. } => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(matches!(
            peer.request(Envelope::bare(crate::Op::Ready)).await,
            Err(ChannelError::Closed)
        ));
    }
}
