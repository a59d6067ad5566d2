/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Stream plumbing shared by the hub and peers.

use std::io;
use std::path::PathBuf;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::UnixListener;
use tokio::net::UnixStream;

use crate::ChannelAddr;

/// A bidirectional byte stream, independent of transport.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub(crate) type BoxStream = Box<dyn Stream>;

pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Bind to `addr`. A stale unix socket file left behind by an earlier
    /// hub is removed first. TCP port 0 binds an ephemeral port; use
    /// [`Listener::local_addr`] to learn it.
    pub(crate) async fn bind(addr: &ChannelAddr) -> io::Result<Self> {
        match addr {
            ChannelAddr::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(addr).await?)),
            ChannelAddr::Unix(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::debug!("removed stale socket {}", path.display()),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
                Ok(Self::Unix(UnixListener::bind(path)?, path.clone()))
            }
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<ChannelAddr> {
        match self {
            Self::Tcp(listener) => Ok(ChannelAddr::Tcp(listener.local_addr()?)),
            Self::Unix(_, path) => Ok(ChannelAddr::Unix(path.clone())),
        }
    }

    pub(crate) async fn accept(&self) -> io::Result<BoxStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Self::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix(_, path) = self {
            if let Err(err) = std::fs::remove_file(path.as_path()) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove socket {}: {}", path.display(), err);
                }
            }
        }
    }
}

pub(crate) async fn dial(addr: &ChannelAddr) -> io::Result<BoxStream> {
    match addr {
        ChannelAddr::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        ChannelAddr::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
    }
}
