/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

/// Types of channel transports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelTransport {
    /// Transport over a TCP connection.
    Tcp,
    /// Transport over a unix domain socket.
    Unix,
}

impl fmt::Display for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Unix => write!(f, "unix"),
        }
    }
}

/// The address on which a hub listens and to which peers connect.
///
/// Concrete syntax:
///
/// ```text
/// tcp:127.0.0.1:9999        // a TCP socket address
/// unix:/tmp/shardmesh.sock  // a unix socket path
/// 9999                      // shorthand for tcp:127.0.0.1:9999
/// /tmp/shardmesh.sock       // shorthand for unix:/tmp/shardmesh.sock
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChannelAddr {
    /// A TCP socket address.
    Tcp(SocketAddr),
    /// A filesystem path naming a unix domain socket.
    Unix(PathBuf),
}

impl ChannelAddr {
    /// A loopback TCP address on the given port.
    pub fn loopback(port: u16) -> Self {
        Self::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// The transport used by this address.
    pub fn transport(&self) -> ChannelTransport {
        match self {
            Self::Tcp(_) => ChannelTransport::Tcp,
            Self::Unix(_) => ChannelTransport::Unix,
        }
    }
}

impl fmt::Display for ChannelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp:{}", addr),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for ChannelAddr {
    type Err = anyhow::Error;

    fn from_str(addr: &str) -> Result<Self, Self::Err> {
        if let Ok(port) = addr.parse::<u16>() {
            return Ok(Self::loopback(port));
        }
        if addr.starts_with('/') || addr.starts_with('.') {
            return Ok(Self::Unix(PathBuf::from(addr)));
        }
        match addr.split_once(':') {
            Some(("tcp", rest)) => rest
                .parse::<SocketAddr>()
                .map(Self::Tcp)
                .context("invalid socket address syntax"),
            Some(("unix", "")) => Err(anyhow::anyhow!("empty unix socket path")),
            Some(("unix", rest)) => Ok(Self::Unix(PathBuf::from(rest))),
            Some((r#type, _)) => Err(anyhow::anyhow!("no such channel type: {}", r#type)),
            None => Err(anyhow::anyhow!("no channel type specified")),
        }
    }
}

impl TryFrom<String> for ChannelAddr {
    type Error = anyhow::Error;

    fn try_from(addr: String) -> Result<Self, Self::Error> {
        addr.parse()
    }
}

impl From<ChannelAddr> for String {
    fn from(addr: ChannelAddr) -> Self {
        addr.to_string()
    }
}
