/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Length-prefixed framing: each frame is an 8-byte big-endian length
//! followed by exactly that many bytes of body.

use std::io;
use std::mem::take;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 8;

/// A FrameReader reads frames from an underlying [`AsyncRead`].
pub struct FrameReader<R> {
    reader: R,
    max_frame_length: usize,
    state: FrameReaderState,
}

enum FrameReaderState {
    /// Accumulating the length prefix.
    ReadLen { buf: [u8; LEN_PREFIX], off: usize },
    /// Accumulating a body of exactly `len` bytes.
    ReadBody { buf: BytesMut, len: usize }, // buf.len() <= len
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a new framer for `reader`. Frames exceeding `max_frame_length`
    /// result in an irrecoverable reader error.
    pub fn new(reader: R, max_frame_length: usize) -> Self {
        Self {
            reader,
            max_frame_length,
            state: FrameReaderState::ReadLen {
                buf: [0; LEN_PREFIX],
                off: 0,
            },
        }
    }

    /// Read the next frame. Returns `Ok(None)` when the stream ends on a
    /// frame boundary.
    ///
    /// The method is cancellation safe: partial frames are retained across
    /// calls, so it may be used in a `tokio::select!` branch.
    ///
    /// # Errors
    ///
    /// * `io::ErrorKind::InvalidData` if a frame exceeds `max_frame_length`.
    ///   This error is fatal; the connection is no longer valid.
    /// * `io::ErrorKind::UnexpectedEof` if the stream ends mid-frame.
    pub async fn next(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match &mut self.state {
                FrameReaderState::ReadLen { buf, off } if *off < LEN_PREFIX => {
                    let n = self.reader.read(&mut buf[*off..]).await?;
                    if n == 0 {
                        return if *off == 0 {
                            Ok(None)
                        } else {
                            Err(io::ErrorKind::UnexpectedEof.into())
                        };
                    }
                    *off += n;
                }

                FrameReaderState::ReadLen { buf, .. } => {
                    let len = (&buf[..]).get_u64();
                    let len = match usize::try_from(len) {
                        Ok(len) if len <= self.max_frame_length => len,
                        _ => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!(
                                    "frame length {} exceeds maximum {}",
                                    len, self.max_frame_length
                                ),
                            ));
                        }
                    };
                    self.state = FrameReaderState::ReadBody {
                        buf: BytesMut::with_capacity(len),
                        len,
                    };
                }

                FrameReaderState::ReadBody { buf, len } if buf.len() < *len => {
                    let remaining = (*len - buf.len()) as u64;
                    let n = (&mut self.reader).take(remaining).read_buf(buf).await?;
                    if n == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                }

                FrameReaderState::ReadBody { buf, .. } => {
                    let frame = take(buf).freeze();
                    self.state = FrameReaderState::ReadLen {
                        buf: [0; LEN_PREFIX],
                        off: 0,
                    };
                    return Ok(Some(frame));
                }
            }
        }
    }
}

/// Prefix `body` with its length.
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + body.len());
    buf.put_u64(body.len() as u64);
    buf.put_slice(body);
    buf.freeze()
}

/// Write a single frame and flush it. Bodies longer than `max_frame_length`
/// are rejected before anything is written.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
    max_frame_length: usize,
) -> io::Result<()> {
    if body.len() > max_frame_length {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame length {} exceeds maximum {}",
                body.len(),
                max_frame_length
            ),
        ));
    }
    writer.write_all(&encode_frame(body)).await?;
    writer.flush().await
}
