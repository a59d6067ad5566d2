/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::io;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::task::JoinHandle;

/// Maximum byte size of a single log line before truncation.
const MAX_BYTE_SIZE_LOG_LINE: usize = 256 * 1024;

/// Tails a worker's output stream: every line is copied, prefixed, onto a
/// tee writer, and the last `max` lines are kept for post-mortems.
pub(crate) struct LogTailer {
    lines: Arc<Mutex<VecDeque<String>>>,
    handle: JoinHandle<io::Result<()>>,
}

impl LogTailer {
    /// Tail `stream` in the background until it ends, writing each line to
    /// `tee` preceded by `prefix`.
    pub(crate) fn tee(
        max: usize,
        prefix: String,
        stream: impl AsyncRead + Send + Unpin + 'static,
        mut tee: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(max)));
        let handle = tokio::spawn({
            let lines = Arc::clone(&lines);
            async move {
                let mut reader = BufReader::new(stream);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    let n = (&mut reader)
                        .take(MAX_BYTE_SIZE_LOG_LINE as u64)
                        .read_until(b'\n', &mut buf)
                        .await?;
                    if n == 0 {
                        break Ok(());
                    }
                    let complete = buf.ends_with(b"\n");
                    let mut line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if !complete && n == MAX_BYTE_SIZE_LOG_LINE {
                        line.push_str("<TRUNCATED>");
                        skip_line(&mut reader).await?;
                    }

                    tee.write_all(format!("{}{}\n", prefix, line).as_bytes())
                        .await?;
                    push_line(&lines, line, max);
                }
            }
        });
        Self { lines, handle }
    }

    /// The most recent lines, oldest first.
    pub(crate) fn tail(&self) -> Vec<String> {
        locked(&self.lines).iter().cloned().collect()
    }

    /// Wait up to `grace` for the stream to end, and return the most recent
    /// lines. A stream still open after `grace` (held by a grandchild, say)
    /// keeps being tailed in the background.
    pub(crate) async fn finish(mut self, grace: Duration) -> Vec<String> {
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => tracing::debug!("log tailer stopped: {}", err),
            Ok(Err(err)) => tracing::debug!("log tailer task failed: {}", err),
            Err(_) => tracing::debug!("output still open {:?} after exit", grace),
        }
        self.tail()
    }
}

fn locked(lines: &Mutex<VecDeque<String>>) -> std::sync::MutexGuard<'_, VecDeque<String>> {
    lines.lock().unwrap_or_else(PoisonError::into_inner)
}

fn push_line(lines: &Mutex<VecDeque<String>>, line: String, max: usize) {
    if max == 0 {
        return;
    }
    let mut lines = locked(lines);
    if lines.len() == max {
        lines.pop_front();
    }
    lines.push_back(line);
}

/// Discard input up to and including the next newline.
async fn skip_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<()> {
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn test_tee_prefixes_lines() {
        let reader = Cursor::new("hello\nworld".as_bytes());
        let (write, read) = io::duplex(256);
        let lines = LogTailer::tee(5, "[Cluster 3] ".to_string(), reader, write)
            .finish(Duration::from_secs(5))
            .await;
        assert_eq!(lines, vec!["hello", "world"]);

        let mut teed = BufReader::new(read).lines();
        assert_eq!(teed.next_line().await.unwrap().unwrap(), "[Cluster 3] hello");
        assert_eq!(teed.next_line().await.unwrap().unwrap(), "[Cluster 3] world");
    }

    #[tokio::test]
    async fn test_finish_with_open_stream() {
        let (mut writer, reader) = io::duplex(256);
        writer.write_all(b"still here\n").await.unwrap();
        let tailer = LogTailer::tee(5, String::new(), reader, io::sink());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let lines = tailer.finish(Duration::from_millis(50)).await;
        assert_eq!(lines, vec!["still here"]);
        drop(writer);
    }

    #[tokio::test]
    async fn test_keeps_last_lines() {
        let input: String = (0..10).map(|i| format!("line {}\r\n", i)).collect();
        let lines = LogTailer::tee(3, String::new(), Cursor::new(input.into_bytes()), io::sink())
            .finish(Duration::from_secs(5))
            .await;
        assert_eq!(lines, vec!["line 7", "line 8", "line 9"]);
    }

    #[tokio::test]
    async fn test_line_truncation() {
        let mut input = Vec::new();
        input.extend(vec![b'a'; MAX_BYTE_SIZE_LOG_LINE - 1]);
        input.push(b'\n');
        input.extend(vec![b'b'; MAX_BYTE_SIZE_LOG_LINE + 10]);
        input.push(b'\n');
        input.extend(b"tail\n");

        let lines = LogTailer::tee(5, String::new(), Cursor::new(input), io::sink())
            .finish(Duration::from_secs(5))
            .await;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "a".repeat(MAX_BYTE_SIZE_LOG_LINE - 1));
        assert_eq!(
            lines[1],
            format!("{}<TRUNCATED>", "b".repeat(MAX_BYTE_SIZE_LOG_LINE))
        );
        assert_eq!(lines[2], "tail");
    }
}
