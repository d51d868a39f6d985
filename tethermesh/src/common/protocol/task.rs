// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::TaskInfo;
use crate::util::framed::{encode_framed_json, read_framed_json, JsonReadError, JsonWriteError};
use crate::util::tunnel_stream::HalfClose;

/// Task headers are tiny; anything larger is a confused or hostile peer
pub const MAX_TASK_HEADER_LENGTH: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum TaskError {
  #[error("Failed to read task header: {0}")]
  ReadHeader(#[from] JsonReadError),
  #[error("Failed to encode task header: {0}")]
  EncodeHeader(#[from] JsonWriteError),
}

pin_project_lite::pin_project! {
  /// A connection carrying a routing header, plus bytes to emit ahead of its own
  ///
  /// Reads drain the pending prefix before touching the underlying connection;
  /// writes go straight through.
  pub struct TunnelTask<S> {
    #[pin]
    conn: S,
    header: TaskInfo,
    pre_send: Vec<u8>,
    pre_send_offset: usize,
  }
}

impl<S> TunnelTask<S> {
  pub fn new(conn: S, header: TaskInfo) -> Self {
    Self {
      conn,
      header,
      pre_send: Vec::new(),
      pre_send_offset: 0,
    }
  }

  pub fn header(&self) -> &TaskInfo {
    &self.header
  }

  fn pending(&self) -> &[u8] {
    &self.pre_send[self.pre_send_offset..]
  }

  /// Places `bytes` ahead of everything already pending
  pub fn prefix_send(&mut self, bytes: &[u8]) {
    let mut combined = Vec::with_capacity(bytes.len() + self.pending().len());
    combined.extend_from_slice(bytes);
    combined.extend_from_slice(self.pending());
    self.pre_send = combined;
    self.pre_send_offset = 0;
  }

  /// Places the framed header ahead of everything already pending, for the next hop to read
  pub fn prefix_task_info(&mut self) -> Result<(), TaskError> {
    let framed = encode_framed_json(&self.header, Some(MAX_TASK_HEADER_LENGTH))?;
    self.prefix_send(&framed);
    Ok(())
  }

  /// Takes every pending byte, leaving reads to fall through to the connection
  pub fn read_pre_send(&mut self) -> Vec<u8> {
    let offset = std::mem::replace(&mut self.pre_send_offset, 0);
    let mut pending = std::mem::take(&mut self.pre_send);
    pending.drain(..offset);
    pending
  }
}

impl<S: AsyncRead + Unpin> TunnelTask<S> {
  /// Reconstructs a task arriving from another node, whose header precedes the payload
  pub async fn read_tunnel_task(mut conn: S) -> Result<Self, TaskError> {
    let header: TaskInfo = read_framed_json(&mut conn, Some(MAX_TASK_HEADER_LENGTH)).await?;
    Ok(Self::new(conn, header))
  }
}

impl<S: AsyncRead> AsyncRead for TunnelTask<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.project();
    let pending = &this.pre_send[*this.pre_send_offset..];
    if !pending.is_empty() {
      let len = pending.len().min(buf.remaining());
      buf.put_slice(&pending[..len]);
      *this.pre_send_offset += len;
      if *this.pre_send_offset == this.pre_send.len() {
        this.pre_send.clear();
        *this.pre_send_offset = 0;
      }
      return Poll::Ready(Ok(()));
    }
    this.conn.poll_read(cx, buf)
  }
}

impl<S: AsyncWrite> AsyncWrite for TunnelTask<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, std::io::Error>> {
    self.project().conn.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
    self.project().conn.poll_flush(cx)
  }

  fn poll_shutdown(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Result<(), std::io::Error>> {
    self.project().conn.poll_shutdown(cx)
  }
}

impl<S: HalfClose> HalfClose for TunnelTask<S> {
  fn supports_half_close(&self) -> bool {
    self.conn.supports_half_close()
  }
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::TunnelTask;
  use crate::common::protocol::{TaskInfo, TaskType};
  use crate::util::tunnel_stream::WrappedStream;

  #[tokio::test]
  async fn prefix_is_read_before_connection_across_a_hop() {
    // Simulates the entry connection
    let (mut entry, client) = WrappedStream::duplex(1024);
    let mut task = TunnelTask::new(client, TaskInfo::socks("localhost", 8080));
    task.prefix_task_info().unwrap();
    task.prefix_send(b"abcd");
    entry.write_all(b"12345678901234567890").await.unwrap();

    // Simulates the relay stream to the next node
    let (mut near, far) = WrappedStream::duplex(1024);
    let copier = tokio::task::spawn(async move {
      let _ = tokio::io::copy(&mut task, &mut near).await;
    });

    // The framed header sits behind "abcd", so the far side sees "abcd" first
    let mut far = far;
    let mut head = [0u8; 4];
    far.read_exact(&mut head).await.unwrap();
    assert_eq!(&head, b"abcd");
    let mut received = TunnelTask::read_tunnel_task(far).await.unwrap();
    assert_eq!(received.header().task_type, TaskType::Socks);
    assert_eq!(received.header().target_address, "localhost");
    assert_eq!(received.header().target_port, "8080");

    let mut rest = [0u8; 11];
    received.read_exact(&mut rest).await.unwrap();
    assert_eq!(&rest, b"12345678901");
    copier.abort();
  }

  #[tokio::test]
  async fn pre_send_then_stream_in_small_reads() {
    let (mut server, client) = WrappedStream::duplex(64);
    let mut task = TunnelTask::new(client, TaskInfo::socks("localhost", 8080));
    task.prefix_send(b"abcd");
    server.write_all(b"12345678901234567890").await.unwrap();

    let mut out = Vec::new();
    let mut chunk = [0u8; 3];
    while out.len() < 15 {
      let n = task.read(&mut chunk).await.unwrap();
      assert!(n > 0);
      out.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(&out[..15], b"abcd12345678901");
  }

  #[tokio::test]
  async fn header_round_trips_through_prefix() {
    let (_server, client) = WrappedStream::duplex(64);
    let info = TaskInfo::socks("10.1.2.3", 22);
    let mut task = TunnelTask::new(client, info.clone());
    task.prefix_task_info().unwrap();
    let framed = task.read_pre_send();
    let parsed = TunnelTask::read_tunnel_task(&framed[..]).await.unwrap();
    assert_eq!(parsed.header(), &info);
  }

  #[tokio::test]
  async fn read_pre_send_takes_only_unread_bytes() {
    let (_server, client) = WrappedStream::duplex(64);
    let mut task = TunnelTask::new(client, TaskInfo::socks("h", 1));
    task.prefix_send(b"world");
    task.prefix_send(b"hello ");
    let mut first = [0u8; 2];
    task.read_exact(&mut first).await.unwrap();
    assert_eq!(&first, b"he");
    assert_eq!(task.read_pre_send(), b"llo world");
    assert!(task.read_pre_send().is_empty());
    task.prefix_send(b"x");
    assert_eq!(task.header().target_address, "h");
    assert_eq!(task.read_pre_send(), b"x");
  }

  #[tokio::test]
  async fn writes_pass_through() {
    let (mut server, client) = WrappedStream::duplex(64);
    let mut task = TunnelTask::new(client, TaskInfo::socks("h", 1));
    task.prefix_send(b"not for the writer");
    task.write_all(b"reply").await.unwrap();
    let mut reply = [0u8; 5];
    server.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"reply");
  }
}
