// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bidirectional relay between two byte streams
//!
//! Each direction runs as its own task and reports into a two-slot completion
//! channel. Both streams are owned by the relay and are dropped, and thus closed,
//! before it returns, whatever the outcome.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::tunnel_stream::HalfClose;

const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Direction {
  AToB,
  BToA,
}

/// Aborts both copy tasks if the relay is abandoned or fails early
struct AbortOnDrop([Option<JoinHandle<()>>; 2]);

impl Drop for AbortOnDrop {
  fn drop(&mut self) {
    for handle in self.0.iter_mut().filter_map(Option::take) {
      handle.abort();
    }
  }
}

async fn pump<R, W>(reader: R, mut writer: W, half_close: bool) -> Result<u64, std::io::Error>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut reader = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader);
  let res = tokio::io::copy_buf(&mut reader, &mut writer).await;
  if half_close {
    // Propagates EOF to the far side while the other direction keeps flowing
    if let Err(error) = writer.shutdown().await {
      tracing::trace!(?error, "half-close failed");
    }
  }
  res
}

/// Copies `a` into `b` and `b` into `a` until both directions finish
///
/// Returns the byte counts `(a_to_b, b_to_a)`, or the first error either
/// direction reported. On error the remaining direction is torn down at once.
#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn splice_bidirectional<A, B>(a: A, b: B) -> Result<(u64, u64), std::io::Error>
where
  A: AsyncRead + AsyncWrite + HalfClose + Send + 'static,
  B: AsyncRead + AsyncWrite + HalfClose + Send + 'static,
{
  let a_half_close = a.supports_half_close();
  let b_half_close = b.supports_half_close();
  let (a_read, a_write) = tokio::io::split(a);
  let (b_read, b_write) = tokio::io::split(b);

  let (done_tx, mut done_rx) = mpsc::channel::<(Direction, Result<u64, std::io::Error>)>(2);
  let a_to_b = tokio::task::spawn({
    let done_tx = done_tx.clone();
    async move {
      let res = pump(a_read, b_write, b_half_close).await;
      let _ = done_tx.send((Direction::AToB, res)).await;
    }
  });
  let b_to_a = tokio::task::spawn(async move {
    let res = pump(b_read, a_write, a_half_close).await;
    let _ = done_tx.send((Direction::BToA, res)).await;
  });
  let mut tasks = AbortOnDrop([Some(a_to_b), Some(b_to_a)]);

  let (mut a_to_b_bytes, mut b_to_a_bytes) = (0u64, 0u64);
  for _ in 0..2 {
    match done_rx.recv().await {
      Some((direction, Ok(bytes))) => {
        tracing::trace!(?direction, bytes, "direction complete");
        match direction {
          Direction::AToB => a_to_b_bytes = bytes,
          Direction::BToA => b_to_a_bytes = bytes,
        }
      }
      Some((direction, Err(error))) => {
        tracing::debug!(?direction, ?error, "relay direction failed");
        return Err(error);
      }
      None => {
        return Err(std::io::Error::new(
          std::io::ErrorKind::Other,
          "relay task ended without reporting",
        ))
      }
    }
  }
  // Both halves of each stream are gone once the tasks have finished
  for handle in tasks.0.iter_mut().filter_map(Option::take) {
    let _ = handle.await;
  }
  Ok((a_to_b_bytes, b_to_a_bytes))
}

#[cfg(test)]
mod tests {
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::splice_bidirectional;
  use crate::util::tunnel_stream::WrappedStream;

  #[tokio::test]
  async fn relays_both_directions_with_half_close() {
    let (mut client, near) = WrappedStream::duplex(1024);
    let (far, mut server) = WrappedStream::duplex(1024);
    let relay = tokio::task::spawn(splice_bidirectional(near, far));

    let request = Vec::from(*b"request").repeat(256);
    client.write_all(&request).await.unwrap();
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    server.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, request);

    // The response still flows after the request direction has closed
    server.write_all(b"response").await.unwrap();
    server.shutdown().await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"response");

    let (a_to_b, b_to_a) = tokio::time::timeout(Duration::from_secs(5), relay)
      .await
      .expect("relay must finish once both sides close")
      .unwrap()
      .unwrap();
    assert_eq!(a_to_b, request.len() as u64);
    assert_eq!(b_to_a, 8);
  }

  #[tokio::test]
  async fn dropping_one_side_closes_the_other() {
    let (client, near) = WrappedStream::duplex(64);
    let (far, mut server) = WrappedStream::duplex(64);
    let relay = tokio::task::spawn(splice_bidirectional(near, far));
    drop(client);
    // The client vanishing reads as EOF, which half-closes toward the server
    let mut received = Vec::new();
    server.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());
    drop(server);
    let res = tokio::time::timeout(Duration::from_secs(5), relay)
      .await
      .expect("relay must finish once both sides are gone")
      .unwrap();
    // Writing into a dropped duplex peer may surface as a broken pipe
    if let Ok((a_to_b, _)) = res {
      assert_eq!(a_to_b, 0);
    }
  }
}
