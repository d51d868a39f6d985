// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed records: a big-endian `u32` length followed by that many bytes.
//!
//! Every control record exchanged between nodes (network configs on new physical
//! connections, task headers ahead of relayed payloads) uses this framing with a
//! JSON body.

use std::mem::size_of;

/// Size of the length prefix preceding each frame
pub const LENGTH_PREFIX_SIZE: usize = size_of::<u32>();

/// Default upper bound on control records; real records are a few hundred bytes
pub const DEFAULT_MAX_RECORD_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: std::io::Error,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum JsonReadError {
  #[error("Failure reading JSON from frame: {0}")]
  Read(#[from] ReadError),
  #[error("Failure deserializing JSON from frame: {0}")]
  Deserialization(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] std::io::Error),
  #[error("Frame of {0} bytes cannot be described by a 32-bit length prefix")]
  TooLarge(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum JsonWriteError {
  #[error("Failure writing JSON into frame: {0}")]
  Write(#[from] WriteError),
  #[error("Failure serializing JSON for frame: {0}")]
  Serialization(#[from] serde_json::Error),
  /// Serialization happens before any write, so the stream is left untouched.
  ///
  /// Will never occur when a maximum length of `None` is provided.
  #[error("Frame length exceeded expectation of {expected} bytes with {produced}")]
  MaxLengthExceeded { expected: usize, produced: usize },
}

fn length_prefix(length: usize) -> Result<[u8; LENGTH_PREFIX_SIZE], WriteError> {
  u32::try_from(length)
    .map(u32::to_be_bytes)
    .map_err(|_| WriteError::TooLarge(length))
}

pub async fn read_frame<T: tokio::io::AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  use tokio::io::AsyncReadExt;
  let length = s
    .read_u32()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

pub async fn write_frame<T: tokio::io::AsyncWrite + Unpin>(
  mut s: T,
  buffer: &[u8],
) -> Result<(), WriteError> {
  use tokio::io::AsyncWriteExt;
  // A single write keeps the prefix and body together on message-oriented links
  let mut framed = Vec::with_capacity(buffer.len() + LENGTH_PREFIX_SIZE);
  framed.extend_from_slice(&length_prefix(buffer.len())?);
  framed.extend_from_slice(buffer);
  s.write_all(&framed).await?;
  s.flush().await?;
  Ok(())
}

/// Serializes `value` into a complete frame held in memory, prefix included
pub fn encode_framed_json<TInput: serde::Serialize>(
  value: &TInput,
  max_length: Option<usize>,
) -> Result<Vec<u8>, JsonWriteError> {
  let body = serde_json::to_vec(value)?;
  let produced = body.len() + LENGTH_PREFIX_SIZE;
  if let Some(max_length) = max_length {
    if produced > max_length {
      return Err(JsonWriteError::MaxLengthExceeded {
        expected: max_length,
        produced,
      });
    }
  }
  let mut framed = Vec::with_capacity(produced);
  framed.extend_from_slice(&length_prefix(body.len())?);
  framed.extend_from_slice(&body);
  Ok(framed)
}

pub async fn read_framed_json<
  TStream: tokio::io::AsyncRead + Unpin,
  TOutput: serde::de::DeserializeOwned,
>(
  s: TStream,
  max_length: Option<usize>,
) -> Result<TOutput, JsonReadError> {
  let buffer = read_frame(s, max_length).await?;
  Ok(serde_json::from_slice::<TOutput>(&buffer)?)
}

pub async fn write_framed_json<TStream: tokio::io::AsyncWrite + Unpin, TInput: serde::Serialize>(
  mut s: TStream,
  value: &TInput,
  max_length: Option<usize>,
) -> Result<(), JsonWriteError> {
  use tokio::io::AsyncWriteExt;
  let framed = encode_framed_json(value, max_length)?;
  s.write_all(&framed).await.map_err(WriteError::from)?;
  s.flush().await.map_err(WriteError::from)?;
  Ok(())
}
