// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Identity exchange performed on every new physical connection
//!
//! The accepting node always speaks first, so the dialing node reads the
//! acceptor's [NetworkConfig] before presenting its own.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::common::config::{ListenerConfig, NetworkConfig};
use crate::util::framed::{
  read_framed_json, write_framed_json, JsonReadError, JsonWriteError, DEFAULT_MAX_RECORD_LENGTH,
};

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
  #[error("Failed to send network config: {0}")]
  Send(#[from] JsonWriteError),
  #[error("Failed to receive network config: {0}")]
  Receive(#[from] JsonReadError),
  #[error("Peer presented an empty client id")]
  EmptyClientId,
  #[error("Peer {0:?} failed authentication")]
  Unauthorized(String),
}

/// Accepting side: advertise our identity, then read and authenticate the peer's
#[tracing::instrument(level = "debug", skip_all, err, fields(local = %local.client_id))]
pub async fn accept_handshake<S>(
  conn: &mut S,
  local: &NetworkConfig,
  listener: &ListenerConfig,
) -> Result<NetworkConfig, HandshakeError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  write_framed_json(&mut *conn, &local.advertised(), Some(DEFAULT_MAX_RECORD_LENGTH)).await?;
  let remote: NetworkConfig = read_framed_json(&mut *conn, Some(DEFAULT_MAX_RECORD_LENGTH)).await?;
  if remote.client_id.trim().is_empty() {
    let _ = conn.shutdown().await;
    return Err(HandshakeError::EmptyClientId);
  }
  if !listener.authorizes(&remote.client_id, &remote.secret) {
    tracing::warn!(client_id = %remote.client_id, "Authentication error, bad password");
    let _ = conn.shutdown().await;
    return Err(HandshakeError::Unauthorized(remote.client_id));
  }
  tracing::debug!(client_id = %remote.client_id, "peer identified");
  Ok(remote)
}

/// Dialing side: read the acceptor's identity, then present ours along with `password`
#[tracing::instrument(level = "debug", skip_all, err, fields(local = %local.client_id))]
pub async fn connect_handshake<S>(
  conn: &mut S,
  local: &NetworkConfig,
  password: &str,
) -> Result<NetworkConfig, HandshakeError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let remote: NetworkConfig = read_framed_json(&mut *conn, Some(DEFAULT_MAX_RECORD_LENGTH)).await?;
  if remote.client_id.trim().is_empty() {
    return Err(HandshakeError::EmptyClientId);
  }
  write_framed_json(
    &mut *conn,
    &local.presenting(password),
    Some(DEFAULT_MAX_RECORD_LENGTH),
  )
  .await?;
  tracing::debug!(client_id = %remote.client_id, "relay identified");
  Ok(remote)
}
