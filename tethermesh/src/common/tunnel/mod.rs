// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::common::config::NetworkConfig;
use crate::util::tunnel_stream::WrappedStream;

pub mod id;
pub mod multimux;

pub use id::SessionId;
pub use multimux::{MultiMux, MuxError, MuxRole};

/// A bundle of physical connections to one peer, plus the identity that peer advertised
#[derive(Debug)]
pub struct Tether {
  remote_config: ArcSwap<NetworkConfig>,
  channel: MultiMux,
}

impl Tether {
  pub fn new(remote_config: NetworkConfig, role: MuxRole) -> Self {
    Self {
      remote_config: ArcSwap::from_pointee(remote_config),
      channel: MultiMux::new(role),
    }
  }

  pub fn remote_config(&self) -> Arc<NetworkConfig> {
    self.remote_config.load_full()
  }

  pub fn client_id(&self) -> String {
    self.remote_config.load().client_id.clone()
  }

  /// Replaces the peer's advertised identity with the one from its latest connection
  pub fn update_remote_config(&self, remote_config: NetworkConfig) {
    self.remote_config.store(Arc::new(remote_config));
  }

  pub fn add_connection(&self, conn: WrappedStream) -> Result<SessionId, MuxError> {
    self.channel.add_connection(conn)
  }

  pub async fn open(&self) -> Result<WrappedStream, MuxError> {
    self.channel.open().await
  }

  pub async fn accept(&self) -> Result<WrappedStream, MuxError> {
    self.channel.accept().await
  }

  pub fn session_count(&self) -> usize {
    self.channel.session_count()
  }

  pub fn is_closed(&self) -> bool {
    self.channel.is_closed()
  }

  pub fn close(&self) {
    self.channel.close()
  }
}
