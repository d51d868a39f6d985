// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-node routing: listeners, tether formation, and the relay-or-execute decision
//!
//! Every task entering a node, whether from a SOCKS5 entry socket or a virtual
//! stream on a tether, is resolved against the node's [RoutingTable]. It then
//! either executes here, with a SOCKS5 request record synthesized in front of it,
//! or has its header re-framed onto a fresh virtual stream toward the next hop.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::config::{
  AgentConfig, ListenerConfig, ListenerType, NetworkConfig, ProxyInfo, TetherConfig,
};
use crate::common::protocol::handshake::{accept_handshake, connect_handshake, HandshakeError};
use crate::common::protocol::socks5::{self, Socks5Error, SocksRequest, TargetAddr};
use crate::common::protocol::{TaskError, TaskInfo, TunnelTask};
use crate::common::transport::{self, TransportError};
use crate::common::tunnel::{MuxError, MuxRole, Tether};
use crate::util::{splice_bidirectional, tunnel_stream::WrappedStream};

pub mod exec;
pub mod routing;

#[cfg(test)]
mod tests;

pub use exec::{ExecError, Socks5Executor, TaskExecutor};
pub use routing::{is_local_target, RoutingRule, RoutingTable, WildcardPattern};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
  #[error("No route matches {0}")]
  NoRoute(String),
  #[error("No route: tether {0:?} not found")]
  TetherNotFound(String),
}

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
  #[error("Failed to open a stream on the next hop: {0}")]
  Open(#[from] MuxError),
  #[error("Relay failed: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
  #[error("A tether needs at least one physical connection")]
  NoConnections,
  #[error("Transport failure: {0}")]
  Transport(#[from] TransportError),
  #[error("Handshake failed: {0}")]
  Handshake(#[from] HandshakeError),
  #[error("Connections reached different peers: {expected:?} and {found:?}")]
  InconsistentPeer { expected: String, found: String },
  #[error("Failed to attach connection: {0}")]
  Mux(#[from] MuxError),
}

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
  #[error("Listener type {0:?} is not implemented")]
  NotImplemented(ListenerType),
  #[error("Unknown listener type")]
  UnknownType,
  #[error("Failed to bind {address}")]
  Bind {
    address: SocketAddr,
    #[source]
    error: std::io::Error,
  },
  #[error("Failed to load listener credentials: {0}")]
  Transport(#[from] TransportError),
}

/// The per-node routing engine; independent instances share nothing
pub struct Router {
  network_config: ArcSwap<NetworkConfig>,
  tethers: RwLock<HashMap<String, Arc<Tether>>>,
  executor: Arc<dyn TaskExecutor>,
  default_proxy: Option<ProxyInfo>,
  conns_per_tether: Option<usize>,
  shutdown: CancellationToken,
}

impl std::fmt::Debug for Router {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Router")
      .field("client_id", &self.client_id())
      .field("tethers", &self.tether_ids())
      .finish_non_exhaustive()
  }
}

impl Router {
  pub fn new(network_config: NetworkConfig) -> Self {
    Self {
      network_config: ArcSwap::from_pointee(network_config),
      tethers: RwLock::new(HashMap::new()),
      executor: Arc::new(Socks5Executor),
      default_proxy: None,
      conns_per_tether: None,
      shutdown: CancellationToken::new(),
    }
  }

  pub fn from_agent_config(config: &AgentConfig) -> Self {
    Self::new(config.net_conf.clone())
      .with_default_proxy(config.proxy.clone())
      .with_connections_per_tether(config.num_conns_per_tether)
  }

  pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
    self.executor = executor;
    self
  }

  pub fn with_default_proxy(mut self, proxy: Option<ProxyInfo>) -> Self {
    self.default_proxy = proxy;
    self
  }

  pub fn with_connections_per_tether(mut self, count: Option<usize>) -> Self {
    self.conns_per_tether = count;
    self
  }

  pub fn network_config(&self) -> Arc<NetworkConfig> {
    self.network_config.load_full()
  }

  /// Swaps in a new identity and routing table; tasks already routed are unaffected
  pub fn update_network_config(&self, network_config: NetworkConfig) {
    self.network_config.store(Arc::new(network_config));
  }

  pub fn client_id(&self) -> String {
    self.network_config.load().client_id.clone()
  }

  pub fn tether(&self, client_id: &str) -> Option<Arc<Tether>> {
    self
      .tethers
      .read()
      .expect("tether table lock poisoned")
      .get(client_id)
      .cloned()
  }

  pub fn tether_ids(&self) -> Vec<String> {
    let mut ids: Vec<String> = self
      .tethers
      .read()
      .expect("tether table lock poisoned")
      .keys()
      .cloned()
      .collect();
    ids.sort();
    ids
  }

  /// Stops every listener loop and closes every tether; in-flight relays run to completion
  pub fn shutdown(&self) {
    self.shutdown.cancel();
    let tethers: Vec<Arc<Tether>> = self
      .tethers
      .write()
      .expect("tether table lock poisoned")
      .drain()
      .map(|(_, tether)| tether)
      .collect();
    for tether in tethers {
      tether.close();
    }
  }

  pub fn is_shut_down(&self) -> bool {
    self.shutdown.is_cancelled()
  }

  /// Picks the next hop for a task, or `None` when it should execute on this node
  pub fn get_target_tether(&self, info: &TaskInfo) -> Result<Option<Arc<Tether>>, RoutingError> {
    let config = self.network_config.load();
    let target = match config.mapping.resolve(&info.target_address) {
      None if info.local => return Ok(None),
      None => return Err(RoutingError::NoRoute(info.target())),
      Some(target) if target == config.client_id || is_local_target(target) => return Ok(None),
      Some(target) => target,
    };
    let tethers = self.tethers.read().expect("tether table lock poisoned");
    match tethers.get(target) {
      Some(tether) if !tether.is_closed() => Ok(Some(Arc::clone(tether))),
      _ => Err(RoutingError::TetherNotFound(target.to_string())),
    }
  }

  /// Sends a task on its way; failures end the task and are only logged
  #[tracing::instrument(level = "debug", skip_all, fields(target = %task.header().target()))]
  pub async fn route(&self, mut task: TunnelTask<WrappedStream>) {
    let next_hop = match self.get_target_tether(task.header()) {
      Ok(next_hop) => next_hop,
      Err(error) => {
        tracing::warn!(%error, "dropping unroutable task");
        return;
      }
    };
    match next_hop {
      None => {
        let record = TargetAddr::from_task_info(task.header())
          .and_then(|target| SocksRequest::connect(target).encode());
        match record {
          Ok(record) => task.prefix_send(&record),
          Err(error) => {
            tracing::warn!(%error, "dropping task with unusable destination");
            return;
          }
        }
        tracing::info!("executing locally");
        if let Err(error) = self.task_exec(task).await {
          tracing::debug!(%error, "local execution ended");
        }
      }
      Some(tether) => {
        if let Err(error) = task.prefix_task_info() {
          tracing::warn!(%error, "dropping task with unencodable header");
          return;
        }
        tracing::info!(via = %tether.client_id(), "relaying");
        match self.task_relay(task, tether).await {
          Ok((sent, received)) => tracing::trace!(sent, received, "relay finished"),
          Err(error) => tracing::debug!(%error, "relay ended"),
        }
      }
    }
  }

  pub async fn task_exec(&self, task: TunnelTask<WrappedStream>) -> Result<(), ExecError> {
    self.executor.execute(task).await
  }

  /// Forwards a task's pending bytes onto a new stream on `tether`, then splices the two
  pub async fn task_relay(
    &self,
    mut task: TunnelTask<WrappedStream>,
    tether: Arc<Tether>,
  ) -> Result<(u64, u64), RelayError> {
    let mut next_hop = tether.open().await?;
    let pending = task.read_pre_send();
    next_hop.write_all(&pending).await?;
    next_hop.flush().await?;
    Ok(splice_bidirectional(task, next_hop).await?)
  }

  /// Dials a relay listener and forms a tether over every resulting connection
  #[tracing::instrument(level = "debug", skip_all, err, fields(relay = %tether_config.address()))]
  pub async fn connect(
    self: &Arc<Self>,
    tether_config: &TetherConfig,
  ) -> Result<Arc<Tether>, ConnectError> {
    let tls = transport::client_config(tether_config.authority.as_deref())?;
    let proxy = tether_config.effective_proxy(self.default_proxy.as_ref());
    let count = tether_config.effective_connections(self.conns_per_tether);
    let mut conns = Vec::with_capacity(count);
    for _ in 0..count {
      conns.push(transport::dial(tether_config, proxy, Arc::clone(&tls)).await?);
    }
    self.establish_tether(conns, &tether_config.password).await
  }

  /// Client half of tether formation over already-established physical connections
  pub async fn establish_tether(
    self: &Arc<Self>,
    conns: Vec<WrappedStream>,
    password: &str,
  ) -> Result<Arc<Tether>, ConnectError> {
    let local = self.network_config();
    let mut remote: Option<NetworkConfig> = None;
    let mut ready = Vec::with_capacity(conns.len());
    for mut conn in conns {
      let presented = connect_handshake(&mut conn, &local, password).await?;
      if let Some(expected) = &remote {
        if expected.client_id != presented.client_id {
          return Err(ConnectError::InconsistentPeer {
            expected: expected.client_id.clone(),
            found: presented.client_id,
          });
        }
      }
      remote = Some(presented);
      ready.push(conn);
    }
    let remote = remote.ok_or(ConnectError::NoConnections)?;
    let peer = remote.client_id.clone();

    let tether = Arc::new(Tether::new(remote, MuxRole::Client));
    for conn in ready {
      tether.add_connection(conn)?;
    }
    let replaced = self
      .tethers
      .write()
      .expect("tether table lock poisoned")
      .insert(peer.clone(), Arc::clone(&tether));
    if replaced.is_some() {
      tracing::debug!(%peer, "superseding existing tether");
    }
    tracing::info!(%peer, sessions = tether.session_count(), "tether established");
    self.spawn_stream_acceptor(Arc::clone(&tether));
    Ok(tether)
  }

  /// Server half of tether formation: authenticate the peer, then join or create its tether
  pub async fn accept_physical_connection(
    self: &Arc<Self>,
    mut conn: WrappedStream,
    listener: &ListenerConfig,
  ) -> Result<Arc<Tether>, ConnectError> {
    let local = self.network_config();
    let transport = conn.kind();
    let remote = accept_handshake(&mut conn, &local, listener).await?;
    let peer = remote.client_id.clone();
    tracing::trace!(%peer, transport, "peer authenticated");
    let (tether, created) = {
      let mut tethers = self.tethers.write().expect("tether table lock poisoned");
      match tethers.get(&peer) {
        Some(existing) if !existing.is_closed() => {
          existing.update_remote_config(remote);
          existing.add_connection(conn)?;
          (Arc::clone(existing), false)
        }
        _ => {
          let tether = Arc::new(Tether::new(remote, MuxRole::Server));
          tether.add_connection(conn)?;
          tethers.insert(peer.clone(), Arc::clone(&tether));
          (tether, true)
        }
      }
    };
    if created {
      tracing::info!(%peer, "tether formed by peer");
      self.spawn_stream_acceptor(Arc::clone(&tether));
    } else {
      tracing::debug!(%peer, sessions = tether.session_count(), "connection joined tether");
    }
    Ok(tether)
  }

  fn spawn_stream_acceptor(self: &Arc<Self>, tether: Arc<Tether>) {
    let span = tracing::debug_span!("tether", peer = %tether.client_id());
    tokio::task::spawn(Arc::clone(self).handle_incoming_streams(tether).instrument(span));
  }

  async fn handle_incoming_streams(self: Arc<Self>, tether: Arc<Tether>) {
    loop {
      match tether.accept().await {
        Ok(stream) => {
          let router = Arc::clone(&self);
          tokio::task::spawn(
            async move {
              match TunnelTask::read_tunnel_task(stream).await {
                Ok(task) => router.route(task).await,
                Err(TaskError::ReadHeader(error)) => {
                  tracing::debug!(%error, "discarding stream without task header")
                }
                Err(error) => tracing::debug!(%error, "discarding stream"),
              }
            }
            .instrument(tracing::trace_span!("virtual_stream")),
          );
        }
        Err(error) => {
          tracing::debug!(%error, "tether stopped accepting");
          break;
        }
      }
    }
    self.evict(&tether);
  }

  fn evict(&self, tether: &Arc<Tether>) {
    let peer = tether.client_id();
    let mut tethers = self.tethers.write().expect("tether table lock poisoned");
    let current = tethers.get(&peer).map(|current| Arc::ptr_eq(current, tether));
    if current == Some(true) && tether.is_closed() {
      tethers.remove(&peer);
      tracing::info!(%peer, "tether lost");
    }
  }

  /// Binds a listener and runs its accept loop in the background, returning the bound address
  #[tracing::instrument(level = "debug", skip_all, err, fields(port = listener.port, kind = ?listener.listener_type))]
  pub async fn serve(self: &Arc<Self>, listener: ListenerConfig) -> Result<SocketAddr, ServeError> {
    match listener.listener_type {
      ListenerType::Socks5 => {
        let socket = Self::bind(&listener).await?;
        let address = socket.local_addr().map_err(|error| ServeError::Bind {
          address: listener.bind_address(),
          error,
        })?;
        let listener = Arc::new(listener);
        tokio::task::spawn(
          Arc::clone(self)
            .accept_loop(socket, move |router, conn| {
              router.handle_socks5_connection(conn, Arc::clone(&listener))
            })
            .instrument(tracing::info_span!("socks5_listener", %address)),
        );
        tracing::info!(%address, "SOCKS5 listener started");
        Ok(address)
      }
      ListenerType::RelayTcp => {
        let tls = transport::load_server_config(listener.cert_path(), listener.key_path())?;
        let acceptor = tokio_rustls::TlsAcceptor::from(tls);
        let socket = Self::bind(&listener).await?;
        let address = socket.local_addr().map_err(|error| ServeError::Bind {
          address: listener.bind_address(),
          error,
        })?;
        let listener = Arc::new(listener);
        tokio::task::spawn(
          Arc::clone(self)
            .accept_loop(socket, move |router, conn| {
              router.handle_relay_connection(conn, acceptor.clone(), Arc::clone(&listener))
            })
            .instrument(tracing::info_span!("relay_listener", %address)),
        );
        tracing::info!(%address, "relay listener started");
        Ok(address)
      }
      ListenerType::RelayUdp | ListenerType::RelayWebSockets => {
        Err(ServeError::NotImplemented(listener.listener_type))
      }
      ListenerType::Unknown => Err(ServeError::UnknownType),
    }
  }

  async fn bind(listener: &ListenerConfig) -> Result<TcpListener, ServeError> {
    let address = listener.bind_address();
    TcpListener::bind(address)
      .await
      .map_err(|error| ServeError::Bind { address, error })
  }

  async fn accept_loop<F, Fut>(self: Arc<Self>, socket: TcpListener, handle: F)
  where
    F: Fn(Arc<Self>, TcpStream) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
  {
    loop {
      let accepted = tokio::select! {
        biased;
        _ = self.shutdown.cancelled() => break,
        accepted = socket.accept() => accepted,
      };
      match accepted {
        Ok((conn, peer)) => {
          let _ = conn.set_nodelay(true);
          let span = tracing::debug_span!("connection", %peer);
          tokio::task::spawn(handle(Arc::clone(&self), conn).instrument(span));
        }
        Err(error) => tracing::warn!(%error, "accept failed"),
      }
    }
    tracing::debug!("listener stopped");
  }

  async fn handle_relay_connection(
    self: Arc<Self>,
    conn: TcpStream,
    acceptor: tokio_rustls::TlsAcceptor,
    listener: Arc<ListenerConfig>,
  ) {
    let conn = match transport::accept_tls(&acceptor, conn).await {
      Ok(conn) => conn,
      Err(error) => {
        tracing::warn!(%error, "TLS accept failed");
        return;
      }
    };
    if let Err(error) = self.accept_physical_connection(conn, &listener).await {
      tracing::warn!(%error, "rejected relay connection");
    }
  }

  async fn handle_socks5_connection(self: Arc<Self>, mut conn: TcpStream, listener: Arc<ListenerConfig>) {
    let request = match socks5::negotiate(&mut conn, &listener).await {
      Ok(request) => request,
      Err(error @ Socks5Error::AuthenticationFailed(_)) => {
        tracing::warn!(%error, "SOCKS5 entry rejected");
        return;
      }
      Err(error) => {
        tracing::debug!(%error, "SOCKS5 negotiation failed");
        return;
      }
    };
    let info = TaskInfo::socks(request.target.host(), request.target.port())
      .with_local(listener.local_only);
    self.route(TunnelTask::new(WrappedStream::from(conn), info)).await;
  }
}
