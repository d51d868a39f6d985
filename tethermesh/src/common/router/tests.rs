// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::exec::MockTaskExecutor;
use super::{ConnectError, Router, RoutingError, RoutingTable};
use crate::common::config::{ListenerConfig, ListenerType, NetworkConfig, TetherConfig};
use crate::common::protocol::handshake::HandshakeError;
use crate::common::protocol::socks5::{Reply, SocksRequest, TargetAddr};
use crate::common::protocol::{TaskInfo, TunnelTask};
use crate::common::tunnel::Tether;
use crate::util::tunnel_stream::WrappedStream;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn node(client_id: &str, rules: &[(&str, &str)]) -> Arc<Router> {
  let table: RoutingTable = rules.iter().copied().collect();
  Arc::new(Router::new(NetworkConfig::new(client_id, table)))
}

fn relay_listener() -> ListenerConfig {
  ListenerConfig::new(ListenerType::RelayTcp, 0)
}

/// Joins `client` to `server` over `count` in-memory physical connections
async fn link(
  client: &Arc<Router>,
  server: &Arc<Router>,
  listener: ListenerConfig,
  password: &str,
  count: usize,
) -> (
  Result<Arc<Tether>, ConnectError>,
  Vec<Result<Arc<Tether>, ConnectError>>,
) {
  let listener = Arc::new(listener);
  let mut client_ends = Vec::with_capacity(count);
  let mut accepts = Vec::with_capacity(count);
  for _ in 0..count {
    let (client_end, server_end) = WrappedStream::duplex(64 * 1024);
    client_ends.push(client_end);
    let server = Arc::clone(server);
    let listener = Arc::clone(&listener);
    accepts.push(tokio::task::spawn(async move {
      server.accept_physical_connection(server_end, &listener).await
    }));
  }
  let connected = client.establish_tether(client_ends, password).await;
  let mut accepted = Vec::with_capacity(count);
  for accept in accepts {
    accepted.push(accept.await.unwrap());
  }
  (connected, accepted)
}

async fn echo_server() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::task::spawn(async move {
    while let Ok((mut conn, _)) = listener.accept().await {
      tokio::task::spawn(async move {
        let (mut reader, mut writer) = conn.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
      });
    }
  });
  port
}

/// Plays a SOCKS client that has already negotiated: expects a success reply, then echoes
async fn expect_echo<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(client: &mut S) {
  let mut reply = [0u8; 10];
  client.read_exact(&mut reply).await.unwrap();
  assert_eq!(reply[..2], [5, Reply::Succeeded as u8]);
  client.write_all(b"across the mesh").await.unwrap();
  let mut echoed = [0u8; 15];
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"across the mesh");
}

#[test]
fn local_targets_resolve_without_a_tether() {
  let router = node("alpha", &[("*.corp", "alpha"), ("*.lan", "LocalHost"), ("*", "local")]);
  for address in ["db.corp", "printer.lan", "example.com"] {
    let next = router.get_target_tether(&TaskInfo::socks(address, 80)).unwrap();
    assert!(next.is_none(), "{} should execute locally", address);
  }
}

#[test]
fn first_declared_pattern_wins() {
  let router = node("alpha", &[("*.internal.corp", "beta"), ("*", "local")]);
  assert_eq!(
    router
      .get_target_tether(&TaskInfo::socks("git.internal.corp", 443))
      .unwrap_err(),
    RoutingError::TetherNotFound(String::from("beta"))
  );
  assert!(router
    .get_target_tether(&TaskInfo::socks("git.external.com", 443))
    .unwrap()
    .is_none());
}

#[test]
fn unmatched_targets_fail_unless_local() {
  let router = node("alpha", &[("*.corp", "beta")]);
  let info = TaskInfo::socks("example.com", 80);
  assert!(matches!(
    router.get_target_tether(&info),
    Err(RoutingError::NoRoute(_))
  ));
  assert!(router
    .get_target_tether(&info.with_local(true))
    .unwrap()
    .is_none());
  assert!(router.tether_ids().is_empty());
}

#[tokio::test]
async fn local_execution_receives_synthesized_request() {
  let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
  let mut executor = MockTaskExecutor::new();
  executor
    .expect_execute()
    .times(1)
    .returning(move |mut task: TunnelTask<WrappedStream>| {
      let _ = seen_tx.send((task.header().clone(), task.read_pre_send()));
      async { Ok(()) }.boxed()
    });
  let router = Arc::new(
    Router::new(NetworkConfig::new("alpha", [("*.corp", "beta")].into_iter().collect()))
      .with_executor(Arc::new(executor)),
  );

  let (entry, _client) = WrappedStream::duplex(1024);
  let info = TaskInfo::socks("example.com", 8080).with_local(true);
  router.route(TunnelTask::new(entry, info.clone())).await;

  let (header, pending) = seen_rx.recv().await.unwrap();
  assert_eq!(header, info);
  let expected = SocksRequest::connect(TargetAddr::Domain(String::from("example.com"), 8080))
    .encode()
    .unwrap();
  assert_eq!(pending, expected);
}

#[tokio::test]
async fn unroutable_tasks_are_dropped_without_execution() {
  let mut executor = MockTaskExecutor::new();
  executor.expect_execute().times(0);
  let router = Arc::new(
    Router::new(NetworkConfig::new("alpha", [("*", "beta")].into_iter().collect()))
      .with_executor(Arc::new(executor)),
  );
  let (entry, mut client) = WrappedStream::duplex(1024);
  router
    .route(TunnelTask::new(entry, TaskInfo::socks("example.com", 80)))
    .await;
  let mut buf = Vec::new();
  assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn bad_credentials_leave_tether_table_untouched() {
  let alpha = node("alpha", &[]);
  let beta = node("beta", &[("*", "local")]);
  let listener = relay_listener().authenticated([("alpha", "correct horse")]);
  let (_, accepted) = tokio::time::timeout(TEST_TIMEOUT, link(&alpha, &beta, listener, "wrong", 1))
    .await
    .unwrap();
  assert!(matches!(
    accepted[0],
    Err(ConnectError::Handshake(HandshakeError::Unauthorized(ref id))) if id == "alpha"
  ));
  assert!(beta.tether_ids().is_empty());
}

#[tokio::test]
async fn connections_from_one_peer_share_a_tether() {
  let alpha = node("alpha", &[]);
  let beta = node("beta", &[]);
  let listener = relay_listener().authenticated([("alpha", "pw")]);
  let (connected, accepted) = tokio::time::timeout(TEST_TIMEOUT, link(&alpha, &beta, listener, "pw", 3))
    .await
    .unwrap();
  let outbound = connected.unwrap();
  assert_eq!(outbound.client_id(), "beta");
  assert_eq!(outbound.session_count(), 3);

  let inbound: Vec<_> = accepted.into_iter().map(Result::unwrap).collect();
  assert!(inbound.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
  assert_eq!(inbound[0].session_count(), 3);
  assert_eq!(beta.tether_ids(), vec![String::from("alpha")]);
  // The acceptor never advertises its secret; the dialer presents its password
  assert_eq!(inbound[0].remote_config().secret, "pw");
  assert!(outbound.remote_config().secret.is_empty());
}

#[tokio::test]
async fn tasks_relay_across_multiple_hops() {
  init_logging();
  let echo_port = echo_server().await;
  let alpha = node("alpha", &[("*", "beta")]);
  let beta = node("beta", &[("127.0.0.*", "gamma")]);
  let gamma = node("gamma", &[("*", "local")]);
  tokio::time::timeout(TEST_TIMEOUT, async {
    link(&alpha, &beta, relay_listener(), "", 2).await.0.unwrap();
    link(&beta, &gamma, relay_listener(), "", 2).await.0.unwrap();
  })
  .await
  .unwrap();

  let (entry, mut client) = WrappedStream::duplex(64 * 1024);
  let routing = tokio::task::spawn({
    let alpha = Arc::clone(&alpha);
    async move {
      alpha
        .route(TunnelTask::new(entry, TaskInfo::socks("127.0.0.1", echo_port)))
        .await
    }
  });
  tokio::time::timeout(TEST_TIMEOUT, expect_echo(&mut client))
    .await
    .unwrap();
  drop(client);
  tokio::time::timeout(TEST_TIMEOUT, routing).await.unwrap().unwrap();
}

#[tokio::test]
async fn lost_tethers_are_evicted() {
  let alpha = node("alpha", &[("*", "beta")]);
  let beta = node("beta", &[("*", "local")]);
  let (connected, _) = tokio::time::timeout(TEST_TIMEOUT, link(&alpha, &beta, relay_listener(), "", 2))
    .await
    .unwrap();
  let tether = connected.unwrap();
  assert!(alpha.get_target_tether(&TaskInfo::socks("example.com", 80)).unwrap().is_some());

  beta.shutdown();
  tokio::time::timeout(TEST_TIMEOUT, async {
    while alpha.tether("beta").is_some() {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("Dead tether must be evicted");
  assert!(tether.is_closed());
  assert_eq!(
    alpha
      .get_target_tether(&TaskInfo::socks("example.com", 80))
      .unwrap_err(),
    RoutingError::TetherNotFound(String::from("beta"))
  );
}

#[tokio::test]
async fn unimplemented_listeners_are_reported() {
  let router = node("alpha", &[]);
  for listener_type in [ListenerType::RelayUdp, ListenerType::RelayWebSockets] {
    assert!(matches!(
      router.serve(ListenerConfig::new(listener_type, 0)).await,
      Err(super::ServeError::NotImplemented(kind)) if kind == listener_type
    ));
  }
  assert!(matches!(
    router.serve(ListenerConfig::new(ListenerType::Unknown, 0)).await,
    Err(super::ServeError::UnknownType)
  ));
}

#[tokio::test]
async fn socks5_entry_over_tls_tether() {
  init_logging();
  let echo_port = echo_server().await;
  let cert = rcgen::generate_simple_self_signed(vec![String::from("localhost")]).unwrap();
  let dir = std::env::temp_dir().join(format!("tethermesh-router-{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let (cert_file, key_file) = (dir.join("relay.crt"), dir.join("relay.key"));
  std::fs::write(&cert_file, cert.serialize_pem().unwrap()).unwrap();
  std::fs::write(&key_file, cert.serialize_private_key_pem()).unwrap();

  let alpha = node("alpha", &[("127.0.0.1", "beta")]);
  let beta = node("beta", &[("*", "local")]);
  let mut relay = relay_listener().local_only().authenticated([("alpha", "secret")]);
  relay.cert_file = Some(cert_file);
  relay.key_file = Some(key_file);
  let relay_address = beta.serve(relay).await.unwrap();
  let socks_address = alpha
    .serve(ListenerConfig::new(ListenerType::Socks5, 0).local_only())
    .await
    .unwrap();

  let mut tether_config = TetherConfig::new("localhost", relay_address.port());
  tether_config.password = String::from("secret");
  tether_config.num_connections = Some(2);
  let tether = tokio::time::timeout(TEST_TIMEOUT, alpha.connect(&tether_config))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(tether.session_count(), 2);

  let mut client = TcpStream::connect(socks_address).await.unwrap();
  client.write_all(&[5, 1, 0]).await.unwrap();
  let mut method = [0u8; 2];
  client.read_exact(&mut method).await.unwrap();
  assert_eq!(method, [5, 0]);
  let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
  request.extend_from_slice(&echo_port.to_be_bytes());
  client.write_all(&request).await.unwrap();
  tokio::time::timeout(TEST_TIMEOUT, expect_echo(&mut client))
    .await
    .unwrap();

  alpha.shutdown();
  beta.shutdown();
  let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn default_executor_is_used_for_local_routes() {
  let echo_port = echo_server().await;
  let router = node("alpha", &[("*", "local")]);
  let (entry, mut client) = WrappedStream::duplex(4096);
  let info = TaskInfo::socks("127.0.0.1", echo_port);
  let routing = tokio::task::spawn({
    let router = Arc::clone(&router);
    async move { router.route(TunnelTask::new(entry, info)).await }
  });
  tokio::time::timeout(TEST_TIMEOUT, expect_echo(&mut client))
    .await
    .unwrap();
  drop(client);
  routing.await.unwrap();
}
