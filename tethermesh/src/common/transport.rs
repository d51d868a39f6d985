// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Encrypted physical links between nodes: TLS over TCP, optionally through an HTTP proxy

use base64::Engine;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::common::config::{ProxyInfo, TetherConfig};
use crate::util::tunnel_stream::WrappedStream;

const MAX_PROXY_RESPONSE_HEADER: usize = 16 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("Transport I/O failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("Failed reading {path:?}")]
  ReadFile {
    path: PathBuf,
    #[source]
    error: std::io::Error,
  },
  #[error("No certificates found in PEM input")]
  NoCertificates,
  #[error("No private key found in PEM input")]
  NoPrivateKey,
  #[error("TLS configuration rejected: {0}")]
  Tls(#[from] rustls::Error),
  #[error("Invalid server name {0:?}")]
  InvalidServerName(String),
  #[error("Unsupported connection type {0:?}")]
  UnsupportedConnectionType(String),
  #[error("Unsupported proxy address {0:?}")]
  UnsupportedProxy(String),
  #[error("Proxy refused tunnel: {0}")]
  ProxyRefused(String),
}

fn read_file(path: &Path) -> Result<Vec<u8>, TransportError> {
  std::fs::read(path).map_err(|error| TransportError::ReadFile {
    path: path.to_path_buf(),
    error,
  })
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<rustls::Certificate>, TransportError> {
  let certs = rustls_pemfile::certs(&mut BufReader::new(pem))?;
  if certs.is_empty() {
    return Err(TransportError::NoCertificates);
  }
  Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn parse_private_key(pem: &[u8]) -> Result<rustls::PrivateKey, TransportError> {
  let mut reader = BufReader::new(pem);
  loop {
    match rustls_pemfile::read_one(&mut reader)? {
      Some(rustls_pemfile::Item::PKCS8Key(key))
      | Some(rustls_pemfile::Item::RSAKey(key))
      | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
      Some(_) => continue,
      None => return Err(TransportError::NoPrivateKey),
    }
  }
}

pub fn server_config_from_pem(
  cert_pem: &[u8],
  key_pem: &[u8],
) -> Result<Arc<rustls::ServerConfig>, TransportError> {
  let config = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(parse_certificates(cert_pem)?, parse_private_key(key_pem)?)?;
  Ok(Arc::new(config))
}

/// Loads the certificate chain and key a relay listener presents
pub fn load_server_config(
  cert_path: &Path,
  key_path: &Path,
) -> Result<Arc<rustls::ServerConfig>, TransportError> {
  server_config_from_pem(&read_file(cert_path)?, &read_file(key_path)?)
}

/// Accepts any server certificate; relays commonly run on self-signed certificates
struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls::Certificate,
    _intermediates: &[rustls::Certificate],
    _server_name: &rustls::ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: std::time::SystemTime,
  ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::ServerCertVerified::assertion())
  }
}

/// Client settings trusting only `authority_pem`, or skipping verification when absent
pub fn client_config_from_pem(
  authority_pem: Option<&[u8]>,
) -> Result<Arc<rustls::ClientConfig>, TransportError> {
  let builder = rustls::ClientConfig::builder().with_safe_defaults();
  let config = match authority_pem {
    Some(pem) => {
      let mut roots = rustls::RootCertStore::empty();
      for cert in parse_certificates(pem)? {
        roots.add(&cert)?;
      }
      builder
        .with_root_certificates(roots)
        .with_no_client_auth()
    }
    None => {
      let mut config = builder
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
      config
        .dangerous()
        .set_certificate_verifier(Arc::new(SkipServerVerification));
      config
    }
  };
  Ok(Arc::new(config))
}

pub fn client_config(authority: Option<&Path>) -> Result<Arc<rustls::ClientConfig>, TransportError> {
  match authority {
    Some(path) => client_config_from_pem(Some(&read_file(path)?)),
    None => client_config_from_pem(None),
  }
}

pub async fn accept_tls(
  acceptor: &tokio_rustls::TlsAcceptor,
  conn: TcpStream,
) -> Result<WrappedStream, TransportError> {
  Ok(acceptor.accept(conn).await?.into())
}

/// Opens one physical connection toward a relay listener
#[tracing::instrument(level = "debug", skip_all, err, fields(target = %tether.address()))]
pub async fn dial(
  tether: &TetherConfig,
  proxy: Option<&ProxyInfo>,
  tls: Arc<rustls::ClientConfig>,
) -> Result<WrappedStream, TransportError> {
  if !tether.connection_type.eq_ignore_ascii_case("tls") {
    return Err(TransportError::UnsupportedConnectionType(
      tether.connection_type.clone(),
    ));
  }
  let target = tether.address();
  let tcp = match proxy {
    Some(proxy) => http_connect(proxy, &target).await?,
    None => TcpStream::connect(&target).await?,
  };
  let _ = tcp.set_nodelay(true);
  let server_name = rustls::ServerName::try_from(tether.host.as_str())
    .map_err(|_| TransportError::InvalidServerName(tether.host.clone()))?;
  let stream = tokio_rustls::TlsConnector::from(tls)
    .connect(server_name, tcp)
    .await?;
  Ok(stream.into())
}

fn proxy_authority(address: &str) -> Result<&str, TransportError> {
  let authority = match address.split_once("://") {
    None => address,
    Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => rest,
    Some(_) => return Err(TransportError::UnsupportedProxy(address.to_string())),
  };
  let authority = authority.trim_end_matches('/');
  if authority.is_empty() || authority.contains('/') {
    return Err(TransportError::UnsupportedProxy(address.to_string()));
  }
  Ok(authority)
}

fn connect_request(proxy: &ProxyInfo, target: &str) -> String {
  let mut request = format!(
    "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n",
    target = target
  );
  if proxy.user.is_some() || proxy.pass.is_some() {
    let credentials = format!(
      "{}:{}",
      proxy.user.as_deref().unwrap_or_default(),
      proxy.pass.as_deref().unwrap_or_default()
    );
    request.push_str(&format!(
      "Proxy-Authorization: Basic {}\r\n",
      base64::engine::general_purpose::STANDARD.encode(credentials)
    ));
  }
  request.push_str("\r\n");
  request
}

/// Establishes a raw tunnel to `target` through an HTTP proxy's CONNECT method
pub async fn http_connect(proxy: &ProxyInfo, target: &str) -> Result<TcpStream, TransportError> {
  let mut conn = TcpStream::connect(proxy_authority(&proxy.address)?).await?;
  conn.write_all(connect_request(proxy, target).as_bytes()).await?;
  conn.flush().await?;

  // Byte-wise so nothing past the header is consumed before TLS starts
  let mut header = Vec::with_capacity(256);
  while !header.ends_with(b"\r\n\r\n") {
    if header.len() >= MAX_PROXY_RESPONSE_HEADER {
      return Err(TransportError::ProxyRefused(String::from(
        "response header too large",
      )));
    }
    header.push(conn.read_u8().await?);
  }
  let header = String::from_utf8_lossy(&header);
  let status_line = header.lines().next().unwrap_or_default();
  let status = status_line.split_whitespace().nth(1);
  if status != Some("200") {
    return Err(TransportError::ProxyRefused(status_line.to_string()));
  }
  tracing::debug!(proxy = %proxy.address, %target, "proxy tunnel established");
  Ok(conn)
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  use super::{
    client_config_from_pem, connect_request, http_connect, proxy_authority, server_config_from_pem,
    TransportError,
  };
  use crate::common::config::ProxyInfo;

  fn proxy(address: &str, user: Option<&str>, pass: Option<&str>) -> ProxyInfo {
    ProxyInfo {
      address: address.to_string(),
      user: user.map(String::from),
      pass: pass.map(String::from),
    }
  }

  #[test]
  fn pem_configs() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_pem = cert.serialize_pem().unwrap();
    let key_pem = cert.serialize_private_key_pem();
    server_config_from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
    client_config_from_pem(Some(cert_pem.as_bytes())).unwrap();
    client_config_from_pem(None).unwrap();
    assert!(matches!(
      server_config_from_pem(b"", key_pem.as_bytes()),
      Err(TransportError::NoCertificates)
    ));
    assert!(matches!(
      server_config_from_pem(cert_pem.as_bytes(), cert_pem.as_bytes()),
      Err(TransportError::NoPrivateKey)
    ));
  }

  #[test]
  fn proxy_addresses_and_requests() {
    assert_eq!(proxy_authority("http://proxy.corp:3128/").unwrap(), "proxy.corp:3128");
    assert_eq!(proxy_authority("proxy.corp:3128").unwrap(), "proxy.corp:3128");
    assert!(proxy_authority("socks5://proxy:1080").is_err());

    let plain = connect_request(&proxy("p:1", None, None), "relay:10102");
    assert_eq!(plain, "CONNECT relay:10102 HTTP/1.1\r\nHost: relay:10102\r\n\r\n");
    let authed = connect_request(&proxy("p:1", Some("me"), Some("pw")), "relay:10102");
    // base64("me:pw")
    assert!(authed.contains("Proxy-Authorization: Basic bWU6cHc=\r\n"));
  }

  #[tokio::test]
  async fn connect_through_http_proxy() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let fake_proxy = tokio::task::spawn(async move {
      for answer in ["HTTP/1.1 200 Connection established", "HTTP/1.1 407 Proxy Auth Required"] {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        while !request.ends_with(b"\r\n\r\n") {
          request.push(conn.read_u8().await.unwrap());
        }
        assert!(request.starts_with(b"CONNECT relay.example:443 HTTP/1.1\r\n"));
        conn
          .write_all(format!("{}\r\nVia: test\r\n\r\ntunneled", answer).as_bytes())
          .await
          .unwrap();
      }
    });

    let mut tunnel = http_connect(&proxy(&address, None, None), "relay.example:443")
      .await
      .unwrap();
    let mut payload = [0u8; 8];
    tunnel.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"tunneled");

    assert!(matches!(
      http_connect(&proxy(&address, Some("u"), Some("p")), "relay.example:443").await,
      Err(TransportError::ProxyRefused(line)) if line.contains("407")
    ));
    fake_proxy.await.unwrap();
  }
}
