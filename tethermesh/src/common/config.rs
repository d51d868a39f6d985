// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Node configuration as persisted in the agent's JSON config file
//!
//! [NetworkConfig] is also the record exchanged by both ends of every new
//! physical connection, so its field names are part of the wire format.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::router::routing::RoutingTable;

pub const DEFAULT_CONNECTIONS_PER_TETHER: usize = 10;
pub const DEFAULT_CERT_FILE: &str = "server.crt";
pub const DEFAULT_KEY_FILE: &str = "server.key";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read configuration file {path:?}")]
  Read {
    path: PathBuf,
    #[source]
    error: std::io::Error,
  },
  #[error("Failed to write configuration file {path:?}")]
  Write {
    path: PathBuf,
    #[source]
    error: std::io::Error,
  },
  #[error("Malformed configuration: {0}")]
  Malformed(#[from] serde_json::Error),
  #[error("Node configuration requires a non-empty clientId")]
  MissingClientId,
}

/// A node's identity, credential, and routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub secret: String,
  #[serde(default)]
  pub client_id: String,
  #[serde(rename = "networkMapping", default)]
  pub mapping: RoutingTable,
}

impl NetworkConfig {
  pub fn new<S: Into<String>>(client_id: S, mapping: RoutingTable) -> Self {
    Self {
      secret: String::new(),
      client_id: client_id.into(),
      mapping,
    }
  }

  /// The record sent to peers which did not prove anything yet; never carries our secret
  pub fn advertised(&self) -> NetworkConfig {
    NetworkConfig {
      secret: String::new(),
      ..self.clone()
    }
  }

  /// The record sent when dialing out, presenting `secret` to the accepting node
  pub fn presenting<S: Into<String>>(&self, secret: S) -> NetworkConfig {
    NetworkConfig {
      secret: secret.into(),
      ..self.clone()
    }
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.client_id.trim().is_empty() {
      return Err(ConfigError::MissingClientId);
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListenerType {
  #[serde(alias = "Socks5", alias = "socks")]
  Socks5,
  #[serde(alias = "relay")]
  RelayTcp,
  RelayUdp,
  RelayWebSockets,
  #[serde(other)]
  Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
  pub port: u16,
  #[serde(rename = "type")]
  pub listener_type: ListenerType,
  #[serde(rename = "acceptLocalOnly", default)]
  pub local_only: bool,
  #[serde(default)]
  pub use_authentication: bool,
  /// Client id (or SOCKS5 user name) to expected secret
  #[serde(rename = "authClients", default)]
  pub authorized_clients: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cert_file: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key_file: Option<PathBuf>,
}

impl ListenerConfig {
  pub fn new(listener_type: ListenerType, port: u16) -> Self {
    Self {
      port,
      listener_type,
      local_only: false,
      use_authentication: false,
      authorized_clients: Default::default(),
      cert_file: None,
      key_file: None,
    }
  }

  pub fn local_only(mut self) -> Self {
    self.local_only = true;
    self
  }

  pub fn authenticated<I, K, V>(mut self, clients: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    self.use_authentication = true;
    self.authorized_clients = clients
      .into_iter()
      .map(|(k, v)| (k.into(), v.into()))
      .collect();
    self
  }

  pub fn bind_address(&self) -> std::net::SocketAddr {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    let ip = if self.local_only {
      IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
      IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    SocketAddr::new(ip, self.port)
  }

  pub fn cert_path(&self) -> &Path {
    self
      .cert_file
      .as_deref()
      .unwrap_or_else(|| Path::new(DEFAULT_CERT_FILE))
  }

  pub fn key_path(&self) -> &Path {
    self
      .key_file
      .as_deref()
      .unwrap_or_else(|| Path::new(DEFAULT_KEY_FILE))
  }

  /// Static credential check shared by relay peers and SOCKS5 users
  pub fn authorizes(&self, id: &str, secret: &str) -> bool {
    !self.use_authentication
      || self
        .authorized_clients
        .get(id)
        .map_or(false, |expected| expected == secret)
  }
}

/// Upstream HTTP proxy used to reach a relay listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyInfo {
  /// `host:port`, optionally with an `http://` scheme
  #[serde(alias = "address")]
  pub address: String,
  #[serde(default, alias = "user", skip_serializing_if = "Option::is_none")]
  pub user: Option<String>,
  #[serde(default, alias = "pass", skip_serializing_if = "Option::is_none")]
  pub pass: Option<String>,
}

fn default_connection_type() -> String {
  String::from("tls")
}

/// An outbound tether to a relay listener on another node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TetherConfig {
  pub host: String,
  pub port: u16,
  #[serde(default = "default_connection_type")]
  pub connection_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub connection_name: Option<String>,
  #[serde(default)]
  pub password: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub proxy: Option<ProxyInfo>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub num_connections: Option<usize>,
  /// PEM trust anchor for the relay's certificate; unverified when absent
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub authority: Option<PathBuf>,
}

impl TetherConfig {
  pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
      connection_type: default_connection_type(),
      connection_name: None,
      password: String::new(),
      proxy: None,
      num_connections: None,
      authority: None,
    }
  }

  pub fn address(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }

  /// Per-tether proxy settings take precedence over the node-wide default
  pub fn effective_proxy<'a>(&'a self, default: Option<&'a ProxyInfo>) -> Option<&'a ProxyInfo> {
    self.proxy.as_ref().or(default)
  }

  pub fn effective_connections(&self, default: Option<usize>) -> usize {
    self
      .num_connections
      .or(default)
      .filter(|count| *count > 0)
      .unwrap_or(DEFAULT_CONNECTIONS_PER_TETHER)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
  #[serde(default)]
  pub servers: Vec<ListenerConfig>,
  #[serde(default)]
  pub tethers: Vec<TetherConfig>,
  #[serde(rename = "netConf")]
  pub net_conf: NetworkConfig,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub proxy: Option<ProxyInfo>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub num_conns_per_tether: Option<usize>,
}

impl AgentConfig {
  pub fn from_json(json: &[u8]) -> Result<Self, ConfigError> {
    let config: AgentConfig = serde_json::from_slice(json)?;
    config.net_conf.validate()?;
    Ok(config)
  }

  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read(path).map_err(|error| ConfigError::Read {
      path: path.to_path_buf(),
      error,
    })?;
    Self::from_json(&json)
  }

  pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let json = serde_json::to_vec_pretty(self)?;
    std::fs::write(path, json).map_err(|error| ConfigError::Write {
      path: path.to_path_buf(),
      error,
    })
  }

  /// A starting point for operators: route everything locally, a loopback SOCKS5
  /// entry, a relay listener, and a placeholder tether to fill in
  pub fn template<S: Into<String>>(client_id: S) -> Self {
    let mut placeholder = TetherConfig::new("<remote host address or IP>", 10201);
    placeholder.connection_name = Some(String::from(
      "<description, such as: network node #2, which should have clientId = HomeComputer>",
    ));
    Self {
      servers: vec![
        ListenerConfig::new(ListenerType::Socks5, 10101).local_only(),
        ListenerConfig::new(ListenerType::RelayTcp, 10102),
      ],
      tethers: vec![placeholder],
      net_conf: NetworkConfig::new(client_id, RoutingTable::new().with_rule("*", "local")),
      proxy: None,
      num_conns_per_tether: None,
    }
  }
}
