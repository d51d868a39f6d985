// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! SOCKS5 (RFC 1928) negotiation and request records, with RFC 1929 credentials
//!
//! Entry listeners negotiate the greeting and read the CONNECT request, but do
//! not answer it; the node which finally executes the request writes the reply,
//! which then travels back through every relay hop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TaskInfo;
use crate::common::config::ListenerConfig;

pub const SOCKS_VERSION: u8 = 0x05;
const USER_PASS_VERSION: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
  NoAuth = 0x00,
  UsernamePassword = 0x02,
  NoAcceptable = 0xFF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
  Connect = 0x01,
  Bind = 0x02,
  UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
  type Error = Socks5Error;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0x01 => Ok(Command::Connect),
      0x02 => Ok(Command::Bind),
      0x03 => Ok(Command::UdpAssociate),
      _ => Err(Socks5Error::UnsupportedCommand(value)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
  Ipv4 = 0x01,
  Domain = 0x03,
  Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
  type Error = Socks5Error;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    match value {
      0x01 => Ok(AddressType::Ipv4),
      0x03 => Ok(AddressType::Domain),
      0x04 => Ok(AddressType::Ipv6),
      _ => Err(Socks5Error::UnsupportedAddressType(value)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
  Succeeded = 0x00,
  GeneralFailure = 0x01,
  ConnectionNotAllowed = 0x02,
  NetworkUnreachable = 0x03,
  HostUnreachable = 0x04,
  ConnectionRefused = 0x05,
  TtlExpired = 0x06,
  CommandNotSupported = 0x07,
  AddressTypeNotSupported = 0x08,
}

impl Reply {
  /// Failure code describing why dialing a destination failed
  pub fn for_connect_error(error: &std::io::Error) -> Self {
    use std::io::ErrorKind;
    match error.kind() {
      ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
      ErrorKind::PermissionDenied => Reply::ConnectionNotAllowed,
      ErrorKind::TimedOut => Reply::TtlExpired,
      ErrorKind::AddrNotAvailable => Reply::NetworkUnreachable,
      _ => Reply::HostUnreachable,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum Socks5Error {
  #[error("SOCKS5 stream failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("Unsupported SOCKS version {0:#04x}")]
  InvalidVersion(u8),
  #[error("Client offered no acceptable authentication method")]
  NoAcceptableAuth,
  #[error("Authentication failed for user {0:?}")]
  AuthenticationFailed(String),
  #[error("Unsupported SOCKS command {0:#04x}")]
  UnsupportedCommand(u8),
  #[error("Unsupported SOCKS address type {0:#04x}")]
  UnsupportedAddressType(u8),
  #[error("Invalid destination port {0:?}")]
  InvalidPort(String),
  #[error("Destination name of {0} bytes does not fit a SOCKS record")]
  DomainTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
  Ip(SocketAddr),
  Domain(String, u16),
}

impl TargetAddr {
  /// Rebuilds the destination of a routed task, treating anything that isn't an IP as a name
  pub fn from_task_info(info: &TaskInfo) -> Result<Self, Socks5Error> {
    let port: u16 = info
      .target_port
      .trim()
      .parse()
      .map_err(|_| Socks5Error::InvalidPort(info.target_port.clone()))?;
    let host = info
      .target_address
      .trim_start_matches('[')
      .trim_end_matches(']');
    Ok(match host.parse::<IpAddr>() {
      Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
      Err(_) => TargetAddr::Domain(info.target_address.clone(), port),
    })
  }

  pub fn host(&self) -> String {
    match self {
      TargetAddr::Ip(addr) => addr.ip().to_string(),
      TargetAddr::Domain(name, _) => name.clone(),
    }
  }

  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ip(addr) => addr.port(),
      TargetAddr::Domain(_, port) => *port,
    }
  }

  fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), Socks5Error> {
    match self {
      TargetAddr::Ip(SocketAddr::V4(addr)) => {
        out.push(AddressType::Ipv4 as u8);
        out.extend_from_slice(&addr.ip().octets());
      }
      TargetAddr::Ip(SocketAddr::V6(addr)) => {
        out.push(AddressType::Ipv6 as u8);
        out.extend_from_slice(&addr.ip().octets());
      }
      TargetAddr::Domain(name, _) => {
        let len = u8::try_from(name.len()).map_err(|_| Socks5Error::DomainTooLong(name.len()))?;
        out.push(AddressType::Domain as u8);
        out.push(len);
        out.extend_from_slice(name.as_bytes());
      }
    }
    out.extend_from_slice(&self.port().to_be_bytes());
    Ok(())
  }

  async fn read_from<S: AsyncRead + Unpin>(
    stream: &mut S,
    address_type: AddressType,
  ) -> Result<Self, Socks5Error> {
    let target = match address_type {
      AddressType::Ipv4 => {
        let mut ip = [0u8; 4];
        stream.read_exact(&mut ip).await?;
        let port = stream.read_u16().await?;
        TargetAddr::Ip(SocketAddr::new(IpAddr::from(ip), port))
      }
      AddressType::Ipv6 => {
        let mut ip = [0u8; 16];
        stream.read_exact(&mut ip).await?;
        let port = stream.read_u16().await?;
        TargetAddr::Ip(SocketAddr::new(IpAddr::from(ip), port))
      }
      AddressType::Domain => {
        let len = stream.read_u8().await? as usize;
        let mut name = vec![0u8; len];
        stream.read_exact(&mut name).await?;
        let port = stream.read_u16().await?;
        TargetAddr::Domain(String::from_utf8_lossy(&name).into_owned(), port)
      }
    };
    Ok(target)
  }
}

impl std::fmt::Display for TargetAddr {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TargetAddr::Ip(addr) => write!(f, "{}", addr),
      TargetAddr::Domain(name, port) => write!(f, "{}:{}", name, port),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
  pub command: Command,
  pub target: TargetAddr,
}

impl SocksRequest {
  pub fn connect(target: TargetAddr) -> Self {
    Self {
      command: Command::Connect,
      target,
    }
  }

  /// The request record as a client would have sent it after negotiation
  pub fn encode(&self) -> Result<Vec<u8>, Socks5Error> {
    let mut out = vec![SOCKS_VERSION, self.command as u8, 0x00];
    self.target.encode_into(&mut out)?;
    Ok(out)
  }
}

/// Reads a request record; unknown commands are answered and rejected here
pub async fn read_request<S>(stream: &mut S) -> Result<SocksRequest, Socks5Error>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut head = [0u8; 4];
  stream.read_exact(&mut head).await?;
  let [version, command, _reserved, address_type] = head;
  if version != SOCKS_VERSION {
    return Err(Socks5Error::InvalidVersion(version));
  }
  let address_type = match AddressType::try_from(address_type) {
    Ok(address_type) => address_type,
    Err(e) => {
      write_reply(stream, Reply::AddressTypeNotSupported, None).await?;
      return Err(e);
    }
  };
  let target = TargetAddr::read_from(stream, address_type).await?;
  let command = match Command::try_from(command) {
    Ok(command) => command,
    Err(e) => {
      write_reply(stream, Reply::CommandNotSupported, None).await?;
      return Err(e);
    }
  };
  Ok(SocksRequest { command, target })
}

pub async fn write_reply<S: AsyncWrite + Unpin>(
  stream: &mut S,
  reply: Reply,
  bound: Option<SocketAddr>,
) -> Result<(), Socks5Error> {
  let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
  let mut out = vec![SOCKS_VERSION, reply as u8, 0x00];
  TargetAddr::Ip(bound).encode_into(&mut out)?;
  stream.write_all(&out).await?;
  stream.flush().await?;
  Ok(())
}

/// Runs the greeting, optional credential check, and request read of an entry connection
///
/// Only CONNECT requests are returned; anything else is answered with
/// "command not supported". A successful CONNECT is left unanswered.
pub async fn negotiate<S>(stream: &mut S, listener: &ListenerConfig) -> Result<SocksRequest, Socks5Error>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let version = stream.read_u8().await?;
  if version != SOCKS_VERSION {
    return Err(Socks5Error::InvalidVersion(version));
  }
  let method_count = stream.read_u8().await? as usize;
  let mut methods = vec![0u8; method_count];
  stream.read_exact(&mut methods).await?;

  let wanted = if listener.use_authentication {
    AuthMethod::UsernamePassword
  } else {
    AuthMethod::NoAuth
  };
  let method = if methods.contains(&(wanted as u8)) {
    wanted
  } else {
    AuthMethod::NoAcceptable
  };
  stream.write_all(&[SOCKS_VERSION, method as u8]).await?;
  stream.flush().await?;

  match method {
    AuthMethod::NoAcceptable => return Err(Socks5Error::NoAcceptableAuth),
    AuthMethod::UsernamePassword => {
      let version = stream.read_u8().await?;
      if version != USER_PASS_VERSION {
        return Err(Socks5Error::InvalidVersion(version));
      }
      let user = read_short_string(stream).await?;
      let pass = read_short_string(stream).await?;
      let accepted = listener.authorizes(&user, &pass);
      stream
        .write_all(&[USER_PASS_VERSION, if accepted { 0x00 } else { 0x01 }])
        .await?;
      stream.flush().await?;
      if !accepted {
        return Err(Socks5Error::AuthenticationFailed(user));
      }
    }
    AuthMethod::NoAuth => {}
  }

  let request = read_request(stream).await?;
  if request.command != Command::Connect {
    write_reply(stream, Reply::CommandNotSupported, None).await?;
    return Err(Socks5Error::UnsupportedCommand(request.command as u8));
  }
  Ok(request)
}

async fn read_short_string<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, Socks5Error> {
  let len = stream.read_u8().await? as usize;
  let mut bytes = vec![0u8; len];
  stream.read_exact(&mut bytes).await?;
  Ok(String::from_utf8_lossy(&bytes).into_owned())
}
