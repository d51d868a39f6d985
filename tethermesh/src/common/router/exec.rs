// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Terminating a task at this node

use futures::future::{BoxFuture, FutureExt};
use tokio::net::TcpStream;

use crate::common::protocol::socks5::{self, Reply, Socks5Error, TargetAddr};
use crate::common::protocol::{TaskType, TunnelTask};
use crate::util::{splice_bidirectional, tunnel_stream::WrappedStream};

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
  #[error("No local execution for {0:?} tasks")]
  Unsupported(TaskType),
  #[error("Destination request failed: {0}")]
  Socks(#[from] Socks5Error),
  #[error("Failed to reach {target}")]
  Connect {
    target: String,
    #[source]
    error: std::io::Error,
  },
  #[error("Relay to destination failed: {0}")]
  Relay(#[source] std::io::Error),
}

/// Executes tasks whose route resolved to this node
///
/// Tasks arrive with a SOCKS5 request record pending ahead of their payload.
#[cfg_attr(test, mockall::automock)]
pub trait TaskExecutor: Send + Sync {
  fn execute(&self, task: TunnelTask<WrappedStream>) -> BoxFuture<'static, Result<(), ExecError>>;
}

/// Dials the requested destination over TCP and relays the task to it
#[derive(Debug, Default, Clone, Copy)]
pub struct Socks5Executor;

impl Socks5Executor {
  async fn connect(target: &TargetAddr) -> std::io::Result<TcpStream> {
    match target {
      TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
      TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    }
  }

  async fn run(mut task: TunnelTask<WrappedStream>) -> Result<(), ExecError> {
    let task_type = task.header().task_type;
    if task_type != TaskType::Socks {
      return Err(ExecError::Unsupported(task_type));
    }
    let request = socks5::read_request(&mut task).await?;
    if request.command != socks5::Command::Connect {
      socks5::write_reply(&mut task, Reply::CommandNotSupported, None).await?;
      return Err(Socks5Error::UnsupportedCommand(request.command as u8).into());
    }
    let destination = match Self::connect(&request.target).await {
      Ok(destination) => destination,
      Err(error) => {
        socks5::write_reply(&mut task, Reply::for_connect_error(&error), None).await?;
        return Err(ExecError::Connect {
          target: request.target.to_string(),
          error,
        });
      }
    };
    socks5::write_reply(&mut task, Reply::Succeeded, destination.local_addr().ok()).await?;
    tracing::debug!(target = %request.target, "destination connected");
    let (sent, received) = splice_bidirectional(task, destination)
      .await
      .map_err(ExecError::Relay)?;
    tracing::trace!(target = %request.target, sent, received, "destination relay finished");
    Ok(())
  }
}

impl TaskExecutor for Socks5Executor {
  fn execute(&self, task: TunnelTask<WrappedStream>) -> BoxFuture<'static, Result<(), ExecError>> {
    Self::run(task).boxed()
  }
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  use super::{ExecError, Socks5Executor, TaskExecutor};
  use crate::common::protocol::socks5::{Reply, SocksRequest, TargetAddr};
  use crate::common::protocol::{TaskInfo, TaskType, TunnelTask};
  use crate::util::tunnel_stream::WrappedStream;

  fn local_task(info: TaskInfo) -> (TunnelTask<WrappedStream>, WrappedStream) {
    let (ours, theirs) = WrappedStream::duplex(4096);
    let mut task = TunnelTask::new(ours, info);
    let request = SocksRequest::connect(TargetAddr::from_task_info(task.header()).unwrap());
    task.prefix_send(&request.encode().unwrap());
    (task, theirs)
  }

  #[tokio::test]
  async fn connects_replies_and_relays() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = echo.local_addr().unwrap().port();
    tokio::task::spawn(async move {
      let (mut conn, _) = echo.accept().await.unwrap();
      let mut buf = [0u8; 5];
      conn.read_exact(&mut buf).await.unwrap();
      conn.write_all(&buf).await.unwrap();
    });

    let (task, mut client) = local_task(TaskInfo::socks("127.0.0.1", port));
    let execution = tokio::task::spawn(Socks5Executor.execute(task));

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[..2], [5, Reply::Succeeded as u8]);
    client.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");
    drop(client);
    execution.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn refused_destination_gets_failure_reply() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = unused.local_addr().unwrap().port();
    drop(unused);

    let (task, mut client) = local_task(TaskInfo::socks("127.0.0.1", port));
    let result = Socks5Executor.execute(task).await;
    assert!(matches!(result, Err(ExecError::Connect { .. })));
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], Reply::ConnectionRefused as u8);
  }

  #[tokio::test]
  async fn other_task_types_are_unsupported() {
    let mut info = TaskInfo::socks("127.0.0.1", 80);
    info.task_type = TaskType::Vpn;
    let (task, _client) = local_task(info);
    assert!(matches!(
      Socks5Executor.execute(task).await,
      Err(ExecError::Unsupported(TaskType::Vpn))
    ));
  }
}
