// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Records and stream wrappers exchanged between nodes of the mesh

use serde::{Deserialize, Serialize};

pub mod handshake;
pub mod socks5;
pub mod task;

pub use task::{TaskError, TunnelTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
  Socks,
  UpdateConfig,
  Vpn,
}

/// Routing header of a task, read by every hop before any payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
  #[serde(rename = "type")]
  pub task_type: TaskType,
  pub target_address: String,
  pub target_port: String,
  /// Set when a loopback-only entry listener produced the task; never crosses a hop
  #[serde(skip)]
  pub local: bool,
}

impl TaskInfo {
  pub fn socks<A: Into<String>, P: ToString>(target_address: A, target_port: P) -> Self {
    Self {
      task_type: TaskType::Socks,
      target_address: target_address.into(),
      target_port: target_port.to_string(),
      local: false,
    }
  }

  pub fn with_local(mut self, local: bool) -> Self {
    self.local = local;
    self
  }

  pub fn target(&self) -> String {
    if self.target_address.contains(':') {
      format!("[{}]:{}", self.target_address, self.target_port)
    } else {
      format!("{}:{}", self.target_address, self.target_port)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{TaskInfo, TaskType};

  #[test]
  fn task_info_wire_shape() {
    let info = TaskInfo::socks("example.com", 443).with_local(true);
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(
      json,
      serde_json::json!({ "type": "socks", "targetAddress": "example.com", "targetPort": "443" })
    );
    let parsed: TaskInfo = serde_json::from_value(json).unwrap();
    assert_eq!(parsed.task_type, TaskType::Socks);
    assert!(!parsed.local, "locality must not survive a hop");
    assert_eq!(parsed.target(), "example.com:443");
    assert_eq!(TaskInfo::socks("::1", "80").target(), "[::1]:80");
  }
}
