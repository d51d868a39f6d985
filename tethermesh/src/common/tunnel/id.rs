// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

/// Identifies one physical connection's multiplexing session within a channel
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
  pub fn new(inner: u64) -> SessionId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for SessionId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl std::fmt::Debug for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("SessionId").field(&self.inner()).finish()
  }
}

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.inner())
  }
}

#[derive(Debug)]
pub struct MonotonicAtomicGenerator {
  next: std::sync::atomic::AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: std::sync::atomic::AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> SessionId {
    SessionId::new(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
  }
}

impl Default for MonotonicAtomicGenerator {
  fn default() -> Self {
    Self::new(0)
  }
}
