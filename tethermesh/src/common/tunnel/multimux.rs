// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! One logical channel of virtual streams over a growing bundle of physical links
//!
//! Every physical connection becomes a yamux session owned by a dedicated driver
//! task. Drivers push inbound streams into a single queue shared by the channel,
//! serve outbound open requests routed to them, and deregister themselves from
//! the session set when their link ends. Once the last session is gone the
//! channel is closed for good.

use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::task::Poll;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::id::{MonotonicAtomicGenerator, SessionId};
use crate::util::dropkick::Dropkick;
use crate::util::tunnel_stream::WrappedStream;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MuxRole {
  /// The dialing side of the physical connections
  Client,
  /// The accepting side of the physical connections
  Server,
}

impl From<MuxRole> for yamux::Mode {
  fn from(role: MuxRole) -> Self {
    match role {
      MuxRole::Client => yamux::Mode::Client,
      MuxRole::Server => yamux::Mode::Server,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum MuxError {
  #[error("No established session to open a stream on")]
  NoSession,
  #[error("Channel is closed")]
  Closed,
}

type OpenResult = Result<yamux::Stream, yamux::ConnectionError>;
type OpenResponder = oneshot::Sender<OpenResult>;

#[derive(Default)]
struct SessionSet {
  openers: HashMap<SessionId, mpsc::UnboundedSender<OpenResponder>>,
  closed: bool,
}

pub struct MultiMux {
  role: MuxRole,
  sessions: Arc<Mutex<SessionSet>>,
  incoming_tx: mpsc::UnboundedSender<yamux::Stream>,
  incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<yamux::Stream>>,
  closed: CancellationToken,
  ids: MonotonicAtomicGenerator,
  _close_on_drop: Dropkick<CancellationToken>,
}

impl std::fmt::Debug for MultiMux {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MultiMux")
      .field("role", &self.role)
      .field("sessions", &self.session_count())
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl MultiMux {
  pub fn new(role: MuxRole) -> Self {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    Self {
      role,
      sessions: Default::default(),
      incoming_tx,
      incoming_rx: tokio::sync::Mutex::new(incoming_rx),
      _close_on_drop: Dropkick::new(closed.clone()),
      closed,
      ids: MonotonicAtomicGenerator::default(),
    }
  }

  pub fn role(&self) -> MuxRole {
    self.role
  }

  pub fn session_count(&self) -> usize {
    self
      .sessions
      .lock()
      .expect("session set lock poisoned")
      .openers
      .len()
  }

  pub fn is_closed(&self) -> bool {
    self.closed.is_cancelled()
  }

  /// Folds a physical connection into the channel as a new multiplexing session
  ///
  /// Fails only if the channel has already closed; link failures surface later
  /// as the session silently leaving the set.
  pub fn add_connection(&self, conn: WrappedStream) -> Result<SessionId, MuxError> {
    let id = self.ids.next();
    let (open_tx, open_rx) = mpsc::unbounded_channel();
    {
      let mut set = self.sessions.lock().expect("session set lock poisoned");
      if set.closed {
        return Err(MuxError::Closed);
      }
      set.openers.insert(id, open_tx);
    }

    let connection = yamux::Connection::new(
      conn.compat(),
      yamux::Config::default(),
      self.role.into(),
    );
    let deregister = Dropkick::callback({
      let sessions = Arc::downgrade(&self.sessions);
      let closed = self.closed.clone();
      move || remove_session(&sessions, id, &closed)
    });
    let driver = drive_session(
      connection,
      open_rx,
      self.incoming_tx.clone(),
      self.closed.clone(),
    );
    tokio::task::spawn(
      async move {
        let _deregister = deregister;
        match driver.await {
          Ok(()) => tracing::debug!("session ended"),
          Err(error) => tracing::debug!(%error, "session failed"),
        }
      }
      .instrument(tracing::debug_span!("mux_session", session = %id, role = ?self.role)),
    );
    Ok(id)
  }

  /// Originates a virtual stream on a randomly chosen live session
  ///
  /// A session found dead along the way is dropped from the set and another is
  /// tried; this fails only once no session remains.
  pub async fn open(&self) -> Result<WrappedStream, MuxError> {
    loop {
      let (id, response) = self.request_open()?;
      match response.await {
        Ok(Ok(stream)) => return Ok(WrappedStream::Mux(stream.compat())),
        Ok(Err(error)) => tracing::debug!(session = %id, %error, "session failed to open stream"),
        Err(_) => tracing::debug!(session = %id, "session ended before opening stream"),
      }
      forget_session(
        &mut self.sessions.lock().expect("session set lock poisoned"),
        id,
        &self.closed,
      );
    }
  }

  /// Hands an open request to a live session, discarding any whose driver is gone
  fn request_open(&self) -> Result<(SessionId, oneshot::Receiver<OpenResult>), MuxError> {
    let mut set = self.sessions.lock().expect("session set lock poisoned");
    loop {
      if set.closed {
        return Err(MuxError::Closed);
      }
      let live: Vec<SessionId> = set
        .openers
        .iter()
        .filter(|(_, opener)| !opener.is_closed())
        .map(|(id, _)| *id)
        .collect();
      if live.is_empty() {
        return Err(MuxError::NoSession);
      }
      let id = live[rand::thread_rng().gen_range(0..live.len())];
      let (responder, response) = oneshot::channel();
      let sent = set
        .openers
        .get(&id)
        .map_or(false, |opener| opener.send(responder).is_ok());
      if sent {
        tracing::trace!(session = %id, "opening stream");
        return Ok((id, response));
      }
      forget_session(&mut set, id, &self.closed);
    }
  }

  /// Waits for the next virtual stream any session accepted
  ///
  /// Streams queued before the channel closed are still delivered.
  pub async fn accept(&self) -> Result<WrappedStream, MuxError> {
    let mut incoming = self.incoming_rx.lock().await;
    let stream = tokio::select! {
      biased;
      stream = incoming.recv() => stream,
      _ = self.closed.cancelled() => incoming.try_recv().ok(),
    };
    stream
      .map(|stream| WrappedStream::Mux(stream.compat()))
      .ok_or(MuxError::Closed)
  }

  /// Closes every session and refuses further connections
  pub fn close(&self) {
    self
      .sessions
      .lock()
      .expect("session set lock poisoned")
      .closed = true;
    self.closed.cancel();
  }
}

fn remove_session(sessions: &Weak<Mutex<SessionSet>>, id: SessionId, closed: &CancellationToken) {
  let Some(sessions) = sessions.upgrade() else {
    closed.cancel();
    return;
  };
  let mut set = sessions.lock().expect("session set lock poisoned");
  forget_session(&mut set, id, closed);
}

/// Drops a session from the set, closing the channel when it was the last one
fn forget_session(set: &mut SessionSet, id: SessionId, closed: &CancellationToken) {
  if set.openers.remove(&id).is_none() {
    return;
  }
  if set.openers.is_empty() {
    set.closed = true;
    closed.cancel();
  }
  tracing::trace!(session = %id, remaining = set.openers.len(), "session removed");
}

enum DriverExit {
  Shutdown,
  Ended,
}

async fn drive_session<T>(
  mut connection: yamux::Connection<T>,
  mut open_rx: mpsc::UnboundedReceiver<OpenResponder>,
  incoming_tx: mpsc::UnboundedSender<yamux::Stream>,
  shutdown: CancellationToken,
) -> Result<(), yamux::ConnectionError>
where
  T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
  let mut pending_opens: VecDeque<OpenResponder> = VecDeque::new();
  let cancelled = shutdown.cancelled();
  tokio::pin!(cancelled);

  let exit = futures::future::poll_fn(|cx| {
    if cancelled.as_mut().poll(cx).is_ready() {
      return Poll::Ready(Ok(DriverExit::Shutdown));
    }

    loop {
      match open_rx.poll_recv(cx) {
        Poll::Ready(Some(responder)) => pending_opens.push_back(responder),
        // The channel itself is gone
        Poll::Ready(None) => return Poll::Ready(Ok(DriverExit::Shutdown)),
        Poll::Pending => break,
      }
    }

    while !pending_opens.is_empty() {
      match connection.poll_new_outbound(cx) {
        Poll::Ready(res) => {
          if let Some(responder) = pending_opens.pop_front() {
            let failed = res.is_err();
            let _ = responder.send(res);
            if failed {
              return Poll::Ready(Ok(DriverExit::Ended));
            }
          }
        }
        Poll::Pending => break,
      }
    }

    loop {
      match connection.poll_next_inbound(cx) {
        Poll::Ready(Some(Ok(stream))) => {
          tracing::trace!("inbound stream");
          if incoming_tx.send(stream).is_err() {
            return Poll::Ready(Ok(DriverExit::Shutdown));
          }
        }
        Poll::Ready(Some(Err(error))) => return Poll::Ready(Err(error)),
        Poll::Ready(None) => return Poll::Ready(Ok(DriverExit::Ended)),
        Poll::Pending => return Poll::Pending,
      }
    }
  })
  .await;

  // Unserved open requests learn of the closure when their responders drop
  drop(pending_opens);
  match exit? {
    DriverExit::Shutdown => futures::future::poll_fn(|cx| connection.poll_close(cx)).await,
    DriverExit::Ended => Ok(()),
  }
}
