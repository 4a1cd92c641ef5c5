//! One connection per remote node.
//!
//! Frames sent before the handshake completes wait in a backlog. Activation
//! flushes the backlog in order and from then on frames go straight to the
//! transport. Closing is final: the first cause is kept and every pending or
//! later send fails with it.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{codec::DistFrame, etf::Atom, handshake::PeerNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, handshake not finished yet. Sends are backlogged.
    Pending,
    /// Handshake finished, backlog being flushed.
    Draining,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("connection lost: {0}")]
    Lost(String),
    #[error("transport is gone")]
    TransportClosed,
    #[error("node is shutting down")]
    Shutdown,
}

type Completion = oneshot::Sender<Result<(), ConnectionError>>;

struct Inner {
    state: ConnectionState,
    backlog: VecDeque<(DistFrame, Completion)>,
    transport: Option<mpsc::UnboundedSender<DistFrame>>,
    peer: Option<PeerNode>,
    error: Option<ConnectionError>,
}

pub struct Connection {
    node: Atom,
    inner: Mutex<Inner>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

/// Resolves once a send has been handed to the transport, or failed.
#[derive(Debug)]
pub struct SendReceipt(Option<oneshot::Receiver<Result<(), ConnectionError>>>);

impl SendReceipt {
    pub async fn wait(self) -> Result<(), ConnectionError> {
        match self.0 {
            None => Ok(()),
            Some(rx) => rx.await.unwrap_or(Err(ConnectionError::TransportClosed)),
        }
    }
}

impl Connection {
    pub fn new(node: Atom) -> Self {
        let (state, _) = watch::channel(ConnectionState::Pending);
        Connection {
            node,
            inner: Mutex::new(Inner {
                state: ConnectionState::Pending,
                backlog: VecDeque::new(),
                transport: None,
                peer: None,
                error: None,
            }),
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Name of the remote node.
    pub fn node(&self) -> &Atom {
        &self.node
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn peer(&self) -> Option<PeerNode> {
        self.inner.lock().peer.clone()
    }

    pub fn error(&self) -> Option<ConnectionError> {
        self.inner.lock().error.clone()
    }

    /// Cancelled when the connection closes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn send(&self, frame: DistFrame) -> Result<SendReceipt, ConnectionError> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.error {
            return Err(err.clone());
        }
        match (inner.state, &inner.transport) {
            (ConnectionState::Active, Some(transport)) => {
                transport
                    .send(frame)
                    .map_err(|_| ConnectionError::TransportClosed)?;
                Ok(SendReceipt(None))
            }
            _ => {
                let (tx, rx) = oneshot::channel();
                inner.backlog.push_back((frame, tx));
                Ok(SendReceipt(Some(rx)))
            }
        }
    }

    /// Attaches the transport of a completed handshake. Only the first call
    /// on a pending connection is accepted; returns whether this call made the
    /// connection active.
    pub fn activate(&self, transport: mpsc::UnboundedSender<DistFrame>, peer: PeerNode) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Pending {
                return false;
            }
            inner.state = ConnectionState::Draining;
            inner.transport = Some(transport.clone());
            inner.peer = Some(peer);
        }
        self.state.send_replace(ConnectionState::Draining);

        loop {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return false;
            }
            match inner.backlog.pop_front() {
                Some((frame, done)) => {
                    drop(inner);
                    let result = transport
                        .send(frame)
                        .map_err(|_| ConnectionError::TransportClosed);
                    let _ = done.send(result);
                }
                None => {
                    inner.state = ConnectionState::Active;
                    drop(inner);
                    self.state.send_replace(ConnectionState::Active);
                    log::debug!("connection to {} is active", self.node);
                    return true;
                }
            }
        }
    }

    /// Closes the connection with `cause`. Returns false if it was already
    /// closed, in which case the earlier cause stands.
    pub fn close(&self, cause: ConnectionError) -> bool {
        self.close_if(cause, |_| true)
    }

    /// Closes the connection only if no handshake has completed on it yet.
    pub fn abort(&self, cause: ConnectionError) -> bool {
        self.close_if(cause, |state| state == ConnectionState::Pending)
    }

    fn close_if(&self, cause: ConnectionError, allowed: impl Fn(ConnectionState) -> bool) -> bool {
        let backlog = {
            let mut inner = self.inner.lock();
            if inner.error.is_some() || !allowed(inner.state) {
                return false;
            }
            inner.error = Some(cause.clone());
            inner.state = ConnectionState::Closed;
            inner.transport = None;
            std::mem::take(&mut inner.backlog)
        };
        log::debug!("closing connection to {}: {}", self.node, cause);
        for (_, done) in backlog {
            let _ = done.send(Err(cause.clone()));
        }
        self.state.send_replace(ConnectionState::Closed);
        self.cancel.cancel();
        true
    }

    /// Waits until the connection is either active or closed.
    pub async fn wait_active(&self) -> Result<(), ConnectionError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| {
                matches!(state, ConnectionState::Active | ConnectionState::Closed)
            })
            .await
            .map(|state| *state);
        match state {
            Ok(ConnectionState::Active) => Ok(()),
            _ => Err(self.error().unwrap_or(ConnectionError::Shutdown)),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("node", &self.node)
            .field("state", &self.state())
            .finish()
    }
}
