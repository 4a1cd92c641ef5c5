//! Connection setup: the two-sided challenge/response exchange that
//! authenticates a peer with the shared cookie.
//!
//! [`Acceptor`] and [`Initiator`] are plain state machines over frame bodies.
//! [`accept`] and [`initiate`] drive them over a socket, enforce the timeouts
//! and hand back the stream reframed for steady-state traffic.

use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt as _};
use rand::{rngs::StdRng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{
    bytes::{Bytes, BytesMut},
    codec::{Framed, LengthDelimitedCodec},
};

use crate::{
    codec::{handshake_codec, DistCodec},
    discovery::{Discovery, NodeInfo},
    etf::Atom,
};

mod acceptor;
pub mod flags;
mod initiator;
mod messages;

pub use acceptor::{Acceptor, AcceptorPhase};
pub use initiator::{Initiator, InitiatorPhase};
pub use messages::{ChallengeRequest, HandshakeMessage, MessageKind, NameRequest};

pub type Digest = [u8; 16];

/// `MD5(cookie ++ decimal(challenge))`, with the challenge read as an
/// unsigned 32-bit integer. Negative values wrap, so `-1` and `4294967295`
/// produce the same digest.
pub fn digest(challenge: impl Into<i64>, cookie: &str) -> Digest {
    let challenge = challenge.into() as u32;
    md5::compute(format!("{}{}", cookie, challenge)).0
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("peer closed the connection mid-handshake")]
    Closed,
    #[error("challenge digest did not match, are both nodes using the same cookie?")]
    DigestMismatch,
    #[error("expected {expected:?}, received a message tagged {tag:?}")]
    UnexpectedMessage {
        expected: MessageKind,
        tag: Option<u8>,
    },
    #[error("malformed {kind:?}: {reason}")]
    Malformed { kind: MessageKind, reason: String },
    #[error("lookup of {name} failed: {reason}")]
    LookupFailed { name: Atom, reason: String },
    #[error("lookup of {0} timed out")]
    LookupTimeout(Atom),
    #[error("peer refused the connection with status {0:?}")]
    Rejected(String),
    #[error("no shared protocol version, peer speaks {low}..={high}")]
    UnsupportedVersion { low: u16, high: u16 },
    #[error("peer lacks required capability flags {0:#x}")]
    MissingFlags(u64),
    #[error("invalid node name {0:?}")]
    InvalidName(String),
    #[error("connected to {actual}, expected {expected}")]
    UnexpectedPeer { expected: Atom, actual: Atom },
    #[error("handshake is not waiting for this input")]
    Finished,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Identity this node presents to peers.
#[derive(Debug)]
pub struct LocalNode {
    pub name: Atom,
    pub creation: u32,
    /// Advertised capabilities, see [`flags::advertised`].
    pub flags: u64,
    pub low_version: u16,
    pub high_version: u16,
    cookie: SecretString,
}

impl LocalNode {
    pub fn new(name: impl Into<Atom>, cookie: SecretString, creation: u32, hidden: bool) -> Self {
        LocalNode {
            name: name.into(),
            creation,
            flags: flags::advertised(hidden),
            low_version: 5,
            high_version: 6,
            cookie,
        }
    }

    pub fn with_versions(mut self, low: u16, high: u16) -> Self {
        self.low_version = low;
        self.high_version = high;
        self
    }

    pub fn cookie(&self) -> &str {
        self.cookie.expose_secret()
    }

    pub fn supports(&self, version: u16) -> bool {
        (self.low_version..=self.high_version).contains(&version)
    }

    pub fn flags_for(&self, version: u16) -> u64 {
        flags::for_version(self.flags, version)
    }
}

/// A peer that completed the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNode {
    pub name: Atom,
    pub version: u16,
    pub flags: u64,
    /// Only learned over version 6.
    pub creation: Option<u32>,
}

impl PeerNode {
    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags & flag == flag
    }
}

#[derive(Debug)]
pub enum Transition {
    /// Write these messages (possibly none), then wait for the next frame.
    Send(Vec<HandshakeMessage>),
    /// Resolve this node through discovery and pass the result to
    /// [`Acceptor::resolved`].
    Lookup(Atom),
    /// Authenticated. Write the reply, if any, and switch to steady state.
    Complete {
        reply: Option<HandshakeMessage>,
        peer: PeerNode,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Longest wait for any single frame from the peer.
    pub idle: Duration,
    pub lookup: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            idle: Duration::from_secs(5),
            lookup: Duration::from_secs(5),
        }
    }
}

pub struct Established<S> {
    pub framed: Framed<S, DistCodec>,
    pub peer: PeerNode,
}

/// Runs the accepting side over `stream`.
pub async fn accept<S>(
    stream: S,
    local: Arc<LocalNode>,
    discovery: &dyn Discovery,
    timeouts: Timeouts,
    codec: DistCodec,
) -> Result<Established<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, handshake_codec());
    let mut acceptor = Acceptor::new(local, StdRng::from_entropy());

    let frame = read_frame(&mut framed, timeouts.idle).await?;
    let mut transition = acceptor.handle(&frame)?;
    loop {
        transition = match transition {
            Transition::Lookup(name) => {
                let lookup = tokio::time::timeout(timeouts.lookup, discovery.lookup(&name))
                    .await
                    .map_err(|_| HandshakeError::LookupTimeout(name.clone()))?;
                acceptor.resolved(lookup)?
            }
            Transition::Send(messages) => {
                write_messages(&mut framed, messages).await?;
                let frame = read_frame(&mut framed, timeouts.idle).await?;
                acceptor.handle(&frame)?
            }
            Transition::Complete { reply, peer } => {
                write_messages(&mut framed, reply.into_iter().collect()).await?;
                log::info!("accepted connection from {}", peer.name);
                return Ok(Established {
                    framed: framed.map_codec(|_| codec),
                    peer,
                });
            }
        }
    }
}

/// Runs the connecting side over `stream` towards `remote`, which was
/// resolved to `info` beforehand.
pub async fn initiate<S>(
    stream: S,
    local: Arc<LocalNode>,
    remote: Atom,
    info: &NodeInfo,
    timeouts: Timeouts,
    codec: DistCodec,
) -> Result<Established<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, handshake_codec());
    let mut initiator = Initiator::new(local, remote, info, StdRng::from_entropy())?;

    let mut transition = initiator.start()?;
    loop {
        transition = match transition {
            Transition::Send(messages) => {
                write_messages(&mut framed, messages).await?;
                let frame = read_frame(&mut framed, timeouts.idle).await?;
                initiator.handle(&frame)?
            }
            Transition::Complete { reply, peer } => {
                write_messages(&mut framed, reply.into_iter().collect()).await?;
                log::info!(
                    "connected to {} over handshake version {}",
                    peer.name,
                    peer.version
                );
                return Ok(Established {
                    framed: framed.map_codec(|_| codec),
                    peer,
                });
            }
            // The initiator resolves its peer before connecting.
            Transition::Lookup(_) => return Err(HandshakeError::Finished),
        }
    }
}

async fn read_frame<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    idle: Duration,
) -> Result<BytesMut, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(idle, framed.next()).await {
        Err(_) => Err(HandshakeError::Timeout),
        Ok(None) => Err(HandshakeError::Closed),
        Ok(Some(frame)) => Ok(frame?),
    }
}

async fn write_messages<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    messages: Vec<HandshakeMessage>,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if messages.is_empty() {
        return Ok(());
    }
    for message in messages {
        log::debug!("-> {:?}", message);
        framed.feed(Bytes::from(message.encode()?)).await?;
    }
    SinkExt::<Bytes>::flush(framed).await?;
    Ok(())
}
