use std::sync::Arc;

use rand::Rng;

use super::{
    digest, flags,
    messages::{ChallengeRequest, HandshakeMessage, MessageKind, NameRequest},
    HandshakeError, LocalNode, PeerNode, Transition,
};
use crate::discovery::NodeInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorPhase {
    ReceiveName,
    AwaitingLookup,
    SendChallengeAck,
    Done,
    Failed,
}

enum State {
    ReceiveName,
    AwaitingLookup {
        request: NameRequest,
    },
    SendChallengeAck {
        request: NameRequest,
        challenge: u32,
    },
    Done,
    Failed,
}

/// Accepting side of the handshake. Feed it every frame the peer sends and
/// the result of each lookup it asks for.
pub struct Acceptor<R> {
    local: Arc<LocalNode>,
    rng: R,
    state: State,
}

impl<R: Rng> Acceptor<R> {
    pub fn new(local: Arc<LocalNode>, rng: R) -> Self {
        Acceptor {
            local,
            rng,
            state: State::ReceiveName,
        }
    }

    pub fn phase(&self) -> AcceptorPhase {
        match self.state {
            State::ReceiveName => AcceptorPhase::ReceiveName,
            State::AwaitingLookup { .. } => AcceptorPhase::AwaitingLookup,
            State::SendChallengeAck { .. } => AcceptorPhase::SendChallengeAck,
            State::Done => AcceptorPhase::Done,
            State::Failed => AcceptorPhase::Failed,
        }
    }

    pub fn handle(&mut self, frame: &[u8]) -> Result<Transition, HandshakeError> {
        let state = std::mem::replace(&mut self.state, State::Failed);
        let (next, transition) = match state {
            State::ReceiveName => self.receive_name(frame)?,
            State::SendChallengeAck { request, challenge } => {
                self.receive_challenge_reply(frame, request, challenge)?
            }
            State::AwaitingLookup { .. } | State::Done | State::Failed => {
                return Err(HandshakeError::Finished)
            }
        };
        self.state = next;
        Ok(transition)
    }

    /// Completes the lookup requested by `Transition::Lookup`.
    pub fn resolved(
        &mut self,
        lookup: anyhow::Result<NodeInfo>,
    ) -> Result<Transition, HandshakeError> {
        let request = match std::mem::replace(&mut self.state, State::Failed) {
            State::AwaitingLookup { request } => request,
            _ => return Err(HandshakeError::Finished),
        };

        let info = lookup.map_err(|err| HandshakeError::LookupFailed {
            name: request.name.clone(),
            reason: format!("{:#}", err),
        })?;
        if request.version < info.low_version || request.version > info.high_version {
            return Err(HandshakeError::UnsupportedVersion {
                low: info.low_version,
                high: info.high_version,
            });
        }

        let challenge: u32 = self.rng.gen();
        let reply = ChallengeRequest {
            version: request.version,
            flags: self.local.flags_for(request.version),
            challenge,
            creation: (request.version >= 6).then_some(self.local.creation),
            name: self.local.name.clone(),
        };
        log::debug!(
            "accepting {} over version {}, challenge {}",
            request.name,
            request.version,
            challenge
        );

        self.state = State::SendChallengeAck { request, challenge };
        Ok(Transition::Send(vec![
            HandshakeMessage::Status("ok".to_owned()),
            HandshakeMessage::ChallengeRequest(reply),
        ]))
    }

    fn receive_name(&mut self, frame: &[u8]) -> Result<(State, Transition), HandshakeError> {
        let request = match HandshakeMessage::decode(MessageKind::NameRequest, frame)? {
            HandshakeMessage::NameRequest(request) => request,
            other => return Err(unexpected(MessageKind::NameRequest, &other)),
        };
        log::debug!(
            "<- NameRequest: name: {} version: {} flags: {:#x}",
            request.name,
            request.version,
            request.flags
        );

        if !self.local.supports(request.version) {
            return Err(HandshakeError::UnsupportedVersion {
                low: request.version,
                high: request.version,
            });
        }
        let missing = flags::missing(request.flags);
        if missing != 0 {
            return Err(HandshakeError::MissingFlags(missing));
        }

        let name = request.name.clone();
        Ok((State::AwaitingLookup { request }, Transition::Lookup(name)))
    }

    fn receive_challenge_reply(
        &mut self,
        frame: &[u8],
        request: NameRequest,
        challenge: u32,
    ) -> Result<(State, Transition), HandshakeError> {
        let (peer_challenge, peer_digest) =
            match HandshakeMessage::decode(MessageKind::ChallengeResponse, frame)? {
                HandshakeMessage::ChallengeResponse { challenge, digest } => (challenge, digest),
                other => return Err(unexpected(MessageKind::ChallengeResponse, &other)),
            };

        if peer_digest != digest(challenge, self.local.cookie()) {
            log::warn!("{} answered the challenge with a wrong digest", request.name);
            return Err(HandshakeError::DigestMismatch);
        }

        let ack = HandshakeMessage::ChallengeAck {
            digest: digest(peer_challenge, self.local.cookie()),
        };
        let peer = PeerNode {
            name: request.name,
            version: request.version,
            flags: request.flags,
            creation: request.creation,
        };
        Ok((
            State::Done,
            Transition::Complete {
                reply: Some(ack),
                peer,
            },
        ))
    }
}

pub(super) fn unexpected(expected: MessageKind, message: &HandshakeMessage) -> HandshakeError {
    HandshakeError::UnexpectedMessage {
        expected,
        tag: message.encode().ok().and_then(|bytes| bytes.first().copied()),
    }
}
