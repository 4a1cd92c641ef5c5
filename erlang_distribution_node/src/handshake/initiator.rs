use std::sync::Arc;

use rand::Rng;

use super::{
    acceptor::unexpected,
    digest, flags,
    messages::{ChallengeRequest, HandshakeMessage, MessageKind, NameRequest},
    HandshakeError, LocalNode, PeerNode, Transition,
};
use crate::{discovery::NodeInfo, etf::Atom};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorPhase {
    SendName,
    ReceiveStatus,
    ReceiveChallenge,
    ReceiveChallengeAck,
    Done,
    Failed,
}

enum State {
    SendName,
    ReceiveStatus,
    ReceiveChallenge,
    ReceiveChallengeAck {
        request: ChallengeRequest,
        challenge: u32,
    },
    Done,
    Failed,
}

/// Connecting side of the handshake.
pub struct Initiator<R> {
    local: Arc<LocalNode>,
    remote: Atom,
    version: u16,
    rng: R,
    state: State,
}

impl<R: Rng> Initiator<R> {
    /// Picks the highest version both this node and the looked-up peer speak.
    pub fn new(
        local: Arc<LocalNode>,
        remote: Atom,
        info: &NodeInfo,
        rng: R,
    ) -> Result<Self, HandshakeError> {
        let high = local.high_version.min(info.high_version);
        let low = local.low_version.max(info.low_version);
        if high < low {
            return Err(HandshakeError::UnsupportedVersion {
                low: info.low_version,
                high: info.high_version,
            });
        }
        Ok(Initiator {
            local,
            remote,
            version: high,
            rng,
            state: State::SendName,
        })
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn phase(&self) -> InitiatorPhase {
        match self.state {
            State::SendName => InitiatorPhase::SendName,
            State::ReceiveStatus => InitiatorPhase::ReceiveStatus,
            State::ReceiveChallenge => InitiatorPhase::ReceiveChallenge,
            State::ReceiveChallengeAck { .. } => InitiatorPhase::ReceiveChallengeAck,
            State::Done => InitiatorPhase::Done,
            State::Failed => InitiatorPhase::Failed,
        }
    }

    /// Produces the opening NameRequest.
    pub fn start(&mut self) -> Result<Transition, HandshakeError> {
        if !matches!(self.state, State::SendName) {
            return Err(HandshakeError::Finished);
        }
        let request = NameRequest {
            version: self.version,
            flags: self.local.flags_for(self.version),
            creation: (self.version >= 6).then_some(self.local.creation),
            name: self.local.name.clone(),
        };
        self.state = State::ReceiveStatus;
        Ok(Transition::Send(vec![HandshakeMessage::NameRequest(request)]))
    }

    pub fn handle(&mut self, frame: &[u8]) -> Result<Transition, HandshakeError> {
        let state = std::mem::replace(&mut self.state, State::Failed);
        let (next, transition) = match state {
            State::ReceiveStatus => self.receive_status(frame)?,
            State::ReceiveChallenge => self.receive_challenge(frame)?,
            State::ReceiveChallengeAck { request, challenge } => {
                self.receive_challenge_ack(frame, request, challenge)?
            }
            State::SendName | State::Done | State::Failed => return Err(HandshakeError::Finished),
        };
        self.state = next;
        Ok(transition)
    }

    fn receive_status(&mut self, frame: &[u8]) -> Result<(State, Transition), HandshakeError> {
        let status = match HandshakeMessage::decode(MessageKind::Status, frame)? {
            HandshakeMessage::Status(status) => status,
            other => return Err(unexpected(MessageKind::Status, &other)),
        };
        log::debug!("<- Status: {}", status);
        if status != "ok" {
            return Err(HandshakeError::Rejected(status));
        }
        Ok((State::ReceiveChallenge, Transition::Send(Vec::new())))
    }

    fn receive_challenge(&mut self, frame: &[u8]) -> Result<(State, Transition), HandshakeError> {
        let request = match HandshakeMessage::decode(MessageKind::ChallengeRequest, frame)? {
            HandshakeMessage::ChallengeRequest(request) => request,
            other => return Err(unexpected(MessageKind::ChallengeRequest, &other)),
        };
        log::debug!(
            "<- ChallengeRequest: name: {} challenge: {} flags: {:#x}",
            request.name,
            request.challenge,
            request.flags
        );

        if request.name != self.remote {
            return Err(HandshakeError::UnexpectedPeer {
                expected: self.remote.clone(),
                actual: request.name,
            });
        }
        let missing = flags::missing(request.flags);
        if missing != 0 {
            return Err(HandshakeError::MissingFlags(missing));
        }

        let challenge: u32 = self.rng.gen();
        let reply = HandshakeMessage::ChallengeResponse {
            challenge,
            digest: digest(request.challenge, self.local.cookie()),
        };
        Ok((
            State::ReceiveChallengeAck { request, challenge },
            Transition::Send(vec![reply]),
        ))
    }

    fn receive_challenge_ack(
        &mut self,
        frame: &[u8],
        request: ChallengeRequest,
        challenge: u32,
    ) -> Result<(State, Transition), HandshakeError> {
        let ack_digest = match HandshakeMessage::decode(MessageKind::ChallengeAck, frame)? {
            HandshakeMessage::ChallengeAck { digest } => digest,
            other => return Err(unexpected(MessageKind::ChallengeAck, &other)),
        };
        if ack_digest != digest(challenge, self.local.cookie()) {
            log::warn!("{} acknowledged with a wrong digest", request.name);
            return Err(HandshakeError::DigestMismatch);
        }

        let peer = PeerNode {
            name: request.name,
            version: self.version,
            flags: request.flags,
            creation: request.creation,
        };
        Ok((State::Done, Transition::Complete { reply: None, peer }))
    }
}
