use anyhow::Context;
use deku::prelude::*;

use super::{Digest, HandshakeError};
use crate::etf::Atom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    NameRequest,
    Status,
    ChallengeRequest,
    ChallengeResponse,
    ChallengeAck,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRequest {
    pub version: u16,
    pub flags: u64,
    /// Only carried by version 6.
    pub creation: Option<u32>,
    pub name: Atom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub version: u16,
    pub flags: u64,
    pub challenge: u32,
    /// Only carried by version 6.
    pub creation: Option<u32>,
    pub name: Atom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    NameRequest(NameRequest),
    Status(String),
    ChallengeRequest(ChallengeRequest),
    ChallengeResponse { challenge: u32, digest: Digest },
    ChallengeAck { digest: Digest },
}

// Version 5 messages end with the name, taking up the rest of the frame.

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"n")]
struct SendNameV5 {
    version: u16,
    flags: u32,
}

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"N")]
struct SendNameV6 {
    flags: u64,
    creation: u32,
    name: PString,
}

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"n")]
struct RecvChallengeV5 {
    version: u16,
    flags: u32,
    challenge: u32,
}

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"N")]
struct RecvChallengeV6 {
    flags: u64,
    challenge: u32,
    creation: u32,
    name: PString,
}

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"r")]
struct SendChallengeReply {
    challenge: u32,
    digest: [u8; 16],
}

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "big", magic = b"a")]
struct RecvChallengeAck {
    digest: [u8; 16],
}

#[derive(Debug, Clone, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
struct PString {
    len: u16,
    #[deku(count = "len")]
    data: Vec<u8>,
}

impl PString {
    fn new(kind: MessageKind, string: &str) -> Result<Self, HandshakeError> {
        let len = u16::try_from(string.len()).map_err(|_| HandshakeError::Malformed {
            kind,
            reason: format!("name of {} bytes does not fit a 2-byte length", string.len()),
        })?;
        Ok(PString {
            len,
            data: string.as_bytes().to_vec(),
        })
    }
}

impl MessageKind {
    /// Tag bytes that may open a message of this kind.
    fn tags(self) -> &'static [u8] {
        match self {
            MessageKind::NameRequest | MessageKind::ChallengeRequest => b"nN",
            MessageKind::Status => b"s",
            MessageKind::ChallengeResponse => b"r",
            MessageKind::ChallengeAck => b"a",
        }
    }
}

impl HandshakeMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            HandshakeMessage::NameRequest(_) => MessageKind::NameRequest,
            HandshakeMessage::Status(_) => MessageKind::Status,
            HandshakeMessage::ChallengeRequest(_) => MessageKind::ChallengeRequest,
            HandshakeMessage::ChallengeResponse { .. } => MessageKind::ChallengeResponse,
            HandshakeMessage::ChallengeAck { .. } => MessageKind::ChallengeAck,
        }
    }

    /// Encodes the frame body, without the length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, HandshakeError> {
        let kind = self.kind();
        let malformed = |err: DekuError| HandshakeError::Malformed {
            kind,
            reason: err.to_string(),
        };

        let data: Vec<u8> = match self {
            HandshakeMessage::NameRequest(request) if request.version >= 6 => SendNameV6 {
                flags: request.flags,
                creation: request.creation.unwrap_or_default(),
                name: PString::new(kind, request.name.as_str())?,
            }
            .try_into()
            .map_err(malformed)?,
            HandshakeMessage::NameRequest(request) => {
                let mut data: Vec<u8> = SendNameV5 {
                    version: request.version,
                    flags: request.flags as u32,
                }
                .try_into()
                .map_err(malformed)?;
                data.extend_from_slice(request.name.as_str().as_bytes());
                data
            }
            HandshakeMessage::Status(status) => {
                let mut data = Vec::with_capacity(status.len() + 1);
                data.push(b's');
                data.extend_from_slice(status.as_bytes());
                data
            }
            HandshakeMessage::ChallengeRequest(request) if request.version >= 6 => {
                RecvChallengeV6 {
                    flags: request.flags,
                    challenge: request.challenge,
                    creation: request.creation.unwrap_or_default(),
                    name: PString::new(kind, request.name.as_str())?,
                }
                .try_into()
                .map_err(malformed)?
            }
            HandshakeMessage::ChallengeRequest(request) => {
                let mut data: Vec<u8> = RecvChallengeV5 {
                    version: request.version,
                    flags: request.flags as u32,
                    challenge: request.challenge,
                }
                .try_into()
                .map_err(malformed)?;
                data.extend_from_slice(request.name.as_str().as_bytes());
                data
            }
            HandshakeMessage::ChallengeResponse { challenge, digest } => SendChallengeReply {
                challenge: *challenge,
                digest: *digest,
            }
            .try_into()
            .map_err(malformed)?,
            HandshakeMessage::ChallengeAck { digest } => RecvChallengeAck { digest: *digest }
                .try_into()
                .map_err(malformed)?,
        };
        Ok(data)
    }

    /// Decodes a frame body as the message the current state expects. The
    /// name and challenge messages share tags, so the caller has to say which
    /// one it is waiting for.
    pub fn decode(expected: MessageKind, frame: &[u8]) -> Result<Self, HandshakeError> {
        let tag = frame.first().copied();
        if !tag.map_or(false, |tag| expected.tags().contains(&tag)) {
            return Err(HandshakeError::UnexpectedMessage { expected, tag });
        }
        let malformed = |err: DekuError| HandshakeError::Malformed {
            kind: expected,
            reason: err.to_string(),
        };

        let message = match (expected, tag) {
            (MessageKind::NameRequest, Some(b'n')) => {
                let ((rest, _), header) = SendNameV5::from_bytes((frame, 0)).map_err(malformed)?;
                check_v5(header.version)?;
                HandshakeMessage::NameRequest(NameRequest {
                    version: 5,
                    flags: header.flags.into(),
                    creation: None,
                    name: node_name(rest)?,
                })
            }
            (MessageKind::NameRequest, _) => {
                let (rest, msg) = SendNameV6::from_bytes((frame, 0)).map_err(malformed)?;
                expect_end(expected, rest)?;
                HandshakeMessage::NameRequest(NameRequest {
                    version: 6,
                    flags: msg.flags,
                    creation: Some(msg.creation),
                    name: node_name(&msg.name.data)?,
                })
            }
            (MessageKind::ChallengeRequest, Some(b'n')) => {
                let ((rest, _), header) =
                    RecvChallengeV5::from_bytes((frame, 0)).map_err(malformed)?;
                check_v5(header.version)?;
                HandshakeMessage::ChallengeRequest(ChallengeRequest {
                    version: 5,
                    flags: header.flags.into(),
                    challenge: header.challenge,
                    creation: None,
                    name: node_name(rest)?,
                })
            }
            (MessageKind::ChallengeRequest, _) => {
                let (rest, msg) = RecvChallengeV6::from_bytes((frame, 0)).map_err(malformed)?;
                expect_end(expected, rest)?;
                HandshakeMessage::ChallengeRequest(ChallengeRequest {
                    version: 6,
                    flags: msg.flags,
                    challenge: msg.challenge,
                    creation: Some(msg.creation),
                    name: node_name(&msg.name.data)?,
                })
            }
            (MessageKind::Status, _) => {
                let status = std::str::from_utf8(&frame[1..]).map_err(|err| {
                    HandshakeError::Malformed {
                        kind: expected,
                        reason: err.to_string(),
                    }
                })?;
                HandshakeMessage::Status(status.to_owned())
            }
            (MessageKind::ChallengeResponse, _) => {
                let (rest, msg) = SendChallengeReply::from_bytes((frame, 0)).map_err(malformed)?;
                expect_end(expected, rest)?;
                HandshakeMessage::ChallengeResponse {
                    challenge: msg.challenge,
                    digest: msg.digest,
                }
            }
            (MessageKind::ChallengeAck, _) => {
                let (rest, msg) = RecvChallengeAck::from_bytes((frame, 0)).map_err(malformed)?;
                expect_end(expected, rest)?;
                HandshakeMessage::ChallengeAck { digest: msg.digest }
            }
        };
        Ok(message)
    }
}

fn check_v5(version: u16) -> Result<(), HandshakeError> {
    if version == 5 {
        Ok(())
    } else {
        Err(HandshakeError::UnsupportedVersion {
            low: version,
            high: version,
        })
    }
}

fn expect_end(kind: MessageKind, (rest, _): (&[u8], usize)) -> Result<(), HandshakeError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(HandshakeError::Malformed {
            kind,
            reason: format!("{} trailing bytes", rest.len()),
        })
    }
}

/// Node names are `name@host`.
fn node_name(bytes: &[u8]) -> Result<Atom, HandshakeError> {
    let name = std::str::from_utf8(bytes)
        .context("node name is not valid text")
        .map_err(|err| HandshakeError::InvalidName(format!("{:#}", err)))?;
    match name.split_once('@') {
        Some((alive, host)) if !alive.is_empty() && !host.is_empty() => {
            Atom::try_new(name).map_err(|err| HandshakeError::InvalidName(err.to_string()))
        }
        _ => Err(HandshakeError::InvalidName(name.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_request(version: u16) -> HandshakeMessage {
        HandshakeMessage::NameRequest(NameRequest {
            version,
            flags: 0x1_0000_0004,
            creation: (version >= 6).then_some(9),
            name: Atom::from("alice@localhost"),
        })
    }

    #[test]
    fn version_5_name_request_layout() {
        let bytes = name_request(5).encode().unwrap();
        let mut expected = vec![b'n', 0, 5, 0, 0, 0, 4];
        expected.extend_from_slice(b"alice@localhost");
        assert_eq!(bytes, expected);

        let decoded = HandshakeMessage::decode(MessageKind::NameRequest, &bytes).unwrap();
        let HandshakeMessage::NameRequest(request) = decoded else {
            panic!("expected a name request");
        };
        assert_eq!(request.version, 5);
        assert_eq!(request.flags, 4);
        assert_eq!(request.creation, None);
        assert_eq!(request.name, Atom::from("alice@localhost"));
    }

    #[test]
    fn version_6_name_request_layout() {
        let message = name_request(6);
        let bytes = message.encode().unwrap();
        assert_eq!(&bytes[..13], &[b'N', 0, 0, 0, 1, 0, 0, 0, 4, 0, 0, 0, 9]);
        assert_eq!(&bytes[13..15], &[0, 15]);
        assert_eq!(
            HandshakeMessage::decode(MessageKind::NameRequest, &bytes).unwrap(),
            message
        );
    }

    #[test]
    fn challenge_messages_survive_the_wire() {
        for version in [5, 6] {
            let message = HandshakeMessage::ChallengeRequest(ChallengeRequest {
                version,
                flags: 0x104,
                challenge: 0xdead_beef,
                creation: (version >= 6).then_some(3),
                name: Atom::from("bob@localhost"),
            });
            let bytes = message.encode().unwrap();
            assert_eq!(
                HandshakeMessage::decode(MessageKind::ChallengeRequest, &bytes).unwrap(),
                message
            );
        }

        let reply = HandshakeMessage::ChallengeResponse {
            challenge: 7,
            digest: [1; 16],
        };
        let bytes = reply.encode().unwrap();
        assert_eq!(bytes.len(), 21);
        assert_eq!(
            HandshakeMessage::decode(MessageKind::ChallengeResponse, &bytes).unwrap(),
            reply
        );

        let ack = HandshakeMessage::ChallengeAck { digest: [2; 16] };
        let bytes = ack.encode().unwrap();
        assert_eq!(bytes[0], b'a');
        assert_eq!(
            HandshakeMessage::decode(MessageKind::ChallengeAck, &bytes).unwrap(),
            ack
        );
    }

    #[test]
    fn status_text() {
        let bytes = HandshakeMessage::Status("ok".into()).encode().unwrap();
        assert_eq!(bytes, b"sok");
        assert_eq!(
            HandshakeMessage::decode(MessageKind::Status, b"snot_allowed").unwrap(),
            HandshakeMessage::Status("not_allowed".into())
        );
    }

    #[test]
    fn message_for_another_state_is_unexpected() {
        let bytes = HandshakeMessage::ChallengeAck { digest: [0; 16] }
            .encode()
            .unwrap();
        assert!(matches!(
            HandshakeMessage::decode(MessageKind::ChallengeResponse, &bytes),
            Err(HandshakeError::UnexpectedMessage {
                expected: MessageKind::ChallengeResponse,
                tag: Some(b'a'),
            })
        ));
        assert!(matches!(
            HandshakeMessage::decode(MessageKind::Status, &[]),
            Err(HandshakeError::UnexpectedMessage { tag: None, .. })
        ));
    }

    #[test]
    fn short_and_long_frames_are_malformed() {
        assert!(matches!(
            HandshakeMessage::decode(MessageKind::ChallengeResponse, b"r\0\0"),
            Err(HandshakeError::Malformed { .. })
        ));
        let mut bytes = HandshakeMessage::ChallengeAck { digest: [0; 16] }
            .encode()
            .unwrap();
        bytes.push(0);
        assert!(matches!(
            HandshakeMessage::decode(MessageKind::ChallengeAck, &bytes),
            Err(HandshakeError::Malformed { .. })
        ));
    }

    #[test]
    fn names_need_a_host() {
        let mut bytes = vec![b'n', 0, 5, 0, 0, 0, 0];
        bytes.extend_from_slice(b"alice");
        assert!(matches!(
            HandshakeMessage::decode(MessageKind::NameRequest, &bytes),
            Err(HandshakeError::InvalidName(name)) if name == "alice"
        ));
    }

    #[test]
    fn overlong_names_are_rejected() {
        let name = format!("{}@localhost", "a".repeat(300));
        let mut bytes = vec![b'n', 0, 5, 0, 0, 0, 0];
        bytes.extend_from_slice(name.as_bytes());
        assert!(matches!(
            HandshakeMessage::decode(MessageKind::NameRequest, &bytes),
            Err(HandshakeError::InvalidName(_))
        ));
    }

    #[test]
    fn length_prefixed_names_check_their_length() {
        let long = "é".repeat(40_000);
        assert!(matches!(
            PString::new(MessageKind::NameRequest, &long),
            Err(HandshakeError::Malformed { .. })
        ));
        let fits = PString::new(MessageKind::NameRequest, "alice@localhost").unwrap();
        assert_eq!(fits.len, 15);
    }
}
