//! Framing for distribution connections.
//!
//! The handshake uses 2-byte length prefixes. Once authenticated, every frame
//! has a 4-byte length and carries the pass-through marker, a control term
//! and, for the send operations, a message term. An empty frame is a tick.

use tokio_util::{
    bytes::{BufMut as _, Bytes, BytesMut},
    codec::{Decoder, Encoder, LengthDelimitedCodec},
};

use crate::{
    control::{ControlMessage, ControlMessageParsingError, Operation},
    etf::{
        consts::PASS_THROUGH, decode_prefix, decode_with_depth, DecodeError, Term,
        DEFAULT_MAX_DEPTH,
    },
};

/// Largest steady-state frame accepted by default.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

pub fn handshake_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .new_codec()
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("undecodable term in frame: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid control message: {0}")]
    Control(#[from] ControlMessageParsingError),
    #[error("frame starts with {0}, expected the pass-through marker")]
    MissingPassThrough(u8),
    #[error("{0:?} frame carries no message")]
    MissingPayload(Operation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistMessage {
    pub control: ControlMessage,
    pub payload: Option<Term>,
}

impl DistMessage {
    pub fn control(control: ControlMessage) -> Self {
        DistMessage {
            control,
            payload: None,
        }
    }

    pub fn with_payload(control: ControlMessage, payload: Term) -> Self {
        DistMessage {
            control,
            payload: Some(payload),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DistFrame {
    Tick,
    Message(DistMessage),
}

pub struct DistCodec {
    frames: LengthDelimitedCodec,
    max_depth: usize,
}

impl DistCodec {
    pub fn new(max_frame_length: usize, max_depth: usize) -> Self {
        DistCodec {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_depth,
        }
    }
}

impl Default for DistCodec {
    fn default() -> Self {
        DistCodec::new(DEFAULT_MAX_FRAME_LENGTH, DEFAULT_MAX_DEPTH)
    }
}

impl Decoder for DistCodec {
    type Item = DistFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DistFrame>, FrameError> {
        let frame = match self.frames.decode(src)? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        if frame.is_empty() {
            return Ok(Some(DistFrame::Tick));
        }
        parse_message(&frame, self.max_depth).map(|message| Some(DistFrame::Message(message)))
    }
}

impl Encoder<DistFrame> for DistCodec {
    type Error = FrameError;

    fn encode(&mut self, item: DistFrame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = match item {
            DistFrame::Tick => Bytes::new(),
            DistFrame::Message(message) => {
                let mut body = BytesMut::new();
                body.put_u8(PASS_THROUGH);
                let mut writer = body.writer();
                message.control.to_term().write_versioned(&mut writer)?;
                if let Some(payload) = &message.payload {
                    payload.write_versioned(&mut writer)?;
                }
                writer.into_inner().freeze()
            }
        };
        self.frames.encode(body, dst)?;
        Ok(())
    }
}

fn parse_message(frame: &[u8], max_depth: usize) -> Result<DistMessage, FrameError> {
    let (marker, rest) = frame.split_first().ok_or(DecodeError::Truncated)?;
    if *marker != PASS_THROUGH {
        return Err(FrameError::MissingPassThrough(*marker));
    }

    let (control_term, rest) = decode_prefix(rest, max_depth)?;
    let control = ControlMessage::from_term(&control_term)?;

    let payload = if control.has_payload() {
        if rest.is_empty() {
            return Err(FrameError::MissingPayload(control.operation()));
        }
        Some(decode_with_depth(rest, max_depth)?)
    } else if !rest.is_empty() {
        return Err(DecodeError::TrailingBytes(rest.len()).into());
    } else {
        None
    };

    Ok(DistMessage { control, payload })
}

#[cfg(test)]
mod tests {
    use tokio_util::bytes::BufMut;

    use super::*;
    use crate::etf::Pid;

    fn pid(id: u32) -> Pid {
        Pid::new("a@host", id, 0, 1)
    }

    fn send(payload: Term) -> DistFrame {
        DistFrame::Message(DistMessage::with_payload(
            ControlMessage::Send { to: pid(2) },
            payload,
        ))
    }

    #[test]
    fn frames_carry_length_marker_and_terms() {
        let mut codec = DistCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(send(Term::atom("hi")), &mut buf).unwrap();

        let control = ControlMessage::Send { to: pid(2) }.to_term().encode();
        let payload = Term::atom("hi").encode();
        let len = 1 + control.len() + payload.len();
        assert_eq!(&buf[..4], &(len as u32).to_be_bytes());
        assert_eq!(buf[4], PASS_THROUGH);
        assert_eq!(&buf[5..5 + control.len()], &control[..]);
        assert_eq!(&buf[5 + control.len()..], &payload[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(send(Term::atom("hi"))));
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_frame_is_a_tick() {
        let mut codec = DistCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(DistFrame::Tick, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(DistFrame::Tick));
    }

    #[test]
    fn partial_frames_wait_for_more_input() {
        let mut codec = DistCodec::default();
        let mut encoded = BytesMut::new();
        let link = DistFrame::Message(DistMessage::control(ControlMessage::Link {
            from: pid(1),
            to: pid(2),
        }));
        codec.encode(link.clone(), &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        for byte in &encoded[..encoded.len() - 1] {
            buf.put_u8(*byte);
            assert_eq!(codec.decode(&mut buf).unwrap(), None);
        }
        buf.put_u8(encoded[encoded.len() - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(link));
    }

    fn frame(body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn frame_without_marker_is_rejected() {
        let mut codec = DistCodec::default();
        let mut buf = frame(&[131, 106]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::MissingPassThrough(131))
        ));
    }

    #[test]
    fn send_without_message_is_rejected() {
        let mut body = vec![PASS_THROUGH];
        body.extend(ControlMessage::Send { to: pid(2) }.to_term().encode());
        let mut codec = DistCodec::default();
        assert!(matches!(
            codec.decode(&mut frame(&body)),
            Err(FrameError::MissingPayload(Operation::Send))
        ));
    }

    #[test]
    fn link_with_extra_term_is_rejected() {
        let mut body = vec![PASS_THROUGH];
        body.extend(
            ControlMessage::Link {
                from: pid(1),
                to: pid(2),
            }
            .to_term()
            .encode(),
        );
        body.extend(Term::Nil.encode());
        let mut codec = DistCodec::default();
        assert!(matches!(
            codec.decode(&mut frame(&body)),
            Err(FrameError::Decode(DecodeError::TrailingBytes(2)))
        ));
    }

    #[test]
    fn nesting_bound_applies_to_payloads() {
        let mut nested = Term::Nil;
        for _ in 0..20 {
            nested = Term::tuple(vec![nested]);
        }
        let mut codec = DistCodec::new(DEFAULT_MAX_FRAME_LENGTH, 8);
        let mut buf = BytesMut::new();
        codec.encode(send(nested), &mut buf).unwrap();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::Decode(DecodeError::TooDeep(8)))
        ));
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let mut body = vec![PASS_THROUGH];
        body.extend(Term::tuple(vec![Term::from(99)]).encode());
        let mut codec = DistCodec::default();
        assert!(matches!(
            codec.decode(&mut frame(&body)),
            Err(FrameError::Control(ControlMessageParsingError::UnknownOperation(99)))
        ));
    }
}
