//! Control messages: the envelope term describing a process-level operation.
//!
//! On the wire every control message is a tuple whose first element is the
//! operation code, followed by a fixed list of fields for that operation.

use crate::etf::{Atom, Pid, Reference, Term};

#[allow(dead_code)]
pub mod op {
    /// Format: {1, FromPid, ToPid}
    pub const LINK: u8 = 1;

    /// Format: {2, Unused, ToPid}
    /// Note: Followed by the message
    pub const SEND: u8 = 2;

    /// Format: {3, FromPid, ToPid, Reason}
    pub const EXIT: u8 = 3;

    /// Format: {4, FromPid, ToPid}
    /// Note: Superseded by UNLINK_ID on peers using the new link protocol
    pub const UNLINK: u8 = 4;

    /// Format: {5}
    pub const NODE_LINK: u8 = 5;

    /// Format: {6, FromPid, Unused, ToName}
    /// Note: Followed by the message
    pub const REG_SEND: u8 = 6;

    /// Format: {7, FromPid, ToPid}
    pub const GROUP_LEADER: u8 = 7;

    /// Format: {8, FromPid, ToPid, Reason}
    pub const EXIT2: u8 = 8;

    /// Format: {12, Unused, ToPid, TraceToken}
    /// Note: Followed by the message
    pub const SEND_TT: u8 = 12;

    /// Format: {13, FromPid, ToPid, TraceToken, Reason}
    pub const EXIT_TT: u8 = 13;

    /// Format: {16, FromPid, Unused, ToName, TraceToken}
    /// Note: Followed by the message
    pub const REG_SEND_TT: u8 = 16;

    /// Format: {18, FromPid, ToPid, TraceToken, Reason}
    pub const EXIT2_TT: u8 = 18;

    /// Format: {19, FromPid, ToProc, Ref}
    /// Note: ToProc is a pid or a registered name
    pub const MONITOR_P: u8 = 19;

    /// Format: {20, FromPid, ToProc, Ref}
    pub const DEMONITOR_P: u8 = 20;

    /// Format: {21, FromProc, ToPid, Ref, Reason}
    pub const MONITOR_P_EXIT: u8 = 21;

    /// Format: {35, Id, FromPid, ToPid}
    /// Note: Must be answered with UNLINK_ID_ACK
    pub const UNLINK_ID: u8 = 35;

    /// Format: {36, Id, FromPid, ToPid}
    pub const UNLINK_ID_ACK: u8 = 36;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    Link = op::LINK,
    Send = op::SEND,
    Exit = op::EXIT,
    Unlink = op::UNLINK,
    NodeLink = op::NODE_LINK,
    RegSend = op::REG_SEND,
    GroupLeader = op::GROUP_LEADER,
    Exit2 = op::EXIT2,
    SendTT = op::SEND_TT,
    ExitTT = op::EXIT_TT,
    RegSendTT = op::REG_SEND_TT,
    Exit2TT = op::EXIT2_TT,
    MonitorP = op::MONITOR_P,
    DemonitorP = op::DEMONITOR_P,
    MonitorPExit = op::MONITOR_P_EXIT,
    UnlinkId = op::UNLINK_ID,
    UnlinkIdAck = op::UNLINK_ID_ACK,
}

impl Operation {
    /// Returns None for codes this node does not speak.
    pub fn from_u8(value: u8) -> Option<Self> {
        use Operation::*;
        match value {
            op::LINK => Some(Link),
            op::SEND => Some(Send),
            op::EXIT => Some(Exit),
            op::UNLINK => Some(Unlink),
            op::NODE_LINK => Some(NodeLink),
            op::REG_SEND => Some(RegSend),
            op::GROUP_LEADER => Some(GroupLeader),
            op::EXIT2 => Some(Exit2),
            op::SEND_TT => Some(SendTT),
            op::EXIT_TT => Some(ExitTT),
            op::REG_SEND_TT => Some(RegSendTT),
            op::EXIT2_TT => Some(Exit2TT),
            op::MONITOR_P => Some(MonitorP),
            op::DEMONITOR_P => Some(DemonitorP),
            op::MONITOR_P_EXIT => Some(MonitorPExit),
            op::UNLINK_ID => Some(UnlinkId),
            op::UNLINK_ID_ACK => Some(UnlinkIdAck),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlMessageParsingError {
    #[error("control message is not a tuple starting with an operation code")]
    NotATuple,
    #[error("unknown control operation {0}")]
    UnknownOperation(i64),
    #[error("{operation:?} field {index}: expected {expected}")]
    Field {
        operation: Operation,
        index: usize,
        expected: &'static str,
    },
}

/// Target of a monitor: a pid, or a name registered on the monitored node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessRef {
    Pid(Pid),
    Name(Atom),
}

impl ProcessRef {
    pub fn to_term(&self) -> Term {
        match self {
            ProcessRef::Pid(pid) => Term::Pid(pid.clone()),
            ProcessRef::Name(name) => Term::Atom(name.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Link {
        from: Pid,
        to: Pid,
    },
    Send {
        to: Pid,
    },
    Exit {
        from: Pid,
        to: Pid,
        reason: Term,
    },
    Unlink {
        from: Pid,
        to: Pid,
    },
    NodeLink,
    RegSend {
        from: Pid,
        to_name: Atom,
    },
    GroupLeader {
        from: Pid,
        to: Pid,
    },
    Exit2 {
        from: Pid,
        to: Pid,
        reason: Term,
    },
    SendTT {
        to: Pid,
        token: Term,
    },
    ExitTT {
        from: Pid,
        to: Pid,
        token: Term,
        reason: Term,
    },
    RegSendTT {
        from: Pid,
        to_name: Atom,
        token: Term,
    },
    Exit2TT {
        from: Pid,
        to: Pid,
        token: Term,
        reason: Term,
    },
    MonitorProcess {
        from: Pid,
        to: ProcessRef,
        reference: Reference,
    },
    DemonitorProcess {
        from: Pid,
        to: ProcessRef,
        reference: Reference,
    },
    MonitorProcessExit {
        from: ProcessRef,
        to: Pid,
        reference: Reference,
        reason: Term,
    },
    UnlinkId {
        id: u64,
        from: Pid,
        to: Pid,
    },
    UnlinkIdAck {
        id: u64,
        from: Pid,
        to: Pid,
    },
}

impl ControlMessage {
    pub fn operation(&self) -> Operation {
        match self {
            ControlMessage::Link { .. } => Operation::Link,
            ControlMessage::Send { .. } => Operation::Send,
            ControlMessage::Exit { .. } => Operation::Exit,
            ControlMessage::Unlink { .. } => Operation::Unlink,
            ControlMessage::NodeLink => Operation::NodeLink,
            ControlMessage::RegSend { .. } => Operation::RegSend,
            ControlMessage::GroupLeader { .. } => Operation::GroupLeader,
            ControlMessage::Exit2 { .. } => Operation::Exit2,
            ControlMessage::SendTT { .. } => Operation::SendTT,
            ControlMessage::ExitTT { .. } => Operation::ExitTT,
            ControlMessage::RegSendTT { .. } => Operation::RegSendTT,
            ControlMessage::Exit2TT { .. } => Operation::Exit2TT,
            ControlMessage::MonitorProcess { .. } => Operation::MonitorP,
            ControlMessage::DemonitorProcess { .. } => Operation::DemonitorP,
            ControlMessage::MonitorProcessExit { .. } => Operation::MonitorPExit,
            ControlMessage::UnlinkId { .. } => Operation::UnlinkId,
            ControlMessage::UnlinkIdAck { .. } => Operation::UnlinkIdAck,
        }
    }

    /// Whether a message term follows this control term in the frame.
    pub fn has_payload(&self) -> bool {
        matches!(
            self,
            ControlMessage::Send { .. }
                | ControlMessage::RegSend { .. }
                | ControlMessage::SendTT { .. }
                | ControlMessage::RegSendTT { .. }
        )
    }

    /// The pid this message is addressed to, when it names one.
    pub fn destination_pid(&self) -> Option<&Pid> {
        match self {
            ControlMessage::Link { to, .. }
            | ControlMessage::Send { to }
            | ControlMessage::Exit { to, .. }
            | ControlMessage::Unlink { to, .. }
            | ControlMessage::GroupLeader { to, .. }
            | ControlMessage::Exit2 { to, .. }
            | ControlMessage::SendTT { to, .. }
            | ControlMessage::ExitTT { to, .. }
            | ControlMessage::Exit2TT { to, .. }
            | ControlMessage::MonitorProcessExit { to, .. }
            | ControlMessage::UnlinkId { to, .. }
            | ControlMessage::UnlinkIdAck { to, .. } => Some(to),
            ControlMessage::MonitorProcess { to, .. }
            | ControlMessage::DemonitorProcess { to, .. } => match to {
                ProcessRef::Pid(pid) => Some(pid),
                ProcessRef::Name(_) => None,
            },
            ControlMessage::NodeLink
            | ControlMessage::RegSend { .. }
            | ControlMessage::RegSendTT { .. } => None,
        }
    }

    pub fn to_term(&self) -> Term {
        let code = Term::Integer(self.operation().as_u8().into());
        let pid = |pid: &Pid| Term::Pid(pid.clone());
        let fields = match self {
            ControlMessage::Link { from, to }
            | ControlMessage::Unlink { from, to }
            | ControlMessage::GroupLeader { from, to } => vec![pid(from), pid(to)],
            ControlMessage::Send { to } => vec![Term::Nil, pid(to)],
            ControlMessage::Exit { from, to, reason } | ControlMessage::Exit2 { from, to, reason } => {
                vec![pid(from), pid(to), reason.clone()]
            }
            ControlMessage::NodeLink => vec![],
            ControlMessage::RegSend { from, to_name } => {
                vec![pid(from), Term::Nil, Term::Atom(to_name.clone())]
            }
            ControlMessage::SendTT { to, token } => vec![Term::Nil, pid(to), token.clone()],
            ControlMessage::ExitTT {
                from,
                to,
                token,
                reason,
            }
            | ControlMessage::Exit2TT {
                from,
                to,
                token,
                reason,
            } => vec![pid(from), pid(to), token.clone(), reason.clone()],
            ControlMessage::RegSendTT {
                from,
                to_name,
                token,
            } => vec![
                pid(from),
                Term::Nil,
                Term::Atom(to_name.clone()),
                token.clone(),
            ],
            ControlMessage::MonitorProcess {
                from,
                to,
                reference,
            }
            | ControlMessage::DemonitorProcess {
                from,
                to,
                reference,
            } => vec![pid(from), to.to_term(), Term::Reference(reference.clone())],
            ControlMessage::MonitorProcessExit {
                from,
                to,
                reference,
                reason,
            } => vec![
                from.to_term(),
                pid(to),
                Term::Reference(reference.clone()),
                reason.clone(),
            ],
            ControlMessage::UnlinkId { id, from, to }
            | ControlMessage::UnlinkIdAck { id, from, to } => {
                vec![Term::from(*id), pid(from), pid(to)]
            }
        };

        let mut elements = Vec::with_capacity(fields.len() + 1);
        elements.push(code);
        elements.extend(fields);
        Term::Tuple(elements)
    }

    pub fn from_term(term: &Term) -> Result<ControlMessage, ControlMessageParsingError> {
        let elements = term
            .as_tuple()
            .filter(|elements| !elements.is_empty())
            .ok_or(ControlMessageParsingError::NotATuple)?;
        let code = match &elements[0] {
            Term::Integer(code) => i64::from(*code),
            _ => return Err(ControlMessageParsingError::NotATuple),
        };
        let operation = u8::try_from(code)
            .ok()
            .and_then(Operation::from_u8)
            .ok_or(ControlMessageParsingError::UnknownOperation(code))?;

        let mut f = Fields {
            operation,
            elements,
            index: 1,
        };
        let message = match operation {
            Operation::Link => ControlMessage::Link {
                from: f.pid()?,
                to: f.pid()?,
            },
            Operation::Send => {
                f.reserved()?;
                ControlMessage::Send { to: f.pid()? }
            }
            Operation::Exit => ControlMessage::Exit {
                from: f.pid()?,
                to: f.pid()?,
                reason: f.any()?,
            },
            Operation::Unlink => ControlMessage::Unlink {
                from: f.pid()?,
                to: f.pid()?,
            },
            Operation::NodeLink => ControlMessage::NodeLink,
            Operation::RegSend => {
                let from = f.pid()?;
                f.reserved()?;
                ControlMessage::RegSend {
                    from,
                    to_name: f.atom()?,
                }
            }
            Operation::GroupLeader => ControlMessage::GroupLeader {
                from: f.pid()?,
                to: f.pid()?,
            },
            Operation::Exit2 => ControlMessage::Exit2 {
                from: f.pid()?,
                to: f.pid()?,
                reason: f.any()?,
            },
            Operation::SendTT => {
                f.reserved()?;
                ControlMessage::SendTT {
                    to: f.pid()?,
                    token: f.any()?,
                }
            }
            Operation::ExitTT => ControlMessage::ExitTT {
                from: f.pid()?,
                to: f.pid()?,
                token: f.any()?,
                reason: f.any()?,
            },
            Operation::RegSendTT => {
                let from = f.pid()?;
                f.reserved()?;
                ControlMessage::RegSendTT {
                    from,
                    to_name: f.atom()?,
                    token: f.any()?,
                }
            }
            Operation::Exit2TT => ControlMessage::Exit2TT {
                from: f.pid()?,
                to: f.pid()?,
                token: f.any()?,
                reason: f.any()?,
            },
            Operation::MonitorP => ControlMessage::MonitorProcess {
                from: f.pid()?,
                to: f.process()?,
                reference: f.reference()?,
            },
            Operation::DemonitorP => ControlMessage::DemonitorProcess {
                from: f.pid()?,
                to: f.process()?,
                reference: f.reference()?,
            },
            Operation::MonitorPExit => ControlMessage::MonitorProcessExit {
                from: f.process()?,
                to: f.pid()?,
                reference: f.reference()?,
                reason: f.any()?,
            },
            Operation::UnlinkId => ControlMessage::UnlinkId {
                id: f.id()?,
                from: f.pid()?,
                to: f.pid()?,
            },
            Operation::UnlinkIdAck => ControlMessage::UnlinkIdAck {
                id: f.id()?,
                from: f.pid()?,
                to: f.pid()?,
            },
        };
        f.finish()?;
        Ok(message)
    }
}

/// Cursor over the fields of a control tuple. Struct literal fields are
/// evaluated in source order, so parsers read fields left to right.
struct Fields<'a> {
    operation: Operation,
    elements: &'a [Term],
    index: usize,
}

impl<'a> Fields<'a> {
    fn error(&self, index: usize, expected: &'static str) -> ControlMessageParsingError {
        ControlMessageParsingError::Field {
            operation: self.operation,
            index,
            expected,
        }
    }

    fn next<T>(
        &mut self,
        expected: &'static str,
        convert: impl FnOnce(&'a Term) -> Option<T>,
    ) -> Result<T, ControlMessageParsingError> {
        let index = self.index;
        let elements = self.elements;
        let value = elements
            .get(index)
            .and_then(convert)
            .ok_or_else(|| self.error(index, expected))?;
        self.index += 1;
        Ok(value)
    }

    fn pid(&mut self) -> Result<Pid, ControlMessageParsingError> {
        self.next("pid", |term| term.as_pid().cloned())
    }

    fn atom(&mut self) -> Result<Atom, ControlMessageParsingError> {
        self.next("atom", |term| term.as_atom().cloned())
    }

    fn reference(&mut self) -> Result<Reference, ControlMessageParsingError> {
        self.next("reference", |term| term.as_reference().cloned())
    }

    fn process(&mut self) -> Result<ProcessRef, ControlMessageParsingError> {
        self.next("pid or atom", |term| match term {
            Term::Pid(pid) => Some(ProcessRef::Pid(pid.clone())),
            Term::Atom(name) => Some(ProcessRef::Name(name.clone())),
            _ => None,
        })
    }

    fn id(&mut self) -> Result<u64, ControlMessageParsingError> {
        self.next("non-negative integer", |term| {
            term.as_integer().and_then(|id| u64::try_from(id).ok())
        })
    }

    fn any(&mut self) -> Result<Term, ControlMessageParsingError> {
        self.next("term", |term| Some(term.clone()))
    }

    /// Unused slot: present on the wire, content ignored.
    fn reserved(&mut self) -> Result<(), ControlMessageParsingError> {
        self.next("unused slot", |_| Some(()))
    }

    fn finish(self) -> Result<(), ControlMessageParsingError> {
        if self.index == self.elements.len() {
            Ok(())
        } else {
            Err(self.error(self.index, "end of tuple"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: u32) -> Pid {
        Pid::new("a@host", id, 0, 1)
    }

    fn reference() -> Reference {
        Reference {
            node: Atom::from("a@host"),
            creation: 1,
            ids: vec![1, 2, 3],
        }
    }

    #[test]
    fn operation_conversion() {
        assert_eq!(Operation::from_u8(op::LINK), Some(Operation::Link));
        assert_eq!(
            Operation::from_u8(op::UNLINK_ID_ACK),
            Some(Operation::UnlinkIdAck)
        );

        assert_eq!(Operation::from_u8(0), None);
        assert_eq!(Operation::from_u8(9), None);
        assert_eq!(Operation::from_u8(22), None);
        assert_eq!(Operation::from_u8(37), None);

        for i in 0..=u8::MAX {
            if let Some(operation) = Operation::from_u8(i) {
                assert_eq!(operation.as_u8(), i);
            }
        }
    }

    #[test]
    fn every_message_survives_the_wire() {
        let messages = vec![
            ControlMessage::Link {
                from: pid(1),
                to: pid(2),
            },
            ControlMessage::Send { to: pid(2) },
            ControlMessage::Exit {
                from: pid(1),
                to: pid(2),
                reason: Term::atom("boom"),
            },
            ControlMessage::Unlink {
                from: pid(1),
                to: pid(2),
            },
            ControlMessage::NodeLink,
            ControlMessage::RegSend {
                from: pid(1),
                to_name: Atom::from("logger"),
            },
            ControlMessage::GroupLeader {
                from: pid(1),
                to: pid(2),
            },
            ControlMessage::Exit2 {
                from: pid(1),
                to: pid(2),
                reason: Term::atom("kill"),
            },
            ControlMessage::SendTT {
                to: pid(2),
                token: Term::atom("token"),
            },
            ControlMessage::ExitTT {
                from: pid(1),
                to: pid(2),
                token: Term::atom("token"),
                reason: Term::from(3),
            },
            ControlMessage::RegSendTT {
                from: pid(1),
                to_name: Atom::from("logger"),
                token: Term::Nil,
            },
            ControlMessage::Exit2TT {
                from: pid(1),
                to: pid(2),
                token: Term::atom("token"),
                reason: Term::atom("shutdown"),
            },
            ControlMessage::MonitorProcess {
                from: pid(1),
                to: ProcessRef::Name(Atom::from("logger")),
                reference: reference(),
            },
            ControlMessage::DemonitorProcess {
                from: pid(1),
                to: ProcessRef::Pid(pid(2)),
                reference: reference(),
            },
            ControlMessage::MonitorProcessExit {
                from: ProcessRef::Pid(pid(2)),
                to: pid(1),
                reference: reference(),
                reason: Term::atom("noproc"),
            },
            ControlMessage::UnlinkId {
                id: 7,
                from: pid(1),
                to: pid(2),
            },
            ControlMessage::UnlinkIdAck {
                id: 1 << 40,
                from: pid(2),
                to: pid(1),
            },
        ];

        for message in messages {
            let bytes = message.to_term().encode();
            let term = crate::etf::decode(&bytes).unwrap();
            assert_eq!(ControlMessage::from_term(&term).unwrap(), message);
        }
    }

    #[test]
    fn unused_slots_are_written_as_nil() {
        let term = ControlMessage::Send { to: pid(2) }.to_term();
        assert_eq!(
            term,
            Term::tuple(vec![Term::from(2), Term::Nil, Term::Pid(pid(2))])
        );

        let term = ControlMessage::RegSend {
            from: pid(1),
            to_name: Atom::from("logger"),
        }
        .to_term();
        assert!(term.as_tuple().unwrap()[2].is_nil());
    }

    #[test]
    fn unused_slots_are_ignored_on_decode() {
        let term = Term::tuple(vec![Term::from(2), Term::atom("whatever"), Term::Pid(pid(2))]);
        assert_eq!(
            ControlMessage::from_term(&term).unwrap(),
            ControlMessage::Send { to: pid(2) }
        );
    }

    #[test]
    fn send_with_wrong_arity_names_the_field() {
        let short = Term::tuple(vec![Term::from(2), Term::Nil]);
        assert_eq!(
            ControlMessage::from_term(&short).unwrap_err(),
            ControlMessageParsingError::Field {
                operation: Operation::Send,
                index: 2,
                expected: "pid",
            }
        );

        let long = Term::tuple(vec![
            Term::from(2),
            Term::Nil,
            Term::Pid(pid(2)),
            Term::atom("extra"),
        ]);
        assert_eq!(
            ControlMessage::from_term(&long).unwrap_err(),
            ControlMessageParsingError::Field {
                operation: Operation::Send,
                index: 3,
                expected: "end of tuple",
            }
        );
    }

    #[test]
    fn mistyped_field_is_rejected() {
        let term = Term::tuple(vec![Term::from(1), Term::Pid(pid(1)), Term::atom("nope")]);
        assert_eq!(
            ControlMessage::from_term(&term).unwrap_err(),
            ControlMessageParsingError::Field {
                operation: Operation::Link,
                index: 2,
                expected: "pid",
            }
        );
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let term = Term::tuple(vec![Term::from(99)]);
        assert_eq!(
            ControlMessage::from_term(&term).unwrap_err(),
            ControlMessageParsingError::UnknownOperation(99)
        );
        let term = Term::tuple(vec![Term::from(-1)]);
        assert_eq!(
            ControlMessage::from_term(&term).unwrap_err(),
            ControlMessageParsingError::UnknownOperation(-1)
        );
        assert_eq!(
            ControlMessage::from_term(&Term::atom("link")).unwrap_err(),
            ControlMessageParsingError::NotATuple
        );
    }

    #[test]
    fn payload_carrying_operations() {
        assert!(ControlMessage::Send { to: pid(1) }.has_payload());
        assert!(!ControlMessage::NodeLink.has_payload());
        assert!(!ControlMessage::Link {
            from: pid(1),
            to: pid(2)
        }
        .has_payload());
    }
}
