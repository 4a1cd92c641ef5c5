//! Mailboxes: the addressable endpoints of a node.
//!
//! A mailbox owns a pid and an inbox. Link and monitor bookkeeping happens as
//! control messages are delivered; exit signals and monitor notifications are
//! interpreted by the receive loop, which only hands user messages back to
//! the caller.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::{
    codec::DistMessage,
    control::{ControlMessage, ProcessRef},
    error::NodeError,
    etf::{Atom, Pid, Reference, Term},
    node::Shared,
};

/// An exit signal observed by [`Mailbox::receive`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub from: Pid,
    pub reason: Term,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReceiveError {
    #[error("exit signal from {} with reason {:?}", .0.from, .0.reason)]
    Exit(ExitSignal),
    #[error("mailbox is closed")]
    Closed,
    #[error("no message within the timeout")]
    Timeout,
}

/// A user message. `from` is known for messages sent to a registered name.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: Option<Pid>,
    pub message: Term,
}

/// A monitor this mailbox holds on some other process.
#[derive(Debug, Clone)]
struct Monitored {
    node: Atom,
    target: ProcessRef,
}

#[derive(Debug, Default)]
struct Relations {
    links: HashSet<Pid>,
    /// Monitors others hold on this mailbox, with the target as they named it.
    monitored_by: HashMap<Reference, (Pid, ProcessRef)>,
    monitoring: HashMap<Reference, Monitored>,
}

/// The part of a mailbox the node keeps in its registry.
#[derive(Debug)]
pub(crate) struct MailboxShared {
    pid: Pid,
    name: Mutex<Option<Atom>>,
    inbox: Mutex<Option<mpsc::UnboundedSender<DistMessage>>>,
    relations: Mutex<Relations>,
    closed: AtomicBool,
}

impl MailboxShared {
    pub(crate) fn pid(&self) -> &Pid {
        &self.pid
    }

    pub(crate) fn name(&self) -> Option<Atom> {
        self.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: Option<Atom>) {
        *self.name.lock() = name;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Takes a message addressed to this mailbox. Link and monitor changes
    /// are applied immediately so that an exit racing with them sees them.
    pub(crate) fn deliver(&self, message: DistMessage) {
        if self.is_closed() {
            return;
        }
        match &message.control {
            ControlMessage::Link { from, .. } => {
                self.relations.lock().links.insert(from.clone());
            }
            ControlMessage::Unlink { from, .. } | ControlMessage::UnlinkId { from, .. } => {
                self.relations.lock().links.remove(from);
            }
            ControlMessage::MonitorProcess {
                from,
                to,
                reference,
            } => {
                self.relations
                    .lock()
                    .monitored_by
                    .insert(reference.clone(), (from.clone(), to.clone()));
            }
            ControlMessage::DemonitorProcess { reference, .. } => {
                self.relations.lock().monitored_by.remove(reference);
            }
            ControlMessage::UnlinkIdAck { .. }
            | ControlMessage::NodeLink
            | ControlMessage::GroupLeader { .. } => {}
            _ => {
                if let Some(inbox) = &*self.inbox.lock() {
                    let _ = inbox.send(message);
                }
            }
        }
    }

    /// Signals for everything tied to `node`, which is no longer reachable.
    pub(crate) fn peer_lost(&self, node: &Atom) {
        let signals = {
            let mut relations = self.relations.lock();
            let lost_links: Vec<Pid> = relations
                .links
                .iter()
                .filter(|pid| pid.node == *node)
                .cloned()
                .collect();
            for pid in &lost_links {
                relations.links.remove(pid);
            }
            relations.monitored_by.retain(|_, (pid, _)| pid.node != *node);

            let mut signals: Vec<ControlMessage> = lost_links
                .into_iter()
                .map(|from| ControlMessage::Exit {
                    from,
                    to: self.pid.clone(),
                    reason: Term::atom("noconnection"),
                })
                .collect();
            signals.extend(
                relations
                    .monitoring
                    .iter()
                    .filter(|(_, monitored)| monitored.node == *node)
                    .map(|(reference, monitored)| ControlMessage::MonitorProcessExit {
                        from: monitored.target.clone(),
                        to: self.pid.clone(),
                        reference: reference.clone(),
                        reason: Term::atom("noconnection"),
                    }),
            );
            signals
        };
        if let Some(inbox) = &*self.inbox.lock() {
            for signal in signals {
                let _ = inbox.send(DistMessage::control(signal));
            }
        }
    }

    /// Marks the mailbox closed and wakes a pending receive. Returns false if
    /// it was already closed.
    pub(crate) fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inbox.lock().take();
        true
    }
}

pub struct Mailbox {
    shared: Arc<MailboxShared>,
    inbox: mpsc::UnboundedReceiver<DistMessage>,
    node: Arc<Shared>,
}

impl Mailbox {
    pub(crate) fn new(node: Arc<Shared>, pid: Pid) -> (Self, Arc<MailboxShared>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MailboxShared {
            pid,
            name: Mutex::new(None),
            inbox: Mutex::new(Some(tx)),
            relations: Mutex::new(Relations::default()),
            closed: AtomicBool::new(false),
        });
        let mailbox = Mailbox {
            shared: shared.clone(),
            inbox: rx,
            node,
        };
        (mailbox, shared)
    }

    pub fn pid(&self) -> &Pid {
        &self.shared.pid
    }

    pub fn name(&self) -> Option<Atom> {
        self.shared.name()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Pids currently linked to this mailbox.
    pub fn links(&self) -> Vec<Pid> {
        self.shared.relations.lock().links.iter().cloned().collect()
    }

    pub fn register_name(&self, name: impl Into<Atom>) -> Result<(), NodeError> {
        self.ensure_open()?;
        self.node.register_name(name.into(), &self.shared)
    }

    fn ensure_open(&self) -> Result<(), NodeError> {
        if self.is_closed() {
            Err(NodeError::MailboxClosed)
        } else {
            Ok(())
        }
    }

    fn route(&self, node: &Atom, control: ControlMessage) -> Result<(), NodeError> {
        self.node.route(node, DistMessage::control(control))
    }

    pub fn send(&self, to: &Pid, message: impl Into<Term>) -> Result<(), NodeError> {
        self.ensure_open()?;
        self.node.route(
            &to.node,
            DistMessage::with_payload(ControlMessage::Send { to: to.clone() }, message.into()),
        )
    }

    /// Sends to the process registered as `name` on `node`.
    pub fn send_to_name(
        &self,
        node: impl Into<Atom>,
        name: impl Into<Atom>,
        message: impl Into<Term>,
    ) -> Result<(), NodeError> {
        self.ensure_open()?;
        let control = ControlMessage::RegSend {
            from: self.pid().clone(),
            to_name: name.into(),
        };
        self.node
            .route(&node.into(), DistMessage::with_payload(control, message.into()))
    }

    pub fn link(&self, to: &Pid) -> Result<(), NodeError> {
        self.ensure_open()?;
        if to == self.pid() {
            return Ok(());
        }
        self.shared.relations.lock().links.insert(to.clone());
        self.route(
            &to.node,
            ControlMessage::Link {
                from: self.pid().clone(),
                to: to.clone(),
            },
        )
    }

    pub fn unlink(&self, to: &Pid) -> Result<(), NodeError> {
        self.ensure_open()?;
        if !self.shared.relations.lock().links.remove(to) {
            return Ok(());
        }
        self.route(
            &to.node,
            ControlMessage::Unlink {
                from: self.pid().clone(),
                to: to.clone(),
            },
        )
    }

    /// Monitors `to`. When it exits, [`receive`](Self::receive) returns
    /// `{'DOWN', Ref, process, Pid, Reason}`.
    pub fn monitor(&self, to: &Pid) -> Result<Reference, NodeError> {
        self.monitor_process(to.node.clone(), ProcessRef::Pid(to.clone()))
    }

    /// Monitors the process registered as `name` on `node`. The DOWN message
    /// names it as `{Name, Node}`.
    pub fn monitor_name(
        &self,
        node: impl Into<Atom>,
        name: impl Into<Atom>,
    ) -> Result<Reference, NodeError> {
        self.monitor_process(node.into(), ProcessRef::Name(name.into()))
    }

    fn monitor_process(&self, node: Atom, target: ProcessRef) -> Result<Reference, NodeError> {
        self.ensure_open()?;
        let reference = self.node.make_ref();
        self.shared.relations.lock().monitoring.insert(
            reference.clone(),
            Monitored {
                node: node.clone(),
                target: target.clone(),
            },
        );
        self.route(
            &node,
            ControlMessage::MonitorProcess {
                from: self.pid().clone(),
                to: target,
                reference: reference.clone(),
            },
        )?;
        Ok(reference)
    }

    pub fn demonitor(&self, reference: &Reference) -> Result<(), NodeError> {
        self.ensure_open()?;
        let monitored = match self.shared.relations.lock().monitoring.remove(reference) {
            Some(monitored) => monitored,
            None => return Ok(()),
        };
        self.route(
            &monitored.node,
            ControlMessage::DemonitorProcess {
                from: self.pid().clone(),
                to: monitored.target,
                reference: reference.clone(),
            },
        )
    }

    /// Sends an exit signal to `to` without being linked to it.
    pub fn exit_to(&self, to: &Pid, reason: impl Into<Term>) -> Result<(), NodeError> {
        self.ensure_open()?;
        self.route(
            &to.node,
            ControlMessage::Exit2 {
                from: self.pid().clone(),
                to: to.clone(),
                reason: reason.into(),
            },
        )
    }

    /// Terminates the mailbox. Linked processes get an exit signal and
    /// monitoring processes a DOWN notification carrying `reason`. Calling it
    /// again has no effect.
    pub fn exit(&self, reason: impl Into<Term>) {
        if !self.shared.shut() {
            return;
        }
        let reason = reason.into();
        let Relations {
            links,
            monitored_by,
            monitoring,
        } = std::mem::take(&mut *self.shared.relations.lock());
        let me = self.pid().clone();

        for link in links {
            let node = link.node.clone();
            self.notify(
                &node,
                ControlMessage::Exit {
                    from: me.clone(),
                    to: link,
                    reason: reason.clone(),
                },
            );
        }
        self.release_monitors(monitored_by, monitoring, &reason);

        self.node.deregister(&self.shared);
        log::debug!("{} exited with {:?}", me, reason);
    }

    /// Exits with reason `normal`.
    pub fn close(&self) {
        self.exit(Term::atom("normal"));
    }

    /// Sends DOWN to everyone monitoring this mailbox and drops the monitors it holds.
    fn release_monitors(
        &self,
        monitored_by: HashMap<Reference, (Pid, ProcessRef)>,
        monitoring: HashMap<Reference, Monitored>,
        reason: &Term,
    ) {
        for (reference, (watcher, target)) in monitored_by {
            let node = watcher.node.clone();
            self.notify(
                &node,
                ControlMessage::MonitorProcessExit {
                    from: target,
                    to: watcher,
                    reference,
                    reason: reason.clone(),
                },
            );
        }
        for (reference, monitored) in monitoring {
            self.notify(
                &monitored.node,
                ControlMessage::DemonitorProcess {
                    from: self.pid().clone(),
                    to: monitored.target,
                    reference,
                },
            );
        }
    }

    fn notify(&self, node: &Atom, control: ControlMessage) {
        if let Err(err) = self.route(node, control) {
            log::debug!("could not notify {}: {}", node, err);
        }
    }

    pub async fn receive(&mut self) -> Result<Envelope, ReceiveError> {
        loop {
            if self.is_closed() {
                return Err(ReceiveError::Closed);
            }
            let message = self.inbox.recv().await.ok_or(ReceiveError::Closed)?;
            if let Some(envelope) = self.handle(message)? {
                return Ok(envelope);
            }
        }
    }

    pub async fn receive_timeout(&mut self, timeout: Duration) -> Result<Envelope, ReceiveError> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| ReceiveError::Timeout)?
    }

    /// Returns `Ok(None)` when no user message is waiting.
    pub fn try_receive(&mut self) -> Result<Option<Envelope>, ReceiveError> {
        loop {
            if self.is_closed() {
                return Err(ReceiveError::Closed);
            }
            let message = match self.inbox.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(ReceiveError::Closed),
            };
            if let Some(envelope) = self.handle(message)? {
                return Ok(Some(envelope));
            }
        }
    }

    /// Blocks the current thread. Must not be called from async code.
    pub fn blocking_receive(&mut self) -> Result<Envelope, ReceiveError> {
        loop {
            if self.is_closed() {
                return Err(ReceiveError::Closed);
            }
            let message = self.inbox.blocking_recv().ok_or(ReceiveError::Closed)?;
            if let Some(envelope) = self.handle(message)? {
                return Ok(envelope);
            }
        }
    }

    fn handle(&mut self, message: DistMessage) -> Result<Option<Envelope>, ReceiveError> {
        let DistMessage { control, payload } = message;
        match control {
            ControlMessage::Send { .. } | ControlMessage::SendTT { .. } => Ok(payload.map(|message| {
                Envelope {
                    from: None,
                    message,
                }
            })),
            ControlMessage::RegSend { from, .. } | ControlMessage::RegSendTT { from, .. } => {
                Ok(payload.map(|message| Envelope {
                    from: Some(from),
                    message,
                }))
            }
            ControlMessage::Exit { from, reason, .. }
            | ControlMessage::Exit2 { from, reason, .. }
            | ControlMessage::ExitTT { from, reason, .. }
            | ControlMessage::Exit2TT { from, reason, .. } => self.handle_exit(from, reason),
            ControlMessage::MonitorProcessExit {
                from,
                reference,
                reason,
                ..
            } => Ok(self.handle_down(from, reference, reason)),
            // Applied on delivery.
            ControlMessage::Link { .. }
            | ControlMessage::Unlink { .. }
            | ControlMessage::UnlinkId { .. }
            | ControlMessage::UnlinkIdAck { .. }
            | ControlMessage::MonitorProcess { .. }
            | ControlMessage::DemonitorProcess { .. }
            | ControlMessage::NodeLink
            | ControlMessage::GroupLeader { .. } => Ok(None),
        }
    }

    fn handle_exit(&mut self, from: Pid, reason: Term) -> Result<Option<Envelope>, ReceiveError> {
        if reason.is_atom("normal") {
            return Ok(None);
        }
        if reason.is_atom("kill") {
            if self.shared.shut() {
                // Links are not told; monitors see `killed`.
                let relations = std::mem::take(&mut *self.shared.relations.lock());
                self.release_monitors(
                    relations.monitored_by,
                    relations.monitoring,
                    &Term::atom("killed"),
                );
                self.node.deregister(&self.shared);
            }
            return Err(ReceiveError::Exit(ExitSignal { from, reason }));
        }

        let links = {
            let mut relations = self.shared.relations.lock();
            relations.links.remove(&from);
            std::mem::take(&mut relations.links)
        };
        for link in links {
            let node = link.node.clone();
            self.notify(
                &node,
                ControlMessage::Exit {
                    from: self.pid().clone(),
                    to: link,
                    reason: reason.clone(),
                },
            );
        }
        Err(ReceiveError::Exit(ExitSignal { from, reason }))
    }

    fn handle_down(&mut self, from: ProcessRef, reference: Reference, reason: Term) -> Option<Envelope> {
        let monitored = self.shared.relations.lock().monitoring.remove(&reference)?;
        let object = match from {
            ProcessRef::Pid(pid) => Term::Pid(pid),
            ProcessRef::Name(name) => Term::tuple(vec![Term::Atom(name), Term::Atom(monitored.node)]),
        };
        Some(Envelope {
            from: None,
            message: Term::tuple(vec![
                Term::atom("DOWN"),
                Term::Reference(reference),
                Term::atom("process"),
                object,
                reason,
            ]),
        })
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("pid", self.pid())
            .field("name", &self.name())
            .finish()
    }
}
