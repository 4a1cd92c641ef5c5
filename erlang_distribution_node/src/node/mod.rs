//! The node runtime: identity, the mailbox and name registries, the
//! connection table and the tasks that move frames between sockets and
//! mailboxes.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt as _, StreamExt as _,
};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use secrecy::SecretString;
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Handle,
    sync::mpsc,
};
use tokio_util::{codec::Framed, sync::CancellationToken};

use crate::{
    codec::{DistCodec, DistFrame, DistMessage},
    connection::{Connection, ConnectionError, ConnectionState},
    control::{ControlMessage, ProcessRef},
    discovery::Discovery,
    error::NodeError,
    etf::{Atom, Pid, Reference, Term},
    handshake::{self, flags::dist_flags::DFLAG_UNLINK_ID, Established, LocalNode, PeerNode},
    mailbox::{Mailbox, MailboxShared},
};

mod config;
mod ids;

pub use config::NodeConfig;
pub use ids::IdGenerator;

/// Silent tick intervals after which a peer is considered gone.
const TICKS_BEFORE_TIMEOUT: u32 = 4;

pub(crate) struct Shared {
    local: Arc<LocalNode>,
    config: NodeConfig,
    ids: IdGenerator,
    discovery: Arc<dyn Discovery>,
    mailboxes: RwLock<HashMap<Pid, Arc<MailboxShared>>>,
    names: RwLock<HashMap<Atom, Pid>>,
    connections: Mutex<HashMap<Atom, Arc<Connection>>>,
    runtime: Handle,
    cancel: CancellationToken,
}

/// A running node. Cloning gives another handle to the same node.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl Node {
    /// Binds the listener and starts accepting connections. Must be called
    /// from within a tokio runtime.
    pub async fn start(
        config: NodeConfig,
        cookie: SecretString,
        discovery: Arc<dyn Discovery>,
    ) -> anyhow::Result<Node> {
        config.validate()?;
        let name = Atom::try_new(config.full_name()?).context("node name is too long")?;
        let creation = config
            .creation
            .unwrap_or_else(|| rand::thread_rng().gen_range(1..=u32::MAX));

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("when binding the distribution port {}", config.listen))?;
        let local_addr = listener
            .local_addr()
            .context("when reading the bound address")?;

        let local = LocalNode::new(name.clone(), cookie, creation, config.hidden)
            .with_versions(config.low_version, config.high_version);
        let shared = Arc::new(Shared {
            local: Arc::new(local),
            ids: IdGenerator::new(name.clone(), creation),
            config,
            discovery,
            mailboxes: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            runtime: Handle::current(),
            cancel: CancellationToken::new(),
        });

        log::info!("node {} listening on {}", name, local_addr);
        shared.runtime.spawn(accept_loop(shared.clone(), listener));

        Ok(Node { shared, local_addr })
    }

    pub fn name(&self) -> &Atom {
        &self.shared.local.name
    }

    pub fn creation(&self) -> u32 {
        self.shared.local.creation
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn create_mailbox(&self) -> Mailbox {
        self.shared.create_mailbox()
    }

    pub fn create_named_mailbox(&self, name: impl Into<Atom>) -> Result<Mailbox, NodeError> {
        let mailbox = self.shared.create_mailbox();
        mailbox.register_name(name)?;
        Ok(mailbox)
    }

    pub fn make_ref(&self) -> Reference {
        self.shared.make_ref()
    }

    pub fn whereis(&self, name: &Atom) -> Option<Pid> {
        self.shared.names.read().get(name).cloned()
    }

    /// Connects to `node` unless already connected, and waits for the
    /// handshake to finish.
    pub async fn connect(&self, node: impl Into<Atom>) -> Result<(), NodeError> {
        let node = node.into();
        if node == self.shared.local.name {
            return Ok(());
        }
        let connection = self.shared.connection_to(&node)?;
        connection.wait_active().await?;
        Ok(())
    }

    pub fn connected_nodes(&self) -> Vec<Atom> {
        self.shared
            .connections
            .lock()
            .values()
            .filter(|connection| connection.state() == ConnectionState::Active)
            .map(|connection| connection.node().clone())
            .collect()
    }

    /// Stops accepting, closes every connection and every mailbox.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", self.name())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Shared {
    fn create_mailbox(self: &Arc<Self>) -> Mailbox {
        let (mailbox, shared) = Mailbox::new(self.clone(), self.ids.next_pid());
        if self.cancel.is_cancelled() {
            shared.shut();
        } else {
            self.mailboxes.write().insert(shared.pid().clone(), shared);
        }
        mailbox
    }

    pub(crate) fn make_ref(&self) -> Reference {
        self.ids.next_reference()
    }

    pub(crate) fn register_name(
        &self,
        name: Atom,
        mailbox: &Arc<MailboxShared>,
    ) -> Result<(), NodeError> {
        let mut names = self.names.write();
        if names.contains_key(&name) {
            return Err(NodeError::NameTaken(name));
        }
        if let Some(previous) = mailbox.name() {
            names.remove(&previous);
        }
        names.insert(name.clone(), mailbox.pid().clone());
        mailbox.set_name(Some(name));
        Ok(())
    }

    pub(crate) fn deregister(&self, mailbox: &MailboxShared) {
        if let Some(name) = mailbox.name() {
            let mut names = self.names.write();
            if names.get(&name) == Some(mailbox.pid()) {
                names.remove(&name);
            }
        }
        self.mailboxes.write().remove(mailbox.pid());
    }

    fn mailbox(&self, pid: &Pid) -> Option<Arc<MailboxShared>> {
        self.mailboxes.read().get(pid).cloned()
    }

    fn named_mailbox(&self, name: &Atom) -> Option<Arc<MailboxShared>> {
        let pid = self.names.read().get(name).cloned()?;
        self.mailbox(&pid)
    }

    /// Sends `message` towards `node`, delivering directly when it is this
    /// node.
    pub(crate) fn route(self: &Arc<Self>, node: &Atom, message: DistMessage) -> Result<(), NodeError> {
        if *node == self.local.name {
            self.deliver_local(message);
            return Ok(());
        }
        let connection = self.connection_to(node)?;
        connection.send(DistFrame::Message(message))?;
        Ok(())
    }

    fn deliver_local(self: &Arc<Self>, message: DistMessage) {
        let target = match &message.control {
            ControlMessage::RegSend { to_name, .. } | ControlMessage::RegSendTT { to_name, .. } => {
                self.named_mailbox(to_name)
            }
            ControlMessage::MonitorProcess {
                to: ProcessRef::Name(name),
                ..
            }
            | ControlMessage::DemonitorProcess {
                to: ProcessRef::Name(name),
                ..
            } => self.named_mailbox(name),
            control => control.destination_pid().and_then(|pid| self.mailbox(pid)),
        };

        let target = match target {
            Some(target) if !target.is_closed() => target,
            _ => return self.no_such_process(message.control),
        };
        let ack = match &message.control {
            ControlMessage::UnlinkId { id, from, to } => Some(ControlMessage::UnlinkIdAck {
                id: *id,
                from: to.clone(),
                to: from.clone(),
            }),
            _ => None,
        };
        target.deliver(message);
        if let Some(ack) = ack {
            self.reply(ack);
        }
    }

    fn no_such_process(self: &Arc<Self>, control: ControlMessage) {
        match control {
            ControlMessage::Link { from, to } => self.reply(ControlMessage::Exit {
                from: to,
                to: from,
                reason: Term::atom("noproc"),
            }),
            ControlMessage::MonitorProcess {
                from,
                to,
                reference,
            } => self.reply(ControlMessage::MonitorProcessExit {
                from: to,
                to: from,
                reference,
                reason: Term::atom("noproc"),
            }),
            ControlMessage::UnlinkId { id, from, to } => {
                self.reply(ControlMessage::UnlinkIdAck {
                    id,
                    from: to,
                    to: from,
                })
            }
            other => log::debug!(
                "dropping {:?} for a process that does not exist",
                other.operation()
            ),
        }
    }

    /// Routes a control message back to the node of its destination.
    fn reply(self: &Arc<Self>, control: ControlMessage) {
        let node = match control.destination_pid() {
            Some(pid) => pid.node.clone(),
            None => return,
        };
        if let Err(err) = self.route(&node, DistMessage::control(control)) {
            log::debug!("could not reply to {}: {}", node, err);
        }
    }

    /// Existing usable connection to `node`, or a new one with a connect
    /// task behind it.
    fn connection_to(self: &Arc<Self>, node: &Atom) -> Result<Arc<Connection>, NodeError> {
        if self.cancel.is_cancelled() {
            return Err(NodeError::Shutdown);
        }
        let mut connections = self.connections.lock();
        if let Some(connection) = connections.get(node) {
            if connection.state() != ConnectionState::Closed {
                return Ok(connection.clone());
            }
        }
        let connection = Arc::new(Connection::new(node.clone()));
        connections.insert(node.clone(), connection.clone());
        drop(connections);

        log::debug!("connecting to {}", node);
        self.runtime
            .spawn(self.clone().connect(connection.clone()));
        Ok(connection)
    }

    async fn connect(self: Arc<Self>, connection: Arc<Connection>) {
        let name = connection.node().clone();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(ConnectionError::Shutdown),
            result = self.establish(&name) => result.map_err(|err| {
                log::warn!("connecting to {} failed: {:#}", name, err);
                ConnectionError::Connect(format!("{:#}", err))
            }),
        };
        match result {
            Ok(established) => self.attach(connection, established),
            Err(cause) => {
                if connection.abort(cause) {
                    self.connection_lost(&connection);
                }
            }
        }
    }

    async fn establish(&self, name: &Atom) -> anyhow::Result<Established<TcpStream>> {
        let timeouts = self.config.timeouts();
        let info = tokio::time::timeout(timeouts.lookup, self.discovery.lookup(name))
            .await
            .map_err(|_| handshake::HandshakeError::LookupTimeout(name.clone()))?
            .with_context(|| format!("when looking up {}", name))?;

        let stream = TcpStream::connect((info.host.as_str(), info.port))
            .await
            .with_context(|| format!("when connecting to {}:{}", info.host, info.port))?;
        stream.set_nodelay(true)?;

        let established = handshake::initiate(
            stream,
            self.local.clone(),
            name.clone(),
            &info,
            timeouts,
            self.codec(),
        )
        .await
        .with_context(|| format!("during the handshake with {}", name))?;
        Ok(established)
    }

    fn codec(&self) -> DistCodec {
        DistCodec::new(self.config.max_frame_length, self.config.max_term_depth)
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream) -> anyhow::Result<()> {
        stream.set_nodelay(true)?;
        let established = handshake::accept(
            stream,
            self.local.clone(),
            self.discovery.as_ref(),
            self.config.timeouts(),
            self.codec(),
        )
        .await?;

        let peer = established.peer.name.clone();
        let connection = {
            let mut connections = self.connections.lock();
            let existing = connections
                .get(&peer)
                .map(|existing| (existing.clone(), existing.state()));
            match existing {
                Some((existing, ConnectionState::Pending)) => existing,
                Some((_, ConnectionState::Draining | ConnectionState::Active)) => {
                    log::debug!("already connected to {}, dropping the new connection", peer);
                    return Ok(());
                }
                _ => {
                    let connection = Arc::new(Connection::new(peer.clone()));
                    connections.insert(peer, connection.clone());
                    connection
                }
            }
        };
        self.attach(connection, established);
        Ok(())
    }

    /// Activates `connection` with an authenticated stream and starts its
    /// reader and writer.
    fn attach(self: &Arc<Self>, connection: Arc<Connection>, established: Established<TcpStream>) {
        let Established { framed, peer } = established;
        let (sink, stream) = framed.split();
        let (tx, rx) = mpsc::unbounded_channel();

        if !connection.activate(tx, peer.clone()) {
            log::debug!("connection to {} was settled elsewhere, dropping stream", peer.name);
            return;
        }

        let tick = self.config.tick_interval();
        self.runtime
            .spawn(write_frames(sink, rx, peer, tick, connection.clone()));
        self.runtime.spawn(self.clone().read_frames(
            stream,
            connection,
            tick * TICKS_BEFORE_TIMEOUT,
        ));
    }

    async fn read_frames(
        self: Arc<Self>,
        mut stream: SplitStream<Framed<TcpStream, DistCodec>>,
        connection: Arc<Connection>,
        silence: Duration,
    ) {
        let cancel = connection.cancel_token().clone();
        let cause = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break None,
                _ = self.cancel.cancelled() => break Some(ConnectionError::Shutdown),
                next = tokio::time::timeout(silence, stream.next()) => next,
            };
            match next {
                Err(_) => break Some(ConnectionError::Lost("peer stopped ticking".into())),
                Ok(None) => break Some(ConnectionError::Lost("peer closed the connection".into())),
                Ok(Some(Err(err))) => break Some(ConnectionError::Lost(err.to_string())),
                Ok(Some(Ok(DistFrame::Tick))) => {}
                Ok(Some(Ok(DistFrame::Message(message)))) => {
                    log::debug!("<- {}: {:?}", connection.node(), message.control);
                    self.deliver_local(message);
                }
            }
        };
        if let Some(cause) = cause {
            log::info!("connection to {} closed: {}", connection.node(), cause);
            connection.close(cause);
        }
        self.connection_lost(&connection);
    }

    /// Forgets `connection` and tells local mailboxes their peers on that
    /// node are gone.
    fn connection_lost(&self, connection: &Arc<Connection>) {
        let node = connection.node();
        {
            let mut connections = self.connections.lock();
            if let Some(current) = connections.get(node) {
                if Arc::ptr_eq(current, connection) {
                    connections.remove(node);
                }
            }
        }
        let mailboxes: Vec<Arc<MailboxShared>> = self.mailboxes.read().values().cloned().collect();
        for mailbox in mailboxes {
            mailbox.peer_lost(node);
        }
    }

    fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        log::info!("shutting down node {}", self.local.name);
        self.cancel.cancel();

        let connections: Vec<Arc<Connection>> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close(ConnectionError::Shutdown);
        }
        let mailboxes: Vec<Arc<MailboxShared>> =
            self.mailboxes.write().drain().map(|(_, m)| m).collect();
        for mailbox in mailboxes {
            mailbox.shut();
        }
        self.names.write().clear();
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    continue;
                }
            },
        };

        log::debug!("incoming connection from {}", addr);
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(err) = shared.handle_inbound(stream).await {
                log::warn!("inbound connection from {} failed: {:#}", addr, err);
            }
        });
    }
    log::debug!("accept loop stopped");
}

async fn write_frames(
    mut sink: SplitSink<Framed<TcpStream, DistCodec>, DistFrame>,
    mut outbound: mpsc::UnboundedReceiver<DistFrame>,
    peer: PeerNode,
    tick: Duration,
    connection: Arc<Connection>,
) {
    let cancel = connection.cancel_token().clone();
    let mut unlink_ids = 1u64;
    let result = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break Ok(()),
            },
            _ = tokio::time::sleep(tick) => DistFrame::Tick,
        };
        let frame = for_peer(frame, &peer, &mut unlink_ids);
        if let DistFrame::Message(message) = &frame {
            log::debug!("-> {}: {:?}", peer.name, message.control);
        }
        if let Err(err) = sink.send(frame).await {
            break Err(err);
        }
    };
    if let Err(err) = result {
        connection.close(ConnectionError::Lost(err.to_string()));
    }
    let _ = sink.close().await;
}

/// Peers that speak the new link protocol expect unlinks as UnlinkId.
fn for_peer(frame: DistFrame, peer: &PeerNode, unlink_ids: &mut u64) -> DistFrame {
    match frame {
        DistFrame::Message(DistMessage {
            control: ControlMessage::Unlink { from, to },
            payload,
        }) if peer.has_flag(DFLAG_UNLINK_ID) => {
            let id = *unlink_ids;
            *unlink_ids += 1;
            DistFrame::Message(DistMessage {
                control: ControlMessage::UnlinkId { id, from, to },
                payload,
            })
        }
        frame => frame,
    }
}
