//! A node that joins an Erlang distribution cluster.
//!
//! [`Node`] listens for and opens distribution connections, authenticates
//! them with the shared cookie and routes control messages to [`Mailbox`]es,
//! which give every endpoint a pid, an inbox and link and monitor semantics.

pub mod codec;
pub mod connection;
pub mod control;
pub mod discovery;
pub mod error;
pub mod etf;
pub mod handshake;
pub mod mailbox;
pub mod node;

pub use discovery::{Discovery, NodeInfo, StaticDiscovery};
pub use error::NodeError;
pub use etf::{Atom, Pid, Reference, Term};
pub use mailbox::{Envelope, ExitSignal, Mailbox, ReceiveError};
pub use node::{Node, NodeConfig};
