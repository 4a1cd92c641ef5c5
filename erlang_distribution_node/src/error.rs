use crate::{connection::ConnectionError, etf::Atom};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("mailbox is closed")]
    MailboxClosed,
    #[error("node is shut down")]
    Shutdown,
    #[error("{0} is already registered")]
    NameTaken(Atom),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
