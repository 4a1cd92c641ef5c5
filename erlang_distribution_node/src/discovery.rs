//! Resolving node names to listening addresses.
//!
//! In a real cluster this is the port mapper daemon. The node only needs the
//! [`Discovery`] trait; [`StaticDiscovery`] is a fixed table for tests and
//! for deployments that know their peers up front.

use std::collections::HashMap;

use anyhow::Context;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::etf::Atom;

/// What discovery knows about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub host: String,
    pub port: u16,
    pub low_version: u16,
    pub high_version: u16,
    pub flags: u64,
}

impl NodeInfo {
    /// A node speaking handshake versions 5 and 6.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeInfo {
            host: host.into(),
            port,
            low_version: 5,
            high_version: 6,
            flags: 0,
        }
    }
}

pub trait Discovery: Send + Sync {
    fn lookup<'a>(&'a self, name: &'a Atom) -> BoxFuture<'a, anyhow::Result<NodeInfo>>;
}

#[derive(Debug, Default)]
pub struct StaticDiscovery {
    nodes: RwLock<HashMap<Atom, NodeInfo>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<Atom>, info: NodeInfo) {
        self.nodes.write().insert(name.into(), info);
    }

    pub fn unregister(&self, name: &Atom) -> Option<NodeInfo> {
        self.nodes.write().remove(name)
    }
}

impl Discovery for StaticDiscovery {
    fn lookup<'a>(&'a self, name: &'a Atom) -> BoxFuture<'a, anyhow::Result<NodeInfo>> {
        let found = self
            .nodes
            .read()
            .get(name)
            .cloned()
            .with_context(|| format!("{} is not registered", name));
        Box::pin(async move { found })
    }
}
