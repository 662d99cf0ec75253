//! Node identity and the set of nodes believed to be active.
//!
//! The registry only sizes the reply quorum of fan-in requests. It is not a
//! membership protocol: entries arrive through presence announcements on the
//! nodes channel and leave on a `leave` announcement or, when heartbeats are
//! enabled, after `node_timeout` of silence.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Length of generated node ids.
const NODE_ID_LEN: usize = 6;

/// Short random token identifying one running process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn generate() -> Self {
        Self(nanoid!(NODE_ID_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Presence announcements exchanged on the nodes channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Presence {
    /// Sent once when a node's subscription starts.
    Join { node: NodeId },
    /// Reply to a `Join` so the newcomer learns about existing nodes.
    Present { node: NodeId },
    /// Periodic liveness signal.
    Heartbeat { node: NodeId },
    /// Sent on clean shutdown.
    Leave { node: NodeId },
}

impl Presence {
    pub fn node(&self) -> &NodeId {
        match self {
            Presence::Join { node }
            | Presence::Present { node }
            | Presence::Heartbeat { node }
            | Presence::Leave { node } => node,
        }
    }
}

/// Active node ids with the last time each was heard from.
#[derive(Debug)]
pub struct NodeRegistry {
    local: NodeId,
    nodes: BTreeMap<NodeId, Instant>,
}

impl NodeRegistry {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            nodes: BTreeMap::new(),
        }
    }

    /// Inserts or refreshes a node. Returns `true` when the id was not known.
    pub fn touch(&mut self, id: NodeId, now: Instant) -> bool {
        self.nodes.insert(id, now).is_none()
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        self.nodes.remove(id).is_some()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// Number of replies a fan-in request expects, counting this node.
    ///
    /// The local node always answers its own requests in-process, so it is
    /// counted even while its subscription is down.
    pub fn quorum(&self) -> usize {
        self.nodes.len() + usize::from(!self.nodes.contains_key(&self.local))
    }

    /// Drops peers not heard from within `ttl`. The local node is never pruned.
    pub fn prune(&mut self, now: Instant, ttl: Duration) -> Vec<NodeId> {
        let stale: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, seen)| **id != self.local && now.duration_since(**seen) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.nodes.remove(id);
        }
        stale
    }
}
