//! Bookkeeping for cluster-wide requests issued by this node.
//!
//! Each outstanding request is a [`PendingRequest`] owned by the worker. It
//! moves from pending to either resolved (quorum met, or first reply for
//! single-target requests) or timed out (deadline passed). Both transitions
//! remove the entry from [`PendingRequests`] before the result is sent, so a
//! request resolves at most once and any later reply finds nothing to update.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::{RequestBody, ResponseBody, ResponseEnvelope};
use crate::registry::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Clients,
    ClientRooms,
    AllRooms,
    RemoteJoin,
    RemoteLeave,
    RemoteDisconnect,
    Custom,
}

impl RequestKind {
    /// Fan-in requests wait for every node; the others need one owner to reply.
    pub fn is_fan_in(self) -> bool {
        matches!(
            self,
            RequestKind::Clients | RequestKind::AllRooms | RequestKind::Custom
        )
    }

    pub fn of_request(body: &RequestBody) -> Option<Self> {
        Some(match body {
            RequestBody::Clients { .. } => RequestKind::Clients,
            RequestBody::ClientRooms { .. } => RequestKind::ClientRooms,
            RequestBody::AllRooms => RequestKind::AllRooms,
            RequestBody::RemoteJoin { .. } => RequestKind::RemoteJoin,
            RequestBody::RemoteLeave { .. } => RequestKind::RemoteLeave,
            RequestBody::RemoteDisconnect { .. } => RequestKind::RemoteDisconnect,
            RequestBody::Custom { .. } => RequestKind::Custom,
            RequestBody::Unknown => return None,
        })
    }

    pub fn of_response(body: &ResponseBody) -> Option<Self> {
        Some(match body {
            ResponseBody::Clients { .. } => RequestKind::Clients,
            ResponseBody::ClientRooms { .. } => RequestKind::ClientRooms,
            ResponseBody::AllRooms { .. } => RequestKind::AllRooms,
            ResponseBody::RemoteJoin => RequestKind::RemoteJoin,
            ResponseBody::RemoteLeave => RequestKind::RemoteLeave,
            ResponseBody::RemoteDisconnect => RequestKind::RemoteDisconnect,
            ResponseBody::Custom { .. } => RequestKind::Custom,
            ResponseBody::Unknown => return None,
        })
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Clients => "clients",
            RequestKind::ClientRooms => "client_rooms",
            RequestKind::AllRooms => "all_rooms",
            RequestKind::RemoteJoin => "remote_join",
            RequestKind::RemoteLeave => "remote_leave",
            RequestKind::RemoteDisconnect => "remote_disconnect",
            RequestKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Replies folded so far.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Names(BTreeSet<String>),
    ClientRooms(Option<Vec<String>>),
    Ack,
    Custom(Vec<serde_json::Value>),
}

impl Accumulator {
    pub fn empty(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Clients | RequestKind::AllRooms => Accumulator::Names(BTreeSet::new()),
            RequestKind::ClientRooms => Accumulator::ClientRooms(None),
            RequestKind::RemoteJoin | RequestKind::RemoteLeave | RequestKind::RemoteDisconnect => {
                Accumulator::Ack
            }
            RequestKind::Custom => Accumulator::Custom(Vec::new()),
        }
    }

    pub fn into_names(self) -> BTreeSet<String> {
        match self {
            Accumulator::Names(names) => names,
            Accumulator::ClientRooms(rooms) => rooms.unwrap_or_default().into_iter().collect(),
            Accumulator::Ack | Accumulator::Custom(_) => BTreeSet::new(),
        }
    }

    pub fn into_rooms(self) -> Vec<String> {
        match self {
            Accumulator::ClientRooms(rooms) => rooms.unwrap_or_default(),
            other => other.into_names().into_iter().collect(),
        }
    }

    pub fn into_custom(self) -> Vec<serde_json::Value> {
        match self {
            Accumulator::Custom(replies) => replies,
            _ => Vec::new(),
        }
    }

    /// Folds one reply in. Returns `false` when the reply does not fit.
    fn fold(&mut self, body: ResponseBody) -> bool {
        match (self, body) {
            (Accumulator::Names(names), ResponseBody::Clients { clients }) => {
                names.extend(clients);
                true
            }
            (Accumulator::Names(names), ResponseBody::AllRooms { rooms }) => {
                names.extend(rooms);
                true
            }
            (Accumulator::ClientRooms(slot), ResponseBody::ClientRooms { rooms }) => {
                if slot.is_none() {
                    *slot = Some(rooms);
                }
                true
            }
            (
                Accumulator::Ack,
                ResponseBody::RemoteJoin
                | ResponseBody::RemoteLeave
                | ResponseBody::RemoteDisconnect,
            ) => true,
            (Accumulator::Custom(replies), ResponseBody::Custom { data }) => {
                replies.push(data);
                true
            }
            _ => false,
        }
    }
}

/// Final state of a request, handed to the waiting caller.
#[derive(Debug)]
pub struct Resolution {
    pub accumulator: Accumulator,
    pub timed_out: bool,
    pub received: usize,
    pub expected: usize,
}

/// A request as submitted by a caller, before the worker sizes its quorum.
pub struct NewRequest {
    pub id: String,
    pub kind: RequestKind,
    /// Local contribution already folded in.
    pub seed: Accumulator,
    /// Replies already counted, 1 when the local node answered in-process.
    pub received: usize,
    pub timeout: Duration,
    pub respond_to: oneshot::Sender<Resolution>,
}

pub struct PendingRequest {
    id: String,
    kind: RequestKind,
    created_at: Instant,
    deadline: Instant,
    expected: usize,
    received: usize,
    responders: HashSet<NodeId>,
    accumulator: Accumulator,
    respond_to: oneshot::Sender<Resolution>,
}

impl PendingRequest {
    pub fn new(request: NewRequest, expected: usize, now: Instant) -> Self {
        let expected = if request.kind.is_fan_in() { expected } else { 1 };
        Self {
            id: request.id,
            kind: request.kind,
            created_at: now,
            deadline: now + request.timeout,
            expected,
            received: request.received,
            responders: HashSet::new(),
            accumulator: request.seed,
            respond_to: request.respond_to,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    fn is_complete(&self) -> bool {
        self.received >= self.expected
    }

    fn resolve(self, timed_out: bool) {
        let elapsed = self.created_at.elapsed();
        debug!(
            request_id = %self.id,
            kind = %self.kind,
            received = self.received,
            expected = self.expected,
            timed_out,
            ?elapsed,
            "request resolved"
        );
        // The caller may have given up; nothing else to do then.
        let _ = self.respond_to.send(Resolution {
            accumulator: self.accumulator,
            timed_out,
            received: self.received,
            expected: self.expected,
        });
    }
}

/// What happened to an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// No pending request with that id: late, duplicate, or someone else's.
    Unmatched,
    /// Same peer already answered this request.
    Duplicate,
    /// Reply shape does not belong to the pending request.
    Mismatched,
    Accepted,
    Resolved,
}

#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Tracks a request. Returns `false` when it was already complete and
    /// has been resolved on the spot.
    pub fn insert(&mut self, pending: PendingRequest) -> bool {
        if pending.is_complete() {
            pending.resolve(false);
            return false;
        }
        if let Some(previous) = self.entries.insert(pending.id.clone(), pending) {
            warn!(request_id = %previous.id, "request id reused; dropping older request");
        }
        true
    }

    /// Forgets a request without resolving it. Its caller sees a closed channel.
    pub fn cancel(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn on_response(&mut self, envelope: ResponseEnvelope) -> ResponseOutcome {
        let Some(pending) = self.entries.get_mut(&envelope.request_id) else {
            trace!(request_id = %envelope.request_id, "ignore response without pending request");
            return ResponseOutcome::Unmatched;
        };

        if RequestKind::of_response(&envelope.body) != Some(pending.kind) {
            warn!(
                request_id = %envelope.request_id,
                kind = %pending.kind,
                "ignore response of a different type"
            );
            return ResponseOutcome::Mismatched;
        }

        if let Some(node) = envelope.node {
            if !pending.responders.insert(node) {
                debug!(request_id = %envelope.request_id, "ignore repeated response from node");
                return ResponseOutcome::Duplicate;
            }
        }

        if !pending.accumulator.fold(envelope.body) {
            return ResponseOutcome::Mismatched;
        }
        pending.received += 1;

        if !pending.is_complete() {
            return ResponseOutcome::Accepted;
        }
        match self.entries.remove(&envelope.request_id) {
            Some(done) => {
                done.resolve(false);
                ResponseOutcome::Resolved
            }
            None => ResponseOutcome::Unmatched,
        }
    }

    /// Earliest deadline among pending requests, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(PendingRequest::deadline).min()
    }

    /// Resolves every request whose deadline has passed. Returns how many.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|pending| pending.deadline <= now)
            .map(|pending| pending.id.clone())
            .collect();
        for id in &expired {
            if let Some(pending) = self.entries.remove(id) {
                pending.resolve(true);
            }
        }
        expired.len()
    }

    /// Drops every pending request; their callers observe the node closing.
    pub fn close(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
