//! Local room bookkeeping for the connections hosted by this process.
//!
//! The cluster adapter composes against [`LocalRooms`] rather than owning
//! connection state itself. [`InMemoryRooms`] is a complete implementation in
//! which every connected socket receives its packets on an unbounded channel.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::codec::{BroadcastOptions, Packet};

/// Room membership and in-process delivery for one namespace on one node.
pub trait LocalRooms: Send + Sync + 'static {
    fn add_all(&self, id: &str, rooms: &[String]);

    fn del(&self, id: &str, room: &str);

    fn del_all(&self, id: &str);

    /// Whether `id` is a connection hosted by this process.
    fn has_client(&self, id: &str) -> bool;

    fn has_room(&self, room: &str) -> bool;

    fn rooms(&self) -> BTreeSet<String>;

    fn client_rooms(&self, id: &str) -> Option<BTreeSet<String>>;

    /// Connections in any of `rooms`, or every connection when `rooms` is empty.
    fn clients(&self, rooms: &[String]) -> BTreeSet<String>;

    /// Delivers `packet` to the matching local connections only.
    fn broadcast(&self, packet: &Packet, options: &BroadcastOptions);

    /// Forcefully disconnects a local connection.
    fn disconnect(&self, id: &str, close: bool);
}

/// What a connected socket observes.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Packet(Packet),
    Disconnected { close: bool },
}

#[derive(Default)]
struct RoomState {
    rooms: HashMap<String, HashSet<String>>,
    sids: HashMap<String, HashSet<String>>,
    sockets: HashMap<String, mpsc::UnboundedSender<SocketEvent>>,
}

impl RoomState {
    fn leave(&mut self, id: &str, room: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
        if let Some(joined) = self.sids.get_mut(id) {
            joined.remove(room);
        }
    }

    fn leave_all(&mut self, id: &str) {
        let Some(joined) = self.sids.remove(id) else {
            return;
        };
        for room in joined {
            if let Some(members) = self.rooms.get_mut(&room) {
                members.remove(id);
                if members.is_empty() {
                    self.rooms.remove(&room);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct InMemoryRooms {
    state: Mutex<RoomState>,
}

impl InMemoryRooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a local connection and returns the receiving end of its inbox.
    pub fn connect(&self, id: &str) -> mpsc::UnboundedReceiver<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.sockets.insert(id.to_string(), tx);
        state.sids.entry(id.to_string()).or_default();
        rx
    }

    pub fn connected(&self) -> usize {
        self.state.lock().sockets.len()
    }
}

impl LocalRooms for InMemoryRooms {
    fn add_all(&self, id: &str, rooms: &[String]) {
        let mut state = self.state.lock();
        for room in rooms {
            state
                .rooms
                .entry(room.clone())
                .or_default()
                .insert(id.to_string());
            state
                .sids
                .entry(id.to_string())
                .or_default()
                .insert(room.clone());
        }
    }

    fn del(&self, id: &str, room: &str) {
        self.state.lock().leave(id, room);
    }

    fn del_all(&self, id: &str) {
        self.state.lock().leave_all(id);
    }

    fn has_client(&self, id: &str) -> bool {
        let state = self.state.lock();
        state.sockets.contains_key(id) || state.sids.contains_key(id)
    }

    fn has_room(&self, room: &str) -> bool {
        self.state.lock().rooms.contains_key(room)
    }

    fn rooms(&self) -> BTreeSet<String> {
        self.state.lock().rooms.keys().cloned().collect()
    }

    fn client_rooms(&self, id: &str) -> Option<BTreeSet<String>> {
        self.state
            .lock()
            .sids
            .get(id)
            .map(|rooms| rooms.iter().cloned().collect())
    }

    fn clients(&self, rooms: &[String]) -> BTreeSet<String> {
        let state = self.state.lock();
        if rooms.is_empty() {
            return state.sids.keys().cloned().collect();
        }
        rooms
            .iter()
            .filter_map(|room| state.rooms.get(room))
            .flatten()
            .cloned()
            .collect()
    }

    fn broadcast(&self, packet: &Packet, options: &BroadcastOptions) {
        let state = self.state.lock();
        let targets: BTreeSet<&String> = if options.rooms.is_empty() {
            state.sockets.keys().collect()
        } else {
            options
                .rooms
                .iter()
                .filter_map(|room| state.rooms.get(room))
                .flatten()
                .collect()
        };

        let mut delivered = 0usize;
        for id in targets {
            if options.except.contains(id) {
                continue;
            }
            if let Some(socket) = state.sockets.get(id) {
                if socket.send(SocketEvent::Packet(packet.clone())).is_ok() {
                    delivered += 1;
                }
            }
        }
        trace!(delivered, rooms = ?options.rooms, "local broadcast");
    }

    fn disconnect(&self, id: &str, close: bool) {
        let mut state = self.state.lock();
        state.leave_all(id);
        if let Some(socket) = state.sockets.remove(id) {
            let _ = socket.send(SocketEvent::Disconnected { close });
            debug!(sid = id, close, "socket disconnected");
        }
    }
}
