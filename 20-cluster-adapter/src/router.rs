//! Broadcast relay between the local room layer and the shared log.
//!
//! Outbound, a local broadcast becomes a record on the namespace channel, or
//! on the room channel when exactly one room is targeted. Inbound, a data
//! record passes a fixed sequence of guards and stops at the first one that
//! fails:
//!
//! 1. the payload decodes
//! 2. the origin is not this node (the log echoes every append back)
//! 3. a room suffix, if present, names a room this node tracks
//! 4. the packet namespace, `/` when absent, is this namespace
//!
//! A record that passes is handed to local delivery only, never re-published.

use tracing::{debug, warn};

use crate::channel::{ChannelNames, Purpose};
use crate::codec::{decode_broadcast, encode_broadcast, BroadcastOptions, CodecError, Packet};
use crate::registry::NodeId;
use crate::rooms::LocalRooms;
use crate::transport::Record;

/// Namespace assumed for packets published without one.
pub const ROOT_NAMESPACE: &str = "/";

/// Why an inbound data record was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    DifferentChannel,
    Malformed,
    OwnOrigin,
    UnknownRoom,
    DifferentNamespace,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Relay {
    Deliver {
        packet: Packet,
        options: BroadcastOptions,
    },
    Skip(Skip),
}

/// Builds the record for a local broadcast, or `None` for local-only ones.
pub fn outbound(
    names: &ChannelNames,
    local: &NodeId,
    packet: &Packet,
    options: &BroadcastOptions,
) -> Result<Option<Record>, CodecError> {
    if options.flags.local {
        return Ok(None);
    }
    let room = match options.rooms.as_slice() {
        [room] => Some(room.as_str()),
        _ => None,
    };
    let channel = names.for_purpose(Purpose::Data, room);
    let payload = encode_broadcast(local, packet, options)?;
    debug!(%channel, "publishing broadcast");
    Ok(Some(Record::new(channel, payload)))
}

/// Runs the inbound guard sequence for a data record.
pub fn inbound(
    names: &ChannelNames,
    rooms: &dyn LocalRooms,
    local: &NodeId,
    record: &Record,
) -> Relay {
    let Some(room) = names.room_of(&record.channel) else {
        debug!(channel = %record.channel, "ignore different channel");
        return Relay::Skip(Skip::DifferentChannel);
    };

    let envelope = match decode_broadcast(&record.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(channel = %record.channel, error = %err, "dropping malformed broadcast");
            return Relay::Skip(Skip::Malformed);
        }
    };

    if envelope.origin == *local {
        debug!("ignore same uid");
        return Relay::Skip(Skip::OwnOrigin);
    }

    if let Some(room) = room {
        if !rooms.has_room(room) {
            debug!(room, "ignore unknown room");
            return Relay::Skip(Skip::UnknownRoom);
        }
    }

    let mut packet = envelope.packet;
    let nsp = packet.nsp.get_or_insert_with(|| ROOT_NAMESPACE.to_string());
    if nsp.as_str() != names.namespace() {
        debug!(nsp = %nsp, "ignore different namespace");
        return Relay::Skip(Skip::DifferentNamespace);
    }

    Relay::Deliver {
        packet,
        options: envelope.options,
    }
}

/// Applies [`inbound`] and performs the local delivery when it passes.
pub fn relay(
    names: &ChannelNames,
    rooms: &dyn LocalRooms,
    local: &NodeId,
    record: &Record,
) -> Option<Skip> {
    match inbound(names, rooms, local, record) {
        Relay::Deliver { packet, options } => {
            rooms.broadcast(&packet, &options);
            None
        }
        Relay::Skip(reason) => Some(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::rooms::InMemoryRooms;

    fn setup() -> (ChannelNames, InMemoryRooms, NodeId) {
        let rooms = InMemoryRooms::new();
        rooms.add_all("sid-1", &["lobby".to_string()]);
        (
            ChannelNames::new("socket.io", "/"),
            rooms,
            NodeId::from("local"),
        )
    }

    fn remote_record(channel: String, packet: &Packet, options: &BroadcastOptions) -> Record {
        let payload =
            encode_broadcast(&NodeId::from("remote"), packet, options).expect("encode");
        Record::new(channel, payload)
    }

    #[test]
    fn single_room_uses_room_channel() {
        let (names, _, local) = setup();
        let packet = Packet::event("chat", [Value::from("hi")]);

        let record = outbound(&names, &local, &packet, &BroadcastOptions::to_room("lobby"))
            .expect("encode")
            .expect("record");
        assert_eq!(record.channel, "socket.io#/#lobby#");

        let options = BroadcastOptions::to_room("a").to("b");
        let record = outbound(&names, &local, &packet, &options)
            .expect("encode")
            .expect("record");
        assert_eq!(record.channel, "socket.io#/#");
    }

    #[test]
    fn local_flag_skips_the_log() {
        let (names, _, local) = setup();
        let packet = Packet::event("chat", []);
        let options = BroadcastOptions::default().local();
        assert_eq!(outbound(&names, &local, &packet, &options).expect("encode"), None);
    }

    #[test]
    fn own_records_are_suppressed() {
        let (names, rooms, local) = setup();
        let packet = Packet::event("chat", [Value::from(vec![1u8, 2, 3])]);
        let record = outbound(&names, &local, &packet, &BroadcastOptions::default())
            .expect("encode")
            .expect("record");
        assert_eq!(
            inbound(&names, &rooms, &local, &record),
            Relay::Skip(Skip::OwnOrigin)
        );
    }

    #[test]
    fn unknown_room_is_dropped() {
        let (names, rooms, local) = setup();
        let packet = Packet::event("chat", []);
        let options = BroadcastOptions::to_room("attic");
        let record = remote_record(names.room("attic"), &packet, &options);
        assert_eq!(
            inbound(&names, &rooms, &local, &record),
            Relay::Skip(Skip::UnknownRoom)
        );
    }

    #[test]
    fn missing_namespace_defaults_to_root() {
        let (names, rooms, local) = setup();
        let packet = Packet::event("chat", []);
        let options = BroadcastOptions::to_room("lobby");
        let record = remote_record(names.room("lobby"), &packet, &options);

        match inbound(&names, &rooms, &local, &record) {
            Relay::Deliver { packet, options } => {
                assert_eq!(packet.nsp.as_deref(), Some("/"));
                assert_eq!(options.rooms, vec!["lobby".to_string()]);
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn foreign_namespace_is_dropped() {
        let (names, rooms, local) = setup();
        let mut packet = Packet::event("chat", []);
        packet.nsp = Some("/admin".into());
        let record = remote_record(names.data().to_string(), &packet, &BroadcastOptions::default());
        assert_eq!(
            inbound(&names, &rooms, &local, &record),
            Relay::Skip(Skip::DifferentNamespace)
        );
    }

    #[test]
    fn garbage_payload_is_dropped() {
        let (names, rooms, local) = setup();
        let record = Record::new(names.data(), vec![0xff, 0x00, 0x01]);
        assert_eq!(
            inbound(&names, &rooms, &local, &record),
            Relay::Skip(Skip::Malformed)
        );
    }

    #[test]
    fn other_channels_are_not_data() {
        let (names, rooms, local) = setup();
        let record = Record::new("socket.io#/chat#", Vec::<u8>::new());
        assert_eq!(
            inbound(&names, &rooms, &local, &record),
            Relay::Skip(Skip::DifferentChannel)
        );
    }
}
