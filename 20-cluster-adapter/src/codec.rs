//! Wire formats for records in the shared log.
//!
//! Broadcasts are encoded as a compact bincode 3-tuple
//! `(origin, packet, options)`. Packet data is a self-describing [`Value`]
//! tree so nested payloads, including binary fields, survive the trip.
//!
//! Control traffic (requests, responses, presence) is JSON so it stays
//! readable when someone inspects the log directly.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::NodeId;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed broadcast envelope: {0}")]
    Broadcast(#[from] bincode::Error),
    #[error("malformed control envelope: {0}")]
    Control(#[from] serde_json::Error),
}

/// Structured packet payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(value))
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PacketKind {
    Connect,
    Disconnect,
    #[default]
    Event,
    Ack,
    ConnectError,
    BinaryEvent,
    BinaryAck,
}

/// A packet as handed to the broadcast path.
///
/// `nsp` is stamped by the publishing adapter; receivers treat a missing
/// value as the root namespace.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketKind,
    pub nsp: Option<String>,
    pub data: Value,
    pub id: Option<u64>,
}

impl Packet {
    /// Builds an event packet whose data is `[name, args...]`.
    pub fn event<I>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        let mut data = vec![Value::from(name)];
        data.extend(args);
        Self {
            kind: PacketKind::Event,
            nsp: None,
            data: Value::Array(data),
            id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BroadcastFlags {
    /// Deliver on this node only; never append to the log.
    pub local: bool,
    pub volatile: bool,
    pub compress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BroadcastOptions {
    /// Target rooms. Empty means every connection in the namespace.
    pub rooms: Vec<String>,
    /// Socket ids excluded from delivery.
    pub except: Vec<String>,
    pub flags: BroadcastFlags,
}

impl BroadcastOptions {
    pub fn to_room(room: impl Into<String>) -> Self {
        Self::default().to(room)
    }

    pub fn to(mut self, room: impl Into<String>) -> Self {
        self.rooms.push(room.into());
        self
    }

    pub fn except(mut self, id: impl Into<String>) -> Self {
        self.except.push(id.into());
        self
    }

    pub fn local(mut self) -> Self {
        self.flags.local = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEnvelope {
    pub origin: NodeId,
    pub packet: Packet,
    pub options: BroadcastOptions,
}

pub fn encode_broadcast(
    origin: &NodeId,
    packet: &Packet,
    options: &BroadcastOptions,
) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(bincode::serialize(&(origin, packet, options))?))
}

pub fn decode_broadcast(bytes: &[u8]) -> Result<BroadcastEnvelope, CodecError> {
    let (origin, packet, options): (NodeId, Packet, BroadcastOptions) =
        bincode::deserialize(bytes)?;
    Ok(BroadcastEnvelope {
        origin,
        packet,
        options,
    })
}

/// A cluster-wide request, appended to the request channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: String,
    /// Requesting node, so it never answers its own request echoed back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<NodeId>,
    #[serde(flatten)]
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    Clients {
        #[serde(default)]
        rooms: Vec<String>,
    },
    ClientRooms {
        sid: String,
    },
    AllRooms,
    RemoteJoin {
        sid: String,
        room: String,
    },
    RemoteLeave {
        sid: String,
        room: String,
    },
    RemoteDisconnect {
        sid: String,
        #[serde(default)]
        close: bool,
    },
    Custom {
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Any type tag this node does not understand.
    #[serde(other)]
    Unknown,
}

/// A reply to a [`RequestEnvelope`], appended to the response channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub request_id: String,
    /// Replying node, used to ignore repeated replies from the same peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    Clients {
        #[serde(default)]
        clients: Vec<String>,
    },
    ClientRooms {
        #[serde(default)]
        rooms: Vec<String>,
    },
    AllRooms {
        #[serde(default)]
        rooms: Vec<String>,
    },
    RemoteJoin,
    RemoteLeave,
    RemoteDisconnect,
    Custom {
        #[serde(default)]
        data: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

pub fn encode_control<T: Serialize>(message: &T) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode_control<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_packet() -> Packet {
        Packet {
            kind: PacketKind::BinaryEvent,
            nsp: Some("/chat".into()),
            data: Value::Array(vec![
                Value::from("upload"),
                Value::map([
                    ("name", Value::from("avatar.png")),
                    ("size", Value::Int(3)),
                    ("ratio", Value::Float(0.5)),
                    ("blob", Value::from(vec![0u8, 159, 255])),
                    ("tags", Value::Array(vec![Value::Null, Value::Bool(true)])),
                ]),
            ]),
            id: Some(7),
        }
    }

    #[test]
    fn broadcast_envelope_keeps_binary_and_nesting() {
        let origin = NodeId::from("n1");
        let packet = nested_packet();
        let options = BroadcastOptions::to_room("lobby").except("sid-1");

        let bytes = encode_broadcast(&origin, &packet, &options).expect("encode");
        let envelope = decode_broadcast(&bytes).expect("decode");

        assert_eq!(envelope.origin, origin);
        assert_eq!(envelope.packet, packet);
        assert_eq!(envelope.options, options);
    }

    #[test]
    fn truncated_broadcast_is_an_error() {
        let bytes = encode_broadcast(
            &NodeId::from("n1"),
            &nested_packet(),
            &BroadcastOptions::default(),
        )
        .expect("encode");
        let result = decode_broadcast(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(CodecError::Broadcast(_))));
    }

    #[test]
    fn every_request_shape_survives_json() {
        let bodies = vec![
            RequestBody::Clients {
                rooms: vec!["a".into(), "b".into()],
            },
            RequestBody::ClientRooms { sid: "sid-1".into() },
            RequestBody::AllRooms,
            RequestBody::RemoteJoin {
                sid: "sid-1".into(),
                room: "vip".into(),
            },
            RequestBody::RemoteLeave {
                sid: "sid-1".into(),
                room: "vip".into(),
            },
            RequestBody::RemoteDisconnect {
                sid: "sid-1".into(),
                close: true,
            },
            RequestBody::Custom {
                data: serde_json::json!({ "op": "count" }),
            },
        ];
        for body in bodies {
            let envelope = RequestEnvelope {
                request_id: "req-1".into(),
                origin: Some(NodeId::from("n1")),
                body,
            };
            let bytes = encode_control(&envelope).expect("encode");
            let back: RequestEnvelope = decode_control(&bytes).expect("decode");
            assert_eq!(back, envelope);
        }
    }

    #[test]
    fn every_response_shape_survives_json() {
        let bodies = vec![
            ResponseBody::Clients {
                clients: vec!["sid-1".into()],
            },
            ResponseBody::ClientRooms {
                rooms: vec!["a".into()],
            },
            ResponseBody::AllRooms {
                rooms: vec!["a".into(), "b".into()],
            },
            ResponseBody::RemoteJoin,
            ResponseBody::RemoteLeave,
            ResponseBody::RemoteDisconnect,
            ResponseBody::Custom {
                data: serde_json::json!([1, 2, 3]),
            },
        ];
        for body in bodies {
            let envelope = ResponseEnvelope {
                request_id: "req-1".into(),
                node: Some(NodeId::from("n2")),
                body,
            };
            let bytes = encode_control(&envelope).expect("encode");
            let back: ResponseEnvelope = decode_control(&bytes).expect("decode");
            assert_eq!(back, envelope);
        }
    }

    #[test]
    fn control_wire_format_is_readable_json() {
        let envelope = RequestEnvelope {
            request_id: "req-9".into(),
            origin: None,
            body: RequestBody::AllRooms,
        };
        let bytes = encode_control(&envelope).expect("encode");
        let text = std::str::from_utf8(&bytes).expect("utf8");
        assert_eq!(text, r#"{"requestId":"req-9","type":"all_rooms"}"#);

        let envelope = RequestEnvelope {
            origin: Some(NodeId::from("n1")),
            ..envelope
        };
        let bytes = encode_control(&envelope).expect("encode");
        let text = std::str::from_utf8(&bytes).expect("utf8");
        assert_eq!(text, r#"{"requestId":"req-9","origin":"n1","type":"all_rooms"}"#);
    }

    #[test]
    fn absent_optional_fields_use_defaults() {
        let request: RequestEnvelope =
            decode_control(br#"{"requestId":"r","type":"clients"}"#).expect("decode");
        assert_eq!(request.origin, None);
        assert_eq!(request.body, RequestBody::Clients { rooms: Vec::new() });

        let request: RequestEnvelope =
            decode_control(br#"{"requestId":"r","type":"remote_disconnect","sid":"s"}"#)
                .expect("decode");
        assert_eq!(
            request.body,
            RequestBody::RemoteDisconnect {
                sid: "s".into(),
                close: false
            }
        );

        let response: ResponseEnvelope =
            decode_control(br#"{"requestId":"r","type":"all_rooms"}"#).expect("decode");
        assert_eq!(response.node, None);
        assert_eq!(response.body, ResponseBody::AllRooms { rooms: Vec::new() });
    }

    #[test]
    fn unknown_type_is_not_a_decode_error() {
        let request: RequestEnvelope =
            decode_control(br#"{"requestId":"r","type":"reboot_cluster"}"#).expect("decode");
        assert_eq!(request.body, RequestBody::Unknown);
    }

    #[test]
    fn garbage_control_payload_is_an_error() {
        let result = decode_control::<RequestEnvelope>(b"\x00not json");
        assert!(matches!(result, Err(CodecError::Control(_))));
    }
}
