//! Per-namespace adapter: the surface a socket server talks to.
//!
//! An [`Adapter`] pairs one namespace with its local room layer and a handle
//! to the node running the shared subscription. Broadcasts are delivered
//! locally and published to the log. Cluster queries answer from local state
//! when they can and otherwise scatter a request to every node, gathering the
//! replies until the quorum is met or the request times out.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use nanoid::nanoid;
use tokio::sync::oneshot;
use tracing::debug;

use crate::channel::ChannelNames;
use crate::codec::{encode_control, BroadcastOptions, Packet, RequestBody, RequestEnvelope};
use crate::coordinator::{Accumulator, NewRequest, RequestKind, Resolution};
use crate::error::{AdapterError, RequestError};
use crate::rooms::LocalRooms;
use crate::router;
use crate::runtime::NodeHandle;
use crate::transport::Record;

/// Answers application-defined requests from peers.
#[async_trait]
pub trait CustomHandler: Send + Sync + 'static {
    async fn handle(&self, data: serde_json::Value) -> serde_json::Value;
}

/// Adapts a plain closure into a [`CustomHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F> CustomHandler for HandlerFn<F>
where
    F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
{
    async fn handle(&self, data: serde_json::Value) -> serde_json::Value {
        (self.0)(data)
    }
}

#[derive(Clone)]
pub struct Adapter {
    node: NodeHandle,
    names: ChannelNames,
    rooms: Arc<dyn LocalRooms>,
    handler: Option<Arc<dyn CustomHandler>>,
}

impl Adapter {
    pub(crate) fn new(
        node: NodeHandle,
        names: ChannelNames,
        rooms: Arc<dyn LocalRooms>,
        handler: Option<Arc<dyn CustomHandler>>,
    ) -> Self {
        Self {
            node,
            names,
            rooms,
            handler,
        }
    }

    pub fn namespace(&self) -> &str {
        self.names.namespace()
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.names
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    pub fn join(&self, id: &str, rooms: &[String]) {
        self.rooms.add_all(id, rooms);
    }

    pub fn leave(&self, id: &str, room: &str) {
        self.rooms.del(id, room);
    }

    pub fn leave_all(&self, id: &str) {
        self.rooms.del_all(id);
    }

    /// Rooms known on this node only.
    pub fn local_rooms(&self) -> BTreeSet<String> {
        self.rooms.rooms()
    }

    /// Delivers `packet` to matching local connections, then publishes it so
    /// every other node delivers it to theirs.
    pub async fn broadcast(
        &self,
        mut packet: Packet,
        options: BroadcastOptions,
    ) -> Result<(), AdapterError> {
        packet.nsp = Some(self.names.namespace().to_string());
        let record = router::outbound(&self.names, self.node.id(), &packet, &options)?;
        self.rooms.broadcast(&packet, &options);
        if let Some(record) = record {
            self.node.transport().append(record).await?;
        }
        Ok(())
    }

    /// Every connection in any of `rooms` across the cluster, or every
    /// connection when `rooms` is empty.
    pub async fn clients(
        &self,
        rooms: &[String],
    ) -> Result<BTreeSet<String>, RequestError<BTreeSet<String>>> {
        let local = self.rooms.clients(rooms);
        self.scatter(
            RequestKind::Clients,
            RequestBody::Clients {
                rooms: rooms.to_vec(),
            },
            Accumulator::Names(local),
            1,
            Accumulator::into_names,
        )
        .await
    }

    /// Rooms joined by connection `id`, wherever it is hosted.
    pub async fn client_rooms(&self, id: &str) -> Result<Vec<String>, RequestError<Vec<String>>> {
        if let Some(rooms) = self.rooms.client_rooms(id) {
            return Ok(rooms.into_iter().collect());
        }
        self.scatter(
            RequestKind::ClientRooms,
            RequestBody::ClientRooms { sid: id.to_string() },
            Accumulator::empty(RequestKind::ClientRooms),
            0,
            Accumulator::into_rooms,
        )
        .await
    }

    /// Union of the rooms known on every node.
    pub async fn all_rooms(&self) -> Result<BTreeSet<String>, RequestError<BTreeSet<String>>> {
        self.scatter(
            RequestKind::AllRooms,
            RequestBody::AllRooms,
            Accumulator::Names(self.rooms.rooms()),
            1,
            Accumulator::into_names,
        )
        .await
    }

    /// Makes connection `id` join `room` on whichever node hosts it.
    pub async fn remote_join(&self, id: &str, room: &str) -> Result<(), RequestError<()>> {
        if self.rooms.has_client(id) {
            self.rooms.add_all(id, &[room.to_string()]);
            return Ok(());
        }
        self.scatter(
            RequestKind::RemoteJoin,
            RequestBody::RemoteJoin {
                sid: id.to_string(),
                room: room.to_string(),
            },
            Accumulator::empty(RequestKind::RemoteJoin),
            0,
            |_| (),
        )
        .await
    }

    pub async fn remote_leave(&self, id: &str, room: &str) -> Result<(), RequestError<()>> {
        if self.rooms.has_client(id) {
            self.rooms.del(id, room);
            return Ok(());
        }
        self.scatter(
            RequestKind::RemoteLeave,
            RequestBody::RemoteLeave {
                sid: id.to_string(),
                room: room.to_string(),
            },
            Accumulator::empty(RequestKind::RemoteLeave),
            0,
            |_| (),
        )
        .await
    }

    pub async fn remote_disconnect(&self, id: &str, close: bool) -> Result<(), RequestError<()>> {
        if self.rooms.has_client(id) {
            self.rooms.disconnect(id, close);
            return Ok(());
        }
        self.scatter(
            RequestKind::RemoteDisconnect,
            RequestBody::RemoteDisconnect {
                sid: id.to_string(),
                close,
            },
            Accumulator::empty(RequestKind::RemoteDisconnect),
            0,
            |_| (),
        )
        .await
    }

    /// Sends `data` to every node's custom handler and collects the replies,
    /// this node's own answer first.
    pub async fn custom_request(
        &self,
        data: serde_json::Value,
    ) -> Result<Vec<serde_json::Value>, RequestError<Vec<serde_json::Value>>> {
        let local = match &self.handler {
            Some(handler) => handler.handle(data.clone()).await,
            None => serde_json::Value::Null,
        };
        self.scatter(
            RequestKind::Custom,
            RequestBody::Custom { data },
            Accumulator::Custom(vec![local]),
            1,
            Accumulator::into_custom,
        )
        .await
    }

    /// Registers a request with the worker, publishes it and waits for the
    /// worker to resolve it.
    async fn scatter<T>(
        &self,
        kind: RequestKind,
        body: RequestBody,
        seed: Accumulator,
        received: usize,
        finish: impl FnOnce(Accumulator) -> T,
    ) -> Result<T, RequestError<T>> {
        let request_id = nanoid!();
        let payload = encode_control(&RequestEnvelope {
            request_id: request_id.clone(),
            origin: Some(self.node.id().clone()),
            body,
        })?;

        let (respond_to, resolved) = oneshot::channel();
        let waiting = self
            .node
            .register(NewRequest {
                id: request_id.clone(),
                kind,
                seed,
                received,
                timeout: self.node.config().requests_timeout(),
                respond_to,
            })
            .await
            .map_err(|_| RequestError::Closed)?;

        if waiting {
            let record = Record::new(self.names.request(), payload);
            if let Err(err) = self.node.transport().append(record).await {
                self.node.cancel(&request_id).await;
                return Err(err.into());
            }
            debug!(%request_id, %kind, "request published");
        }

        let Resolution {
            accumulator,
            timed_out,
            received,
            expected,
        } = resolved.await.map_err(|_| RequestError::Closed)?;
        let value = finish(accumulator);
        if timed_out {
            Err(RequestError::Timeout {
                partial: value,
                received,
                expected,
            })
        } else {
            Ok(value)
        }
    }
}
