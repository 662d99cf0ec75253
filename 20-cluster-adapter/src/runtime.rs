//! Worker runtime for one cluster node.
//!
//! A node is a single Tokio task, the [`Worker`], which owns everything that
//! changes as records arrive:
//!
//! - **Subscription**: the one log stream this node consumes, opened in
//!   [`spawn_node`] before anything else happens
//! - **Pending requests**: requests this node issued and is still waiting on
//! - **Registry**: the node ids currently believed active
//! - **Namespaces**: the attached namespaces with their local room layer
//!
//! Callers reach the worker through a [`NodeHandle`], which sends commands
//! over an mpsc channel and awaits a oneshot reply. Keeping a single owner
//! means no lock guards the pending map or the registry, and records are
//! handled strictly in log order.
//!
//! The worker never awaits I/O or user code while handling a record. Response
//! appends and custom handlers run on spawned tasks, and resolved requests
//! are handed back through their oneshot channel.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::adapter::{Adapter, CustomHandler};
use crate::channel::{is_valid_namespace, nodes_channel, ChannelNames, Purpose};
use crate::codec::{
    decode_control, encode_control, RequestBody, RequestEnvelope, ResponseBody, ResponseEnvelope,
};
use crate::config::AdapterConfig;
use crate::coordinator::{NewRequest, PendingRequest, PendingRequests, RequestKind};
use crate::error::AdapterError;
use crate::registry::{NodeId, NodeRegistry, Presence};
use crate::rooms::LocalRooms;
use crate::router;
use crate::transport::{LogTransport, Record, Subscription, TransportError};

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Non-fatal conditions reported to whoever listens on [`NodeHandle::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// The log subscription failed and has been torn down.
    TransportError(TransportError),
    /// The log subscription ended and has been torn down.
    SubscriptionEnded,
    /// A reply to a peer's request could not be appended.
    ResponseFailed {
        request_id: String,
        error: TransportError,
    },
    NodeJoined(NodeId),
    NodeLeft(NodeId),
}

/// An attached namespace as seen by the worker.
pub(crate) struct Namespace {
    pub(crate) names: ChannelNames,
    pub(crate) rooms: Arc<dyn LocalRooms>,
    pub(crate) handler: Option<Arc<dyn CustomHandler>>,
}

enum Command {
    Attach {
        namespace: Namespace,
        respond_to: oneshot::Sender<Result<(), AdapterError>>,
    },
    Register {
        request: NewRequest,
        respond_to: oneshot::Sender<bool>,
    },
    Cancel {
        request_id: String,
    },
    ActiveNodes {
        respond_to: oneshot::Sender<Vec<NodeId>>,
    },
    PendingCount {
        respond_to: oneshot::Sender<usize>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

struct Shared {
    id: NodeId,
    config: AdapterConfig,
    transport: Arc<dyn LogTransport>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<AdapterEvent>,
}

/// Cheap, cloneable handle to a running node.
///
/// The worker stops once [`NodeHandle::shutdown`] is called or the last
/// handle (including those held by adapters) is dropped.
#[derive(Clone)]
pub struct NodeHandle {
    shared: Arc<Shared>,
}

impl NodeHandle {
    pub fn id(&self) -> &NodeId {
        &self.shared.id
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.shared.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn LogTransport> {
        &self.shared.transport
    }

    pub fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.shared.events.subscribe()
    }

    /// Attaches a namespace backed by `rooms`. Custom requests from peers are
    /// answered with `null`.
    pub async fn attach(
        &self,
        namespace: &str,
        rooms: Arc<dyn LocalRooms>,
    ) -> Result<Adapter, AdapterError> {
        self.attach_inner(namespace, rooms, None).await
    }

    /// Attaches a namespace whose custom requests are answered by `handler`.
    pub async fn attach_with_handler(
        &self,
        namespace: &str,
        rooms: Arc<dyn LocalRooms>,
        handler: Arc<dyn CustomHandler>,
    ) -> Result<Adapter, AdapterError> {
        self.attach_inner(namespace, rooms, Some(handler)).await
    }

    async fn attach_inner(
        &self,
        namespace: &str,
        rooms: Arc<dyn LocalRooms>,
        handler: Option<Arc<dyn CustomHandler>>,
    ) -> Result<Adapter, AdapterError> {
        if !is_valid_namespace(namespace) {
            return Err(AdapterError::InvalidNamespace(namespace.to_string()));
        }
        let names = ChannelNames::new(&self.shared.config.key, namespace);
        let entry = Namespace {
            names: names.clone(),
            rooms: Arc::clone(&rooms),
            handler: handler.clone(),
        };
        self.call(|respond_to| Command::Attach {
            namespace: entry,
            respond_to,
        })
        .await??;
        Ok(Adapter::new(self.clone(), names, rooms, handler))
    }

    /// Node ids currently counted towards the quorum of fan-in requests.
    pub async fn active_nodes(&self) -> Result<Vec<NodeId>, AdapterError> {
        self.call(|respond_to| Command::ActiveNodes { respond_to })
            .await
    }

    /// Number of requests this node is still waiting on.
    pub async fn pending_requests(&self) -> Result<usize, AdapterError> {
        self.call(|respond_to| Command::PendingCount { respond_to })
            .await
    }

    /// Announces departure, drops pending requests and stops the worker.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), AdapterError> {
        match self.call(|respond_to| Command::Shutdown { respond_to }).await {
            Ok(()) | Err(AdapterError::Closed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Registers a request. Returns `false` when it resolved on the spot.
    pub(crate) async fn register(&self, request: NewRequest) -> Result<bool, AdapterError> {
        self.call(|respond_to| Command::Register {
            request,
            respond_to,
        })
        .await
    }

    pub(crate) async fn cancel(&self, request_id: &str) {
        let _ = self
            .shared
            .commands
            .send(Command::Cancel {
                request_id: request_id.to_string(),
            })
            .await;
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, AdapterError> {
        let (respond_to, response) = oneshot::channel();
        self.shared
            .commands
            .send(command(respond_to))
            .await
            .map_err(|_| AdapterError::Closed)?;
        response.await.map_err(|_| AdapterError::Closed)
    }
}

/// Starts a node: generates its id, subscribes to the log from now on and
/// spawns the worker.
pub async fn spawn_node(
    config: AdapterConfig,
    transport: Arc<dyn LogTransport>,
) -> Result<NodeHandle, AdapterError> {
    config.validate()?;
    let id = NodeId::generate();
    let subscription = transport.subscribe_from_now().await?;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let worker = Worker::new(
        id.clone(),
        config.clone(),
        Arc::clone(&transport),
        subscription,
        command_rx,
        event_tx.clone(),
    );
    tokio::spawn(worker.run());
    info!(node = %id, key = %config.key, "cluster node started");

    Ok(NodeHandle {
        shared: Arc::new(Shared {
            id,
            config,
            transport,
            commands: command_tx,
            events: event_tx,
        }),
    })
}

struct Worker {
    id: NodeId,
    config: AdapterConfig,
    nodes_channel: String,
    transport: Arc<dyn LogTransport>,
    subscription: Option<Subscription>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<AdapterEvent>,
    namespaces: HashMap<String, Namespace>,
    pending: PendingRequests,
    registry: NodeRegistry,
}

impl Worker {
    fn new(
        id: NodeId,
        config: AdapterConfig,
        transport: Arc<dyn LogTransport>,
        subscription: Subscription,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<AdapterEvent>,
    ) -> Self {
        Self {
            nodes_channel: nodes_channel(&config.key),
            registry: NodeRegistry::new(id.clone()),
            id,
            config,
            transport,
            subscription: Some(subscription),
            commands,
            events,
            namespaces: HashMap::new(),
            pending: PendingRequests::new(),
        }
    }

    /// Runs until shutdown or until every handle is dropped.
    ///
    /// Each iteration waits on whichever comes first: a command, the next
    /// record, the earliest request deadline or the heartbeat tick.
    async fn run(mut self) {
        self.registry.touch(self.id.clone(), Instant::now());
        self.announce(Presence::Join {
            node: self.id.clone(),
        });

        let mut heartbeat = self.config.heartbeat_interval().map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let deadline = self.pending.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { respond_to }) => {
                        self.shutdown().await;
                        let _ = respond_to.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                item = next_record(&mut self.subscription) => {
                    if !self.handle_stream_item(item) {
                        heartbeat = None;
                    }
                }
                _ = sleep_until(deadline) => {
                    let expired = self.pending.expire(Instant::now());
                    trace!(expired, "request deadlines passed");
                }
                _ = tick(&mut heartbeat) => self.on_heartbeat(),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Attach {
                namespace,
                respond_to,
            } => {
                let key = namespace.names.namespace().to_string();
                let result = if self.namespaces.contains_key(&key) {
                    Err(AdapterError::NamespaceTaken(key))
                } else {
                    info!(node = %self.id, namespace = %key, "namespace attached");
                    self.namespaces.insert(key, namespace);
                    Ok(())
                };
                let _ = respond_to.send(result);
            }
            Command::Register {
                request,
                respond_to,
            } => {
                self.prune_stale();
                let pending = PendingRequest::new(request, self.registry.quorum(), Instant::now());
                debug!(
                    request_id = %pending.id(),
                    kind = %pending.kind(),
                    expected = pending.expected(),
                    "request registered"
                );
                let waiting = self.pending.insert(pending);
                let _ = respond_to.send(waiting);
            }
            Command::Cancel { request_id } => {
                if self.pending.cancel(&request_id) {
                    debug!(%request_id, "request cancelled");
                }
            }
            Command::ActiveNodes { respond_to } => {
                self.prune_stale();
                let _ = respond_to.send(self.registry.ids());
            }
            Command::PendingCount { respond_to } => {
                let _ = respond_to.send(self.pending.len());
            }
            // Handled by the run loop, which has to await the departure notice.
            Command::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    /// Returns `false` once the subscription has been torn down.
    fn handle_stream_item(&mut self, item: Option<Result<Record, TransportError>>) -> bool {
        match item {
            Some(Ok(record)) => {
                self.on_record(record);
                true
            }
            Some(Err(error)) => {
                warn!(node = %self.id, %error, "log subscription failed; tearing it down");
                let _ = self.events.send(AdapterEvent::TransportError(error));
                self.teardown();
                false
            }
            None => {
                warn!(node = %self.id, "log subscription ended; tearing it down");
                let _ = self.events.send(AdapterEvent::SubscriptionEnded);
                self.teardown();
                false
            }
        }
    }

    /// Drops the subscription and tells peers to stop counting this node.
    /// Appends usually still work after the read side has failed.
    fn teardown(&mut self) {
        self.subscription = None;
        self.registry.remove(&self.id);
        self.announce(Presence::Leave {
            node: self.id.clone(),
        });
    }

    fn on_record(&mut self, record: Record) {
        if record.channel == self.nodes_channel {
            self.on_presence(&record);
            return;
        }

        let matched = self.namespaces.values().find_map(|namespace| {
            namespace
                .names
                .purpose_of(&record.channel)
                .map(|purpose| (namespace, purpose))
        });
        let Some((namespace, purpose)) = matched else {
            trace!(channel = %record.channel, "ignore different channel");
            return;
        };

        match purpose {
            Purpose::Data => {
                router::relay(&namespace.names, namespace.rooms.as_ref(), &self.id, &record);
            }
            Purpose::Request => self.on_request(namespace, &record),
            Purpose::Response => on_response(&mut self.pending, &record),
        }
    }

    fn on_request(&self, namespace: &Namespace, record: &Record) {
        let envelope: RequestEnvelope = match decode_control(&record.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(channel = %record.channel, error = %err, "dropping malformed request");
                return;
            }
        };
        let RequestEnvelope {
            request_id,
            origin,
            body,
        } = envelope;

        if origin.as_ref() == Some(&self.id) || self.pending.contains(&request_id) {
            trace!(%request_id, "ignore own request");
            return;
        }
        let Some(kind) = RequestKind::of_request(&body) else {
            warn!(%request_id, "ignore request of unknown type");
            return;
        };
        debug!(%request_id, %kind, "answering request");

        let rooms = namespace.rooms.as_ref();
        let reply = match body {
            RequestBody::Clients { rooms: wanted } => Some(ResponseBody::Clients {
                clients: rooms.clients(&wanted).into_iter().collect(),
            }),
            RequestBody::ClientRooms { sid } => {
                rooms
                    .client_rooms(&sid)
                    .map(|joined| ResponseBody::ClientRooms {
                        rooms: joined.into_iter().collect(),
                    })
            }
            RequestBody::AllRooms => Some(ResponseBody::AllRooms {
                rooms: rooms.rooms().into_iter().collect(),
            }),
            RequestBody::RemoteJoin { sid, room } => rooms.has_client(&sid).then(|| {
                rooms.add_all(&sid, &[room]);
                ResponseBody::RemoteJoin
            }),
            RequestBody::RemoteLeave { sid, room } => rooms.has_client(&sid).then(|| {
                rooms.del(&sid, &room);
                ResponseBody::RemoteLeave
            }),
            RequestBody::RemoteDisconnect { sid, close } => rooms.has_client(&sid).then(|| {
                rooms.disconnect(&sid, close);
                ResponseBody::RemoteDisconnect
            }),
            RequestBody::Custom { data } => {
                self.answer_custom(namespace, request_id, data);
                return;
            }
            RequestBody::Unknown => None,
        };

        match reply {
            Some(body) => {
                let envelope = ResponseEnvelope {
                    request_id,
                    node: Some(self.id.clone()),
                    body,
                };
                tokio::spawn(send_response(
                    Arc::clone(&self.transport),
                    self.events.clone(),
                    namespace.names.response().to_string(),
                    envelope,
                ));
            }
            None => trace!(%request_id, %kind, "target not hosted here; staying silent"),
        }
    }

    fn answer_custom(&self, namespace: &Namespace, request_id: String, data: serde_json::Value) {
        let handler = namespace.handler.clone();
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        let channel = namespace.names.response().to_string();
        let node = self.id.clone();

        tokio::spawn(async move {
            let data = match handler {
                Some(handler) => handler.handle(data).await,
                None => serde_json::Value::Null,
            };
            let envelope = ResponseEnvelope {
                request_id,
                node: Some(node),
                body: ResponseBody::Custom { data },
            };
            send_response(transport, events, channel, envelope).await;
        });
    }

    fn on_presence(&mut self, record: &Record) {
        let presence: Presence = match decode_control(&record.payload) {
            Ok(presence) => presence,
            Err(err) => {
                warn!(error = %err, "dropping malformed presence record");
                return;
            }
        };
        let node = presence.node().clone();
        if node == self.id {
            return;
        }

        let now = Instant::now();
        match presence {
            Presence::Join { .. } => {
                self.note_alive(node, now);
                self.announce(Presence::Present {
                    node: self.id.clone(),
                });
            }
            Presence::Present { .. } | Presence::Heartbeat { .. } => self.note_alive(node, now),
            Presence::Leave { .. } => {
                if self.registry.remove(&node) {
                    info!(node = %self.id, peer = %node, "node left");
                    let _ = self.events.send(AdapterEvent::NodeLeft(node));
                }
            }
        }
    }

    fn note_alive(&mut self, node: NodeId, now: Instant) {
        if self.registry.touch(node.clone(), now) {
            info!(node = %self.id, peer = %node, "node joined");
            let _ = self.events.send(AdapterEvent::NodeJoined(node));
        }
    }

    fn on_heartbeat(&mut self) {
        self.announce(Presence::Heartbeat {
            node: self.id.clone(),
        });
        self.prune_stale();
    }

    /// Drops peers that stopped heartbeating. Without heartbeats nothing is
    /// ever pruned and a crashed peer keeps counting towards the quorum.
    fn prune_stale(&mut self) {
        if self.config.heartbeat_interval().is_none() {
            return;
        }
        for peer in self.registry.prune(Instant::now(), self.config.node_timeout()) {
            warn!(node = %self.id, %peer, "dropping silent node");
            let _ = self.events.send(AdapterEvent::NodeLeft(peer));
        }
    }

    /// Appends a presence record without blocking the worker.
    fn announce(&self, presence: Presence) {
        let payload = match encode_control(&presence) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode presence");
                return;
            }
        };
        let transport = Arc::clone(&self.transport);
        let record = Record::new(self.nodes_channel.as_str(), payload);
        tokio::spawn(async move {
            if let Err(error) = transport.append(record).await {
                warn!(%error, "failed to announce presence");
            }
        });
    }

    async fn shutdown(&mut self) {
        if self.subscription.take().is_some() {
            let leave = Presence::Leave {
                node: self.id.clone(),
            };
            match encode_control(&leave) {
                Ok(payload) => {
                    let record = Record::new(self.nodes_channel.as_str(), payload);
                    if let Err(error) = self.transport.append(record).await {
                        debug!(%error, "could not announce departure");
                    }
                }
                Err(err) => warn!(error = %err, "failed to encode presence"),
            }
        }
        let dropped = self.pending.close();
        self.registry.remove(&self.id);
        info!(node = %self.id, dropped, "cluster node stopped");
    }
}

fn on_response(pending: &mut PendingRequests, record: &Record) {
    let envelope: ResponseEnvelope = match decode_control(&record.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(channel = %record.channel, error = %err, "dropping malformed response");
            return;
        }
    };
    if envelope.body == ResponseBody::Unknown {
        warn!(request_id = %envelope.request_id, "ignore response of unknown type");
        return;
    }
    let outcome = pending.on_response(envelope);
    trace!(?outcome, "response handled");
}

/// Appends a reply. Failures are reported as events and never retried.
async fn send_response(
    transport: Arc<dyn LogTransport>,
    events: broadcast::Sender<AdapterEvent>,
    channel: String,
    envelope: ResponseEnvelope,
) {
    let request_id = envelope.request_id.clone();
    let payload = match encode_control(&envelope) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%request_id, error = %err, "failed to encode response");
            return;
        }
    };
    if let Err(error) = transport.append(Record::new(channel, payload)).await {
        warn!(%request_id, %error, "failed to publish response");
        let _ = events.send(AdapterEvent::ResponseFailed { request_id, error });
    }
}

async fn next_record(
    subscription: &mut Option<Subscription>,
) -> Option<Result<Record, TransportError>> {
    match subscription {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
