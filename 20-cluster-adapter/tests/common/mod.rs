//! Shared harness for the integration tests: several nodes sharing one
//! in-memory log, each with a root namespace and a local room layer.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use cluster_adapter::{
    channel::nodes_channel,
    codec::{encode_control, Packet},
    handler_fn,
    registry::{NodeId, Presence},
    rooms::{InMemoryRooms, SocketEvent},
    spawn_node,
    transport::{Record, Subscription, TransportError},
    Adapter, AdapterConfig, AdapterEvent, LogTransport, MemoryLog, NodeHandle,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};

pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(300);
pub const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

/// Short request timeout, no heartbeats.
pub fn test_config() -> AdapterConfig {
    AdapterConfig::default()
        .with_requests_timeout(REQUEST_TIMEOUT)
        .without_heartbeat()
}

/// The shared log as seen by one misbehaving node: its stream can be cut
/// and appends to one channel can be refused, while everyone else is fine.
pub struct FaultyLog {
    log: MemoryLog,
    rejected: Mutex<Option<String>>,
    cut: broadcast::Sender<()>,
}

impl FaultyLog {
    pub fn new(log: MemoryLog) -> Self {
        let (cut, _) = broadcast::channel(1);
        Self {
            log,
            rejected: Mutex::new(None),
            cut,
        }
    }

    /// Ends every subscription taken through this wrapper.
    pub fn cut_stream(&self) {
        let _ = self.cut.send(());
    }

    /// Refuses further appends to `channel`.
    pub fn reject(&self, channel: &str) {
        *self.rejected.lock() = Some(channel.to_string());
    }
}

#[async_trait]
impl LogTransport for FaultyLog {
    async fn append(&self, record: Record) -> Result<(), TransportError> {
        let rejected = self.rejected.lock().clone();
        if rejected.as_deref() == Some(record.channel.as_str()) {
            return Err(TransportError::Failed("append refused".into()));
        }
        self.log.append(record).await
    }

    async fn subscribe_from_now(&self) -> Result<Subscription, TransportError> {
        let mut cut = self.cut.subscribe();
        let stream = self.log.subscribe_from_now().await?;
        Ok(stream
            .take_until(async move {
                let _ = cut.recv().await;
            })
            .boxed())
    }
}

pub struct TestNode {
    pub handle: NodeHandle,
    pub adapter: Adapter,
    pub rooms: Arc<InMemoryRooms>,
}

pub struct TestCluster {
    pub log: MemoryLog,
    pub config: AdapterConfig,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    pub async fn spawn(n: usize) -> Result<Self> {
        Self::spawn_with(n, test_config()).await
    }

    /// Spawns `n` nodes whose custom handler answers `{"node": index}` and
    /// waits until every node counts all of them.
    pub async fn spawn_with(n: usize, config: AdapterConfig) -> Result<Self> {
        let log = MemoryLog::new("test-log", config.collection_size);
        let transport: Arc<dyn LogTransport> = Arc::new(log.clone());
        Self::spawn_over(log, config, vec![transport; n]).await
    }

    /// Like [`TestCluster::spawn_with`], but node `faulty` reaches the log
    /// through a [`FaultyLog`].
    pub async fn spawn_with_faulty(
        n: usize,
        config: AdapterConfig,
        faulty: usize,
    ) -> Result<(Self, Arc<FaultyLog>)> {
        let log = MemoryLog::new("test-log", config.collection_size);
        let wrapper = Arc::new(FaultyLog::new(log.clone()));

        let mut transports = Vec::with_capacity(n);
        for index in 0..n {
            if index == faulty {
                transports.push(Arc::clone(&wrapper) as Arc<dyn LogTransport>);
            } else {
                transports.push(Arc::new(log.clone()) as Arc<dyn LogTransport>);
            }
        }
        let cluster = Self::spawn_over(log, config, transports).await?;
        Ok((cluster, wrapper))
    }

    /// One node per transport, all sharing `log`.
    async fn spawn_over(
        log: MemoryLog,
        config: AdapterConfig,
        transports: Vec<Arc<dyn LogTransport>>,
    ) -> Result<Self> {
        let n = transports.len();
        let mut nodes = Vec::with_capacity(n);
        for (index, transport) in transports.into_iter().enumerate() {
            let handle = spawn_node(config.clone(), transport).await?;
            let rooms = Arc::new(InMemoryRooms::new());
            let adapter = handle
                .attach_with_handler(
                    "/",
                    rooms.clone(),
                    Arc::new(handler_fn(move |_| json!({ "node": index }))),
                )
                .await?;
            nodes.push(TestNode {
                handle,
                adapter,
                rooms,
            });
        }

        let cluster = Self { log, config, nodes };
        cluster.wait_for_nodes(n).await?;
        Ok(cluster)
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    pub fn adapter(&self, index: usize) -> &Adapter {
        &self.nodes[index].adapter
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Waits until every node counts exactly `expected` active nodes.
    pub async fn wait_for_nodes(&self, expected: usize) -> Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let mut counts = Vec::with_capacity(self.nodes.len());
            for node in &self.nodes {
                counts.push(node.handle.active_nodes().await?.len());
            }
            if counts.iter().all(|count| *count == expected) {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                bail!("timeout waiting for {expected} active nodes, saw {counts:?}");
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Announces a node that never answers anything.
    pub async fn inject_ghost(&self, name: &str) -> Result<()> {
        let join = Presence::Join {
            node: NodeId::from(name),
        };
        self.log
            .append(Record::new(
                nodes_channel(&self.config.key),
                encode_control(&join)?,
            ))
            .await?;
        Ok(())
    }

    /// Connects socket `sid` on node `index` and joins it to `rooms`.
    pub fn connect(
        &self,
        index: usize,
        sid: &str,
        rooms: &[&str],
    ) -> mpsc::UnboundedReceiver<SocketEvent> {
        let node = &self.nodes[index];
        let inbox = node.rooms.connect(sid);
        let rooms: Vec<String> = rooms.iter().map(|room| room.to_string()).collect();
        node.adapter.join(sid, &rooms);
        inbox
    }

    pub async fn shutdown(self) -> Result<()> {
        for node in &self.nodes {
            node.handle.shutdown().await?;
        }
        Ok(())
    }
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

pub async fn next_event(inbox: &mut mpsc::UnboundedReceiver<SocketEvent>) -> Result<SocketEvent> {
    match timeout(WAIT, inbox.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => bail!("socket inbox closed"),
        Err(_) => bail!("timeout waiting for socket event"),
    }
}

pub async fn next_packet(inbox: &mut mpsc::UnboundedReceiver<SocketEvent>) -> Result<Packet> {
    match next_event(inbox).await? {
        SocketEvent::Packet(packet) => Ok(packet),
        other => bail!("expected a packet, got {other:?}"),
    }
}

/// Fails if anything arrives within a short quiet period.
pub async fn assert_silent(inbox: &mut mpsc::UnboundedReceiver<SocketEvent>) -> Result<()> {
    sleep(QUIET).await;
    match inbox.try_recv() {
        Ok(event) => bail!("unexpected socket event {event:?}"),
        Err(_) => Ok(()),
    }
}

/// Waits for the next `NodeLeft` event, skipping everything else.
pub async fn wait_for_node_left(
    events: &mut broadcast::Receiver<AdapterEvent>,
) -> Result<NodeId> {
    let left = async {
        loop {
            match events.recv().await {
                Ok(AdapterEvent::NodeLeft(node)) => return Ok(node),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            }
        }
    };
    match timeout(WAIT, left).await {
        Ok(result) => result,
        Err(_) => bail!("timeout waiting for a node to leave"),
    }
}
