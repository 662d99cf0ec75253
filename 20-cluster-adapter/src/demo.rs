//! In-process walkthrough: a few nodes share one [`MemoryLog`] and exercise
//! broadcasts and every kind of cluster query.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::adapter::{handler_fn, Adapter};
use crate::cli::DemoArgs;
use crate::codec::{BroadcastOptions, Packet, Value};
use crate::config::AdapterConfig;
use crate::rooms::{InMemoryRooms, SocketEvent};
use crate::runtime::{spawn_node, NodeHandle};
use crate::transport::{LogTransport, MemoryLog};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

struct DemoNode {
    handle: NodeHandle,
    adapter: Adapter,
    rooms: Arc<InMemoryRooms>,
}

pub async fn run(args: DemoArgs) -> Result<()> {
    if args.nodes < 2 {
        bail!("the demo needs at least two nodes, got {}", args.nodes);
    }

    let mut config = match &args.config {
        Some(path) => AdapterConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AdapterConfig::default(),
    };
    if let Some(key) = &args.key {
        config = config.with_key(key.clone());
    }
    if let Some(ms) = args.timeout_ms {
        config = config.with_requests_timeout(Duration::from_millis(ms));
    }
    config.validate()?;

    let log = MemoryLog::from_config(&config);
    let transport: Arc<dyn LogTransport> = Arc::new(log.clone());

    let mut nodes = Vec::with_capacity(args.nodes);
    for index in 0..args.nodes {
        let handle = spawn_node(config.clone(), Arc::clone(&transport)).await?;
        let rooms = Arc::new(InMemoryRooms::new());
        let label = format!("node-{index}");
        let adapter = handle
            .attach_with_handler(
                "/",
                rooms.clone(),
                Arc::new(handler_fn(move |data| json!({ "from": label, "echo": data }))),
            )
            .await?;
        nodes.push(DemoNode {
            handle,
            adapter,
            rooms,
        });
    }
    wait_for_cluster(&nodes).await?;
    info!(nodes = nodes.len(), log = log.name(), "cluster converged");

    let mut inboxes = Vec::with_capacity(nodes.len());
    for (index, node) in nodes.iter().enumerate() {
        let sid = format!("sid-{index}");
        inboxes.push(node.rooms.connect(&sid));
        node.adapter.join(&sid, &[format!("room-{index}"), "lobby".to_string()]);
    }

    let first = &nodes[0].adapter;
    let last = &nodes[nodes.len() - 1].adapter;

    first
        .broadcast(
            Packet::event("greeting", [Value::from("hello lobby")]),
            BroadcastOptions::to_room("lobby"),
        )
        .await?;
    for (index, inbox) in inboxes.iter_mut().enumerate() {
        match timeout(DELIVERY_TIMEOUT, inbox.recv()).await {
            Ok(Some(SocketEvent::Packet(packet))) => {
                info!(socket = index, data = ?packet.data, "packet delivered")
            }
            Ok(other) => warn!(socket = index, ?other, "unexpected socket event"),
            Err(_) => warn!(socket = index, "no packet delivered"),
        }
    }

    report("all rooms", first.all_rooms().await);
    report("clients in lobby", first.clients(&["lobby".to_string()]).await);
    report("rooms of sid-0", last.client_rooms("sid-0").await);

    match last.remote_join("sid-0", "vip").await {
        Ok(()) => info!("sid-0 joined vip remotely"),
        Err(err) => warn!(error = %err, "remote join failed"),
    }
    report("rooms of sid-0 after join", first.client_rooms("sid-0").await);
    report("custom request", first.custom_request(json!("ping")).await);

    match first.remote_disconnect("ghost", false).await {
        Ok(()) => warn!("unknown connection was disconnected"),
        Err(err) => info!(error = %err, "disconnecting an unknown connection times out"),
    }

    for node in &nodes {
        node.handle.shutdown().await?;
    }
    info!(records = log.count(), bytes = log.retained_bytes(), "demo finished");
    Ok(())
}

async fn wait_for_cluster(nodes: &[DemoNode]) -> Result<()> {
    let expected = nodes.len();
    let converge = async {
        loop {
            let mut converged = true;
            for node in nodes {
                if node.handle.active_nodes().await?.len() != expected {
                    converged = false;
                }
            }
            if converged {
                return Ok::<(), anyhow::Error>(());
            }
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(CONVERGE_TIMEOUT, converge)
        .await
        .context("nodes did not discover each other")?
}

fn report<T, E>(what: &str, result: Result<T, E>)
where
    T: std::fmt::Debug,
    E: std::fmt::Display,
{
    match result {
        Ok(value) => info!(?value, "{what}"),
        Err(err) => warn!(error = %err, "{what} failed"),
    }
}
