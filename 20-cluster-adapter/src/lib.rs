//! Log-backed cluster adapter for socket.io style namespaces and rooms.
//!
//! Several server processes share one append-only log. Each process runs a
//! node that tails the log from the moment it starts, and each namespace it
//! serves gets an adapter that uses the log for two things:
//!
//! - **Broadcast relay**: a local broadcast is delivered in-process and
//!   appended to the log, and every other node delivers it to its own
//!   connections. A node recognises its own records by id and skips them.
//! - **Cluster queries**: requests such as "which rooms exist" or "make this
//!   connection join a room" are appended to a request channel. Nodes answer
//!   on a response channel, and the requester gathers replies until every
//!   active node has answered or the request times out.
//!
//! # Architecture
//!
//! - **Worker task**: one per node. It owns the subscription, the pending
//!   requests, the node registry and the attached namespaces, and handles
//!   records strictly in log order
//! - **Handles**: [`runtime::NodeHandle`] and [`adapter::Adapter`] talk to the
//!   worker over channels and append to the log directly
//!
//! # Modules
//!
//! - [`adapter`]: per-namespace broadcast and request API
//! - [`channel`]: channel naming and matching
//! - [`cli`]: command-line interface of the demo binary
//! - [`codec`]: wire formats for broadcasts and control messages
//! - [`config`]: adapter configuration
//! - [`coordinator`]: pending request bookkeeping and reply aggregation
//! - [`demo`]: in-process cluster walkthrough
//! - [`error`]: error types
//! - [`registry`]: node ids, presence messages and the active node set
//! - [`rooms`]: local room layer
//! - [`router`]: broadcast relay guards
//! - [`runtime`]: worker loop and node spawning
//! - [`transport`]: log transport trait and the in-memory capped log

pub mod adapter;
pub mod channel;
pub mod cli;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod demo;
pub mod error;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod runtime;
pub mod transport;

pub use adapter::{handler_fn, Adapter, CustomHandler};
pub use config::AdapterConfig;
pub use error::{AdapterError, RequestError};
pub use runtime::{spawn_node, AdapterEvent, NodeHandle};
pub use transport::{LogTransport, MemoryLog};
