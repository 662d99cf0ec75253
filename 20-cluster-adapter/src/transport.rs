//! The append-only log that carries every record between nodes.
//!
//! [`LogTransport`] is the seam to the external log service: appends are
//! committed in a single order and every subscriber sees new records in that
//! order, starting from the moment it subscribed.
//!
//! [`MemoryLog`] is an in-process implementation backed by a Tokio
//! `broadcast` channel. It keeps a capped window of recent records, the way a
//! capped collection would, and can simulate stream errors and end-of-stream.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::AdapterConfig;

/// How many records a slow subscriber may fall behind before it lags out.
const TAIL_BUFFER: usize = 4096;

/// Unit stored in the log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub channel: String,
    pub payload: Bytes,
}

impl Record {
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("log is closed")]
    Closed,
    #[error("subscriber fell behind by {0} records")]
    Lagged(u64),
    #[error("log failure: {0}")]
    Failed(String),
}

/// Ordered stream of new records. An `Err` item signals a stream error and
/// the end of the stream signals that the log stopped delivering.
pub type Subscription = BoxStream<'static, Result<Record, TransportError>>;

#[async_trait]
pub trait LogTransport: Send + Sync + 'static {
    async fn append(&self, record: Record) -> Result<(), TransportError>;

    /// Subscribes to records committed after this call. Earlier records are
    /// never replayed.
    async fn subscribe_from_now(&self) -> Result<Subscription, TransportError>;
}

#[derive(Clone)]
enum Tailed {
    Record(Record),
    Failed(String),
}

struct LogState {
    retained: VecDeque<Record>,
    retained_bytes: usize,
    tail: Option<broadcast::Sender<Tailed>>,
}

/// Capped in-memory log shared by every node of an in-process cluster.
#[derive(Clone)]
pub struct MemoryLog {
    name: Arc<str>,
    capacity_bytes: usize,
    state: Arc<Mutex<LogState>>,
}

impl MemoryLog {
    pub fn new(name: &str, capacity_bytes: usize) -> Self {
        let (tail, _) = broadcast::channel(TAIL_BUFFER);
        Self {
            name: Arc::from(name),
            capacity_bytes,
            state: Arc::new(Mutex::new(LogState {
                retained: VecDeque::new(),
                retained_bytes: 0,
                tail: Some(tail),
            })),
        }
    }

    /// Sizes the log from the collection settings of `config`.
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self::new(&config.collection_name, config.collection_size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of records still retained under the size cap.
    pub fn count(&self) -> usize {
        self.state.lock().retained.len()
    }

    pub fn retained(&self) -> Vec<Record> {
        self.state.lock().retained.iter().cloned().collect()
    }

    pub fn retained_bytes(&self) -> usize {
        self.state.lock().retained_bytes
    }

    /// Delivers a stream error to every current subscriber.
    pub fn fail(&self, reason: &str) {
        let state = self.state.lock();
        if let Some(tail) = &state.tail {
            let _ = tail.send(Tailed::Failed(reason.to_string()));
        }
    }

    /// Ends every subscription and rejects further appends.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.tail = None;
        debug!(log = %self.name, "log closed");
    }
}

impl LogState {
    /// Evicts the oldest records once the cap is exceeded, always keeping the
    /// newest one.
    fn enforce_cap(&mut self, capacity_bytes: usize) {
        while self.retained_bytes > capacity_bytes && self.retained.len() > 1 {
            if let Some(evicted) = self.retained.pop_front() {
                self.retained_bytes -= evicted.payload.len();
            }
        }
    }
}

#[async_trait]
impl LogTransport for MemoryLog {
    async fn append(&self, record: Record) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let Some(tail) = state.tail.clone() else {
            return Err(TransportError::Closed);
        };

        state.retained_bytes += record.payload.len();
        state.retained.push_back(record.clone());
        state.enforce_cap(self.capacity_bytes);

        // Sending under the lock keeps one commit order for every subscriber.
        // A send error only means nobody is subscribed right now.
        let _ = tail.send(Tailed::Record(record));
        Ok(())
    }

    async fn subscribe_from_now(&self) -> Result<Subscription, TransportError> {
        let state = self.state.lock();
        let Some(tail) = &state.tail else {
            return Err(TransportError::Closed);
        };
        let receiver = tail.subscribe();
        let name = Arc::clone(&self.name);

        let stream = stream::unfold(receiver, move |mut receiver| {
            let name = Arc::clone(&name);
            async move {
                match receiver.recv().await {
                    Ok(Tailed::Record(record)) => Some((Ok(record), receiver)),
                    Ok(Tailed::Failed(reason)) => {
                        Some((Err(TransportError::Failed(reason)), receiver))
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(log = %name, skipped, "subscriber lagged behind the log");
                        Some((Err(TransportError::Lagged(skipped)), receiver))
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
