//! Error types surfaced to callers of the adapter.
//!
//! Transport and decode problems on the inbound stream never reach a caller:
//! the worker logs them and reports them as [`crate::runtime::AdapterEvent`]s.
//! Only the caller waiting on a specific request sees that request's failure.

use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invalid namespace {0:?}")]
    InvalidNamespace(String),
    #[error("namespace {0:?} is already attached")]
    NamespaceTaken(String),
    #[error("cluster node is shut down")]
    Closed,
}

/// Failure of a cluster-wide request.
///
/// A timeout still carries whatever the request accumulated before its
/// deadline, along with how many of the expected replies arrived.
#[derive(Debug, Error)]
pub enum RequestError<T> {
    #[error("request timed out after {received} of {expected} replies")]
    Timeout {
        partial: T,
        received: usize,
        expected: usize,
    },
    #[error("request could not be published: {0}")]
    Transport(#[from] TransportError),
    #[error("request could not be encoded: {0}")]
    Codec(#[from] CodecError),
    #[error("cluster node is shut down")]
    Closed,
}

impl<T> RequestError<T> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Timeout { .. })
    }

    /// The partial result of a timed-out request.
    pub fn partial(&self) -> Option<&T> {
        match self {
            RequestError::Timeout { partial, .. } => Some(partial),
            _ => None,
        }
    }

    pub fn into_partial(self) -> Option<T> {
        match self {
            RequestError::Timeout { partial, .. } => Some(partial),
            _ => None,
        }
    }
}
