use std::time::Duration;

use thiserror::Error;

use crate::value::ValueError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// The shard configuration is invalid.
///
/// These are always detected before any endpoint is parsed or connected to.
pub enum ConfigError {
    #[error("Modulus must be greater than 0 when shard instances are set, got {0}")]
    /// Shard instances were configured without a usable modulus.
    InvalidModulus(i64),

    #[error("Bucket indices {buckets:?} are outside of the modulus range [0, {modulus})")]
    /// One or more buckets do not fit within `[0, modulus)`.
    BucketsOutOfRange { buckets: Vec<i64>, modulus: i64 },

    #[error("Bucket indices {0:?} are defined more than once")]
    /// One or more buckets are assigned to more than one shard.
    DuplicateBuckets(Vec<i64>),

    #[error("Bucket indices {0:?} are not assigned to any shard instance")]
    /// The shard instances do not cover every bucket.
    MissingBuckets(Vec<i64>),

    #[error("A default replica endpoint was set without a default primary endpoint")]
    ReplicaWithoutPrimary,
}

#[derive(Debug, Error)]
/// A connection pool could not be opened.
pub enum ConnectionError {
    #[error("Invalid endpoint {endpoint:?}: {reason}")]
    /// The endpoint could not be parsed, no connection was attempted.
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Endpoint {endpoint:?} is unreachable: {source}")]
    /// The pool could not be opened or did not respond to the liveness probe.
    Unreachable {
        endpoint: String,
        source: anyhow::Error,
    },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
/// No connection pool could be selected for an operation.
pub enum RoutingError {
    #[error("The router has not been configured yet")]
    NotInitialized,

    #[error("Missing shard selector, the router only has sharded instances")]
    /// The router is sharded and has no default instance to fall back on.
    MissingSelector,

    #[error("No sharded instance nor default instance is configured")]
    NoInstances,
}

#[derive(Debug, Error)]
/// An operation issued through a [crate::Handle] or [crate::Transaction] failed.
pub enum OperationError {
    #[error("The operation context was cancelled")]
    Cancelled,

    #[error("The operation context deadline was exceeded")]
    DeadlineExceeded,

    #[error("The transaction has already been committed or rolled back")]
    TransactionFinished,

    #[error("Failed to decode row: {0}")]
    Decode(#[from] ValueError),

    #[error("Pool operation failed after {elapsed:?} ({context}): {source}")]
    /// The underlying pool returned an error.
    ///
    /// `context` holds the statement text, or the name of the operation
    /// when no statement is involved. The original pool error can be
    /// recovered with [anyhow::Error::downcast_ref].
    Pool {
        context: String,
        elapsed: Duration,
        source: anyhow::Error,
    },
}

impl OperationError {
    /// Returns if the error was caused by the operation context finishing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Connection(#[from] ConnectionError),

    #[error("{0}")]
    Routing(#[from] RoutingError),

    #[error("Failed to close {failed} connection pool(s): {source}")]
    /// One or more pools failed to close.
    ///
    /// `source` is the first failure observed.
    Close {
        failed: usize,
        source: anyhow::Error,
    },
}
