//! # Shardcake Router
//! Routes database operations to the primary/replica connection pools of a
//! sharded cluster, and swaps the whole routing table atomically when the
//! cluster configuration changes.
//!
//! Operations carry an optional integer selector. With a sharded config of
//! modulus `m`, a selector `s` is served by the shard owning bucket
//! `s.rem_euclid(m)`; operations without a selector are served by the
//! default instance.
//!
//! The router does not execute SQL itself, it is generic over a
//! [PoolConnector] which opens [ConnectionPool]s for a given endpoint.
//!
//! ## Basic Example
//!
//! ```rust
//! use shardcake_router::memory::MemoryConnector;
//! use shardcake_router::{params, OpContext, Router, ShardConfig, ShardInstance};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let router = Router::new(MemoryConnector::default());
//!
//!     let config = ShardConfig::sharded(
//!         4,
//!         vec![
//!             ShardInstance::new("mem://shard-a", [0, 1]),
//!             ShardInstance::new("mem://shard-b", [2, 3]).with_replica("mem://shard-b-ro"),
//!         ],
//!     );
//!     router.configure(config).await?;
//!
//!     // 6 % 4 = 2, served by shard b.
//!     let handle = router.resolve(OpContext::background(), Some(6))?;
//!     handle.execute("INSERT INTO users (id) VALUES (?)", params![6]).await?;
//!
//!     // Reads go to the replica unless the primary is forced.
//!     let rows = handle.query("SELECT id FROM users", params![]).await?;
//!     assert_eq!(rows.count(), 1);
//!
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate tracing;

mod config;
mod context;
mod error;
mod from_row_impl;
mod handle;
pub mod memory;
mod opener;
mod pool;
mod router;
mod row;
mod statistics;
mod table;
mod value;

pub use config::{
    PoolOptions,
    ShardConfig,
    ShardInstance,
    DEFAULT_MAX_IDLE_CONNECTIONS,
    DEFAULT_MAX_LIFETIME,
};
pub use context::OpContext;
pub use error::{ConfigError, ConnectionError, OperationError, RouterError, RoutingError};
pub use handle::{Handle, Rows, Statement, Transaction};
pub use opener::open_pair;
pub use pool::{
    ConnectionPool,
    ExecResult,
    IsolationLevel,
    PoolConnector,
    PoolStatistics,
    PoolTransaction,
    TxOptions,
};
pub use router::{RetirePolicy, Router};
pub use row::{FromRow, Row, RowSet};
pub use statistics::RouterStatistics;
pub use table::{PoolPair, RoutingTable};
pub use tokio_util::sync::CancellationToken;
pub use value::{FromValue, Value, ValueError};
