//! # Shardcake SQLite
//! A [ConnectionPool] implementation for SQLite databases, allowing them to
//! be used as the primary and replica instances of a shardcake router.
//!
//! ```rust
//! use shardcake_router::{params, OpContext, Router, ShardConfig};
//! use shardcake_sqlite::SqliteConnector;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let router = Router::new(SqliteConnector);
//! router.configure(ShardConfig::unsharded("sqlite::memory:")).await?;
//!
//! let handle = router.resolve(OpContext::background(), None)?;
//! handle.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", params![]).await?;
//! handle.execute("INSERT INTO users (id, name) VALUES (?, ?)", params![1, "bob"]).await?;
//!
//! let name: Option<(String,)> = handle
//!     .fetch_one("SELECT name FROM users WHERE id = ?", params![1])
//!     .await?;
//! assert_eq!(name, Some(("bob".to_string(),)));
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

mod db;
mod endpoint;
mod error;
mod pool;
mod transaction;

use async_trait::async_trait;
use shardcake_router::{ConnectionPool, PoolConnector, PoolOptions};

pub use self::endpoint::{OpenMode, SqliteEndpoint};
pub use self::error::SqliteError;
pub use self::pool::SqlitePool;
pub use self::transaction::SqliteTransaction;

#[derive(Debug, Clone, Copy, Default)]
/// Opens [SqlitePool]s for `sqlite::memory:` and `sqlite://<path>` endpoints.
pub struct SqliteConnector;

#[async_trait]
impl PoolConnector for SqliteConnector {
    type Endpoint = SqliteEndpoint;
    type Pool = SqlitePool;

    fn parse_endpoint(&self, endpoint: &str) -> Result<Self::Endpoint, String> {
        SqliteEndpoint::parse(endpoint)
    }

    async fn connect(
        &self,
        endpoint: &Self::Endpoint,
        options: &PoolOptions,
    ) -> Result<Self::Pool, <Self::Pool as ConnectionPool>::Error> {
        SqlitePool::connect(endpoint.clone(), *options).await
    }
}
