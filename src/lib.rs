//! # Shardcake
//! Routes the database operations of a sharded cluster to the right
//! primary/replica connection pools, and swaps the routing table atomically
//! when the cluster is reconfigured.
//!
//! This is a convenience package which includes all of the sub-projects within
//! Shardcake:
//!
//! ### Features
//! - `router` (default) - `shardcake_router`, the configuration model, routing table,
//!   live reconfiguration and the handle facade.
//! - `sqlite` - `shardcake_sqlite`, a SQLite connection pool usable as shard instances.

#[cfg(feature = "shardcake-router")]
pub use shardcake_router as router;
#[cfg(feature = "shardcake-sqlite")]
pub use shardcake_sqlite as sqlite;
