use std::error::Error;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PoolOptions;
use crate::row::{Row, RowSet};
use crate::value::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// The outcome of a write statement.
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    /// Use the isolation level of the backing database.
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Options used when beginning a transaction.
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// A point in time view of a connection pool.
pub struct PoolStatistics {
    /// The maximum number of open connections, `0` when unbounded.
    pub max_open_connections: usize,
    /// The number of connections currently open, both in use and idle.
    pub open_connections: usize,
    /// The number of connections currently checked out.
    pub in_use: usize,
    /// The number of idle connections.
    pub idle: usize,
    /// The total number of times a caller waited for a connection.
    pub wait_count: u64,
    /// The total time spent waiting for a connection.
    pub wait_duration: Duration,
    /// The number of connections closed because the idle limit was reached.
    pub max_idle_closed: u64,
    /// The number of connections closed because they outlived their max lifetime.
    pub max_lifetime_closed: u64,
}

#[async_trait]
/// A thread safe pool of database connections.
///
/// The router never manages individual connections, it only hands
/// statements to a pool and reports the errors it returns.
pub trait ConnectionPool: Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;
    type Transaction: PoolTransaction<Error = Self::Error>;

    /// Execute a write statement with some provided parameters.
    async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<ExecResult, Self::Error>;

    /// Fetch all rows of a given statement with some provided parameters.
    async fn query(&self, sql: &str, params: Vec<Value>) -> Result<RowSet, Self::Error>;

    /// Fetch the first row of a given statement with some provided parameters.
    async fn query_one(&self, sql: &str, params: Vec<Value>) -> Result<Option<Row>, Self::Error>;

    /// Checks that the pool can reach its database.
    async fn ping(&self) -> Result<(), Self::Error>;

    /// Starts a new transaction on a single connection of the pool.
    async fn begin(&self, options: TxOptions) -> Result<Self::Transaction, Self::Error>;

    /// Closes the pool, after which no new connections are handed out.
    async fn close(&self) -> Result<(), Self::Error>;

    /// A point in time view of the pool.
    fn statistics(&self) -> PoolStatistics;
}

#[async_trait]
/// A transaction bound to a single connection of a [ConnectionPool].
pub trait PoolTransaction: Send + 'static {
    type Error: Error + Send + Sync + 'static;

    async fn execute(&mut self, sql: &str, params: Vec<Value>) -> Result<ExecResult, Self::Error>;

    async fn query(&mut self, sql: &str, params: Vec<Value>) -> Result<RowSet, Self::Error>;

    async fn query_one(
        &mut self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Option<Row>, Self::Error>;

    async fn commit(self) -> Result<(), Self::Error>;

    async fn rollback(self) -> Result<(), Self::Error>;
}

#[async_trait]
/// Opens connection pools for a given kind of endpoint.
pub trait PoolConnector: Send + Sync + 'static {
    /// A parsed endpoint.
    type Endpoint: Display + Send + Sync + 'static;
    type Pool: ConnectionPool;

    /// Parses and validates the raw endpoint.
    ///
    /// This must not perform any IO, it is called for every endpoint
    /// of a config before any pool is opened.
    fn parse_endpoint(&self, endpoint: &str) -> Result<Self::Endpoint, String>;

    /// Opens a new pool for the given endpoint.
    ///
    /// The router pings the pool once this returns.
    async fn connect(
        &self,
        endpoint: &Self::Endpoint,
        options: &PoolOptions,
    ) -> Result<Self::Pool, <Self::Pool as ConnectionPool>::Error>;
}
