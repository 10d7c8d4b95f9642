//! An in-memory [PoolConnector] which records every statement it receives.
//!
//! Used to exercise routing without a real database behind it.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::PoolOptions;
use crate::pool::{
    ConnectionPool,
    ExecResult,
    PoolConnector,
    PoolStatistics,
    PoolTransaction,
    TxOptions,
};
use crate::row::{Row, RowSet};
use crate::value::Value;

static SCHEME: &str = "mem://";

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Pool {0:?} is closed")]
    Closed(String),

    #[error("Pool {0:?} refused the connection")]
    Refused(String),

    #[error("Pool {0:?} did not respond")]
    Unreachable(String),

    #[error("Pool {0:?} failed to close")]
    CloseFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A parsed `mem://<name>` endpoint.
pub struct MemoryEndpoint(String);

impl Display for MemoryEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{SCHEME}{}", self.0)
    }
}

#[derive(Default)]
struct ConnectorState {
    refused: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    failing_close: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
    pools: Mutex<Vec<MemoryPool>>,
}

#[derive(Clone, Default)]
/// A [PoolConnector] for `mem://<name>` endpoints.
///
/// Pools record every statement they receive and answer every query
/// with a single `(pool, sql)` row, which makes it easy to assert where
/// a statement was routed to. Failures can be injected per pool name.
pub struct MemoryConnector {
    state: Arc<ConnectorState>,
}

impl MemoryConnector {
    /// Makes connecting to the named pool fail.
    pub fn set_refused(&self, name: &str) {
        self.state.refused.lock().insert(name.to_string());
    }

    /// Makes pinging the named pool fail.
    pub fn set_unreachable(&self, name: &str) {
        self.state.unreachable.lock().insert(name.to_string());
    }

    /// Makes closing the named pool fail.
    pub fn set_failing_close(&self, name: &str) {
        self.state.failing_close.lock().insert(name.to_string());
    }

    /// Sets how long every statement of newly opened pools takes.
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = Some(latency);
    }

    /// Clears all injected failures.
    pub fn reset(&self) {
        self.state.refused.lock().clear();
        self.state.unreachable.lock().clear();
        self.state.failing_close.lock().clear();
        *self.state.latency.lock() = None;
    }

    /// The number of pools opened so far.
    pub fn num_opened(&self) -> usize {
        self.state.pools.lock().len()
    }

    /// The number of opened pools which are not closed.
    pub fn num_live(&self) -> usize {
        self.state
            .pools
            .lock()
            .iter()
            .filter(|pool| !pool.is_closed())
            .count()
    }

    /// Every pool opened with the given name, oldest first.
    pub fn pools_named(&self, name: &str) -> Vec<MemoryPool> {
        self.state
            .pools
            .lock()
            .iter()
            .filter(|pool| pool.name() == name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PoolConnector for MemoryConnector {
    type Endpoint = MemoryEndpoint;
    type Pool = MemoryPool;

    fn parse_endpoint(&self, endpoint: &str) -> Result<Self::Endpoint, String> {
        match endpoint.strip_prefix(SCHEME) {
            Some(name) if !name.is_empty() => Ok(MemoryEndpoint(name.to_string())),
            Some(_) => Err("missing pool name".to_string()),
            None => Err(format!("expected the {SCHEME:?} scheme")),
        }
    }

    async fn connect(
        &self,
        endpoint: &Self::Endpoint,
        options: &PoolOptions,
    ) -> Result<Self::Pool, MemoryError> {
        let name = endpoint.0.clone();
        let pool = MemoryPool {
            inner: Arc::new(PoolInner {
                name: name.clone(),
                options: *options,
                latency: *self.state.latency.lock(),
                unreachable: self.state.unreachable.lock().contains(&name),
                failing_close: self.state.failing_close.lock().contains(&name),
                closed: AtomicBool::new(false),
                num_close_calls: AtomicUsize::new(0),
                statements: Mutex::new(Vec::new()),
            }),
        };

        if self.state.refused.lock().contains(&name) {
            return Err(MemoryError::Refused(name));
        }

        self.state.pools.lock().push(pool.clone());
        Ok(pool)
    }
}

struct PoolInner {
    name: String,
    options: PoolOptions,
    latency: Option<Duration>,
    unreachable: bool,
    failing_close: bool,
    closed: AtomicBool,
    num_close_calls: AtomicUsize,
    statements: Mutex<Vec<String>>,
}

#[derive(Clone)]
/// An in-memory [ConnectionPool] created by [MemoryConnector].
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The options the pool was opened with.
    pub fn options(&self) -> PoolOptions {
        self.inner.options
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The number of times [ConnectionPool::close] was called.
    pub fn num_close_calls(&self) -> usize {
        self.inner.num_close_calls.load(Ordering::SeqCst)
    }

    /// Every statement the pool has received, in order.
    pub fn statements(&self) -> Vec<String> {
        self.inner.statements.lock().clone()
    }

    async fn record(&self, sql: &str) -> Result<(), MemoryError> {
        if let Some(latency) = self.inner.latency {
            tokio::time::sleep(latency).await;
        }

        if self.is_closed() {
            return Err(MemoryError::Closed(self.inner.name.clone()));
        }

        self.inner.statements.lock().push(sql.to_string());
        Ok(())
    }

    fn row(&self, sql: &str) -> Row {
        let columns: Arc<[String]> = vec!["pool".to_string(), "sql".to_string()].into();
        Row::new(
            columns,
            vec![
                Value::Text(self.inner.name.clone()),
                Value::Text(sql.to_string()),
            ],
        )
    }

    fn row_set(&self, sql: &str) -> RowSet {
        let row = self.row(sql);
        RowSet::new(row.columns().to_vec().into(), vec![row])
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    type Error = MemoryError;
    type Transaction = MemoryTransaction;

    async fn execute(&self, sql: &str, _params: Vec<Value>) -> Result<ExecResult, Self::Error> {
        self.record(sql).await?;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn query(&self, sql: &str, _params: Vec<Value>) -> Result<RowSet, Self::Error> {
        self.record(sql).await?;
        Ok(self.row_set(sql))
    }

    async fn query_one(&self, sql: &str, _params: Vec<Value>) -> Result<Option<Row>, Self::Error> {
        self.record(sql).await?;
        Ok(Some(self.row(sql)))
    }

    async fn ping(&self) -> Result<(), Self::Error> {
        if self.inner.unreachable {
            return Err(MemoryError::Unreachable(self.inner.name.clone()));
        }
        if self.is_closed() {
            return Err(MemoryError::Closed(self.inner.name.clone()));
        }
        Ok(())
    }

    async fn begin(&self, _options: TxOptions) -> Result<Self::Transaction, Self::Error> {
        self.record("BEGIN").await?;
        Ok(MemoryTransaction { pool: self.clone() })
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.inner.num_close_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);

        if self.inner.failing_close {
            return Err(MemoryError::CloseFailed(self.inner.name.clone()));
        }
        Ok(())
    }

    fn statistics(&self) -> PoolStatistics {
        let open = usize::from(!self.is_closed());
        PoolStatistics {
            max_open_connections: self.inner.options.max_open_connections,
            open_connections: open,
            idle: open,
            ..Default::default()
        }
    }
}

/// A transaction of a [MemoryPool].
pub struct MemoryTransaction {
    pool: MemoryPool,
}

#[async_trait]
impl PoolTransaction for MemoryTransaction {
    type Error = MemoryError;

    async fn execute(&mut self, sql: &str, params: Vec<Value>) -> Result<ExecResult, Self::Error> {
        self.pool.execute(sql, params).await
    }

    async fn query(&mut self, sql: &str, params: Vec<Value>) -> Result<RowSet, Self::Error> {
        self.pool.query(sql, params).await
    }

    async fn query_one(
        &mut self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Option<Row>, Self::Error> {
        self.pool.query_one(sql, params).await
    }

    async fn commit(self) -> Result<(), Self::Error> {
        self.pool.record("COMMIT").await
    }

    async fn rollback(self) -> Result<(), Self::Error> {
        self.pool.record("ROLLBACK").await
    }
}
