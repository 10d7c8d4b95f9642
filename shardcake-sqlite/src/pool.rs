use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flume::{Receiver, Sender};
use shardcake_router::{
    ConnectionPool,
    ExecResult,
    PoolOptions,
    PoolStatistics,
    Row,
    RowSet,
    TxOptions,
    Value,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::db::ConnectionHandle;
use crate::endpoint::SqliteEndpoint;
use crate::error::SqliteError;
use crate::transaction::SqliteTransaction;

#[derive(Debug, Default)]
struct Counters {
    open: AtomicUsize,
    in_use: AtomicUsize,
    wait_count: AtomicU64,
    wait_duration_micros: AtomicU64,
    max_idle_closed: AtomicU64,
    max_lifetime_closed: AtomicU64,
}

/// An open connection, counted against the limits of its pool.
///
/// Dropping it closes the connection and frees its slot.
struct PoolConnection {
    handle: ConnectionHandle,
    counters: Arc<Counters>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        self.counters.open.fetch_sub(1, Ordering::Relaxed);
    }
}

struct PoolInner {
    endpoint: SqliteEndpoint,
    options: PoolOptions,
    limit: Option<Arc<Semaphore>>,
    idle_tx: Sender<PoolConnection>,
    idle_rx: Receiver<PoolConnection>,
    counters: Arc<Counters>,
    closed: AtomicBool,
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_expired(&self, conn: &PoolConnection) -> bool {
        // Closing the only connection of an in-memory database loses its data.
        !self.endpoint.is_memory() && conn.handle.age() >= self.options.max_lifetime
    }

    fn expire(&self, conn: PoolConnection) {
        self.counters
            .max_lifetime_closed
            .fetch_add(1, Ordering::Relaxed);
        debug!(endpoint = %self.endpoint, age = ?conn.handle.age(), "Closing expired connection.");
    }

    /// Takes the first usable idle connection, closing any expired ones.
    fn take_idle(&self) -> Option<PoolConnection> {
        while let Ok(conn) = self.idle_rx.try_recv() {
            if self.is_expired(&conn) {
                self.expire(conn);
                continue;
            }
            return Some(conn);
        }
        None
    }

    fn drain_idle(&self) -> usize {
        self.idle_rx.drain().count()
    }

    async fn open_connection(
        &self,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<PoolConnection, SqliteError> {
        let handle = ConnectionHandle::open(&self.endpoint).await?;
        self.counters.open.fetch_add(1, Ordering::Relaxed);
        trace!(endpoint = %self.endpoint, "Opened new connection.");

        Ok(PoolConnection {
            handle,
            counters: self.counters.clone(),
            _permit: permit,
        })
    }

    /// Returns a checked out connection to the idle queue if it is still usable.
    fn release(&self, conn: PoolConnection) {
        if self.is_closed() {
            return;
        }

        if self.is_expired(&conn) {
            self.expire(conn);
            return;
        }

        if self.idle_tx.try_send(conn).is_err() {
            self.counters.max_idle_closed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // The pool may have been closed while the connection was returned.
        if self.is_closed() {
            self.drain_idle();
        }
    }
}

/// A connection checked out of a [SqlitePool].
///
/// The connection goes back to the pool once this is dropped.
pub(crate) struct PooledConnection {
    conn: Option<PoolConnection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(conn: PoolConnection, pool: Arc<PoolInner>) -> Self {
        pool.counters.in_use.fetch_add(1, Ordering::Relaxed);
        Self {
            conn: Some(conn),
            pool,
        }
    }

    pub(crate) fn handle(&self) -> Result<&ConnectionHandle, SqliteError> {
        self.conn
            .as_ref()
            .map(|conn| &conn.handle)
            .ok_or(SqliteError::Closed)
    }

    /// Closes the connection instead of returning it to the pool.
    pub(crate) fn discard(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(endpoint = %self.pool.endpoint, "Discarding connection.");
            drop(conn);
        }
    }

    /// Discards the connection if its worker has stopped.
    pub(crate) fn check<T>(&mut self, res: Result<T, SqliteError>) -> Result<T, SqliteError> {
        if let Err(SqliteError::WorkerStopped(_)) = &res {
            self.discard();
        }
        res
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.counters.in_use.fetch_sub(1, Ordering::Relaxed);
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

enum Waited {
    Idle(Option<PoolConnection>),
    Permit(Option<OwnedSemaphorePermit>),
}

#[derive(Clone)]
/// A pool of SQLite connections for a single database.
///
/// Idle connections are kept around up to `max_idle_connections`, and at
/// most `max_open_connections` are open at once when that limit is set,
/// callers wait for a connection to be returned beyond that.
///
/// In-memory databases only ever use a single connection which is kept
/// open until the pool is closed.
pub struct SqlitePool {
    inner: Arc<PoolInner>,
}

impl SqlitePool {
    /// Opens a new pool, connecting to the database once to check it can be opened.
    pub async fn connect(
        endpoint: SqliteEndpoint,
        options: PoolOptions,
    ) -> Result<Self, SqliteError> {
        let mut options = options.normalized();
        if endpoint.is_memory() {
            options.max_open_connections = 1;
            options.max_idle_connections = 1;
        }

        let limit = options
            .open_limit()
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let (idle_tx, idle_rx) = flume::bounded(options.max_idle_connections);

        let pool = Self {
            inner: Arc::new(PoolInner {
                endpoint,
                options,
                limit,
                idle_tx,
                idle_rx,
                counters: Arc::new(Counters::default()),
                closed: AtomicBool::new(false),
            }),
        };

        drop(pool.acquire().await?);
        debug!(endpoint = %pool.inner.endpoint, options = ?options, "SQLite pool opened.");

        Ok(pool)
    }

    #[inline]
    pub fn endpoint(&self) -> &SqliteEndpoint {
        &self.inner.endpoint
    }

    #[inline]
    /// The options the pool applies, with defaults filled in.
    pub fn options(&self) -> PoolOptions {
        self.inner.options
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Checks out a connection, waiting for one if the pool is at its limit.
    pub(crate) async fn acquire(&self) -> Result<PooledConnection, SqliteError> {
        let inner = &self.inner;
        let mut wait_start = None;

        let res = loop {
            if inner.is_closed() {
                break Err(SqliteError::Closed);
            }

            if let Some(conn) = inner.take_idle() {
                break Ok(conn);
            }

            let limit = match &inner.limit {
                None => break inner.open_connection(None).await,
                Some(limit) => limit.clone(),
            };

            let permit = match limit.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => break Err(SqliteError::Closed),
                Err(TryAcquireError::NoPermits) => {
                    if wait_start.is_none() {
                        inner.counters.wait_count.fetch_add(1, Ordering::Relaxed);
                        wait_start = Some(Instant::now());
                    }

                    let waited = tokio::select! {
                        conn = inner.idle_rx.recv_async() => Waited::Idle(conn.ok()),
                        permit = limit.acquire_owned() => Waited::Permit(permit.ok()),
                    };

                    match waited {
                        Waited::Idle(Some(conn)) if !inner.is_expired(&conn) => break Ok(conn),
                        Waited::Idle(Some(conn)) => {
                            inner.expire(conn);
                            continue;
                        },
                        Waited::Permit(Some(permit)) => permit,
                        Waited::Idle(None) | Waited::Permit(None) => {
                            break Err(SqliteError::Closed)
                        },
                    }
                },
            };

            break inner.open_connection(Some(permit)).await;
        };

        if let Some(start) = wait_start {
            let waited = start.elapsed().as_micros() as u64;
            inner
                .counters
                .wait_duration_micros
                .fetch_add(waited, Ordering::Relaxed);
        }

        res.map(|conn| PooledConnection::new(conn, inner.clone()))
    }
}

#[async_trait]
impl ConnectionPool for SqlitePool {
    type Error = SqliteError;
    type Transaction = SqliteTransaction;

    async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<ExecResult, Self::Error> {
        let mut conn = self.acquire().await?;
        let res = conn.handle()?.execute(sql, params).await;
        conn.check(res)
    }

    async fn query(&self, sql: &str, params: Vec<Value>) -> Result<RowSet, Self::Error> {
        let mut conn = self.acquire().await?;
        let res = conn.handle()?.query(sql, params).await;
        conn.check(res)
    }

    async fn query_one(&self, sql: &str, params: Vec<Value>) -> Result<Option<Row>, Self::Error> {
        let mut conn = self.acquire().await?;
        let res = conn.handle()?.query_one(sql, params).await;
        conn.check(res)
    }

    async fn ping(&self) -> Result<(), Self::Error> {
        let mut conn = self.acquire().await?;
        let res = conn.handle()?.ping().await;
        conn.check(res)
    }

    async fn begin(&self, options: TxOptions) -> Result<Self::Transaction, Self::Error> {
        let conn = self.acquire().await?;

        // Wrapped before BEGIN is sent so a caller giving up mid-way still rolls back.
        let mut tx = SqliteTransaction::new(conn, options);
        tx.start().await?;
        Ok(tx)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(limit) = &self.inner.limit {
            limit.close();
        }

        let num_idle = self.inner.drain_idle();
        info!(
            endpoint = %self.inner.endpoint,
            num_idle = num_idle,
            num_in_use = self.inner.counters.in_use.load(Ordering::Relaxed),
            "SQLite pool closed."
        );

        Ok(())
    }

    fn statistics(&self) -> PoolStatistics {
        let counters = &self.inner.counters;
        PoolStatistics {
            max_open_connections: self.inner.options.max_open_connections,
            open_connections: counters.open.load(Ordering::Relaxed),
            in_use: counters.in_use.load(Ordering::Relaxed),
            idle: self.inner.idle_rx.len(),
            wait_count: counters.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_micros(
                counters.wait_duration_micros.load(Ordering::Relaxed),
            ),
            max_idle_closed: counters.max_idle_closed.load(Ordering::Relaxed),
            max_lifetime_closed: counters.max_lifetime_closed.load(Ordering::Relaxed),
        }
    }
}
