use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::context::OpContext;
use crate::error::OperationError;
use crate::pool::{ConnectionPool, ExecResult, PoolStatistics, PoolTransaction, TxOptions};
use crate::row::{FromRow, Row, RowSet};
use crate::statistics::RouterStatistics;
use crate::table::{PoolPair, RoutingTable};
use crate::value::Value;

/// Runs a pool operation unless the context finishes first.
///
/// The context is checked before the operation starts, and the operation
/// is abandoned as soon as the context is cancelled or its deadline passes.
async fn guarded<T, E, F>(ctx: &OpContext, context: &str, fut: F) -> Result<T, OperationError>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    ctx.check()?;

    let start = Instant::now();
    tokio::select! {
        biased;

        err = ctx.done() => Err(err),
        res = fut => res.map_err(|e| OperationError::Pool {
            context: context.to_string(),
            elapsed: start.elapsed(),
            source: anyhow::Error::new(e),
        }),
    }
}

/// The entry point of a unit of work, bound to a single primary/replica pair.
///
/// Writes and transactions always go to the primary, reads go to the
/// replica unless the handle is switched to [Handle::force_primary].
///
/// A handle stays bound to the pools it was resolved with, even when the
/// router publishes a new routing table meanwhile.
pub struct Handle<P: ConnectionPool> {
    ctx: OpContext,
    pair: PoolPair<P>,
    force_primary: bool,
    snapshot: Arc<RoutingTable<P>>,
    statistics: RouterStatistics,
}

impl<P: ConnectionPool> Clone for Handle<P> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            pair: self.pair.clone(),
            force_primary: self.force_primary,
            snapshot: self.snapshot.clone(),
            statistics: self.statistics.clone(),
        }
    }
}

impl<P: ConnectionPool> Debug for Handle<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("pair", &self.pair)
            .field("force_primary", &self.force_primary)
            .field("generation", &self.snapshot.generation())
            .finish()
    }
}

impl<P: ConnectionPool> Handle<P> {
    pub(crate) fn new(
        ctx: OpContext,
        pair: PoolPair<P>,
        snapshot: Arc<RoutingTable<P>>,
        statistics: RouterStatistics,
    ) -> Self {
        Self {
            ctx,
            pair,
            force_primary: false,
            snapshot,
            statistics,
        }
    }

    /// Returns a copy of the handle which sends every operation to the primary.
    ///
    /// This is useful for reading back writes made within the same unit of
    /// work. The original handle is left untouched.
    pub fn force_primary(&self) -> Self {
        let mut handle = self.clone();
        handle.force_primary = true;
        handle
    }

    #[inline]
    pub fn is_forced_primary(&self) -> bool {
        self.force_primary
    }

    #[inline]
    /// The operation context the handle runs under.
    pub fn context(&self) -> &OpContext {
        &self.ctx
    }

    #[inline]
    /// The pool pair the handle is bound to.
    pub fn pools(&self) -> &PoolPair<P> {
        &self.pair
    }

    #[inline]
    /// The generation of the routing table the handle was resolved from.
    pub fn generation(&self) -> u64 {
        self.snapshot.generation()
    }

    /// The pool serving the reads of this handle.
    pub fn read_pool(&self) -> &Arc<P> {
        if self.force_primary {
            self.pair.primary()
        } else {
            self.pair.replica()
        }
    }

    #[inline]
    /// The pool serving the writes of this handle.
    pub fn write_pool(&self) -> &Arc<P> {
        self.pair.primary()
    }

    /// Execute a write statement with some provided parameters.
    pub async fn execute(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<ExecResult, OperationError> {
        self.ctx.check()?;

        let start = Instant::now();
        let res = guarded(&self.ctx, sql, self.write_pool().execute(sql, params)).await;
        self.statistics.record_write(sql, start);

        let res = res?;
        self.statistics.record_affected_rows(res.rows_affected);
        Ok(res)
    }

    /// Fetch the rows of a given statement with some provided parameters.
    ///
    /// Rows are counted as selected as they are consumed from [Rows].
    pub async fn query(&self, sql: &str, params: Vec<Value>) -> Result<Rows, OperationError> {
        self.ctx.check()?;

        let start = Instant::now();
        let res = guarded(&self.ctx, sql, self.read_pool().query(sql, params)).await;
        self.statistics.record_read(sql, start);

        Ok(Rows::new(res?, self.statistics.clone()))
    }

    /// Fetch the first row of a given statement with some provided parameters.
    pub async fn query_one(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Option<Row>, OperationError> {
        self.ctx.check()?;

        let start = Instant::now();
        let res = guarded(&self.ctx, sql, self.read_pool().query_one(sql, params)).await;
        self.statistics.record_read(sql, start);

        let row = res?;
        if row.is_some() {
            self.statistics.record_selected_rows(1);
        }
        Ok(row)
    }

    /// Fetch the first row of a given statement converted to `T`.
    pub async fn fetch_one<T: FromRow>(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Option<T>, OperationError> {
        let row = self.query_one(sql, params).await?;
        row.map(|row| convert_row(sql, &row)).transpose()
    }

    /// Fetch all rows of a given statement converted to `T`.
    pub async fn fetch_all<T: FromRow>(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<T>, OperationError> {
        let rows = self.query(sql, params).await?;
        rows.map(|row| convert_row(sql, &row)).collect()
    }

    /// Checks that the read pool of the handle is reachable.
    pub async fn ping(&self) -> Result<(), OperationError> {
        guarded(&self.ctx, "ping", self.read_pool().ping()).await
    }

    /// Prepares a statement bound to this handle.
    pub fn prepare(&self, sql: impl Into<String>) -> Result<Statement<'_, P>, OperationError> {
        self.ctx.check()?;
        Ok(Statement {
            handle: self,
            sql: sql.into(),
        })
    }

    /// Starts a transaction on the primary pool.
    pub async fn begin_transaction(
        &self,
        options: TxOptions,
    ) -> Result<Transaction<P>, OperationError> {
        let inner = guarded(&self.ctx, "begin", self.write_pool().begin(options)).await?;

        Ok(Transaction {
            ctx: self.ctx.clone(),
            inner: Some(inner),
            _snapshot: self.snapshot.clone(),
            statistics: self.statistics.clone(),
        })
    }

    /// A point in time view of the read pool of the handle.
    pub fn stats(&self) -> PoolStatistics {
        self.read_pool().statistics()
    }
}

fn convert_row<T: FromRow>(sql: &str, row: &Row) -> Result<T, OperationError> {
    T::from_row(row).map_err(|e| {
        debug!(sql = sql, error = %e, "Failed to decode row.");
        OperationError::Decode(e)
    })
}

/// The rows returned by a read statement.
///
/// Every row handed out is counted as a selected row.
pub struct Rows {
    columns: Arc<[String]>,
    rows: std::vec::IntoIter<Row>,
    statistics: RouterStatistics,
}

impl Debug for Rows {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("columns", &self.columns)
            .field("remaining", &self.rows.len())
            .finish()
    }
}

impl Rows {
    fn new(set: RowSet, statistics: RouterStatistics) -> Self {
        Self {
            columns: set.columns,
            rows: set.rows.into_iter(),
            statistics,
        }
    }

    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.next()?;
        self.statistics.record_selected_rows(1);
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for Rows {}

/// A statement bound to a [Handle], executed with different parameters.
pub struct Statement<'a, P: ConnectionPool> {
    handle: &'a Handle<P>,
    sql: String,
}

impl<'a, P: ConnectionPool> Statement<'a, P> {
    #[inline]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub async fn execute(&self, params: Vec<Value>) -> Result<ExecResult, OperationError> {
        self.handle.execute(&self.sql, params).await
    }

    pub async fn query(&self, params: Vec<Value>) -> Result<Rows, OperationError> {
        self.handle.query(&self.sql, params).await
    }

    pub async fn query_one(&self, params: Vec<Value>) -> Result<Option<Row>, OperationError> {
        self.handle.query_one(&self.sql, params).await
    }
}

/// A transaction running on the primary pool of a [Handle].
///
/// If the operation context finishes, the next operation rolls the
/// transaction back and fails.
///
/// Like its handle, a transaction keeps the pools it runs on from being
/// retired until it is dropped.
pub struct Transaction<P: ConnectionPool> {
    ctx: OpContext,
    inner: Option<P::Transaction>,
    _snapshot: Arc<RoutingTable<P>>,
    statistics: RouterStatistics,
}

impl<P: ConnectionPool> Transaction<P> {
    /// Fails and rolls back the transaction if the context has finished.
    async fn check_context(&mut self) -> Result<(), OperationError> {
        if let Some(err) = self.ctx.err() {
            if let Some(inner) = self.inner.take() {
                if let Err(e) = inner.rollback().await {
                    warn!(error = ?e, "Failed to roll back cancelled transaction.");
                }
            }
            return Err(err);
        }

        Ok(())
    }

    fn inner(&mut self) -> Result<&mut P::Transaction, OperationError> {
        self.inner.as_mut().ok_or(OperationError::TransactionFinished)
    }

    pub async fn execute(
        &mut self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<ExecResult, OperationError> {
        self.check_context().await?;

        let start = Instant::now();
        let ctx = self.ctx.clone();
        let res = guarded(&ctx, sql, self.inner()?.execute(sql, params)).await;
        self.statistics.record_write(sql, start);

        let res = res?;
        self.statistics.record_affected_rows(res.rows_affected);
        Ok(res)
    }

    pub async fn query(&mut self, sql: &str, params: Vec<Value>) -> Result<Rows, OperationError> {
        self.check_context().await?;

        let start = Instant::now();
        let ctx = self.ctx.clone();
        let res = guarded(&ctx, sql, self.inner()?.query(sql, params)).await;
        self.statistics.record_read(sql, start);

        Ok(Rows::new(res?, self.statistics.clone()))
    }

    pub async fn query_one(
        &mut self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Option<Row>, OperationError> {
        self.check_context().await?;

        let start = Instant::now();
        let ctx = self.ctx.clone();
        let res = guarded(&ctx, sql, self.inner()?.query_one(sql, params)).await;
        self.statistics.record_read(sql, start);

        let row = res?;
        if row.is_some() {
            self.statistics.record_selected_rows(1);
        }
        Ok(row)
    }

    /// Commits the transaction.
    pub async fn commit(mut self) -> Result<(), OperationError> {
        self.check_context().await?;

        let inner = self.inner.take().ok_or(OperationError::TransactionFinished)?;
        let start = Instant::now();
        inner.commit().await.map_err(|e| OperationError::Pool {
            context: "commit".to_string(),
            elapsed: start.elapsed(),
            source: anyhow::Error::new(e),
        })
    }

    /// Rolls back the transaction.
    pub async fn rollback(mut self) -> Result<(), OperationError> {
        let inner = self.inner.take().ok_or(OperationError::TransactionFinished)?;
        let start = Instant::now();
        inner.rollback().await.map_err(|e| OperationError::Pool {
            context: "rollback".to_string(),
            elapsed: start.elapsed(),
            source: anyhow::Error::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::{MemoryConnector, MemoryPool};
    use crate::params;
    use crate::{Router, ShardConfig};

    async fn router(config: ShardConfig) -> Router<MemoryConnector> {
        let router = Router::new(MemoryConnector::default());
        router.configure(config).await.expect("Configure router.");
        router
    }

    fn pool(router: &Router<MemoryConnector>, name: &str) -> MemoryPool {
        router.connector().pools_named(name).remove(0)
    }

    #[tokio::test]
    async fn test_read_write_split() {
        let router =
            router(ShardConfig::unsharded("mem://primary").with_replica("mem://replica")).await;
        let handle = router
            .resolve(OpContext::background(), None)
            .expect("Resolve handle.");

        handle
            .execute("INSERT INTO t VALUES (?)", params![1])
            .await
            .expect("Execute write.");
        let rows = handle
            .query("SELECT * FROM t", params![])
            .await
            .expect("Execute read.")
            .collect::<Vec<_>>();
        assert_eq!(rows[0].get::<String>(0), Ok("replica".to_string()));

        let forced = handle.force_primary();
        let row = forced
            .query_one("SELECT 1", params![])
            .await
            .expect("Execute forced read.")
            .expect("Row is returned.");
        assert_eq!(row.get_named::<String>("pool"), Ok("primary".to_string()));
        assert!(!handle.is_forced_primary(), "Original handle is unaffected.");

        assert_eq!(
            pool(&router, "primary").statements(),
            ["INSERT INTO t VALUES (?)", "SELECT 1"]
        );
        assert_eq!(pool(&router, "replica").statements(), ["SELECT * FROM t"]);

        let stats = router.statistics();
        assert_eq!(stats.num_writes(), 1);
        assert_eq!(stats.num_reads(), 2);
        assert_eq!(stats.num_affected_rows(), 1);
        assert_eq!(stats.num_selected_rows(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_context_never_reaches_pool() {
        let router = router(ShardConfig::unsharded("mem://primary")).await;
        let ctx = OpContext::background();
        let handle = router.resolve(ctx.clone(), None).expect("Resolve handle.");
        ctx.cancel();

        let err = handle
            .execute("DELETE FROM t", params![])
            .await
            .expect_err("Context is cancelled.");
        assert!(matches!(err, OperationError::Cancelled));

        let err = handle
            .query("SELECT 1", params![])
            .await
            .expect_err("Context is cancelled.");
        assert!(err.is_cancellation());
        assert!(handle.prepare("SELECT 1").is_err());
        assert!(pool(&router, "primary").statements().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_aborts_inflight_operation() {
        let connector = MemoryConnector::default();
        connector.set_latency(Duration::from_secs(60));
        let router = Router::new(connector);
        router
            .configure(ShardConfig::unsharded("mem://slow"))
            .await
            .expect("Configure router.");

        let ctx = OpContext::background().with_timeout(Duration::from_millis(50));
        let handle = router.resolve(ctx, None).expect("Resolve handle.");

        let start = Instant::now();
        let err = handle
            .query_one("SELECT 1", params![])
            .await
            .expect_err("Deadline should be exceeded.");
        assert!(matches!(err, OperationError::DeadlineExceeded));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pool_errors_carry_context() {
        let router = router(ShardConfig::unsharded("mem://primary")).await;
        let handle = router
            .resolve(OpContext::background(), None)
            .expect("Resolve handle.");
        router.close().await.expect("Close router.");

        let err = handle
            .execute("UPDATE t SET a = 1", params![])
            .await
            .expect_err("Pool is closed.");
        match err {
            OperationError::Pool {
                context, source, ..
            } => {
                assert_eq!(context, "UPDATE t SET a = 1");
                assert!(source
                    .downcast_ref::<crate::memory::MemoryError>()
                    .is_some());
            },
            other => panic!("Unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_statement() {
        let router = router(ShardConfig::unsharded("mem://primary")).await;
        let handle = router
            .resolve(OpContext::background(), None)
            .expect("Resolve handle.");

        let stmt = handle.prepare("INSERT INTO t VALUES (?)").expect("Prepare.");
        stmt.execute(params![1]).await.expect("Execute statement.");
        stmt.execute(params![2]).await.expect("Execute statement.");
        assert_eq!(pool(&router, "primary").statements().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_typed_rows() {
        let router = router(ShardConfig::unsharded("mem://primary")).await;
        let handle = router
            .resolve(OpContext::background(), None)
            .expect("Resolve handle.");

        let rows = handle
            .fetch_all::<(String, String)>("SELECT pool, sql", params![])
            .await
            .expect("Fetch rows.");
        assert_eq!(rows, [("primary".to_string(), "SELECT pool, sql".to_string())]);

        let err = handle
            .fetch_one::<(i64,)>("SELECT pool", params![])
            .await
            .expect_err("Text cannot be converted to i64.");
        assert!(matches!(err, OperationError::Decode(_)));
    }

    #[tokio::test]
    async fn test_transaction_uses_primary() {
        let router =
            router(ShardConfig::unsharded("mem://primary").with_replica("mem://replica")).await;
        let handle = router
            .resolve(OpContext::background(), None)
            .expect("Resolve handle.");

        let mut tx = handle
            .begin_transaction(TxOptions::default())
            .await
            .expect("Begin transaction.");
        tx.execute("INSERT INTO t VALUES (1)", params![])
            .await
            .expect("Execute in transaction.");
        let row = tx
            .query_one("SELECT 1", params![])
            .await
            .expect("Query in transaction.")
            .expect("Row is returned.");
        assert_eq!(row.get::<String>(0), Ok("primary".to_string()));
        tx.commit().await.expect("Commit transaction.");

        assert_eq!(
            pool(&router, "primary").statements(),
            ["BEGIN", "INSERT INTO t VALUES (1)", "SELECT 1", "COMMIT"]
        );
        assert!(pool(&router, "replica").statements().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_transaction_rolls_back() {
        let router = router(ShardConfig::unsharded("mem://primary")).await;
        let ctx = OpContext::background();
        let handle = router.resolve(ctx.clone(), None).expect("Resolve handle.");

        let mut tx = handle
            .begin_transaction(TxOptions::default())
            .await
            .expect("Begin transaction.");
        ctx.cancel();

        let err = tx
            .execute("INSERT INTO t VALUES (1)", params![])
            .await
            .expect_err("Context is cancelled.");
        assert!(matches!(err, OperationError::Cancelled));
        assert_eq!(pool(&router, "primary").statements(), ["BEGIN", "ROLLBACK"]);

        let err = tx.commit().await.expect_err("Context is cancelled.");
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_stats_reports_read_pool() {
        let router = router(ShardConfig::unsharded("mem://primary")).await;
        let handle = router
            .resolve(OpContext::background(), None)
            .expect("Resolve handle.");

        let stats = handle.stats();
        assert_eq!(stats.open_connections, 1);
        assert_eq!(stats.max_open_connections, 0);
    }
}
