use async_trait::async_trait;
use shardcake_router::{ExecResult, PoolTransaction, Row, RowSet, TxOptions, Value};

use crate::error::SqliteError;
use crate::pool::PooledConnection;

/// A transaction holding a single connection of a [crate::SqlitePool].
///
/// A transaction dropped without being committed or rolled back is rolled
/// back before its connection is reused.
pub struct SqliteTransaction {
    conn: PooledConnection,
    options: TxOptions,
    finished: bool,
}

impl SqliteTransaction {
    pub(crate) fn new(conn: PooledConnection, options: TxOptions) -> Self {
        Self {
            conn,
            options,
            finished: false,
        }
    }

    #[inline]
    pub fn options(&self) -> TxOptions {
        self.options
    }

    pub(crate) async fn start(&mut self) -> Result<(), SqliteError> {
        let res = self.conn.handle()?.begin(self.options).await;
        if res.is_err() {
            // A failed BEGIN leaves nothing to roll back.
            self.finished = true;
        }
        self.conn.check(res)
    }

    async fn finish(mut self, commit: bool) -> Result<(), SqliteError> {
        let res = self
            .conn
            .handle()?
            .finish(commit, self.options.read_only)
            .await;
        self.finished = true;

        // A transaction which failed to finish may still be open.
        if res.is_err() {
            self.conn.discard();
        }
        res
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let queued = match self.conn.handle() {
            Ok(handle) => handle.queue_rollback(self.options.read_only),
            Err(_) => return,
        };

        if !queued {
            self.conn.discard();
        }
    }
}

#[async_trait]
impl PoolTransaction for SqliteTransaction {
    type Error = SqliteError;

    async fn execute(&mut self, sql: &str, params: Vec<Value>) -> Result<ExecResult, Self::Error> {
        let res = self.conn.handle()?.execute(sql, params).await;
        self.conn.check(res)
    }

    async fn query(&mut self, sql: &str, params: Vec<Value>) -> Result<RowSet, Self::Error> {
        let res = self.conn.handle()?.query(sql, params).await;
        self.conn.check(res)
    }

    async fn query_one(
        &mut self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Option<Row>, Self::Error> {
        let res = self.conn.handle()?.query_one(sql, params).await;
        self.conn.check(res)
    }

    async fn commit(self) -> Result<(), Self::Error> {
        self.finish(true).await
    }

    async fn rollback(self) -> Result<(), Self::Error> {
        self.finish(false).await
    }
}
