use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{self, Receiver, Sender};
use futures::channel::oneshot;
use rusqlite::{params_from_iter, types, Connection, OptionalExtension};
use shardcake_router::{ExecResult, IsolationLevel, Row, RowSet, TxOptions, Value};

use crate::endpoint::SqliteEndpoint;
use crate::error::SqliteError;

type Task = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

const CAPACITY: usize = 10;

/// An asynchronous wrapper around a single SQLite connection.
///
/// The connection lives in a background thread and every operation is
/// executed there, preventing any IO from blocking the async context.
/// The thread exits once the handle is dropped.
pub(crate) struct ConnectionHandle {
    tx: Sender<Task>,
    endpoint: Arc<str>,
    opened_at: Instant,
}

impl ConnectionHandle {
    /// Opens a new connection to the database.
    pub(crate) async fn open(endpoint: &SqliteEndpoint) -> Result<Self, SqliteError> {
        let name: Arc<str> = endpoint.to_string().into();
        let (tx, rx) = flume::bounded(CAPACITY);

        let endpoint = endpoint.clone();
        tokio::task::spawn_blocking(move || setup_connection(&endpoint, rx))
            .await
            .map_err(|_| SqliteError::WorkerStopped(name.to_string()))??;

        Ok(Self {
            tx,
            endpoint: name,
            opened_at: Instant::now(),
        })
    }

    #[inline]
    /// How long ago the connection was opened.
    pub(crate) fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Execute a SQL statement with some provided parameters.
    pub(crate) async fn execute(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<ExecResult, SqliteError> {
        let sql = sql.to_string();
        self.submit_task(move |conn| {
            let rows_affected = {
                let mut prepared = conn.prepare_cached(&sql)?;
                prepared.execute(params_from_iter(params.into_iter().map(to_sql_value)))?
            };

            Ok(ExecResult {
                rows_affected: rows_affected as u64,
                last_insert_id: Some(conn.last_insert_rowid()),
            })
        })
        .await
    }

    /// Fetch all rows from a given SQL statement with some provided parameters.
    pub(crate) async fn query(&self, sql: &str, params: Vec<Value>) -> Result<RowSet, SqliteError> {
        let sql = sql.to_string();
        self.submit_task(move |conn| {
            let mut prepared = conn.prepare_cached(&sql)?;
            let columns = column_names(&prepared);
            let num_columns = columns.len();

            let mut iter = prepared.query(params_from_iter(params.into_iter().map(to_sql_value)))?;
            let mut rows = Vec::with_capacity(4);
            while let Some(row) = iter.next()? {
                rows.push(read_row(&columns, num_columns, row)?);
            }

            Ok(RowSet::new(columns, rows))
        })
        .await
    }

    /// Fetch a single row from a given SQL statement with some provided parameters.
    pub(crate) async fn query_one(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Option<Row>, SqliteError> {
        let sql = sql.to_string();
        self.submit_task(move |conn| {
            let mut prepared = conn.prepare_cached(&sql)?;
            let columns = column_names(&prepared);
            let num_columns = columns.len();

            let row = prepared
                .query_row(params_from_iter(params.into_iter().map(to_sql_value)), |row| {
                    read_row(&columns, num_columns, row)
                })
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Starts a transaction on the connection.
    pub(crate) async fn begin(&self, options: TxOptions) -> Result<(), SqliteError> {
        self.submit_task(move |conn| {
            if options.read_only {
                conn.pragma_update(None, "query_only", true)?;
            }

            let begin = match options.isolation {
                IsolationLevel::Serializable => "BEGIN IMMEDIATE",
                _ => "BEGIN",
            };

            if let Err(e) = conn.execute_batch(begin) {
                if options.read_only {
                    let _ = conn.pragma_update(None, "query_only", false);
                }
                return Err(e);
            }

            Ok(())
        })
        .await
    }

    /// Commits or rolls back the transaction started by [ConnectionHandle::begin].
    pub(crate) async fn finish(&self, commit: bool, read_only: bool) -> Result<(), SqliteError> {
        self.submit_task(move |conn| finish_transaction(conn, commit, read_only))
            .await
    }

    /// Queues a rollback of the open transaction without waiting for it.
    ///
    /// Returns `false` if the task could not be queued.
    pub(crate) fn queue_rollback(&self, read_only: bool) -> bool {
        let task: Task = Box::new(move |conn| {
            if let Err(e) = finish_transaction(conn, false, read_only) {
                warn!(error = ?e, "Failed to roll back abandoned transaction.");
            }
        });

        self.tx.try_send(task).is_ok()
    }

    /// Checks the connection is still usable.
    pub(crate) async fn ping(&self) -> Result<(), SqliteError> {
        self.submit_task(|conn| conn.query_row("SELECT 1", (), |_row| Ok(())))
            .await
    }

    /// Submits a task to execute on the connection's thread.
    async fn submit_task<CB, T>(&self, inner: CB) -> Result<T, SqliteError>
    where
        T: Send + 'static,
        CB: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let cb = move |conn: &mut Connection| {
            let res = inner(conn);
            let _ = tx.send(res);
        };

        self.tx
            .send_async(Box::new(cb))
            .await
            .map_err(|_| SqliteError::WorkerStopped(self.endpoint.to_string()))?;

        let res = rx
            .await
            .map_err(|_| SqliteError::WorkerStopped(self.endpoint.to_string()))?;
        Ok(res?)
    }
}

fn finish_transaction(conn: &mut Connection, commit: bool, read_only: bool) -> rusqlite::Result<()> {
    let res = conn.execute_batch(if commit { "COMMIT" } else { "ROLLBACK" });

    if read_only {
        conn.pragma_update(None, "query_only", false)?;
    }

    res
}

fn column_names(prepared: &rusqlite::Statement) -> Arc<[String]> {
    prepared
        .column_names()
        .into_iter()
        .map(String::from)
        .collect()
}

fn read_row(
    columns: &Arc<[String]>,
    num_columns: usize,
    row: &rusqlite::Row,
) -> rusqlite::Result<Row> {
    let mut values = Vec::with_capacity(num_columns);
    for index in 0..num_columns {
        values.push(from_sql_value(row.get::<_, types::Value>(index)?));
    }
    Ok(Row::new(columns.clone(), values))
}

pub(crate) fn to_sql_value(value: Value) -> types::Value {
    match value {
        Value::Null => types::Value::Null,
        Value::Integer(v) => types::Value::Integer(v),
        Value::Real(v) => types::Value::Real(v),
        Value::Text(v) => types::Value::Text(v),
        Value::Blob(v) => types::Value::Blob(v),
    }
}

pub(crate) fn from_sql_value(value: types::Value) -> Value {
    match value {
        types::Value::Null => Value::Null,
        types::Value::Integer(v) => Value::Integer(v),
        types::Value::Real(v) => Value::Real(v),
        types::Value::Text(v) => Value::Text(v),
        types::Value::Blob(v) => Value::Blob(v),
    }
}

fn setup_connection(endpoint: &SqliteEndpoint, tasks: Receiver<Task>) -> rusqlite::Result<()> {
    let conn = match endpoint {
        SqliteEndpoint::Memory => Connection::open_in_memory()?,
        SqliteEndpoint::File { path, mode } => {
            let conn = Connection::open_with_flags(path, mode.flags())?;

            if !mode.is_read_only() {
                conn.query_row("pragma journal_mode = WAL;", (), |_r| Ok(()))?;
                conn.execute("pragma synchronous = normal;", ())?;
            }
            conn.execute("pragma temp_store = memory;", ())?;
            conn
        },
    };

    std::thread::spawn(move || run_tasks(conn, tasks));

    Ok(())
}

/// Runs all tasks received with a mutable reference to the given connection.
fn run_tasks(mut conn: Connection, tasks: Receiver<Task>) {
    while let Ok(task) = tasks.recv() {
        (task)(&mut conn);
    }
}
