use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("The connection pool is closed")]
    /// The pool was closed and no longer hands out connections.
    Closed,

    #[error("The connection worker of {0} has stopped")]
    /// The background thread owning the connection is gone.
    WorkerStopped(String),
}
