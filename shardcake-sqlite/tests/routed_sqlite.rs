use std::env::temp_dir;
use std::path::PathBuf;

use shardcake_router::{
    params,
    ConnectionError,
    ConnectionPool,
    OpContext,
    PoolOptions,
    RetirePolicy,
    Router,
    RouterError,
    ShardConfig,
    ShardInstance,
    TxOptions,
};
use shardcake_sqlite::{SqliteConnector, SqliteError};

fn temp_db() -> PathBuf {
    temp_dir().join(format!("{}.db", uuid::Uuid::new_v4()))
}

fn endpoint(path: &PathBuf, mode: &str) -> String {
    format!("sqlite://{}?mode={mode}", path.display())
}

#[tokio::test]
async fn test_routed_sqlite_cluster() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let even = temp_db();
    let odd = temp_db();
    let config = ShardConfig::sharded(
        2,
        vec![
            ShardInstance::new(endpoint(&even, "rwc"), [0]).with_replica(endpoint(&even, "ro")),
            ShardInstance::new(endpoint(&odd, "rwc"), [1]),
        ],
    )
    .with_primary("sqlite::memory:");

    let router = Router::new(SqliteConnector).with_retire_policy(RetirePolicy::Immediate);
    router.configure(config).await?;

    for selector in [0, 1] {
        let handle = router.resolve(OpContext::background(), Some(selector))?;
        handle
            .execute(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
                params![],
            )
            .await?;
    }

    for id in 0..10i64 {
        let handle = router.resolve(OpContext::background(), Some(id))?;
        let res = handle
            .execute(
                "INSERT INTO users (id, name) VALUES (?, ?)",
                params![id, format!("user-{id}")],
            )
            .await?;
        assert_eq!(res.rows_affected, 1);
    }

    // The even shard reads from its read-only replica.
    let handle = router.resolve(OpContext::background(), Some(4))?;
    let ids: Vec<(i64,)> = handle
        .fetch_all("SELECT id FROM users ORDER BY id ASC", params![])
        .await?;
    assert_eq!(ids, vec![(0,), (2,), (4,), (6,), (8,)]);

    let forced: Vec<(i64,)> = handle
        .force_primary()
        .fetch_all("SELECT id FROM users ORDER BY id ASC", params![])
        .await?;
    assert_eq!(forced, ids, "The primary and its replica share the same file.");

    let handle = router.resolve(OpContext::background(), Some(-1))?;
    let names: Vec<(String,)> = handle
        .fetch_all("SELECT name FROM users ORDER BY id ASC", params![])
        .await?;
    assert_eq!(names.len(), 5);
    assert_eq!(names[0].0, "user-1");

    // The default instance is a separate in-memory database.
    let handle = router.resolve(OpContext::background(), None)?;
    let err = handle
        .query("SELECT id FROM users", params![])
        .await
        .expect_err("The default database has no tables.");
    assert!(err.to_string().contains("SELECT id FROM users"));

    router.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_replica_rejects_writes() -> anyhow::Result<()> {
    let path = temp_db();
    let config = ShardConfig::unsharded(endpoint(&path, "rwc")).with_replica(endpoint(&path, "ro"));

    let router = Router::new(SqliteConnector);
    router.configure(config).await?;

    let handle = router.resolve(OpContext::background(), None)?;
    handle
        .execute("CREATE TABLE users (id INTEGER PRIMARY KEY)", params![])
        .await?;

    let err = handle
        .read_pool()
        .execute("INSERT INTO users (id) VALUES (1)", params![])
        .await
        .expect_err("The replica is read only.");
    assert!(matches!(err, SqliteError::Sqlite(_)));

    Ok(())
}

#[tokio::test]
async fn test_transactions_use_the_primary() -> anyhow::Result<()> {
    let path = temp_db();
    let config = ShardConfig::unsharded(endpoint(&path, "rwc")).with_replica(endpoint(&path, "ro"));

    let router = Router::new(SqliteConnector);
    router.configure(config).await?;

    let handle = router.resolve(OpContext::background(), None)?;
    handle
        .execute("CREATE TABLE users (id INTEGER PRIMARY KEY)", params![])
        .await?;

    let mut tx = handle.begin_transaction(TxOptions::default()).await?;
    tx.execute("INSERT INTO users (id) VALUES (1)", params![]).await?;
    tx.execute("INSERT INTO users (id) VALUES (2)", params![]).await?;
    tx.commit().await?;

    let mut tx = handle.begin_transaction(TxOptions::default()).await?;
    tx.execute("INSERT INTO users (id) VALUES (3)", params![]).await?;
    tx.rollback().await?;

    let count: Option<(i64,)> = handle
        .fetch_one("SELECT COUNT(*) FROM users", params![])
        .await?;
    assert_eq!(count, Some((2,)));

    Ok(())
}

#[tokio::test]
async fn test_abandoned_begin_is_rolled_back() -> anyhow::Result<()> {
    let path = temp_db();
    let options = PoolOptions {
        max_open_connections: 1,
        max_idle_connections: 1,
        ..Default::default()
    };
    let config = ShardConfig::unsharded(endpoint(&path, "rwc")).with_pool_options(options);

    let router = Router::new(SqliteConnector);
    router.configure(config).await?;

    let handle = router.resolve(OpContext::background(), None)?;
    handle
        .execute("CREATE TABLE users (id INTEGER PRIMARY KEY)", params![])
        .await?;

    // Give up on the transaction after BEGIN has been handed to the connection.
    let mut begin = Box::pin(handle.begin_transaction(TxOptions::default()));
    let _ = futures::poll!(begin.as_mut());
    drop(begin);

    handle
        .execute("INSERT INTO users (id) VALUES (1)", params![])
        .await?;

    let mut tx = handle.begin_transaction(TxOptions::default()).await?;
    tx.execute("INSERT INTO users (id) VALUES (2)", params![]).await?;
    tx.commit().await?;

    // A fresh pool only sees committed rows.
    let reopened = Router::new(SqliteConnector);
    reopened
        .configure(ShardConfig::unsharded(endpoint(&path, "ro")))
        .await?;
    let count: Option<(i64,)> = reopened
        .resolve(OpContext::background(), None)?
        .fetch_one("SELECT COUNT(*) FROM users", params![])
        .await?;
    assert_eq!(count, Some((2,)));

    Ok(())
}

#[tokio::test]
async fn test_invalid_sqlite_endpoints() -> anyhow::Result<()> {
    let router = Router::new(SqliteConnector);

    let err = router
        .configure(ShardConfig::unsharded("postgres://localhost/app"))
        .await
        .expect_err("Only SQLite endpoints are supported.");
    assert!(matches!(
        err,
        RouterError::Connection(ConnectionError::InvalidEndpoint { .. })
    ));

    let missing = temp_dir()
        .join(uuid::Uuid::new_v4().to_string())
        .join("missing.db");
    let err = router
        .configure(ShardConfig::unsharded(endpoint(&missing, "rw")))
        .await
        .expect_err("The database file does not exist.");
    assert!(matches!(
        err,
        RouterError::Connection(ConnectionError::Unreachable { .. })
    ));
    assert_eq!(router.generation(), None);

    Ok(())
}
