#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Map};
use shardcake::router::{OpContext, Router, Row, ShardConfig, Value};
use shardcake::sqlite::SqliteConnector;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Args = Args::parse();

    let config = load_config(&args.config)?;
    let router = Router::new(SqliteConnector);
    router.configure(config).await?;

    let mut ctx = OpContext::background();
    if let Some(timeout) = args.timeout_ms {
        ctx = ctx.with_timeout(Duration::from_millis(timeout));
    }

    let mut handle = router.resolve(ctx, args.selector)?;
    if args.primary {
        handle = handle.force_primary();
    }

    let params = args.params.iter().map(|p| parse_param(p)).collect::<Vec<_>>();

    if args.write {
        let res = handle.execute(&args.sql, params).await?;
        info!(
            generation = handle.generation(),
            rows_affected = res.rows_affected,
            "Statement executed."
        );
        println!(
            "{}",
            json!({
                "rows_affected": res.rows_affected,
                "last_insert_id": res.last_insert_id,
            })
        );
    } else {
        let rows = handle.query(&args.sql, params).await?;
        for row in rows {
            println!("{}", row_to_json(&row));
        }
    }

    router.close().await?;

    Ok(())
}

fn load_config(path: &PathBuf) -> Result<ShardConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ShardConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Integers and floats are bound as numbers, everything else as text.
fn parse_param(raw: &str) -> Value {
    if raw == "null" {
        return Value::Null;
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Value::Integer(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return Value::Real(v);
    }
    Value::Text(raw.to_string())
}

fn row_to_json(row: &Row) -> serde_json::Value {
    let mut object = Map::with_capacity(row.len());
    for (column, value) in row.columns().iter().zip(row.values()) {
        let value = match value {
            Value::Null => serde_json::Value::Null,
            Value::Integer(v) => json!(v),
            Value::Real(v) => json!(v),
            Value::Text(v) => json!(v),
            Value::Blob(v) => json!(v),
        };
        object.insert(column.clone(), value);
    }
    serde_json::Value::Object(object)
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(long)]
    /// The path of the JSON shard config.
    config: PathBuf,

    #[arg(long, allow_hyphen_values = true)]
    /// The shard selector, i.e. the user ID the statement operates on.
    ///
    /// Without a selector the statement runs on the default instance.
    selector: Option<i64>,

    #[arg(long)]
    /// The SQL statement to run.
    sql: String,

    #[arg(long = "param", allow_hyphen_values = true)]
    /// The statement parameters, in order.
    params: Vec<String>,

    #[arg(long)]
    /// Run the statement as a write on the primary.
    write: bool,

    #[arg(long)]
    /// Read from the primary instead of the replica.
    primary: bool,

    #[arg(long)]
    /// Abort the statement after this many milliseconds.
    timeout_ms: Option<u64>,
}
