use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::ShardConfig;
use crate::context::OpContext;
use crate::error::{RouterError, RoutingError};
use crate::handle::Handle;
use crate::opener::PoolOpener;
use crate::pool::{ConnectionPool, PoolConnector};
use crate::statistics::RouterStatistics;
use crate::table::{PoolPair, RoutingTable};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What happens to a routing table once it has been replaced.
pub enum RetirePolicy {
    /// Close the pools of the table as soon as the new table is published.
    ///
    /// Handles still bound to the old pools start failing.
    Immediate,
    /// Close the pools of the table once no handle references it anymore,
    /// or once `timeout` has elapsed, whichever comes first.
    Drain { timeout: Duration },
}

impl Default for RetirePolicy {
    fn default() -> Self {
        Self::Drain {
            timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Routes operations to the connection pools of a sharded database cluster.
///
/// The router owns the currently published [RoutingTable]. Resolving an
/// operation is a lock-free load of that table, while [Router::configure]
/// builds an entirely new table and swaps it in atomically.
///
/// Draining replaced tables runs on the current Tokio runtime. Without
/// one, replaced tables are closed straight away.
///
/// ```rust
/// use shardcake_router::memory::MemoryConnector;
/// use shardcake_router::{params, OpContext, Router, ShardConfig, ShardInstance};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let router = Router::new(MemoryConnector::default());
/// router
///     .configure(ShardConfig::sharded(
///         2,
///         vec![
///             ShardInstance::new("mem://shard-0", [0]),
///             ShardInstance::new("mem://shard-1", [1]),
///         ],
///     ))
///     .await?;
///
/// let handle = router.resolve(OpContext::background(), Some(42))?;
/// handle.execute("UPDATE users SET name = ? WHERE id = ?", params!["bob", 42]).await?;
/// # Ok(())
/// # }
/// ```
pub struct Router<C: PoolConnector> {
    connector: C,
    current: ArcSwapOption<RoutingTable<C::Pool>>,
    retire_policy: RetirePolicy,
    statistics: RouterStatistics,
    next_generation: AtomicU64,
    reconfigure_lock: Mutex<()>,
}

impl<C: PoolConnector> Router<C> {
    /// Creates a new, unconfigured router.
    ///
    /// Every resolution fails with [RoutingError::NotInitialized] until
    /// [Router::configure] succeeds once.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            current: ArcSwapOption::empty(),
            retire_policy: RetirePolicy::default(),
            statistics: RouterStatistics::default(),
            next_generation: AtomicU64::new(1),
            reconfigure_lock: Mutex::new(()),
        }
    }

    /// Sets what happens to replaced routing tables.
    pub fn with_retire_policy(mut self, policy: RetirePolicy) -> Self {
        self.retire_policy = policy;
        self
    }

    #[inline]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    #[inline]
    pub fn retire_policy(&self) -> RetirePolicy {
        self.retire_policy
    }

    #[inline]
    /// Live statistics of the router and every handle it created.
    pub fn statistics(&self) -> &RouterStatistics {
        &self.statistics
    }

    /// The currently published routing table, if any.
    pub fn snapshot(&self) -> Option<Arc<RoutingTable<C::Pool>>> {
        self.current.load_full()
    }

    /// The generation of the currently published table, if any.
    pub fn generation(&self) -> Option<u64> {
        let guard = self.current.load();
        (*guard).as_ref().map(|table| table.generation())
    }

    /// Selects the pool pair serving an operation with the given selector.
    pub fn resolve_pair(
        &self,
        selector: Option<i64>,
    ) -> Result<PoolPair<C::Pool>, RoutingError> {
        let guard = self.current.load();
        let table = (*guard).as_ref().ok_or(RoutingError::NotInitialized)?;
        table.resolve(selector).cloned()
    }

    /// Creates a [Handle] for a unit of work.
    ///
    /// The selector picks the shard; operations without a selector are
    /// served by the default instance. The handle keeps working on the
    /// pools it was bound to even if the router is reconfigured meanwhile.
    pub fn resolve(
        &self,
        ctx: OpContext,
        selector: Option<i64>,
    ) -> Result<Handle<C::Pool>, RoutingError> {
        let table = self.current.load_full().ok_or(RoutingError::NotInitialized)?;
        let pair = table.resolve(selector).map_err(|e| {
            debug!(selector = ?selector, error = %e, "Failed to resolve connection pools.");
            e
        })?;

        Ok(Handle::new(ctx, pair.clone(), table, self.statistics.clone()))
    }

    /// Applies a new configuration.
    ///
    /// The config is validated, every pool is opened and pinged and the
    /// resulting table is published in a single atomic swap. If any step
    /// fails the currently published table stays in place and every pool
    /// opened by the attempt is closed again.
    ///
    /// The replaced table is retired according to the router's [RetirePolicy].
    pub async fn configure(&self, config: ShardConfig) -> Result<(), RouterError> {
        let _guard = self.reconfigure_lock.lock().await;

        let table = match self.build_table(&config).await {
            Ok(table) => Arc::new(table),
            Err(e) => {
                self.statistics
                    .num_failed_reconfigurations
                    .fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Failed to apply router configuration.");
                return Err(e);
            },
        };

        let generation = table.generation();
        let old = self.current.swap(Some(table));
        self.statistics
            .num_reconfigurations
            .fetch_add(1, Ordering::Relaxed);

        info!(
            generation = generation,
            modulus = config.modulus,
            num_shards = config.shards.len(),
            has_default = config.default_primary().is_some(),
            "Routing table published."
        );

        if let Some(old) = old {
            self.retire(old).await;
        }

        Ok(())
    }

    async fn build_table(
        &self,
        config: &ShardConfig,
    ) -> Result<RoutingTable<C::Pool>, RouterError> {
        config.validate()?;

        let mut opener = PoolOpener::new(&self.connector, config.pool);

        // Every endpoint is parsed before any connection is attempted.
        let default = match config.default_primary() {
            Some(primary) => Some(opener.parse_pair(primary, config.default_replica())?),
            None => None,
        };
        let mut shards = Vec::with_capacity(config.shards.len());
        for shard in config.shards.iter() {
            shards.push(opener.parse_pair(&shard.primary, shard.replica())?);
        }

        let mut opened_shards = Vec::with_capacity(shards.len());
        let default_pair = match default.as_ref() {
            Some(parsed) => match opener.open_pair(parsed).await {
                Ok(pair) => Some(pair),
                Err(e) => {
                    opener.rollback().await;
                    return Err(e.into());
                },
            },
            None => None,
        };

        for (shard, parsed) in config.shards.iter().zip(shards.iter()) {
            match opener.open_pair(parsed).await {
                Ok(pair) => opened_shards.push((shard.buckets.clone(), pair)),
                Err(e) => {
                    opener.rollback().await;
                    return Err(e.into());
                },
            }
        }

        opener.finish();

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        Ok(RoutingTable::build(
            generation,
            config.modulus,
            default_pair,
            opened_shards,
        ))
    }

    async fn retire(&self, table: Arc<RoutingTable<C::Pool>>) {
        let statistics = self.statistics.clone();

        match self.retire_policy {
            RetirePolicy::Immediate => close_retired(table, statistics).await,
            RetirePolicy::Drain { timeout } => {
                let runtime = match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => runtime,
                    Err(_) => {
                        warn!(
                            generation = table.generation(),
                            "No Tokio runtime to drain on, closing retired routing table now."
                        );
                        close_retired(table, statistics).await;
                        return;
                    },
                };

                runtime.spawn(async move {
                    let deadline = Instant::now() + timeout;

                    // The only remaining reference is ours once every handle is dropped.
                    while Arc::strong_count(&table) > 1 {
                        if Instant::now() >= deadline {
                            warn!(
                                generation = table.generation(),
                                num_references = Arc::strong_count(&table) - 1,
                                "Drain timeout elapsed, closing retired routing table with live handles."
                            );
                            break;
                        }
                        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
                    }

                    close_retired(table, statistics).await;
                });
            },
        }
    }

    /// Unpublishes the current table and closes all of its pools.
    ///
    /// Resolution fails with [RoutingError::NotInitialized] afterwards,
    /// until the router is configured again.
    pub async fn close(&self) -> Result<(), RouterError> {
        let _guard = self.reconfigure_lock.lock().await;

        let table = match self.current.swap(None) {
            Some(table) => table,
            None => return Ok(()),
        };

        info!(generation = table.generation(), "Closing router.");
        table.close().await.map_err(|(failed, source)| {
            self.statistics
                .num_close_failures
                .fetch_add(failed as u64, Ordering::Relaxed);
            RouterError::Close { failed, source }
        })
    }
}

async fn close_retired<P: ConnectionPool>(
    table: Arc<RoutingTable<P>>,
    statistics: RouterStatistics,
) {
    let generation = table.generation();
    match table.close().await {
        Ok(()) => debug!(generation = generation, "Retired routing table closed."),
        Err((failed, e)) => {
            statistics
                .num_close_failures
                .fetch_add(failed as u64, Ordering::Relaxed);
            warn!(
                generation = generation,
                num_failed = failed,
                error = %e,
                "Failed to close every pool of the retired routing table."
            );
        },
    }
}
