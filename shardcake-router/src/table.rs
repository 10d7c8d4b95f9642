use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use futures::future::join_all;

use crate::error::RoutingError;
use crate::pool::ConnectionPool;

/// A primary pool and the replica pool serving its reads.
///
/// When no replica is configured the replica is the *same* pool as the
/// primary, so reads degrade to the primary rather than failing.
pub struct PoolPair<P> {
    primary: Arc<P>,
    replica: Arc<P>,
}

impl<P> Clone for PoolPair<P> {
    fn clone(&self) -> Self {
        Self {
            primary: self.primary.clone(),
            replica: self.replica.clone(),
        }
    }
}

impl<P> Debug for PoolPair<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolPair")
            .field("primary", &Arc::as_ptr(&self.primary))
            .field("replica", &Arc::as_ptr(&self.replica))
            .finish()
    }
}

impl<P> PoolPair<P> {
    /// Creates a new pair, aliasing the replica to the primary if none is given.
    pub fn new(primary: Arc<P>, replica: Option<Arc<P>>) -> Self {
        let replica = replica.unwrap_or_else(|| primary.clone());
        Self { primary, replica }
    }

    #[inline]
    /// The pool serving writes.
    pub fn primary(&self) -> &Arc<P> {
        &self.primary
    }

    #[inline]
    /// The pool serving reads.
    pub fn replica(&self) -> &Arc<P> {
        &self.replica
    }

    /// Returns if the pair has a replica distinct from its primary.
    pub fn has_replica(&self) -> bool {
        !Arc::ptr_eq(&self.primary, &self.replica)
    }

    /// Returns if both pairs are backed by the same pools.
    pub fn same_pools(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.primary, &other.primary)
            && Arc::ptr_eq(&self.replica, &other.replica)
    }

    fn pools(&self) -> impl Iterator<Item = &Arc<P>> {
        [&self.primary, &self.replica].into_iter()
    }
}

/// An immutable snapshot of where every operation is routed to.
///
/// A table is only ever replaced as a whole, never modified.
pub struct RoutingTable<P> {
    generation: u64,
    modulus: i64,
    default: Option<PoolPair<P>>,
    buckets: HashMap<i64, PoolPair<P>>,
}

impl<P> Debug for RoutingTable<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("generation", &self.generation)
            .field("modulus", &self.modulus)
            .field("default", &self.default)
            .field("num_buckets", &self.buckets.len())
            .finish()
    }
}

impl<P> RoutingTable<P> {
    /// Assembles a new table.
    ///
    /// Every bucket listed for a shard is mapped to that shard's pair.
    /// The bucket coverage is expected to already be validated.
    pub fn build(
        generation: u64,
        modulus: i64,
        default: Option<PoolPair<P>>,
        shards: impl IntoIterator<Item = (Vec<i64>, PoolPair<P>)>,
    ) -> Self {
        let mut buckets = HashMap::new();
        for (shard_buckets, pair) in shards {
            for bucket in shard_buckets {
                buckets.insert(bucket, pair.clone());
            }
        }

        Self {
            generation,
            modulus,
            default,
            buckets,
        }
    }

    #[inline]
    /// The generation of the table, increasing with every published table.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn modulus(&self) -> i64 {
        self.modulus
    }

    #[inline]
    pub fn default_pair(&self) -> Option<&PoolPair<P>> {
        self.default.as_ref()
    }

    #[inline]
    pub fn is_sharded(&self) -> bool {
        !self.buckets.is_empty()
    }

    /// Computes the bucket a selector falls into.
    ///
    /// The result is always within `[0, modulus)`, including for negative
    /// selectors. Unsharded tables have no buckets.
    pub fn bucket_for(&self, selector: i64) -> Option<i64> {
        if self.modulus <= 0 {
            return None;
        }
        Some(selector.rem_euclid(self.modulus))
    }

    /// Selects the pool pair serving an operation.
    ///
    /// A selector always routes to the shards when they exist, the default
    /// pair only serves operations without a selector or unsharded tables.
    pub fn resolve(&self, selector: Option<i64>) -> Result<&PoolPair<P>, RoutingError> {
        match selector {
            Some(selector) if self.is_sharded() => {
                let bucket = self
                    .bucket_for(selector)
                    .ok_or(RoutingError::NoInstances)?;
                self.buckets
                    .get(&bucket)
                    .ok_or(RoutingError::NoInstances)
            },
            Some(_) => self.default.as_ref().ok_or(RoutingError::NoInstances),
            None => match (&self.default, self.is_sharded()) {
                (Some(default), _) => Ok(default),
                (None, true) => Err(RoutingError::MissingSelector),
                (None, false) => Err(RoutingError::NoInstances),
            },
        }
    }

    /// Every distinct pool owned by the table.
    ///
    /// Replica aliases and pairs shared by several buckets only appear once.
    pub fn unique_pools(&self) -> Vec<Arc<P>> {
        let mut pools: Vec<Arc<P>> = Vec::new();
        let pairs = self.default.iter().chain(self.buckets.values());

        for pool in pairs.flat_map(PoolPair::pools) {
            if !pools.iter().any(|existing| Arc::ptr_eq(existing, pool)) {
                pools.push(pool.clone());
            }
        }

        pools
    }
}

impl<P: ConnectionPool> RoutingTable<P> {
    /// Closes every pool owned by the table exactly once.
    pub async fn close(&self) -> Result<(), (usize, anyhow::Error)> {
        close_pools(self.unique_pools()).await
    }
}

/// Closes all of the given pools concurrently.
///
/// Returns the number of failures and the first failure observed.
pub(crate) async fn close_pools<P: ConnectionPool>(
    pools: Vec<Arc<P>>,
) -> Result<(), (usize, anyhow::Error)> {
    let results = join_all(pools.iter().map(|pool| pool.close())).await;

    let mut failed = 0;
    let mut first = None;
    for res in results {
        if let Err(e) = res {
            error!(error = ?e, "Failed to close connection pool.");
            failed += 1;
            first.get_or_insert(anyhow::Error::new(e));
        }
    }

    match first {
        None => Ok(()),
        Some(e) => Err((failed, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Pool(&'static str);

    fn pair(name: &'static str) -> PoolPair<Pool> {
        PoolPair::new(Arc::new(Pool(name)), None)
    }

    fn sharded_table(default: Option<PoolPair<Pool>>) -> RoutingTable<Pool> {
        RoutingTable::build(
            1,
            4,
            default,
            [(vec![0, 1], pair("x")), (vec![2, 3], pair("y"))],
        )
    }

    fn name(pair: &PoolPair<Pool>) -> &'static str {
        pair.primary().0
    }

    #[test]
    fn test_replica_aliases_primary() {
        let pair = pair("x");
        assert!(!pair.has_replica());
        assert!(Arc::ptr_eq(pair.primary(), pair.replica()));

        let pair = PoolPair::new(Arc::new(Pool("x")), Some(Arc::new(Pool("x-ro"))));
        assert!(pair.has_replica());
        assert_eq!(pair.replica().0, "x-ro");
    }

    #[test]
    fn test_bucket_normalization() {
        let table = sharded_table(None);
        assert_eq!(table.bucket_for(6), Some(2));
        assert_eq!(table.bucket_for(-1), Some(3));
        assert_eq!(table.bucket_for(-4), Some(0));
        assert_eq!(table.bucket_for(0), Some(0));
        assert_eq!(table.bucket_for(i64::MIN), Some(0));
        assert_eq!(table.bucket_for(i64::MAX), Some(3));
    }

    #[test]
    fn test_resolve_sharded() {
        let table = sharded_table(None);
        assert_eq!(name(table.resolve(Some(6)).unwrap()), "y");
        assert_eq!(name(table.resolve(Some(-1)).unwrap()), "y");
        assert_eq!(name(table.resolve(Some(0)).unwrap()), "x");
        assert_eq!(name(table.resolve(Some(5)).unwrap()), "x");
        assert_eq!(
            table.resolve(None).unwrap_err(),
            RoutingError::MissingSelector
        );
    }

    #[test]
    fn test_resolve_prefers_shards_when_selector_is_given() {
        let table = sharded_table(Some(pair("default")));
        assert_eq!(name(table.resolve(Some(2)).unwrap()), "y");
        assert_eq!(name(table.resolve(None).unwrap()), "default");
    }

    #[test]
    fn test_resolve_unsharded() {
        let table = RoutingTable::build(1, 0, Some(pair("default")), []);
        assert_eq!(name(table.resolve(None).unwrap()), "default");
        assert_eq!(name(table.resolve(Some(-7)).unwrap()), "default");
    }

    #[test]
    fn test_resolve_empty() {
        let table = RoutingTable::<Pool>::build(1, 0, None, []);
        assert_eq!(table.resolve(None).unwrap_err(), RoutingError::NoInstances);
        assert_eq!(table.resolve(Some(1)).unwrap_err(), RoutingError::NoInstances);
    }

    #[test]
    fn test_unique_pools() {
        let shared = PoolPair::new(Arc::new(Pool("x")), Some(Arc::new(Pool("x-ro"))));
        let table = RoutingTable::build(
            1,
            4,
            Some(pair("default")),
            [(vec![0, 1, 2], shared), (vec![3], pair("y"))],
        );

        let mut names = table
            .unique_pools()
            .iter()
            .map(|pool| pool.0)
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, ["default", "x", "x-ro", "y"]);
    }
}
