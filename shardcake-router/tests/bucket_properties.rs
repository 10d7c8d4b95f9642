use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use shardcake_router::{ConfigError, PoolPair, RoutingTable, ShardConfig, ShardInstance};

/// Splits `[0, modulus)` into shards, `owners[bucket]` being the owning shard.
fn partition(modulus: i64, owners: &[usize]) -> Vec<ShardInstance> {
    let num_shards = owners.iter().copied().max().map(|n| n + 1).unwrap_or(0);
    let mut shards = (0..num_shards)
        .map(|id| ShardInstance::new(format!("mem://shard-{id}"), []))
        .collect::<Vec<_>>();

    for bucket in 0..modulus {
        shards[owners[bucket as usize]].buckets.push(bucket);
    }

    shards.retain(|shard| !shard.buckets.is_empty());
    shards
}

fn partition_strategy() -> impl Strategy<Value = (i64, Vec<usize>)> {
    (1..64i64).prop_flat_map(|modulus| {
        (
            Just(modulus),
            prop::collection::vec(0..8usize, modulus as usize),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn exact_partitions_are_accepted((modulus, owners) in partition_strategy()) {
        let config = ShardConfig::sharded(modulus, partition(modulus, &owners));
        prop_assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn uncovered_buckets_are_reported(
        (modulus, owners) in partition_strategy(),
        removed in prop::collection::btree_set(0..64i64, 1..8)
    ) {
        let removed = removed
            .into_iter()
            .filter(|bucket| *bucket < modulus)
            .collect::<BTreeSet<_>>();
        prop_assume!(!removed.is_empty());

        let mut shards = partition(modulus, &owners);
        for shard in shards.iter_mut() {
            shard.buckets.retain(|bucket| !removed.contains(bucket));
        }

        let config = ShardConfig::sharded(modulus, shards);
        prop_assert_eq!(
            config.validate(),
            Err(ConfigError::MissingBuckets(removed.into_iter().collect()))
        );
    }

    #[test]
    fn overlapping_buckets_are_reported(
        (modulus, owners) in partition_strategy(),
        repeated in prop::collection::btree_set(0..64i64, 1..8)
    ) {
        let repeated = repeated
            .into_iter()
            .filter(|bucket| *bucket < modulus)
            .collect::<BTreeSet<_>>();
        prop_assume!(!repeated.is_empty());

        let mut shards = partition(modulus, &owners);
        shards.push(ShardInstance::new("mem://overlap", repeated.iter().copied()));

        let config = ShardConfig::sharded(modulus, shards);
        prop_assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateBuckets(repeated.into_iter().collect()))
        );
    }

    #[test]
    fn out_of_range_buckets_are_reported(
        (modulus, owners) in partition_strategy(),
        offset in 0..1_000i64,
        negative in any::<bool>()
    ) {
        let bucket = if negative { -1 - offset } else { modulus + offset };

        let mut shards = partition(modulus, &owners);
        shards[0].buckets.push(bucket);

        let config = ShardConfig::sharded(modulus, shards);
        prop_assert_eq!(
            config.validate(),
            Err(ConfigError::BucketsOutOfRange { buckets: vec![bucket], modulus })
        );
    }

    #[test]
    fn selectors_are_normalized(modulus in 1..512i64, selector in any::<i64>()) {
        let table = bucket_table(modulus);
        let expected = ((selector % modulus) + modulus) % modulus;

        prop_assert_eq!(table.bucket_for(selector), Some(expected));
        let pair = table.resolve(Some(selector)).expect("Every bucket is covered.");
        prop_assert_eq!(pair.primary().0, expected);
    }
}

#[derive(Debug)]
struct Bucket(i64);

/// A table where every bucket has its own pool, named after the bucket.
fn bucket_table(modulus: i64) -> RoutingTable<Bucket> {
    RoutingTable::build(
        1,
        modulus,
        None,
        (0..modulus).map(|bucket| (vec![bucket], PoolPair::new(Arc::new(Bucket(bucket)), None))),
    )
}

#[test]
fn test_selector_edge_cases() {
    let table = bucket_table(4);
    for (selector, bucket) in [(0, 0), (3, 3), (4, 0), (6, 2), (-1, 3), (-4, 0), (-5, 3)] {
        assert_eq!(
            table.resolve(Some(selector)).unwrap().primary().0,
            bucket,
            "Selector {selector} should land in bucket {bucket}",
        );
    }

    assert_eq!(table.bucket_for(i64::MIN), Some(0));
    assert_eq!(table.bucket_for(i64::MAX), Some(3));
}
