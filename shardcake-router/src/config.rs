use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The default maximum amount of time a connection may be reused for.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60); // 1 Hour
/// The default maximum number of idle connections kept by a pool.
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// The description of a (possibly sharded) database cluster.
///
/// A config can carry a default primary/replica pair, a set of sharded
/// instances or both. When both exist, operations with a selector are
/// routed to the shards and operations without one to the default pair.
///
/// ```rust
/// use shardcake_router::{ShardConfig, ShardInstance};
///
/// let config = ShardConfig::sharded(
///     4,
///     vec![
///         ShardInstance::new("sqlite://shard-a.db", [0, 1]),
///         ShardInstance::new("sqlite://shard-b.db", [2, 3]),
///     ],
/// );
/// assert!(config.validate().is_ok());
/// ```
pub struct ShardConfig {
    /// The default primary endpoint used by operations without a selector.
    pub primary: Option<String>,

    /// The read replica of the default primary.
    ///
    /// All reads go to this endpoint, defaulting to the primary.
    pub replica: Option<String>,

    /// The number of buckets selectors are hashed into.
    ///
    /// This is ignored unless `shards` is set.
    pub modulus: i64,

    /// The sharded instances, which together must cover every bucket.
    pub shards: Vec<ShardInstance>,

    #[serde(flatten)]
    /// The sizing policy applied to every pool opened from this config.
    pub pool: PoolOptions,
}

impl ShardConfig {
    /// Creates an unsharded config with a single primary endpoint.
    pub fn unsharded(primary: impl Into<String>) -> Self {
        Self {
            primary: Some(primary.into()),
            ..Default::default()
        }
    }

    /// Creates a sharded config without any default endpoint.
    pub fn sharded(modulus: i64, shards: Vec<ShardInstance>) -> Self {
        Self {
            modulus,
            shards,
            ..Default::default()
        }
    }

    /// Sets the default primary endpoint.
    pub fn with_primary(mut self, primary: impl Into<String>) -> Self {
        self.primary = Some(primary.into());
        self
    }

    /// Sets the default read replica endpoint.
    pub fn with_replica(mut self, replica: impl Into<String>) -> Self {
        self.replica = Some(replica.into());
        self
    }

    /// Sets the pool sizing policy.
    pub fn with_pool_options(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    /// The default primary endpoint, if any.
    pub fn default_primary(&self) -> Option<&str> {
        non_empty(self.primary.as_deref())
    }

    /// The default replica endpoint, if any.
    pub fn default_replica(&self) -> Option<&str> {
        non_empty(self.replica.as_deref())
    }

    /// Returns if the config contains any sharded instances.
    pub fn is_sharded(&self) -> bool {
        !self.shards.is_empty()
    }

    /// Checks the bucket assignments of the config.
    ///
    /// When shards are set, every bucket in `[0, modulus)` must be assigned
    /// to exactly one shard. This never performs any IO.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_replica().is_some() && self.default_primary().is_none() {
            return Err(ConfigError::ReplicaWithoutPrimary);
        }

        if self.shards.is_empty() {
            return Ok(());
        }

        if self.modulus <= 0 {
            return Err(ConfigError::InvalidModulus(self.modulus));
        }

        let mut out_of_range = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        let mut seen = BTreeSet::new();

        for bucket in self.shards.iter().flat_map(|shard| shard.buckets.iter()) {
            if *bucket < 0 || *bucket >= self.modulus {
                out_of_range.insert(*bucket);
            } else if !seen.insert(*bucket) {
                duplicates.insert(*bucket);
            }
        }

        if !out_of_range.is_empty() {
            return Err(ConfigError::BucketsOutOfRange {
                buckets: out_of_range.into_iter().collect(),
                modulus: self.modulus,
            });
        }

        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicateBuckets(duplicates.into_iter().collect()));
        }

        if seen.len() as i64 != self.modulus {
            // The modulus is expected to be in the order of the shard count,
            // scanning the whole range is fine.
            let missing = (0..self.modulus)
                .filter(|bucket| !seen.contains(bucket))
                .collect();
            return Err(ConfigError::MissingBuckets(missing));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// A primary/replica pair serving a set of buckets.
pub struct ShardInstance {
    /// The primary endpoint, all writes go here.
    pub primary: String,

    /// The read replica endpoint, defaulting to the primary.
    pub replica: Option<String>,

    /// The buckets this instance serves, i.e. `[0, 1, 2]`.
    pub buckets: Vec<i64>,
}

impl ShardInstance {
    /// Creates a new instance without a replica.
    pub fn new(primary: impl Into<String>, buckets: impl IntoIterator<Item = i64>) -> Self {
        Self {
            primary: primary.into(),
            replica: None,
            buckets: buckets.into_iter().collect(),
        }
    }

    /// Sets the read replica endpoint of the instance.
    pub fn with_replica(mut self, replica: impl Into<String>) -> Self {
        self.replica = Some(replica.into());
        self
    }

    /// The replica endpoint, if any.
    pub fn replica(&self) -> Option<&str> {
        non_empty(self.replica.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// The sizing policy of a connection pool.
pub struct PoolOptions {
    #[serde(rename = "conn_max_lifetime_secs", with = "duration_secs")]
    /// The maximum amount of time a connection may be reused for.
    pub max_lifetime: Duration,

    #[serde(rename = "max_idle_conns")]
    /// The maximum number of idle connections, `0` selects the default of `10`.
    pub max_idle_connections: usize,

    #[serde(rename = "max_open_conns")]
    /// The maximum number of open connections, `0` means unbounded.
    pub max_open_connections: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_lifetime: DEFAULT_MAX_LIFETIME,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            max_open_connections: 0,
        }
    }
}

impl PoolOptions {
    /// Replaces any unset (zero) values with their defaults.
    ///
    /// `max_open_connections` is left untouched as `0` already means unbounded.
    pub fn normalized(mut self) -> Self {
        if self.max_lifetime.is_zero() {
            self.max_lifetime = DEFAULT_MAX_LIFETIME;
        }
        if self.max_idle_connections == 0 {
            self.max_idle_connections = DEFAULT_MAX_IDLE_CONNECTIONS;
        }
        self
    }

    /// The open connection limit, if any.
    pub fn open_limit(&self) -> Option<usize> {
        (self.max_open_connections > 0).then_some(self.max_open_connections)
    }
}

fn non_empty(endpoint: Option<&str>) -> Option<&str> {
    endpoint.filter(|endpoint| !endpoint.trim().is_empty())
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
