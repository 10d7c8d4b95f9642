use std::sync::Arc;

use crate::config::PoolOptions;
use crate::error::ConnectionError;
use crate::pool::{ConnectionPool, PoolConnector};
use crate::table::{close_pools, PoolPair};

/// A primary endpoint and optional replica endpoint which passed parsing.
pub(crate) struct ParsedPair<E> {
    primary: (String, E),
    replica: Option<(String, E)>,
}

/// Opens the pools of a single (re)configuration attempt.
///
/// Every pool opened through the opener is tracked until [PoolOpener::finish]
/// hands them over, so a failed attempt can close everything it opened.
pub(crate) struct PoolOpener<'a, C: PoolConnector> {
    connector: &'a C,
    options: PoolOptions,
    opened: Vec<Arc<C::Pool>>,
}

impl<'a, C: PoolConnector> PoolOpener<'a, C> {
    pub(crate) fn new(connector: &'a C, options: PoolOptions) -> Self {
        Self {
            connector,
            options: options.normalized(),
            opened: Vec::new(),
        }
    }

    /// Parses a primary and replica endpoint without performing any IO.
    pub(crate) fn parse_pair(
        &self,
        primary: &str,
        replica: Option<&str>,
    ) -> Result<ParsedPair<C::Endpoint>, ConnectionError> {
        let primary = (primary.to_string(), self.parse(primary)?);
        let replica = match replica {
            Some(replica) => Some((replica.to_string(), self.parse(replica)?)),
            None => None,
        };

        Ok(ParsedPair { primary, replica })
    }

    fn parse(&self, endpoint: &str) -> Result<C::Endpoint, ConnectionError> {
        self.connector.parse_endpoint(endpoint).map_err(|reason| {
            error!(endpoint = endpoint, reason = %reason, "Connection endpoint is invalid.");
            ConnectionError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason,
            }
        })
    }

    /// Opens the primary pool and, if configured, the replica pool.
    ///
    /// Without a replica the replica pool is the primary pool itself.
    pub(crate) async fn open_pair(
        &mut self,
        parsed: &ParsedPair<C::Endpoint>,
    ) -> Result<PoolPair<C::Pool>, ConnectionError> {
        let (raw, endpoint) = &parsed.primary;
        let primary = self.open_pool(raw, endpoint).await?;

        let replica = match &parsed.replica {
            Some((raw, endpoint)) => Some(self.open_pool(raw, endpoint).await?),
            None => None,
        };

        Ok(PoolPair::new(primary, replica))
    }

    async fn open_pool(
        &mut self,
        raw: &str,
        endpoint: &C::Endpoint,
    ) -> Result<Arc<C::Pool>, ConnectionError> {
        let pool = self
            .connector
            .connect(endpoint, &self.options)
            .await
            .map_err(|e| {
                error!(endpoint = %endpoint, error = ?e, "Failed to open connection pool.");
                unreachable(raw, e)
            })?;
        let pool = Arc::new(pool);

        // Tracked before pinging so a failed probe still closes the pool.
        self.opened.push(pool.clone());

        if let Err(e) = pool.ping().await {
            error!(endpoint = %endpoint, error = ?e, "Failed to ping connection pool.");
            return Err(unreachable(raw, e));
        }

        debug!(endpoint = %endpoint, "Connection pool opened.");
        Ok(pool)
    }

    /// Closes every pool opened by this attempt.
    pub(crate) async fn rollback(self) {
        if self.opened.is_empty() {
            return;
        }

        warn!(
            num_pools = self.opened.len(),
            "Closing connection pools of failed attempt."
        );
        // Failures are already logged and the original error matters more.
        let _ = close_pools(self.opened).await;
    }

    /// Releases ownership of the opened pools to the caller.
    pub(crate) fn finish(self) {
        drop(self.opened);
    }
}

fn unreachable<E>(endpoint: &str, error: E) -> ConnectionError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ConnectionError::Unreachable {
        endpoint: endpoint.to_string(),
        source: anyhow::Error::new(error),
    }
}

/// Opens a single primary/replica pair.
///
/// Both endpoints are parsed before any connection is attempted, and the
/// primary is closed again if the replica cannot be opened.
pub async fn open_pair<C: PoolConnector>(
    connector: &C,
    primary: &str,
    replica: Option<&str>,
    options: PoolOptions,
) -> Result<PoolPair<C::Pool>, ConnectionError> {
    let mut opener = PoolOpener::new(connector, options);
    let parsed = opener.parse_pair(primary, replica)?;

    match opener.open_pair(&parsed).await {
        Ok(pair) => {
            opener.finish();
            Ok(pair)
        },
        Err(e) => {
            opener.rollback().await;
            Err(e)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnector;

    #[tokio::test]
    async fn test_open_pair_without_replica() {
        let connector = MemoryConnector::default();
        let pair = open_pair(&connector, "mem://primary", None, PoolOptions::default())
            .await
            .expect("Open pair.");

        assert!(!pair.has_replica());
        assert_eq!(pair.replica().name(), "primary");
        assert_eq!(connector.num_opened(), 1);
    }

    #[tokio::test]
    async fn test_open_pair_with_replica() {
        let connector = MemoryConnector::default();
        let pair = open_pair(
            &connector,
            "mem://primary",
            Some("mem://replica"),
            PoolOptions::default(),
        )
        .await
        .expect("Open pair.");

        assert!(pair.has_replica());
        assert_eq!(pair.primary().name(), "primary");
        assert_eq!(pair.replica().name(), "replica");
        assert_eq!(connector.num_opened(), 2);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_never_connects() {
        let connector = MemoryConnector::default();
        let err = open_pair(
            &connector,
            "mem://primary",
            Some("tcp://replica"),
            PoolOptions::default(),
        )
        .await
        .expect_err("Replica endpoint should be rejected.");

        assert!(matches!(err, ConnectionError::InvalidEndpoint { .. }));
        assert_eq!(connector.num_opened(), 0, "No pool should be opened.");
    }

    #[tokio::test]
    async fn test_unreachable_replica_closes_primary() {
        let connector = MemoryConnector::default();
        connector.set_unreachable("replica");

        let err = open_pair(
            &connector,
            "mem://primary",
            Some("mem://replica"),
            PoolOptions::default(),
        )
        .await
        .expect_err("Replica should be unreachable.");

        assert!(matches!(
            err,
            ConnectionError::Unreachable { ref endpoint, .. } if endpoint == "mem://replica"
        ));
        assert_eq!(connector.num_opened(), 2);
        assert_eq!(connector.num_live(), 0, "Every opened pool must be closed.");
    }

    #[tokio::test]
    async fn test_options_are_normalized() {
        let connector = MemoryConnector::default();
        let options = PoolOptions {
            max_idle_connections: 0,
            ..Default::default()
        };
        let pair = open_pair(&connector, "mem://primary", None, options)
            .await
            .expect("Open pair.");

        assert_eq!(pair.primary().options().max_idle_connections, 10);
    }
}
