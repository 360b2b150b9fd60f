//! Waiting for cluster health.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::IndexClusterClient;
use crate::error::{IndexResult, UnavailableError};

/// Polls the health of `indices` until they report at least yellow status.
///
/// Every poll asks the cluster to wait up to `poll_timeout` for the status.
/// Fails with [`UnavailableError::HealthTimeout`] once `timeout` has elapsed
/// without a serving status. Does nothing for an empty index set.
pub async fn wait_for_health(
    client: &dyn IndexClusterClient,
    indices: &[String],
    timeout: Duration,
    poll_timeout: Duration,
) -> IndexResult<()> {
    if indices.is_empty() {
        return Ok(());
    }

    let start = Instant::now();
    loop {
        let health = client.cluster_health(indices, poll_timeout).await?;
        let elapsed = start.elapsed();

        if !health.timed_out && health.status.is_serving() {
            info!(
                indices = %indices.join(", "),
                status = %health.status,
                elapsed_ms = elapsed.as_millis() as u64,
                "Cluster health reached serving status"
            );
            return Ok(());
        }

        if elapsed >= timeout {
            return Err(UnavailableError::HealthTimeout {
                indices: indices.to_vec(),
                elapsed,
            }
            .into());
        }

        debug!(
            indices = %indices.join(", "),
            status = %health.status,
            "Waiting for cluster health"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HealthStatus;
    use crate::client::memory::InMemoryCluster;
    use crate::error::IndexError;

    #[tokio::test]
    async fn test_empty_set_is_noop() {
        let cluster = InMemoryCluster::new();
        wait_for_health(&cluster, &[], Duration::from_secs(1), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_healthy_cluster_returns_immediately() {
        let cluster = InMemoryCluster::new();
        cluster.set_health(HealthStatus::Yellow);
        wait_for_health(
            &cluster,
            &["a".to_string()],
            Duration::from_secs(1),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(cluster.calls(), vec!["cluster_health a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_red_cluster_times_out() {
        let cluster = InMemoryCluster::new();
        cluster.set_health(HealthStatus::Red);
        let err = wait_for_health(
            &cluster,
            &["a".to_string(), "b".to_string()],
            Duration::from_secs(10),
            Duration::from_secs(3),
        )
        .await
        .unwrap_err();

        match err {
            IndexError::Unavailable(UnavailableError::HealthTimeout { indices, elapsed }) => {
                assert_eq!(indices, vec!["a".to_string(), "b".to_string()]);
                assert!(elapsed >= Duration::from_secs(10));
            }
            other => panic!("unexpected error: {other}"),
        }
        // polls at 3s, 6s, 9s and 12s
        assert_eq!(cluster.calls().len(), 4);
    }
}
