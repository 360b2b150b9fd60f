//! Update-by-query and delete-by-query with bounded conflict retries.
//!
//! Version conflicts are expected when documents are written concurrently
//! with a bulk mutation. The mutator reissues the request after a short
//! random pause and a refresh of the target index, up to the attempt budget of
//! its [`RetryPolicy`]. Any other per-document failure is fatal immediately.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::client::{ByQueryRequest, IndexClusterClient, Query};
use crate::error::{BackendError, IndexResult, TransientBackendError};
use crate::mapping::{MappingGroup, TYPE_FIELD};
use crate::settings::humantime_serde;

/// Kind of bulk mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkCommand {
    /// Update-by-query.
    Update,
    /// Delete-by-query.
    Delete,
}

impl fmt::Display for BulkCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkCommand::Update => f.write_str("update"),
            BulkCommand::Delete => f.write_str("delete"),
        }
    }
}

/// Updates every document of a type matching a filter with a named script.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUpdate {
    /// Document type.
    pub type_name: String,
    /// Document filter.
    pub filter: Query,
    /// Name of a script declared by the type's mapping.
    pub script: String,
    /// Script parameters.
    pub params: Map<String, Value>,
}

impl BulkUpdate {
    /// Creates a bulk update without parameters.
    pub fn new(type_name: impl Into<String>, filter: Query, script: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            filter,
            script: script.into(),
            params: Map::new(),
        }
    }

    /// Adds a script parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Deletes every document of a type matching a filter.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkDelete {
    /// Document type.
    pub type_name: String,
    /// Document filter.
    pub filter: Query,
}

impl BulkDelete {
    /// Creates a bulk delete.
    pub fn new(type_name: impl Into<String>, filter: Query) -> Self {
        Self {
            type_name: type_name.into(),
            filter,
        }
    }
}

/// Updates a single document with a named script.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Document type.
    pub type_name: String,
    /// Document identifier.
    pub id: String,
    /// Name of a script declared by the type's mapping.
    pub script: String,
    /// Script parameters.
    pub params: Map<String, Value>,
    /// Document created when the identifier does not exist.
    pub upsert: Option<Value>,
}

impl Update {
    /// Creates an update without parameters or upsert document.
    pub fn new(
        type_name: impl Into<String>,
        id: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
            script: script.into(),
            params: Map::new(),
            upsert: None,
        }
    }

    /// Adds a script parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Sets the document created when the identifier does not exist.
    pub fn with_upsert(mut self, upsert: Value) -> Self {
        self.upsert = Some(upsert);
        self
    }
}

/// Restricts a query to the documents of one type within its index.
///
/// Indices holding a single type need no discriminator.
pub(crate) fn type_filter(group: &MappingGroup, type_name: &str) -> Query {
    if group.is_shared() {
        Query::term(TYPE_FIELD, type_name)
    } else {
        Query::MatchAll
    }
}

/// Retry budget for version conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of requests issued before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lower bound of the random pause between attempts.
    #[serde(with = "humantime_serde", default = "default_min_backoff")]
    pub min_backoff: Duration,

    /// Upper bound of the random pause between attempts.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_min_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_millis(1000)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Returns a random pause within the configured bounds.
    pub fn backoff(&self) -> Duration {
        let min = self.min_backoff.as_millis() as u64;
        let max = self.max_backoff.as_millis() as u64;
        if max <= min {
            return self.min_backoff;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

/// Runs by-query mutations against one index.
pub struct BulkMutator<'a> {
    client: &'a dyn IndexClusterClient,
    policy: &'a RetryPolicy,
}

impl<'a> BulkMutator<'a> {
    /// Creates a mutator.
    pub fn new(client: &'a dyn IndexClusterClient, policy: &'a RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Executes `request` until no version conflicts remain.
    ///
    /// Returns true if any document was updated or deleted.
    pub async fn execute(
        &self,
        type_name: &str,
        command: BulkCommand,
        request: &ByQueryRequest,
    ) -> IndexResult<bool> {
        let index = request.index.as_str();
        let mut changed = false;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let response = match command {
                BulkCommand::Update => self.client.update_by_query(request).await?,
                BulkCommand::Delete => self.client.delete_by_query(request).await?,
            };

            let (conflicts, failures): (Vec<_>, Vec<_>) = response
                .failures
                .into_iter()
                .partition(|f| f.is_conflict());
            if !failures.is_empty() {
                for failure in &failures {
                    error!(index, id = ?failure.id, status = failure.status, "Index failure during bulk {}: {}", command, failure.message);
                }
                return Err(BackendError::BulkFailures {
                    operation: format!("bulk {}", command),
                    index: index.to_string(),
                    failures: failures.into_iter().map(|f| f.message).collect(),
                }
                .into());
            }
            for conflict in &conflicts {
                warn!(index, id = ?conflict.id, "Version conflict reason: {}", conflict.message);
            }
            let version_conflicts = response.version_conflicts.max(conflicts.len() as u64);

            if response.updated > 0 {
                changed = true;
                info!(index, "Updated {} {} documents with bulk {}", response.updated, type_name, command);
            }
            if response.deleted > 0 {
                changed = true;
                info!(index, "Deleted {} {} documents with bulk {}", response.deleted, type_name, command);
            }
            if response.total == 0 {
                debug!(index, "Bulk {} matched no {} documents", command, type_name);
            } else if response.updated == 0 && response.deleted == 0 {
                warn!(
                    index,
                    noops = response.noops,
                    version_conflicts,
                    "Bulk {} could not be applied to {} documents",
                    command,
                    type_name
                );
            }

            if version_conflicts == 0 {
                return Ok(changed);
            }
            if attempts >= self.policy.max_attempts {
                return Err(TransientBackendError::ConflictsExhausted {
                    index: index.to_string(),
                    type_name: type_name.to_string(),
                    command: command.to_string(),
                    attempts,
                    conflicts: version_conflicts,
                }
                .into());
            }

            let delay = self.policy.backoff();
            warn!(
                index,
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                version_conflicts,
                "Bulk {} hit version conflicts, retrying",
                command
            );
            sleep(delay).await;
            self.client.refresh(&[index.to_string()]).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backoff_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.backoff();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(1000));
        }

        let fixed = RetryPolicy {
            min_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        assert_eq!(fixed.backoff(), Duration::from_millis(5));
    }

    #[test]
    fn test_retry_policy_serde() {
        let policy: RetryPolicy = serde_json::from_value(json!({
            "max_attempts": 3,
            "max_backoff": "2s"
        }))
        .unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.min_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_builders() {
        let update = BulkUpdate::new("concept", Query::MatchAll, "activate").with_param("active", true);
        assert_eq!(update.params["active"], json!(true));

        let update = Update::new("concept", "1", "activate").with_upsert(json!({ "id": "1" }));
        assert!(update.upsert.is_some());
    }

    mod mutator {
        use super::*;
        use crate::client::Document;
        use crate::client::memory::InMemoryCluster;
        use crate::error::IndexError;

        fn request(query: Query) -> ByQueryRequest {
            ByQueryRequest {
                index: "idx".to_string(),
                query,
                script: None,
                batch_size: 100,
                slices: 1,
            }
        }

        fn cluster() -> InMemoryCluster {
            let cluster = InMemoryCluster::new();
            cluster.seed(
                "idx",
                [
                    Document::new("1", json!({ "n": 1 })),
                    Document::new("2", json!({ "n": 2 })),
                ],
            );
            cluster
        }

        #[tokio::test(start_paused = true)]
        async fn test_conflicts_retried_until_resolved() {
            let cluster = cluster();
            cluster.inject_conflicts("idx", 2);
            let policy = RetryPolicy::default();

            let changed = BulkMutator::new(&cluster, &policy)
                .execute("doc", BulkCommand::Update, &request(Query::MatchAll))
                .await
                .unwrap();

            assert!(changed);
            let calls = cluster.calls();
            assert_eq!(calls.iter().filter(|c| c.starts_with("update_by_query")).count(), 3);
            assert_eq!(calls.iter().filter(|c| c.starts_with("refresh")).count(), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn test_conflicts_exhaust_attempts() {
            let cluster = cluster();
            cluster.inject_conflicts("idx", 100);
            let policy = RetryPolicy::default();

            let err = BulkMutator::new(&cluster, &policy)
                .execute("doc", BulkCommand::Delete, &request(Query::MatchAll))
                .await
                .unwrap_err();

            match err {
                IndexError::Transient(TransientBackendError::ConflictsExhausted {
                    attempts,
                    command,
                    ..
                }) => {
                    assert_eq!(attempts, 5);
                    assert_eq!(command, "delete");
                }
                other => panic!("unexpected error: {other}"),
            }
            let issued = cluster
                .calls()
                .iter()
                .filter(|c| c.starts_with("delete_by_query"))
                .count();
            assert_eq!(issued, 5);
        }

        #[tokio::test]
        async fn test_document_failure_is_fatal() {
            let cluster = cluster();
            cluster.inject_document_failure("idx", 400, "mapper_parsing_exception");
            let policy = RetryPolicy::default();

            let err = BulkMutator::new(&cluster, &policy)
                .execute("doc", BulkCommand::Update, &request(Query::MatchAll))
                .await
                .unwrap_err();

            assert!(matches!(
                err,
                IndexError::Backend(BackendError::BulkFailures { .. })
            ));
            assert_eq!(cluster.calls().len(), 1);
        }

        #[tokio::test]
        async fn test_no_matches_is_unchanged() {
            let cluster = cluster();
            let policy = RetryPolicy::default();

            let changed = BulkMutator::new(&cluster, &policy)
                .execute("doc", BulkCommand::Delete, &request(Query::ids(["missing"])))
                .await
                .unwrap();

            assert!(!changed);
            assert_eq!(cluster.documents("idx").len(), 2);
        }
    }
}
