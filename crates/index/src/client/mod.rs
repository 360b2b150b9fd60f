//! The index cluster client capability.
//!
//! [`IndexClusterClient`] is the only contract the engine has with the
//! backend cluster. Implementations own their connection pool and must be
//! safe to share between admin instances.
//!
//! Two implementations ship with the crate:
//!
//! - [`memory::InMemoryCluster`] keeps indices in process memory and supports
//!   fault injection for tests;
//! - `elasticsearch::EsClusterClient` (feature `elasticsearch`) talks to an
//!   Elasticsearch cluster.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BackendError;
use crate::reindex::ReindexRequest;

#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;
pub mod memory;
mod query;

pub use query::{Query, Script};

/// A raw document and its identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Document identifier.
    pub id: String,
    /// Document source.
    pub source: Value,
}

impl Document {
    /// Creates a document.
    pub fn new(id: impl Into<String>, source: Value) -> Self {
        Self {
            id: id.into(),
            source,
        }
    }
}

/// Health status of a cluster or a set of indices, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// At least one primary shard is unassigned.
    Red,
    /// All primaries are assigned; some replicas are not.
    Yellow,
    /// All shards are assigned.
    Green,
}

impl HealthStatus {
    /// Parses the status name used by the cluster.
    pub fn parse(status: &str) -> Option<Self> {
        match status.to_ascii_lowercase().as_str() {
            "red" => Some(HealthStatus::Red),
            "yellow" => Some(HealthStatus::Yellow),
            "green" => Some(HealthStatus::Green),
            _ => None,
        }
    }

    /// Returns true if indices can serve requests.
    pub fn is_serving(&self) -> bool {
        *self >= HealthStatus::Yellow
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HealthStatus::Red => "red",
            HealthStatus::Yellow => "yellow",
            HealthStatus::Green => "green",
        };
        f.write_str(name)
    }
}

/// Result of a cluster health request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterHealth {
    /// Reported status.
    pub status: HealthStatus,
    /// Whether the request timed out before the status was reached.
    pub timed_out: bool,
}

/// Parameters of an update-by-query or delete-by-query request.
#[derive(Debug, Clone, PartialEq)]
pub struct ByQueryRequest {
    /// Target index.
    pub index: String,
    /// Document filter.
    pub query: Query,
    /// Update script; `None` rewrites documents unchanged.
    pub script: Option<Script>,
    /// Scroll batch size.
    pub batch_size: u64,
    /// Number of parallel slices.
    pub slices: u64,
}

/// A single failed document of a by-query request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemFailure {
    /// Document identifier, when known.
    pub id: Option<String>,
    /// HTTP status of the failure.
    pub status: u16,
    /// Failure reason.
    pub message: String,
}

impl BulkItemFailure {
    /// Returns true for version conflicts.
    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }
}

/// Counters reported by a by-query request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ByQueryResponse {
    /// Matching documents.
    pub total: u64,
    /// Updated documents.
    pub updated: u64,
    /// Deleted documents.
    pub deleted: u64,
    /// Documents left unchanged by the script.
    pub noops: u64,
    /// Documents skipped because of version conflicts.
    pub version_conflicts: u64,
    /// Failed documents.
    pub failures: Vec<BulkItemFailure>,
}

/// Counters reported by a reindex request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReindexResponse {
    /// Server-side duration.
    pub took: Duration,
    /// Whether the request timed out.
    pub timed_out: bool,
    /// Documents processed.
    pub total: u64,
    /// Documents created in the destination.
    pub created: u64,
    /// Documents overwritten in the destination.
    pub updated: u64,
    /// Documents deleted.
    pub deleted: u64,
    /// Documents skipped by a script.
    pub noops: u64,
    /// Version conflicts.
    pub version_conflicts: u64,
    /// Search failures on the source.
    pub search_failures: Vec<String>,
    /// Write failures on the destination.
    pub bulk_failures: Vec<String>,
}

/// Parameters of a single-document update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    /// Target index.
    pub index: String,
    /// Document identifier.
    pub id: String,
    /// Update script.
    pub script: Script,
    /// Document created when the identifier does not exist.
    pub upsert: Option<Value>,
    /// Whether to refresh the index after the write.
    pub refresh: bool,
}

/// A cursor over every document of an index in index order.
#[async_trait]
pub trait DocumentStream: Send {
    /// Total number of documents the stream will return.
    fn total(&self) -> u64;

    /// Returns the next batch, or an empty batch once exhausted.
    async fn next_batch(&mut self) -> Result<Vec<Document>, BackendError>;

    /// Releases server-side resources held by the stream.
    async fn finish(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Operations the engine needs from the index cluster.
#[async_trait]
pub trait IndexClusterClient: Send + Sync {
    /// Returns true if the index exists.
    async fn index_exists(&self, index: &str) -> Result<bool, BackendError>;

    /// Creates an index with its mapping and settings.
    async fn create_index(
        &self,
        index: &str,
        mapping: &Value,
        settings: &Value,
    ) -> Result<(), BackendError>;

    /// Deletes indices; names may be wildcard patterns. Missing indices are ignored.
    async fn delete_index(&self, indices: &[String]) -> Result<(), BackendError>;

    /// Returns the stored mapping body of an index.
    async fn get_mapping(&self, index: &str) -> Result<Value, BackendError>;

    /// Merges a mapping body into an index.
    async fn put_mapping(&self, index: &str, mapping: &Value) -> Result<(), BackendError>;

    /// Applies dynamic settings to an index.
    async fn update_settings(&self, index: &str, settings: &Value) -> Result<(), BackendError>;

    /// Reports the health of the given indices, waiting at most `timeout` for
    /// at least yellow status.
    async fn cluster_health(
        &self,
        indices: &[String],
        timeout: Duration,
    ) -> Result<ClusterHealth, BackendError>;

    /// Makes recent writes visible to searches.
    async fn refresh(&self, indices: &[String]) -> Result<(), BackendError>;

    /// Rewrites the matching documents, optionally through a script.
    async fn update_by_query(&self, request: &ByQueryRequest)
    -> Result<ByQueryResponse, BackendError>;

    /// Deletes the matching documents.
    async fn delete_by_query(&self, request: &ByQueryRequest)
    -> Result<ByQueryResponse, BackendError>;

    /// Copies documents between indices with the given batch size.
    async fn reindex(
        &self,
        request: &ReindexRequest,
        batch_size: u64,
    ) -> Result<ReindexResponse, BackendError>;

    /// Opens a stream over every document of an index.
    async fn stream_documents(
        &self,
        index: &str,
        batch_size: u64,
    ) -> Result<Box<dyn DocumentStream>, BackendError>;

    /// Writes a batch of documents, replacing existing ones with the same identifier.
    async fn bulk_index(&self, index: &str, documents: &[Document]) -> Result<(), BackendError>;

    /// Updates a single document and returns its new source.
    async fn update(&self, request: &UpdateRequest) -> Result<Value, BackendError>;

    /// Releases the connection. Closing twice reports [`BackendError::ConnectionClosed`].
    async fn close(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_ordering() {
        assert!(HealthStatus::Red < HealthStatus::Yellow);
        assert!(HealthStatus::Green.is_serving());
        assert!(HealthStatus::Yellow.is_serving());
        assert!(!HealthStatus::Red.is_serving());
        assert_eq!(HealthStatus::parse("GREEN"), Some(HealthStatus::Green));
        assert_eq!(HealthStatus::parse("blue"), None);
    }
}
