//! Cluster-native reindex with adaptive batch sizing.
//!
//! The cluster copies documents itself; the orchestrator only picks the batch
//! size. When the cluster rejects a batch as too large the size is halved and
//! the request reissued, down to a batch size of one.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::client::IndexClusterClient;
use crate::error::{BackendError, IndexResult, TransientBackendError};
use crate::settings::humantime_serde;

/// A remote cluster to pull documents from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSource {
    /// Base URL of the remote cluster.
    pub host: String,

    /// Basic auth user name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Basic auth password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Socket timeout for remote requests.
    #[serde(with = "humantime_serde", default = "default_remote_timeout")]
    pub socket_timeout: Duration,

    /// Connect timeout for remote requests.
    #[serde(with = "humantime_serde", default = "default_remote_timeout")]
    pub connect_timeout: Duration,
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(30)
}

impl RemoteSource {
    /// Creates a remote source with default timeouts and no credentials.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
            socket_timeout: default_remote_timeout(),
            connect_timeout: default_remote_timeout(),
        }
    }

    fn to_json(&self) -> Value {
        let mut remote = json!({
            "host": self.host,
            "socket_timeout": format!("{}ms", self.socket_timeout.as_millis()),
            "connect_timeout": format!("{}ms", self.connect_timeout.as_millis()),
        });
        if let Some(username) = &self.username {
            remote["username"] = json!(username);
        }
        if let Some(password) = &self.password {
            remote["password"] = json!(password);
        }
        remote
    }
}

/// What to copy and where.
#[derive(Debug, Clone, PartialEq)]
pub struct ReindexRequest {
    /// Source index.
    pub source: String,
    /// Destination index.
    pub destination: String,
    /// Remote cluster holding the source index.
    pub remote: Option<RemoteSource>,
    /// Whether to refresh the destination afterwards.
    pub refresh: bool,
    /// Initial batch size.
    pub batch_size: u64,
}

impl ReindexRequest {
    /// Local reindex with refresh.
    pub fn new(source: impl Into<String>, destination: impl Into<String>, batch_size: u64) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            remote: None,
            refresh: true,
            batch_size,
        }
    }

    /// Pulls the source index from a remote cluster.
    pub fn with_remote(mut self, remote: RemoteSource) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets whether the destination is refreshed afterwards.
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Renders the request body for the given batch size.
    pub fn to_body(&self, batch_size: u64) -> Value {
        let mut source = json!({ "index": self.source, "size": batch_size });
        if let Some(remote) = &self.remote {
            source["remote"] = remote.to_json();
        }
        json!({
            "source": source,
            "dest": { "index": self.destination },
        })
    }
}

/// Outcome of a successful reindex.
#[derive(Debug, Clone, PartialEq)]
pub struct ReindexResult {
    /// Source index.
    pub source: String,
    /// Destination index.
    pub destination: String,
    /// Documents processed.
    pub total: u64,
    /// Documents created.
    pub created: u64,
    /// Documents overwritten.
    pub updated: u64,
    /// Documents deleted.
    pub deleted: u64,
    /// Documents skipped.
    pub noops: u64,
    /// Version conflicts.
    pub version_conflicts: u64,
    /// Server-side duration.
    pub took: Duration,
    /// When the first request was issued.
    pub started_at: DateTime<Utc>,
    /// Number of requests issued, including the successful one.
    pub retries: u32,
    /// Batch size of the successful request.
    pub batch_size: u64,
}

impl fmt::Display for ReindexResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reindexed '{}' into '{}' in {}: total {}, created {}, updated {}, deleted {}, noops {}, version conflicts {}",
            self.source,
            self.destination,
            humantime::format_duration(self.took),
            self.total,
            self.created,
            self.updated,
            self.deleted,
            self.noops,
            self.version_conflicts
        )?;
        if self.retries > 1 {
            write!(f, ", retries {}", self.retries)?;
        }
        Ok(())
    }
}

/// Issues reindex requests, halving the batch size on overload rejections.
pub struct Reindexer<'a> {
    client: &'a dyn IndexClusterClient,
}

impl<'a> Reindexer<'a> {
    /// Creates a reindexer on top of a client.
    pub fn new(client: &'a dyn IndexClusterClient) -> Self {
        Self { client }
    }

    /// Copies `request.source` into `request.destination`.
    pub async fn reindex(&self, request: &ReindexRequest) -> IndexResult<ReindexResult> {
        let started_at = Utc::now();
        let mut batch_size = request.batch_size.max(1);
        let mut attempts: u32 = 0;

        let response = loop {
            attempts += 1;
            match self.client.reindex(request, batch_size).await {
                Ok(response) => break response,
                Err(e) if e.is_batch_rejection() => {
                    if batch_size <= 1 {
                        return Err(TransientBackendError::BatchSizeExhausted {
                            source_index: request.source.clone(),
                            destination: request.destination.clone(),
                            attempts,
                            message: e.to_string(),
                        }
                        .into());
                    }
                    let next = (batch_size / 2).max(1);
                    warn!(
                        source = %request.source,
                        destination = %request.destination,
                        batch_size,
                        next_batch_size = next,
                        error = %e,
                        "Reindex batch rejected, retrying with a smaller batch"
                    );
                    batch_size = next;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let failure = if response.timed_out {
            Some("request timed out".to_string())
        } else if !response.search_failures.is_empty() {
            Some(format!(
                "search failures: {}",
                response.search_failures.join("; ")
            ))
        } else if !response.bulk_failures.is_empty() {
            Some(format!(
                "bulk failures: {}",
                response.bulk_failures.join("; ")
            ))
        } else {
            None
        };
        if let Some(message) = failure {
            return Err(BackendError::ReindexFailed {
                source_index: request.source.clone(),
                destination: request.destination.clone(),
                message,
            }
            .into());
        }

        let result = ReindexResult {
            source: request.source.clone(),
            destination: request.destination.clone(),
            total: response.total,
            created: response.created,
            updated: response.updated,
            deleted: response.deleted,
            noops: response.noops,
            version_conflicts: response.version_conflicts,
            took: response.took,
            started_at,
            retries: attempts,
            batch_size,
        };
        if result.retries > 1 {
            info!(retries = result.retries, batch_size, "{}", result);
        } else {
            info!("{}", result);
        }
        Ok(result)
    }
}
