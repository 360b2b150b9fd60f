//! Elasticsearch implementation of [`IndexClusterClient`].

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use elasticsearch::auth::Credentials;
use elasticsearch::cluster::ClusterHealthParts;
use elasticsearch::http::headers::HeaderMap;
use elasticsearch::http::request::JsonBody;
use elasticsearch::http::response::Response;
use elasticsearch::http::transport::{SingleNodeConnectionPool, Transport, TransportBuilder};
use elasticsearch::http::Url;
use elasticsearch::http::Method;
use elasticsearch::indices::{
    IndicesCreateParts, IndicesDeleteParts, IndicesExistsParts, IndicesGetMappingParts,
    IndicesPutMappingParts, IndicesPutSettingsParts, IndicesRefreshParts,
};
use elasticsearch::params::{Refresh, WaitForStatus};
use elasticsearch::{BulkParts, ClearScrollParts, Elasticsearch, ScrollParts, SearchParts, UpdateParts};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    BulkItemFailure, ByQueryRequest, ByQueryResponse, ClusterHealth, Document, DocumentStream,
    HealthStatus, IndexClusterClient, ReindexResponse, UpdateRequest,
};
use crate::error::BackendError;
use crate::reindex::ReindexRequest;
use crate::settings::{DEFAULT_SOCKET_TIMEOUT, Settings, humantime_serde};

/// How long a scroll context is kept alive between batches.
const SCROLL_KEEP_ALIVE: &str = "5m";

/// Where and how to reach the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConnection {
    /// Base URL of the cluster.
    pub url: String,

    /// Basic auth user name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Basic auth password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Timeout of a single request.
    #[serde(with = "humantime_serde", default = "default_socket_timeout")]
    pub socket_timeout: Duration,
}

fn default_socket_timeout() -> Duration {
    DEFAULT_SOCKET_TIMEOUT
}

impl ClusterConnection {
    /// Connects to `url` with the `socketTimeout` of `settings`.
    pub fn new(url: impl Into<String>, settings: &Settings) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            socket_timeout: settings.socket_timeout(),
        }
    }

    /// Authenticates with basic credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    fn transport(&self) -> Result<Transport, BackendError> {
        let url: Url = self.url.parse().map_err(|e| BackendError::ConnectionFailed {
            message: format!("invalid cluster url '{}': {}", self.url, e),
        })?;
        let mut builder =
            TransportBuilder::new(SingleNodeConnectionPool::new(url)).timeout(self.socket_timeout);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            builder = builder.auth(Credentials::Basic(username.clone(), password.clone()));
        }
        builder.build().map_err(|e| BackendError::ConnectionFailed {
            message: e.to_string(),
        })
    }
}

/// [`IndexClusterClient`] talking to an Elasticsearch cluster over HTTP.
pub struct EsClusterClient {
    client: Elasticsearch,
    url: String,
    closed: AtomicBool,
}

impl Debug for EsClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsClusterClient")
            .field("url", &self.url)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EsClusterClient {
    /// Creates a client for a cluster connection.
    pub fn new(connection: &ClusterConnection) -> Result<Self, BackendError> {
        Ok(Self {
            client: Elasticsearch::new(connection.transport()?),
            url: connection.url.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BackendError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Issues a raw request for APIs whose parameters are passed as a query string.
    async fn send_json(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, String)],
        body: Value,
    ) -> Result<Value, BackendError> {
        self.ensure_open()?;
        let response = self
            .client
            .send(
                Method::Post,
                path,
                HeaderMap::new(),
                Some(query),
                Some(JsonBody::new(body)),
                None,
            )
            .await
            .map_err(|e| transport_error(operation, e))?;
        let response = check(operation, response).await?;
        parse(operation, response).await
    }

    async fn by_query(
        &self,
        operation: &str,
        endpoint: &str,
        request: &ByQueryRequest,
    ) -> Result<ByQueryResponse, BackendError> {
        let mut body = json!({ "query": request.query.to_json() });
        if let Some(script) = &request.script {
            body["script"] = script.to_json();
        }
        let query = [
            ("conflicts", "proceed".to_string()),
            ("refresh", "false".to_string()),
            ("wait_for_completion", "true".to_string()),
            ("scroll_size", request.batch_size.max(1).to_string()),
            ("slices", request.slices.max(1).to_string()),
        ];
        let path = format!("/{}/{}", request.index, endpoint);
        let body = self.send_json(operation, &path, &query, body).await?;
        Ok(parse_by_query(&body))
    }
}

fn transport_error(operation: &str, e: elasticsearch::Error) -> BackendError {
    match e.status_code() {
        Some(status) => BackendError::Request {
            operation: operation.to_string(),
            message: format!("status {}: {}", status, e),
        },
        None => BackendError::ConnectionFailed {
            message: format!("{} failed: {}", operation, e),
        },
    }
}

/// Turns an unsuccessful response into a [`BackendError`].
async fn check(operation: &str, response: Response) -> Result<Response, BackendError> {
    let status = response.status_code();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(operation, status.as_u16(), body))
}

fn classify_failure(operation: &str, status: u16, body: String) -> BackendError {
    if status == 404 && body.contains("index_not_found_exception") {
        let index = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.pointer("/error/index").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        return BackendError::IndexNotFound { index };
    }
    if status == 429
        || body.contains("es_rejected_execution_exception")
        || body.contains("circuit_breaking_exception")
    {
        return BackendError::Rejected {
            status,
            message: body,
        };
    }
    BackendError::Request {
        operation: operation.to_string(),
        message: format!("status {}: {}", status, body),
    }
}

async fn parse(operation: &str, response: Response) -> Result<Value, BackendError> {
    response
        .json::<Value>()
        .await
        .map_err(|e| BackendError::Serialization {
            message: format!("Failed to parse {} response: {}", operation, e),
        })
}

fn acknowledged(operation: &str, index: &str, body: &Value) -> Result<(), BackendError> {
    if body.get("acknowledged").and_then(Value::as_bool) == Some(false) {
        return Err(BackendError::NotAcknowledged {
            operation: operation.to_string(),
            index: index.to_string(),
        });
    }
    Ok(())
}

fn count(body: &Value, key: &str) -> u64 {
    body.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn failure_reason(failure: &Value) -> String {
    failure
        .pointer("/cause/reason")
        .or_else(|| failure.pointer("/reason/reason"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| failure.to_string())
}

fn parse_by_query(body: &Value) -> ByQueryResponse {
    let failures = body
        .get("failures")
        .and_then(Value::as_array)
        .map(|failures| {
            failures
                .iter()
                .map(|f| BulkItemFailure {
                    id: f.get("id").and_then(Value::as_str).map(str::to_string),
                    status: f.get("status").and_then(Value::as_u64).unwrap_or(500) as u16,
                    message: failure_reason(f),
                })
                .collect()
        })
        .unwrap_or_default();
    ByQueryResponse {
        total: count(body, "total"),
        updated: count(body, "updated"),
        deleted: count(body, "deleted"),
        noops: count(body, "noops"),
        version_conflicts: count(body, "version_conflicts"),
        failures,
    }
}

fn parse_reindex(body: &Value) -> ReindexResponse {
    let mut search_failures = Vec::new();
    let mut bulk_failures = Vec::new();
    if let Some(failures) = body.get("failures").and_then(Value::as_array) {
        for failure in failures {
            // search failures are reported per shard
            if failure.get("shard").is_some() {
                search_failures.push(failure_reason(failure));
            } else {
                bulk_failures.push(failure_reason(failure));
            }
        }
    }
    ReindexResponse {
        took: Duration::from_millis(count(body, "took")),
        timed_out: body.get("timed_out").and_then(Value::as_bool).unwrap_or(false),
        total: count(body, "total"),
        created: count(body, "created"),
        updated: count(body, "updated"),
        deleted: count(body, "deleted"),
        noops: count(body, "noops"),
        version_conflicts: count(body, "version_conflicts"),
        search_failures,
        bulk_failures,
    }
}

fn parse_hits(body: &Value) -> Vec<Document> {
    body.pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    let id = hit.get("_id").and_then(Value::as_str)?;
                    let source = hit.get("_source").cloned().unwrap_or(Value::Null);
                    Some(Document::new(id, source))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl IndexClusterClient for EsClusterClient {
    async fn index_exists(&self, index: &str) -> Result<bool, BackendError> {
        self.ensure_open()?;
        let response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[index]))
            .send()
            .await
            .map_err(|e| transport_error("index exists", e))?;
        match response.status_code().as_u16() {
            404 => Ok(false),
            _ => check("index exists", response).await.map(|_| true),
        }
    }

    async fn create_index(
        &self,
        index: &str,
        mapping: &Value,
        settings: &Value,
    ) -> Result<(), BackendError> {
        self.ensure_open()?;
        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(index))
            .body(json!({ "mappings": mapping, "settings": settings }))
            .send()
            .await
            .map_err(|e| transport_error("create index", e))?;
        let body = parse("create index", check("create index", response).await?).await?;
        acknowledged("create index", index, &body)?;
        tracing::info!("Created Elasticsearch index '{}'", index);
        Ok(())
    }

    async fn delete_index(&self, indices: &[String]) -> Result<(), BackendError> {
        self.ensure_open()?;
        let names: Vec<&str> = indices.iter().map(String::as_str).collect();
        let response = self
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&names))
            .ignore_unavailable(true)
            .allow_no_indices(true)
            .send()
            .await
            .map_err(|e| transport_error("delete index", e))?;
        match check("delete index", response).await {
            Ok(_) | Err(BackendError::IndexNotFound { .. }) => {
                tracing::info!("Deleted Elasticsearch indices '{}'", indices.join(", "));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_mapping(&self, index: &str) -> Result<Value, BackendError> {
        self.ensure_open()?;
        let response = self
            .client
            .indices()
            .get_mapping(IndicesGetMappingParts::Index(&[index]))
            .send()
            .await
            .map_err(|e| transport_error("get mapping", e))?;
        let body = parse("get mapping", check("get mapping", response).await?).await?;
        // the response is keyed by the concrete index name
        Ok(body
            .as_object()
            .and_then(|indices| indices.values().next())
            .and_then(|i| i.get("mappings"))
            .cloned()
            .unwrap_or_else(|| json!({})))
    }

    async fn put_mapping(&self, index: &str, mapping: &Value) -> Result<(), BackendError> {
        self.ensure_open()?;
        let response = self
            .client
            .indices()
            .put_mapping(IndicesPutMappingParts::Index(&[index]))
            .body(mapping.clone())
            .send()
            .await
            .map_err(|e| transport_error("put mapping", e))?;
        let body = parse("put mapping", check("put mapping", response).await?).await?;
        acknowledged("put mapping", index, &body)
    }

    async fn update_settings(&self, index: &str, settings: &Value) -> Result<(), BackendError> {
        self.ensure_open()?;
        let response = self
            .client
            .indices()
            .put_settings(IndicesPutSettingsParts::Index(&[index]))
            .body(settings.clone())
            .send()
            .await
            .map_err(|e| transport_error("update settings", e))?;
        let body = parse("update settings", check("update settings", response).await?).await?;
        acknowledged("update settings", index, &body)
    }

    async fn cluster_health(
        &self,
        indices: &[String],
        timeout: Duration,
    ) -> Result<ClusterHealth, BackendError> {
        self.ensure_open()?;
        let names: Vec<&str> = indices.iter().map(String::as_str).collect();
        let timeout = format!("{}ms", timeout.as_millis());
        let response = self
            .client
            .cluster()
            .health(ClusterHealthParts::Index(&names))
            .wait_for_status(WaitForStatus::Yellow)
            .timeout(&timeout)
            .send()
            .await
            .map_err(|e| transport_error("cluster health", e))?;
        // a health request that timed out answers 408 with a regular body
        let response = if response.status_code().as_u16() == 408 {
            response
        } else {
            check("cluster health", response).await?
        };
        let body = parse("cluster health", response).await?;
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .and_then(HealthStatus::parse)
            .unwrap_or(HealthStatus::Red);
        Ok(ClusterHealth {
            status,
            timed_out: body.get("timed_out").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    async fn refresh(&self, indices: &[String]) -> Result<(), BackendError> {
        self.ensure_open()?;
        let names: Vec<&str> = indices.iter().map(String::as_str).collect();
        let response = self
            .client
            .indices()
            .refresh(IndicesRefreshParts::Index(&names))
            .send()
            .await
            .map_err(|e| transport_error("refresh", e))?;
        check("refresh", response).await.map(|_| ())
    }

    async fn update_by_query(
        &self,
        request: &ByQueryRequest,
    ) -> Result<ByQueryResponse, BackendError> {
        self.by_query("update by query", "_update_by_query", request)
            .await
    }

    async fn delete_by_query(
        &self,
        request: &ByQueryRequest,
    ) -> Result<ByQueryResponse, BackendError> {
        self.by_query("delete by query", "_delete_by_query", request)
            .await
    }

    async fn reindex(
        &self,
        request: &ReindexRequest,
        batch_size: u64,
    ) -> Result<ReindexResponse, BackendError> {
        let query = [
            ("refresh", request.refresh.to_string()),
            ("wait_for_completion", "true".to_string()),
        ];
        let body = self
            .send_json("reindex", "/_reindex", &query, request.to_body(batch_size))
            .await?;
        Ok(parse_reindex(&body))
    }

    async fn stream_documents(
        &self,
        index: &str,
        batch_size: u64,
    ) -> Result<Box<dyn DocumentStream>, BackendError> {
        self.ensure_open()?;
        let size = i64::try_from(batch_size.max(1)).unwrap_or(i64::MAX);
        let response = self
            .client
            .search(SearchParts::Index(&[index]))
            .scroll(SCROLL_KEEP_ALIVE)
            .size(size)
            .track_total_hits(true)
            .body(json!({ "query": { "match_all": {} }, "sort": ["_doc"] }))
            .send()
            .await
            .map_err(|e| transport_error("stream documents", e))?;
        let body = parse("stream documents", check("stream documents", response).await?).await?;

        Ok(Box::new(ScrollStream {
            client: self.client.clone(),
            total: body.pointer("/hits/total/value").and_then(Value::as_u64).unwrap_or(0),
            scroll_id: body
                .get("_scroll_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            pending: Some(parse_hits(&body)),
        }))
    }

    async fn bulk_index(&self, index: &str, documents: &[Document]) -> Result<(), BackendError> {
        self.ensure_open()?;
        if documents.is_empty() {
            return Ok(());
        }
        let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(documents.len() * 2);
        for document in documents {
            body.push(json!({ "index": { "_id": document.id } }).into());
            body.push(document.source.clone().into());
        }
        let response = self
            .client
            .bulk(BulkParts::Index(index))
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("bulk index", e))?;
        let body = parse("bulk index", check("bulk index", response).await?).await?;

        if body.get("errors").and_then(Value::as_bool) != Some(true) {
            return Ok(());
        }
        let failures: Vec<String> = body
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("index"))
                    .filter(|item| item.get("error").is_some())
                    .map(|item| {
                        format!(
                            "{}: {}",
                            item.get("_id").and_then(Value::as_str).unwrap_or_default(),
                            item.pointer("/error/reason")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Err(BackendError::BulkFailures {
            operation: "bulk index".to_string(),
            index: index.to_string(),
            failures,
        })
    }

    async fn update(&self, request: &UpdateRequest) -> Result<Value, BackendError> {
        self.ensure_open()?;
        let mut body = json!({ "script": request.script.to_json(), "_source": true });
        if let Some(upsert) = &request.upsert {
            body["upsert"] = upsert.clone();
        }
        let refresh = if request.refresh {
            Refresh::True
        } else {
            Refresh::False
        };
        let response = self
            .client
            .update(UpdateParts::IndexId(&request.index, &request.id))
            .refresh(refresh)
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("update", e))?;
        let body = parse("update", check("update", response).await?).await?;
        Ok(body
            .pointer("/get/_source")
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BackendError::ConnectionClosed);
        }
        tracing::debug!(url = %self.url, "Closed Elasticsearch client");
        Ok(())
    }
}

/// Scroll cursor over an index in `_doc` order.
struct ScrollStream {
    client: Elasticsearch,
    total: u64,
    scroll_id: Option<String>,
    pending: Option<Vec<Document>>,
}

impl ScrollStream {
    async fn clear(&mut self) -> Result<(), BackendError> {
        let Some(scroll_id) = self.scroll_id.take() else {
            return Ok(());
        };
        let response = self
            .client
            .clear_scroll(ClearScrollParts::None)
            .body(json!({ "scroll_id": [scroll_id] }))
            .send()
            .await
            .map_err(|e| transport_error("clear scroll", e))?;
        match check("clear scroll", response).await {
            // an expired scroll context answers 404
            Ok(_) | Err(BackendError::Request { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl DocumentStream for ScrollStream {
    fn total(&self) -> u64 {
        self.total
    }

    async fn next_batch(&mut self) -> Result<Vec<Document>, BackendError> {
        if let Some(batch) = self.pending.take()
            && !batch.is_empty()
        {
            return Ok(batch);
        }
        let Some(scroll_id) = self.scroll_id.clone() else {
            return Ok(Vec::new());
        };

        let response = self
            .client
            .scroll(ScrollParts::None)
            .body(json!({ "scroll": SCROLL_KEEP_ALIVE, "scroll_id": scroll_id }))
            .send()
            .await
            .map_err(|e| transport_error("scroll", e))?;
        let body = parse("scroll", check("scroll", response).await?).await?;
        if let Some(next) = body.get("_scroll_id").and_then(Value::as_str) {
            self.scroll_id = Some(next.to_string());
        }

        let batch = parse_hits(&body);
        if batch.is_empty() {
            self.clear().await?;
        }
        Ok(batch)
    }

    async fn finish(&mut self) -> Result<(), BackendError> {
        self.clear().await
    }
}
