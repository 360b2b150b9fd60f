//! In-process index cluster.
//!
//! Keeps every index in memory and mimics the cluster behaviour the engine
//! depends on: mappings are merged on update and object properties are
//! reported without their implicit `type`, by-query operations evaluate
//! [`Query`](super::Query) filters, and wildcard deletes match index patterns. Scripts are
//! registered as closures keyed by their source.
//!
//! Faults can be injected for tests: version conflicts, rejected reindex batch
//! sizes, failed documents, failing operations and an unhealthy status. Every
//! call is recorded in a call log.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{
    BulkItemFailure, ByQueryRequest, ByQueryResponse, ClusterHealth, Document, DocumentStream,
    HealthStatus, IndexClusterClient, ReindexResponse, Script, UpdateRequest,
};
use crate::error::BackendError;
use crate::reindex::ReindexRequest;

/// Script implementation: mutates the source in place using the parameters.
pub type ScriptFn = Arc<dyn Fn(&mut Value, &Map<String, Value>) + Send + Sync>;

/// Operations that only read cluster state.
const READ_OPERATIONS: [&str; 4] = [
    "index_exists",
    "get_mapping",
    "cluster_health",
    "stream_documents",
];

#[derive(Debug, Clone, Default)]
struct MemoryIndex {
    mapping: Value,
    settings: Value,
    documents: BTreeMap<String, Value>,
}

struct ClusterState {
    indices: BTreeMap<String, MemoryIndex>,
    calls: Vec<String>,
    conflicts: HashMap<String, u32>,
    document_failures: HashMap<String, BulkItemFailure>,
    reindex_limit: Option<u64>,
    health: HealthStatus,
    scripts: HashMap<String, ScriptFn>,
    failures: HashMap<String, String>,
    closed: bool,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            indices: BTreeMap::new(),
            calls: Vec::new(),
            conflicts: HashMap::new(),
            document_failures: HashMap::new(),
            reindex_limit: None,
            health: HealthStatus::Green,
            scripts: HashMap::new(),
            failures: HashMap::new(),
            closed: false,
        }
    }
}

impl ClusterState {
    /// Logs a call and applies injected failures.
    fn record(&mut self, operation: &str, target: impl Into<String>) -> Result<(), BackendError> {
        let call = format!("{} {}", operation, target.into());
        self.calls.push(call.clone());
        if self.closed {
            return Err(BackendError::ConnectionClosed);
        }
        let failure = self
            .failures
            .remove(&call)
            .or_else(|| self.failures.remove(operation));
        if let Some(message) = failure {
            return Err(BackendError::Request {
                operation: operation.to_string(),
                message,
            });
        }
        Ok(())
    }

    fn index(&self, name: &str) -> Result<&MemoryIndex, BackendError> {
        self.indices
            .get(name)
            .ok_or_else(|| BackendError::IndexNotFound {
                index: name.to_string(),
            })
    }

    fn index_mut(&mut self, name: &str) -> Result<&mut MemoryIndex, BackendError> {
        self.indices
            .get_mut(name)
            .ok_or_else(|| BackendError::IndexNotFound {
                index: name.to_string(),
            })
    }

    fn script(&self, script: &Script) -> Result<ScriptFn, BackendError> {
        self.scripts
            .get(&script.source)
            .cloned()
            .ok_or_else(|| BackendError::Request {
                operation: "script".to_string(),
                message: format!("compile error: unknown script '{}'", script.source),
            })
    }
}

/// An index cluster held in process memory.
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

impl std::fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryCluster")
            .field("indices", &state.indices.keys().collect::<Vec<_>>())
            .field("health", &state.health)
            .finish_non_exhaustive()
    }
}

impl InMemoryCluster {
    /// Creates an empty, healthy cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the implementation of a script source.
    pub fn register_script<F>(&self, source: impl Into<String>, script: F)
    where
        F: Fn(&mut Value, &Map<String, Value>) + Send + Sync + 'static,
    {
        self.state
            .lock()
            .scripts
            .insert(source.into(), Arc::new(script));
    }

    /// Makes the next `rounds` by-query requests on `index` report a version
    /// conflict on their first matching document.
    pub fn inject_conflicts(&self, index: &str, rounds: u32) {
        self.state.lock().conflicts.insert(index.to_string(), rounds);
    }

    /// Makes the next by-query request on `index` report a failed document.
    pub fn inject_document_failure(&self, index: &str, status: u16, message: &str) {
        self.state.lock().document_failures.insert(
            index.to_string(),
            BulkItemFailure {
                id: None,
                status,
                message: message.to_string(),
            },
        );
    }

    /// Rejects reindex requests whose batch size exceeds `batch_size`.
    pub fn reject_reindex_above(&self, batch_size: u64) {
        self.state.lock().reindex_limit = Some(batch_size);
    }

    /// Makes the next call of `operation` fail with `message`.
    pub fn fail_next(&self, operation: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(operation.to_string(), message.to_string());
    }

    /// Makes the next call of `operation` on `target` fail with `message`.
    /// The target is written the way the call log records it.
    pub fn fail_next_on(&self, operation: &str, target: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(format!("{} {}", operation, target), message.to_string());
    }

    /// Sets the reported health status.
    pub fn set_health(&self, status: HealthStatus) {
        self.state.lock().health = status;
    }

    /// Creates an index without mapping holding the given documents.
    pub fn seed<I>(&self, index: &str, documents: I)
    where
        I: IntoIterator<Item = Document>,
    {
        let mut state = self.state.lock();
        let entry = state.indices.entry(index.to_string()).or_default();
        for document in documents {
            entry.documents.insert(document.id, document.source);
        }
    }

    /// Returns the call log, one `"<operation> <target>"` entry per call.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Returns the calls that changed cluster state.
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                let operation = c.split(' ').next().unwrap_or_default();
                !READ_OPERATIONS.contains(&operation)
            })
            .collect()
    }

    /// Empties the call log.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Returns the names of all indices.
    pub fn index_names(&self) -> Vec<String> {
        self.state.lock().indices.keys().cloned().collect()
    }

    /// Returns the documents of an index ordered by identifier.
    pub fn documents(&self, index: &str) -> Vec<Document> {
        self.state
            .lock()
            .indices
            .get(index)
            .map(|i| {
                i.documents
                    .iter()
                    .map(|(id, source)| Document::new(id.clone(), source.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns a document source.
    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        self.state
            .lock()
            .indices
            .get(index)
            .and_then(|i| i.documents.get(id).cloned())
    }

    /// Returns the stored mapping of an index.
    pub fn mapping(&self, index: &str) -> Option<Value> {
        self.state.lock().indices.get(index).map(|i| i.mapping.clone())
    }

    /// Returns the settings of an index.
    pub fn settings(&self, index: &str) -> Option<Value> {
        self.state.lock().indices.get(index).map(|i| i.settings.clone())
    }

    fn by_query(&self, operation: &str, request: &ByQueryRequest) -> Result<ByQueryResponse, BackendError> {
        let mut state = self.state.lock();
        state.record(operation, &request.index)?;

        let script = match &request.script {
            Some(script) => Some(state.script(script)?),
            None => None,
        };
        let mut conflict_pending = match state.conflicts.get_mut(&request.index) {
            Some(rounds) if *rounds > 0 => {
                *rounds -= 1;
                true
            }
            _ => false,
        };
        let failure = state.document_failures.remove(&request.index);

        let index = state.index_mut(&request.index)?;
        let matching: Vec<String> = index
            .documents
            .iter()
            .filter(|(id, source)| request.query.matches(id, source))
            .map(|(id, _)| id.clone())
            .collect();

        let mut response = ByQueryResponse {
            total: matching.len() as u64,
            ..Default::default()
        };
        for id in matching {
            if conflict_pending {
                conflict_pending = false;
                response.version_conflicts += 1;
                continue;
            }
            if operation == "delete_by_query" {
                index.documents.remove(&id);
                response.deleted += 1;
                continue;
            }
            let Some(source) = index.documents.get_mut(&id) else {
                continue;
            };
            match (&script, &request.script) {
                (Some(f), Some(s)) => {
                    let before = source.clone();
                    f(source, &s.params);
                    if *source == before {
                        response.noops += 1;
                    } else {
                        response.updated += 1;
                    }
                }
                _ => response.updated += 1,
            }
        }
        if let Some(failure) = failure {
            response.failures.push(failure);
        }
        Ok(response)
    }
}

fn join(indices: &[String]) -> String {
    indices.join(",")
}

/// Matches an index name against a pattern that may contain `*` wildcards.
fn matches_pattern(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }
    let expression = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
    regex::Regex::new(&expression)
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

/// Drops the implicit `type: object` of properties with sub-properties, the
/// way the cluster reports stored mappings.
fn normalize_mapping(value: &mut Value) {
    if let Value::Object(map) = value {
        if map.contains_key("properties") && map.get("type") == Some(&Value::from("object")) {
            map.remove("type");
        }
        for child in map.values_mut() {
            normalize_mapping(child);
        }
    }
}

fn merge_mapping(stored: &mut Value, update: &Value, path: &str) -> Result<(), String> {
    let (Value::Object(stored), Value::Object(update)) = (stored, update) else {
        return Ok(());
    };
    for (key, value) in update {
        if let Some(existing) = stored.get_mut(key) {
            if existing.is_object() && value.is_object() {
                merge_mapping(existing, value, &format!("{}/{}", path, key))?;
                continue;
            }
            if key == "type" && *existing != *value {
                return Err(format!(
                    "mapper [{}] cannot be changed from type [{}] to [{}]",
                    path, existing, value
                ));
            }
        }
        stored.insert(key.clone(), value.clone());
    }
    Ok(())
}

#[async_trait]
impl IndexClusterClient for InMemoryCluster {
    async fn index_exists(&self, index: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock();
        state.record("index_exists", index)?;
        Ok(state.indices.contains_key(index))
    }

    async fn create_index(
        &self,
        index: &str,
        mapping: &Value,
        settings: &Value,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record("create_index", index)?;
        if state.indices.contains_key(index) {
            return Err(BackendError::Request {
                operation: "create_index".to_string(),
                message: format!("resource_already_exists_exception: index [{}]", index),
            });
        }
        let mut mapping = mapping.clone();
        normalize_mapping(&mut mapping);
        state.indices.insert(
            index.to_string(),
            MemoryIndex {
                mapping,
                settings: settings.clone(),
                documents: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_index(&self, indices: &[String]) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record("delete_index", join(indices))?;
        state
            .indices
            .retain(|name, _| !indices.iter().any(|p| matches_pattern(p, name)));
        Ok(())
    }

    async fn get_mapping(&self, index: &str) -> Result<Value, BackendError> {
        let mut state = self.state.lock();
        state.record("get_mapping", index)?;
        Ok(state.index(index)?.mapping.clone())
    }

    async fn put_mapping(&self, index: &str, mapping: &Value) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record("put_mapping", index)?;
        let stored = &mut state.index_mut(index)?.mapping;
        if stored.is_null() {
            *stored = Value::Object(Map::new());
        }
        merge_mapping(stored, mapping, "").map_err(|message| BackendError::Request {
            operation: "put_mapping".to_string(),
            message,
        })?;
        normalize_mapping(stored);
        Ok(())
    }

    async fn update_settings(&self, index: &str, settings: &Value) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record("update_settings", index)?;
        let stored = &mut state.index_mut(index)?.settings;
        if stored.is_null() {
            *stored = Value::Object(Map::new());
        }
        merge_mapping(stored, settings, "").map_err(|message| BackendError::Request {
            operation: "update_settings".to_string(),
            message,
        })
    }

    async fn cluster_health(
        &self,
        indices: &[String],
        timeout: Duration,
    ) -> Result<ClusterHealth, BackendError> {
        let status = {
            let mut state = self.state.lock();
            state.record("cluster_health", join(indices))?;
            state.health
        };
        // an unhealthy cluster holds the request until the wait times out
        if !status.is_serving() {
            tokio::time::sleep(timeout).await;
        }
        Ok(ClusterHealth {
            status,
            timed_out: !status.is_serving(),
        })
    }

    async fn refresh(&self, indices: &[String]) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record("refresh", join(indices))?;
        for index in indices {
            state.index(index)?;
        }
        Ok(())
    }

    async fn update_by_query(
        &self,
        request: &ByQueryRequest,
    ) -> Result<ByQueryResponse, BackendError> {
        self.by_query("update_by_query", request)
    }

    async fn delete_by_query(
        &self,
        request: &ByQueryRequest,
    ) -> Result<ByQueryResponse, BackendError> {
        self.by_query("delete_by_query", request)
    }

    async fn reindex(
        &self,
        request: &ReindexRequest,
        batch_size: u64,
    ) -> Result<ReindexResponse, BackendError> {
        let mut state = self.state.lock();
        state.record(
            "reindex",
            format!(
                "{}->{} size={}",
                request.source, request.destination, batch_size
            ),
        )?;
        if let Some(limit) = state.reindex_limit
            && batch_size > limit
        {
            return Err(BackendError::Rejected {
                status: 429,
                message: format!(
                    "es_rejected_execution_exception: rejected execution of bulk with {} documents",
                    batch_size
                ),
            });
        }

        let documents = state.index(&request.source)?.documents.clone();
        let destination = state
            .indices
            .entry(request.destination.clone())
            .or_default();

        let mut response = ReindexResponse {
            took: Duration::from_millis(1),
            total: documents.len() as u64,
            ..Default::default()
        };
        for (id, source) in documents {
            if destination.documents.insert(id, source).is_some() {
                response.updated += 1;
            } else {
                response.created += 1;
            }
        }
        Ok(response)
    }

    async fn stream_documents(
        &self,
        index: &str,
        batch_size: u64,
    ) -> Result<Box<dyn DocumentStream>, BackendError> {
        let mut state = self.state.lock();
        state.record("stream_documents", index)?;
        let documents: Vec<Document> = state
            .index(index)?
            .documents
            .iter()
            .map(|(id, source)| Document::new(id.clone(), source.clone()))
            .collect();
        Ok(Box::new(MemoryStream {
            total: documents.len() as u64,
            remaining: documents.into_iter().rev().collect(),
            batch_size: batch_size.max(1) as usize,
        }))
    }

    async fn bulk_index(&self, index: &str, documents: &[Document]) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record("bulk_index", format!("{} n={}", index, documents.len()))?;
        let target = state.index_mut(index)?;
        for document in documents {
            target
                .documents
                .insert(document.id.clone(), document.source.clone());
        }
        Ok(())
    }

    async fn update(&self, request: &UpdateRequest) -> Result<Value, BackendError> {
        let mut state = self.state.lock();
        state.record("update", format!("{}/{}", request.index, request.id))?;
        let script = state.script(&request.script)?;
        let index = state.index_mut(&request.index)?;
        match index.documents.get_mut(&request.id) {
            Some(source) => {
                script(source, &request.script.params);
                Ok(source.clone())
            }
            None => match &request.upsert {
                Some(upsert) => {
                    index
                        .documents
                        .insert(request.id.clone(), upsert.clone());
                    Ok(upsert.clone())
                }
                None => Err(BackendError::Request {
                    operation: "update".to_string(),
                    message: format!(
                        "document_missing_exception: [{}]: document missing",
                        request.id
                    ),
                }),
            },
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push("close cluster".to_string());
        if state.closed {
            return Err(BackendError::ConnectionClosed);
        }
        state.closed = true;
        Ok(())
    }
}

/// Stream over a snapshot of an index; documents are kept in reverse order so
/// batches can be popped off the end.
struct MemoryStream {
    total: u64,
    remaining: Vec<Document>,
    batch_size: usize,
}

#[async_trait]
impl DocumentStream for MemoryStream {
    fn total(&self) -> u64 {
        self.total
    }

    async fn next_batch(&mut self) -> Result<Vec<Document>, BackendError> {
        let mut batch = Vec::with_capacity(self.batch_size.min(self.remaining.len()));
        while batch.len() < self.batch_size {
            match self.remaining.pop() {
                Some(document) => batch.push(document),
                None => break,
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Query;
    use serde_json::json;

    fn by_query(index: &str, query: Query, script: Option<Script>) -> ByQueryRequest {
        ByQueryRequest {
            index: index.to_string(),
            query,
            script,
            batch_size: 100,
            slices: 1,
        }
    }

    #[tokio::test]
    async fn test_mapping_merge_and_normalization() {
        let cluster = InMemoryCluster::new();
        cluster
            .create_index(
                "a",
                &json!({ "properties": { "m": { "type": "object", "properties": { "x": { "type": "long" } } } } }),
                &json!({}),
            )
            .await
            .unwrap();
        assert_eq!(
            cluster.get_mapping("a").await.unwrap(),
            json!({ "properties": { "m": { "properties": { "x": { "type": "long" } } } } })
        );

        cluster
            .put_mapping("a", &json!({ "properties": { "y": { "type": "keyword" } } }))
            .await
            .unwrap();
        let mapping = cluster.mapping("a").unwrap();
        assert!(mapping["properties"]["m"].is_object());
        assert_eq!(mapping["properties"]["y"]["type"], "keyword");

        let err = cluster
            .put_mapping("a", &json!({ "properties": { "y": { "type": "long" } } }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot be changed"));
    }

    #[tokio::test]
    async fn test_wildcard_delete() {
        let cluster = InMemoryCluster::new();
        cluster.seed("snomed-concept", Vec::new());
        cluster.seed("snomed-description", Vec::new());
        cluster.seed("other-concept", Vec::new());
        cluster
            .delete_index(&["snomed-*".to_string()])
            .await
            .unwrap();
        assert_eq!(cluster.index_names(), vec!["other-concept".to_string()]);
    }

    #[tokio::test]
    async fn test_by_query_with_conflicts_and_scripts() {
        let cluster = InMemoryCluster::new();
        cluster.seed(
            "a",
            [
                Document::new("1", json!({ "active": false })),
                Document::new("2", json!({ "active": false })),
                Document::new("3", json!({ "active": true })),
            ],
        );
        cluster.register_script("activate", |source, _| {
            source["active"] = json!(true);
        });
        cluster.inject_conflicts("a", 1);

        let script = Some(Script::new("activate"));
        let response = cluster
            .update_by_query(&by_query("a", Query::MatchAll, script.clone()))
            .await
            .unwrap();
        assert_eq!(response.version_conflicts, 1);
        assert_eq!(response.updated, 1);
        assert_eq!(response.noops, 1);

        let response = cluster
            .update_by_query(&by_query("a", Query::MatchAll, script))
            .await
            .unwrap();
        assert_eq!(response.version_conflicts, 0);
        assert_eq!(response.updated, 1);

        let response = cluster
            .delete_by_query(&by_query("a", Query::ids(["3"]), None))
            .await
            .unwrap();
        assert_eq!(response.deleted, 1);
        assert_eq!(cluster.documents("a").len(), 2);
    }

    #[tokio::test]
    async fn test_stream_batches() {
        let cluster = InMemoryCluster::new();
        cluster.seed(
            "a",
            (1..=5).map(|i| Document::new(i.to_string(), json!({ "n": i }))),
        );
        let mut stream = cluster.stream_documents("a", 2).await.unwrap();
        assert_eq!(stream.total(), 5);
        let sizes = [
            stream.next_batch().await.unwrap().len(),
            stream.next_batch().await.unwrap().len(),
            stream.next_batch().await.unwrap().len(),
            stream.next_batch().await.unwrap().len(),
        ];
        assert_eq!(sizes, [2, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_close_twice() {
        let cluster = InMemoryCluster::new();
        cluster.close().await.unwrap();
        assert!(matches!(
            cluster.close().await,
            Err(BackendError::ConnectionClosed)
        ));
        assert!(matches!(
            cluster.index_exists("a").await,
            Err(BackendError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let cluster = InMemoryCluster::new();
        cluster.fail_next("index_exists", "boom");
        assert!(cluster.index_exists("a").await.is_err());
        assert!(!cluster.index_exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_next_on_matches_target() {
        let cluster = InMemoryCluster::new();
        cluster.fail_next_on("index_exists", "b", "boom");
        assert!(!cluster.index_exists("a").await.unwrap());
        assert!(cluster.index_exists("b").await.is_err());
        assert!(!cluster.index_exists("b").await.unwrap());
    }
}
