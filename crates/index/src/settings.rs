//! Engine and index settings.
//!
//! Settings are a flat key-value map mixing three families of keys:
//!
//! - **dynamic** keys are cluster index settings that can change on a live
//!   index ([`keys::RESULT_WINDOW`], [`keys::MAX_TERMS_COUNT`],
//!   [`keys::TRANSLOG_SYNC_INTERVAL`]);
//! - **static** keys only apply when an index is created (shards and
//!   replicas);
//! - **local** keys configure the engine itself and are never sent to the
//!   cluster (concurrency, bulk sizes, watermarks, timeouts, prefix).
//!
//! A key equal to a registered type name carries per-type overrides; its
//! `settings` object is merged into the creation settings of that type's
//! index.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::ConfigurationError;
use crate::mapping::Mappings;

/// Recognized settings keys.
pub mod keys {
    /// Number of primary shards (creation only).
    pub const NUMBER_OF_SHARDS: &str = "number_of_shards";
    /// Number of replicas (creation only).
    pub const NUMBER_OF_REPLICAS: &str = "number_of_replicas";
    /// Maximum result window; also the default batch size.
    pub const RESULT_WINDOW: &str = "max_result_window";
    /// Maximum number of terms in a terms query.
    pub const MAX_TERMS_COUNT: &str = "max_terms_count";
    /// Translog sync interval.
    pub const TRANSLOG_SYNC_INTERVAL: &str = "translog.sync_interval";

    /// Parallel slices used by bulk writes.
    pub const COMMIT_CONCURRENCY_LEVEL: &str = "commitConcurrencyLevel";
    /// Parallel searches used by queries.
    pub const QUERY_CONCURRENCY_LEVEL: &str = "queryConcurrencyLevel";
    /// Maximum number of actions per bulk request.
    pub const BULK_ACTION_SIZE: &str = "bulkActionSize";
    /// Maximum size of a bulk request in megabytes.
    pub const BULK_ACTION_SIZE_IN_MB: &str = "bulkActionSizeInMb";
    /// Pending document count at which commits are encouraged.
    pub const COMMIT_WATERMARK_LOW: &str = "commitWatermarkLow";
    /// Pending document count at which commits are forced.
    pub const COMMIT_WATERMARK_HIGH: &str = "commitWatermarkHigh";
    /// Maximum time to wait for cluster health.
    pub const CLUSTER_HEALTH_TIMEOUT: &str = "clusterHealthTimeout";
    /// Request socket timeout.
    pub const SOCKET_TIMEOUT: &str = "socketTimeout";
    /// Connection timeout.
    pub const CONNECT_TIMEOUT: &str = "connectTimeout";
    /// Prefix prepended to every index name.
    pub const INDEX_PREFIX: &str = "indexPrefix";

    /// Keys that can be updated on live indices.
    pub const DYNAMIC: [&str; 3] = [RESULT_WINDOW, MAX_TERMS_COUNT, TRANSLOG_SYNC_INTERVAL];

    /// Keys that only apply at index creation.
    pub const STATIC: [&str; 2] = [NUMBER_OF_SHARDS, NUMBER_OF_REPLICAS];

    /// Keys that configure the engine only.
    pub const LOCAL: [&str; 10] = [
        COMMIT_CONCURRENCY_LEVEL,
        QUERY_CONCURRENCY_LEVEL,
        BULK_ACTION_SIZE,
        BULK_ACTION_SIZE_IN_MB,
        COMMIT_WATERMARK_LOW,
        COMMIT_WATERMARK_HIGH,
        CLUSTER_HEALTH_TIMEOUT,
        SOCKET_TIMEOUT,
        CONNECT_TIMEOUT,
        INDEX_PREFIX,
    ];
}

/// Default maximum result window.
pub const DEFAULT_RESULT_WINDOW: u64 = 10_000;
/// Default maximum terms count.
pub const DEFAULT_MAX_TERMS_COUNT: u64 = 65_536;
/// Default translog sync interval.
pub const DEFAULT_TRANSLOG_SYNC_INTERVAL: &str = "5s";
/// Default commit concurrency level.
pub const DEFAULT_COMMIT_CONCURRENCY_LEVEL: u64 = 1;
/// Default query concurrency level.
pub const DEFAULT_QUERY_CONCURRENCY_LEVEL: u64 = 4;
/// Default bulk action size.
pub const DEFAULT_BULK_ACTION_SIZE: u64 = 10_000;
/// Default bulk action size in megabytes.
pub const DEFAULT_BULK_ACTION_SIZE_IN_MB: u64 = 9;
/// Default low commit watermark.
pub const DEFAULT_COMMIT_WATERMARK_LOW: u64 = 10_000;
/// Default high commit watermark.
pub const DEFAULT_COMMIT_WATERMARK_HIGH: u64 = 20_000;
/// Default cluster health timeout.
pub const DEFAULT_CLUSTER_HEALTH_TIMEOUT: Duration = Duration::from_secs(300);
/// Default socket timeout.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);
/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

const DURATION_KEYS: [&str; 3] = [
    keys::CLUSTER_HEALTH_TIMEOUT,
    keys::SOCKET_TIMEOUT,
    keys::CONNECT_TIMEOUT,
];

const COUNT_KEYS: [&str; 10] = [
    keys::NUMBER_OF_SHARDS,
    keys::NUMBER_OF_REPLICAS,
    keys::RESULT_WINDOW,
    keys::MAX_TERMS_COUNT,
    keys::COMMIT_CONCURRENCY_LEVEL,
    keys::QUERY_CONCURRENCY_LEVEL,
    keys::BULK_ACTION_SIZE,
    keys::BULK_ACTION_SIZE_IN_MB,
    keys::COMMIT_WATERMARK_LOW,
    keys::COMMIT_WATERMARK_HIGH,
];

/// Family of a settings key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    /// Cluster setting applicable to live indices.
    Dynamic,
    /// Cluster setting applicable at creation only.
    Static,
    /// Engine-only setting.
    Local,
    /// Per-type override.
    Type,
}

/// Classifies a key against the known keys and the registered types.
pub fn classify(key: &str, mappings: &Mappings) -> Option<SettingKind> {
    if keys::DYNAMIC.contains(&key) {
        Some(SettingKind::Dynamic)
    } else if keys::STATIC.contains(&key) {
        Some(SettingKind::Static)
    } else if keys::LOCAL.contains(&key) {
        Some(SettingKind::Local)
    } else if mappings.get_mapping(key).is_some() {
        Some(SettingKind::Type)
    } else {
        None
    }
}

/// Snapshot of the settings of one index admin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    values: Map<String, Value>,
}

impl Settings {
    /// Creates a snapshot, checking the shape of every known key.
    pub fn new(values: Map<String, Value>) -> Result<Self, ConfigurationError> {
        for (key, value) in &values {
            validate_value(key, value)?;
        }
        Ok(Self { values })
    }

    /// Returns the raw value of a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns all values.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Records a value, checking its shape first.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<(), ConfigurationError> {
        let key = key.into();
        validate_value(&key, &value)?;
        self.values.insert(key, value);
        Ok(())
    }

    /// Maximum result window, also used as the default batch size.
    pub fn result_window(&self) -> u64 {
        self.count(keys::RESULT_WINDOW, DEFAULT_RESULT_WINDOW)
    }

    /// Maximum terms count.
    pub fn max_terms_count(&self) -> u64 {
        self.count(keys::MAX_TERMS_COUNT, DEFAULT_MAX_TERMS_COUNT)
    }

    /// Translog sync interval.
    pub fn translog_sync_interval(&self) -> String {
        match self.values.get(keys::TRANSLOG_SYNC_INTERVAL) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => DEFAULT_TRANSLOG_SYNC_INTERVAL.to_string(),
        }
    }

    /// Number of parallel slices for bulk writes.
    pub fn commit_concurrency_level(&self) -> u64 {
        self.count(keys::COMMIT_CONCURRENCY_LEVEL, DEFAULT_COMMIT_CONCURRENCY_LEVEL)
            .max(1)
    }

    /// Number of parallel searches for queries.
    pub fn query_concurrency_level(&self) -> u64 {
        self.count(keys::QUERY_CONCURRENCY_LEVEL, DEFAULT_QUERY_CONCURRENCY_LEVEL)
            .max(1)
    }

    /// Maximum number of actions per bulk request.
    pub fn bulk_action_size(&self) -> u64 {
        self.count(keys::BULK_ACTION_SIZE, DEFAULT_BULK_ACTION_SIZE)
    }

    /// Maximum bulk request size in megabytes.
    pub fn bulk_action_size_in_mb(&self) -> u64 {
        self.count(keys::BULK_ACTION_SIZE_IN_MB, DEFAULT_BULK_ACTION_SIZE_IN_MB)
    }

    /// Low and high commit watermarks.
    pub fn commit_watermarks(&self) -> (u64, u64) {
        (
            self.count(keys::COMMIT_WATERMARK_LOW, DEFAULT_COMMIT_WATERMARK_LOW),
            self.count(keys::COMMIT_WATERMARK_HIGH, DEFAULT_COMMIT_WATERMARK_HIGH),
        )
    }

    /// Maximum time to wait for cluster health.
    pub fn cluster_health_timeout(&self) -> Duration {
        self.duration(keys::CLUSTER_HEALTH_TIMEOUT, DEFAULT_CLUSTER_HEALTH_TIMEOUT)
    }

    /// Request socket timeout.
    pub fn socket_timeout(&self) -> Duration {
        self.duration(keys::SOCKET_TIMEOUT, DEFAULT_SOCKET_TIMEOUT)
    }

    /// Connection timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.duration(keys::CONNECT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Index name prefix.
    pub fn index_prefix(&self) -> Option<&str> {
        self.values
            .get(keys::INDEX_PREFIX)
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
    }

    /// Returns the cluster settings used to create the index of `root_type`.
    pub fn index_creation_settings(&self, root_type: &str) -> Value {
        let mut index = Map::new();
        index.insert("analysis".to_string(), default_analysis());
        index.insert(
            keys::NUMBER_OF_SHARDS.to_string(),
            json!(self.count(keys::NUMBER_OF_SHARDS, 1).to_string()),
        );
        index.insert(
            keys::NUMBER_OF_REPLICAS.to_string(),
            json!(self.count(keys::NUMBER_OF_REPLICAS, 0).to_string()),
        );
        // refreshes are issued explicitly after every commit
        index.insert("refresh_interval".to_string(), json!("-1"));
        index.insert(
            keys::RESULT_WINDOW.to_string(),
            json!(self.result_window().to_string()),
        );
        index.insert(
            keys::MAX_TERMS_COUNT.to_string(),
            json!(self.max_terms_count().to_string()),
        );
        index.insert(
            keys::TRANSLOG_SYNC_INTERVAL.to_string(),
            json!(self.translog_sync_interval()),
        );
        index.insert("translog.durability".to_string(), json!("async"));
        index.insert("write.wait_for_active_shards".to_string(), json!("all"));

        if let Some(overrides) = self
            .values
            .get(root_type)
            .and_then(|v| v.get("settings"))
            .and_then(Value::as_object)
        {
            for (key, value) in overrides {
                index.insert(key.clone(), value.clone());
            }
        }

        json!({ "index": index })
    }

    /// Returns the dynamic subset of `updates` in the form sent to live indices.
    pub fn dynamic_settings(updates: &Map<String, Value>) -> Option<Value> {
        let index: Map<String, Value> = updates
            .iter()
            .filter(|(k, _)| keys::DYNAMIC.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if index.is_empty() {
            None
        } else {
            Some(json!({ "index": index }))
        }
    }

    fn count(&self, key: &str, default: u64) -> u64 {
        self.values
            .get(key)
            .and_then(parse_count)
            .unwrap_or(default)
    }

    fn duration(&self, key: &str, default: Duration) -> Duration {
        self.values
            .get(key)
            .and_then(parse_duration)
            .unwrap_or(default)
    }
}

/// Analysis components available to every index.
pub fn default_analysis() -> Value {
    json!({
        "normalizer": {
            "case_insensitive": {
                "type": "custom",
                "filter": ["lowercase", "asciifolding"]
            }
        },
        "analyzer": {
            "tokenized": {
                "type": "custom",
                "tokenizer": "standard",
                "filter": ["lowercase", "asciifolding"]
            },
            "exact": {
                "type": "custom",
                "tokenizer": "keyword",
                "filter": ["lowercase"]
            }
        }
    })
}

fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Integer values are milliseconds; strings are parsed as humantime durations.
fn parse_duration(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n.as_u64().map(Duration::from_millis),
        Value::String(s) => match s.trim().parse::<u64>() {
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(_) => humantime::parse_duration(s.trim()).ok(),
        },
        _ => None,
    }
}

fn validate_value(key: &str, value: &Value) -> Result<(), ConfigurationError> {
    let invalid = |message: &str| ConfigurationError::InvalidSetting {
        key: key.to_string(),
        message: message.to_string(),
    };
    if COUNT_KEYS.contains(&key) && parse_count(value).is_none() {
        return Err(invalid("expected a non-negative integer"));
    }
    if DURATION_KEYS.contains(&key) && parse_duration(value).is_none() {
        return Err(invalid(
            "expected milliseconds or a duration such as '30s'",
        ));
    }
    if key == keys::INDEX_PREFIX && !value.is_string() {
        return Err(invalid("expected a string"));
    }
    Ok(())
}

/// Serde module for Duration with humantime format.
pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::DocumentMapping;

    fn mappings() -> Mappings {
        Mappings::new(vec![DocumentMapping::new("concept")]).unwrap()
    }

    #[test]
    fn test_classify() {
        let mappings = mappings();
        assert_eq!(
            classify(keys::RESULT_WINDOW, &mappings),
            Some(SettingKind::Dynamic)
        );
        assert_eq!(
            classify(keys::NUMBER_OF_SHARDS, &mappings),
            Some(SettingKind::Static)
        );
        assert_eq!(
            classify(keys::SOCKET_TIMEOUT, &mappings),
            Some(SettingKind::Local)
        );
        assert_eq!(classify("concept", &mappings), Some(SettingKind::Type));
        assert_eq!(classify("unknownKey", &mappings), None);
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.result_window(), DEFAULT_RESULT_WINDOW);
        assert_eq!(settings.commit_concurrency_level(), 1);
        assert_eq!(settings.cluster_health_timeout(), Duration::from_secs(300));
        assert_eq!(settings.index_prefix(), None);
    }

    #[test]
    fn test_durations_accept_millis_and_humantime() {
        let settings = Settings::new(
            json!({
                "socketTimeout": 2000,
                "clusterHealthTimeout": "2m",
                "connectTimeout": "500"
            })
            .as_object()
            .cloned()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(settings.socket_timeout(), Duration::from_secs(2));
        assert_eq!(settings.cluster_health_timeout(), Duration::from_secs(120));
        assert_eq!(settings.connect_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut settings = Settings::default();
        let err = settings
            .insert(keys::RESULT_WINDOW, json!("lots"))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidSetting { .. }));
        assert!(settings.insert(keys::SOCKET_TIMEOUT, json!(true)).is_err());
        assert!(settings.insert(keys::RESULT_WINDOW, json!("500")).is_ok());
        assert_eq!(settings.result_window(), 500);
    }

    #[test]
    fn test_creation_settings_merge_type_overrides() {
        let settings = Settings::new(
            json!({
                "number_of_shards": 3,
                "concept": { "settings": { "number_of_replicas": "2" } }
            })
            .as_object()
            .cloned()
            .unwrap(),
        )
        .unwrap();

        let created = settings.index_creation_settings("concept");
        assert_eq!(created["index"]["number_of_shards"], "3");
        assert_eq!(created["index"]["number_of_replicas"], "2");
        assert_eq!(created["index"]["refresh_interval"], "-1");
        assert!(created["index"]["analysis"]["normalizer"]["case_insensitive"].is_object());

        let other = settings.index_creation_settings("description");
        assert_eq!(other["index"]["number_of_replicas"], "0");
    }

    #[test]
    fn test_dynamic_settings_subset() {
        let updates = json!({ "max_result_window": 500, "socketTimeout": 10 })
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(
            Settings::dynamic_settings(&updates),
            Some(json!({ "index": { "max_result_window": 500 } }))
        );
        assert_eq!(Settings::dynamic_settings(&Map::new()), None);
    }
}
