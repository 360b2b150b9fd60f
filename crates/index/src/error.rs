//! Error types for index administration.
//!
//! Errors are organised by category: configuration mistakes that no retry can
//! fix, transient backend conditions whose local retry budget ran out, backend
//! unavailability, migration failures and plain client failures. Every variant
//! carries the index, versions or operation involved so it is actionable from
//! a log line alone.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::time::Duration;

use thiserror::Error;

/// The primary error type for all index administration operations.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Invalid mappings, settings or schema evolution.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Conflicts or rejections that persisted after local retries.
    #[error(transparent)]
    Transient(#[from] TransientBackendError),

    /// The cluster could not be reached or did not become healthy.
    #[error(transparent)]
    Unavailable(#[from] UnavailableError),

    /// A schema revision could not be applied.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Any other failure reported by the cluster client.
    #[error(transparent)]
    Backend(BackendError),
}

impl IndexError {
    /// Returns true for errors caused by the declared mappings or settings.
    pub fn is_configuration(&self) -> bool {
        matches!(self, IndexError::Configuration(_))
    }
}

/// Client connection failures surface as unavailability, everything else as a
/// backend error.
impl From<BackendError> for IndexError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ConnectionFailed { message } => {
                IndexError::Unavailable(UnavailableError::ConnectionFailed { message })
            }
            other => IndexError::Backend(other),
        }
    }
}

/// Errors caused by mappings, schema versions or settings.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// The live index carries a newer schema than the one declared in code.
    #[error(
        "schema version of index '{index}' regressed: stored version {stored} is newer than declared version {declared}"
    )]
    SchemaVersionRegressed {
        index: String,
        stored: u32,
        declared: u32,
    },

    /// The mapping changed but the schema version was not bumped.
    #[error(
        "mapping of index '{index}' changed without a schema version bump (still {version}); changed properties: {}",
        .changes.join(", ")
    )]
    UnversionedMappingChange {
        index: String,
        version: u32,
        changes: Vec<String>,
    },

    /// Breaking mapping changes with no script revision that rebuilds the index.
    #[error(
        "cannot migrate index '{index}' from version {from} to {to}: breaking change on {} requires a script reindex revision",
        .fields.join(", ")
    )]
    BreakingChangeWithoutRebuild {
        index: String,
        from: u32,
        to: u32,
        fields: Vec<String>,
    },

    /// A settings key that is neither dynamic, local nor a type override.
    #[error("unsupported dynamic setting '{key}'")]
    UnsupportedSetting { key: String },

    /// A settings key that can only be set when an index is created.
    #[error("setting '{key}' can only be applied at index creation")]
    StaticSetting { key: String },

    /// A settings value of the wrong shape.
    #[error("invalid value for setting '{key}': {message}")]
    InvalidSetting { key: String, message: String },

    /// A document mapping declaration is inconsistent.
    #[error("invalid mapping for type '{type_name}': {message}")]
    InvalidMapping { type_name: String, message: String },

    /// An operation referenced a type with no registered mapping.
    #[error("no mapping registered for type '{type_name}'")]
    UnknownType { type_name: String },

    /// An update referenced a script its mapping does not declare.
    #[error("type '{type_name}' declares no script named '{script}'")]
    UnknownScript { type_name: String, script: String },
}

/// Conflicts and rejections that outlived their local retry budget.
#[derive(Error, Debug)]
pub enum TransientBackendError {
    /// Version conflicts were still reported after the last attempt.
    #[error(
        "bulk {command} on '{index}' ({type_name}) still had {conflicts} version conflicts after {attempts} attempts"
    )]
    ConflictsExhausted {
        index: String,
        type_name: String,
        command: String,
        attempts: u32,
        conflicts: u64,
    },

    /// The cluster rejected the reindex even with a batch size of one.
    #[error(
        "reindex from '{source_index}' to '{destination}' was rejected at batch size 1 after {attempts} attempts: {message}"
    )]
    BatchSizeExhausted {
        source_index: String,
        destination: String,
        attempts: u32,
        message: String,
    },
}

/// The cluster could not be reached or stayed unhealthy.
#[derive(Error, Debug)]
pub enum UnavailableError {
    /// Cluster health did not reach yellow in time.
    #[error(
        "cluster health did not reach yellow status for {} after {}",
        .indices.join(", "),
        format_elapsed(.elapsed)
    )]
    HealthTimeout {
        indices: Vec<String>,
        elapsed: Duration,
    },

    /// The connection to the cluster failed.
    #[error("connection to the index cluster failed: {message}")]
    ConnectionFailed { message: String },
}

fn format_elapsed(elapsed: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*elapsed)
}

/// Errors raised while applying a schema revision.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// A migrator produced no document.
    #[error(
        "migrator for '{type_name}' version {version} returned no document for id '{id}' in index '{index}'"
    )]
    MissingMigratorOutput {
        index: String,
        type_name: String,
        version: u32,
        id: String,
    },

    /// The rebuilt index holds a different number of documents than were migrated.
    #[error(
        "rebuild of '{index}' to version {version} copied {copied} documents but {migrated} were migrated; '{temporary}' was kept"
    )]
    DocumentCountMismatch {
        index: String,
        temporary: String,
        version: u32,
        migrated: u64,
        copied: u64,
    },

    /// A step of a revision failed.
    #[error("migration of '{index}' from version {from} to {to} failed during {step}: {source}")]
    StepFailed {
        index: String,
        from: u32,
        to: u32,
        step: String,
        #[source]
        source: Box<IndexError>,
    },
}

/// Failures reported by the index cluster client.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The cluster could not be reached.
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    /// The connection has already been closed.
    #[error("connection already closed")]
    ConnectionClosed,

    /// The cluster rejected the request because it is overloaded.
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The cluster ran out of a resource (memory, circuit breaker, payload size).
    #[error("cluster resources exhausted: {message}")]
    ResourceExhausted { message: String },

    /// The index does not exist.
    #[error("index not found: {index}")]
    IndexNotFound { index: String },

    /// The cluster did not acknowledge an administrative request.
    #[error("{operation} on '{index}' was not acknowledged")]
    NotAcknowledged { operation: String, index: String },

    /// Non-conflict document failures reported by a bulk operation.
    #[error("{operation} on '{index}' reported {} failures: {}", .failures.len(), .failures.join("; "))]
    BulkFailures {
        operation: String,
        index: String,
        failures: Vec<String>,
    },

    /// The reindex operation did not finish cleanly.
    #[error("reindex from '{source_index}' to '{destination}' failed: {message}")]
    ReindexFailed {
        source_index: String,
        destination: String,
        message: String,
    },

    /// Dynamic settings reached some live indices before one update failed.
    #[error(
        "updating settings of '{index}' failed after {} were updated: {source}",
        .applied.join(", ")
    )]
    SettingsPartiallyApplied {
        index: String,
        applied: Vec<String>,
        #[source]
        source: Box<BackendError>,
    },

    /// A request failed for any other reason.
    #[error("{operation} failed: {message}")]
    Request { operation: String, message: String },

    /// A response could not be decoded.
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

/// Pattern of rejection messages caused by oversized batches.
const REJECTION_MARKERS: [&str; 4] = [
    "es_rejected_execution_exception",
    "rejected execution",
    "too many requests",
    "circuit_breaking_exception",
];

impl BackendError {
    /// Returns true when the failure means the request batch was too large for
    /// the cluster to accept.
    pub fn is_batch_rejection(&self) -> bool {
        match self {
            BackendError::Rejected { status, .. } if *status == 429 => true,
            BackendError::ResourceExhausted { .. } => true,
            BackendError::Rejected { message, .. } | BackendError::Request { message, .. } => {
                let message = message.to_lowercase();
                REJECTION_MARKERS.iter().any(|m| message.contains(m))
            }
            _ => false,
        }
    }
}

/// Result type alias for index administration operations.
pub type IndexResult<T> = Result<T, IndexError>;

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let err = ConfigurationError::SchemaVersionRegressed {
            index: "snomed-concept".to_string(),
            stored: 3,
            declared: 2,
        };
        assert!(err.to_string().contains("stored version 3"));

        let err = ConfigurationError::UnversionedMappingChange {
            index: "snomed-concept".to_string(),
            version: 2,
            changes: vec!["/properties/a".to_string(), "/properties/b".to_string()],
        };
        assert!(err.to_string().ends_with("/properties/a, /properties/b"));
    }

    #[test]
    fn test_batch_rejection_classification() {
        assert!(
            BackendError::Rejected {
                status: 429,
                message: String::new(),
            }
            .is_batch_rejection()
        );
        assert!(
            BackendError::Rejected {
                status: 503,
                message: "EsRejectedExecutionException[es_rejected_execution_exception]"
                    .to_string(),
            }
            .is_batch_rejection()
        );
        assert!(
            BackendError::ResourceExhausted {
                message: "heap".to_string(),
            }
            .is_batch_rejection()
        );
        assert!(
            !BackendError::Request {
                operation: "reindex".to_string(),
                message: "mapper_parsing_exception".to_string(),
            }
            .is_batch_rejection()
        );
        assert!(
            !BackendError::IndexNotFound {
                index: "a".to_string(),
            }
            .is_batch_rejection()
        );
    }

    #[test]
    fn test_connection_failure_maps_to_unavailable() {
        let err: IndexError = BackendError::ConnectionFailed {
            message: "refused".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            IndexError::Unavailable(UnavailableError::ConnectionFailed { .. })
        ));

        let err: IndexError = BackendError::ConnectionClosed.into();
        assert!(matches!(err, IndexError::Backend(_)));
    }

    #[test]
    fn test_health_timeout_display() {
        let err = UnavailableError::HealthTimeout {
            indices: vec!["a".to_string(), "b".to_string()],
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(
            err.to_string(),
            "cluster health did not reach yellow status for a, b after 1s 500ms"
        );
    }
}
