//! Replays schema revisions against an existing index.
//!
//! The executor receives the stored schema version of an index and the
//! declared [`IndexSchema`], and applies every pending revision of the index's
//! [`MappingGroup`] in ascending version order:
//!
//! - `NoReindex` pushes the schema;
//! - `ReindexInPlace` pushes the schema and rewrites every document of the
//!   revision's type in place;
//! - `ReindexScript` rebuilds the index through a temporary index, passing
//!   every document of the revision's type through its migrator.
//!
//! Failures stop the replay. Nothing is rolled back; the stored version only
//! records revisions that completed, so the next run resumes where this one
//! stopped.
//!
//! A rebuild first copies the migrated documents into the temporary index and
//! then marks it complete under `_meta.migration`. From that point the
//! temporary index is the source of truth: the original is recreated at the
//! previous version, filled from the temporary index and only bumped to the
//! new version once the copy back is verified. A run that finds a complete
//! temporary index resumes the copy back instead of migrating again.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::bulk::{BulkCommand, BulkMutator, RetryPolicy, type_filter};
use crate::client::{ByQueryRequest, Document, IndexClusterClient};
use crate::error::{BackendError, IndexError, IndexResult, MigrationError};
use crate::health::wait_for_health;
use crate::mapping::{
    DocumentMapping, DocumentMigrator, IndexSchema, MappingGroup, MigrationContext,
    MigrationStrategy, SchemaRevision, TYPE_FIELD,
};
use crate::reindex::{ReindexRequest, Reindexer};
use crate::settings::Settings;

/// Batch size used to stream types flagged as holding large documents.
pub const LARGE_DOCUMENT_BATCH_SIZE: u64 = 1000;

/// Returns the name of the temporary index used to rebuild `index` at `version`.
pub fn temporary_index_name(index: &str, version: u32) -> String {
    format!("{}-migrate-to-v{}", index, version)
}

/// Marker stored under `_meta.migration` of a temporary index holding every
/// migrated document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedCopy {
    /// Stored version of the original index when the copy started.
    pub from: u32,
    /// Documents written to the temporary index.
    pub written: u64,
    /// Documents passed through the migrator.
    pub migrated: u64,
}

impl CompletedCopy {
    /// Reads the marker from a temporary index mapping.
    pub fn from_mapping(mapping: &Value) -> Option<Self> {
        mapping
            .pointer("/_meta/migration")
            .and_then(|marker| serde_json::from_value(marker.clone()).ok())
    }

    fn to_mapping(self, version: u32) -> Value {
        json!({ "_meta": { "version": version, "migration": self } })
    }
}

/// Finds a complete temporary index of `index` left by an interrupted rebuild
/// and returns the version the rebuild started from.
///
/// Only rebuild revisions up to `target` are considered. Used when the
/// original index is missing, which happens when a run stopped between
/// deleting and recreating it.
pub async fn interrupted_rebuild(
    client: &dyn IndexClusterClient,
    index: &str,
    group: &MappingGroup,
    target: u32,
) -> IndexResult<Option<u32>> {
    for (_, revision) in group.pending_revisions(0, target).iter().rev() {
        if !revision.strategy().rebuilds() {
            continue;
        }
        let temporary = temporary_index_name(index, revision.version());
        if !client.index_exists(&temporary).await? {
            continue;
        }
        let mapping = client.get_mapping(&temporary).await?;
        if let Some(copy) = CompletedCopy::from_mapping(&mapping) {
            return Ok(Some(copy.from));
        }
    }
    Ok(None)
}

/// A revision the executor completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRevision {
    /// Type that declared the revision.
    pub type_name: String,
    /// Version reached by the revision.
    pub version: u32,
    /// Strategy name.
    pub strategy: &'static str,
    /// Documents passed through a migrator.
    pub migrated: u64,
}

/// Result of replaying the pending revisions of one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Physical index.
    pub index: String,
    /// Stored version before the replay.
    pub from_version: u32,
    /// Stored version after the replay.
    pub to_version: u32,
    /// Completed revisions in the order they were applied.
    pub applied: Vec<AppliedRevision>,
    /// Types rewritten in place that need a refresh.
    pub refresh_types: BTreeSet<String>,
}

/// Applies schema revisions to indices.
pub struct MigrationExecutor<'a> {
    client: &'a dyn IndexClusterClient,
    settings: &'a Settings,
    policy: &'a RetryPolicy,
}

impl<'a> MigrationExecutor<'a> {
    /// Creates an executor.
    pub fn new(
        client: &'a dyn IndexClusterClient,
        settings: &'a Settings,
        policy: &'a RetryPolicy,
    ) -> Self {
        Self {
            client,
            settings,
            policy,
        }
    }

    /// Brings `index` from `stored_version` to the version of `schema`.
    ///
    /// When `breaking` is set the stored mapping cannot be updated in place;
    /// mapping-only revisions that precede a rebuild are then left to the
    /// rebuild, which recreates the index with the declared schema.
    #[instrument(skip_all, fields(index = %index, from = stored_version, to = schema.version()))]
    pub async fn migrate(
        &self,
        index: &str,
        group: &MappingGroup,
        schema: &IndexSchema,
        stored_version: u32,
        breaking: bool,
    ) -> IndexResult<MigrationOutcome> {
        let target = schema.version();
        let pending = group.pending_revisions(stored_version, target);
        let mut outcome = MigrationOutcome {
            index: index.to_string(),
            from_version: stored_version,
            to_version: stored_version,
            applied: Vec::new(),
            refresh_types: BTreeSet::new(),
        };

        info!(
            pending = pending.len(),
            "Migrating index '{}' from version {} to {}", index, stored_version, target
        );

        for (position, (mapping, revision)) in pending.iter().enumerate() {
            let from = outcome.to_version;
            let to = revision.version();
            info!(
                type_name = mapping.type_name(),
                strategy = revision.strategy().name(),
                "Applying revision {} of '{}': {}",
                to,
                mapping.type_name(),
                revision.description()
            );

            let superseded = breaking
                && pending[position + 1..]
                    .iter()
                    .any(|(_, later)| later.strategy().rebuilds());

            let migrated = match revision.strategy() {
                MigrationStrategy::NoReindex | MigrationStrategy::ReindexInPlace if superseded => {
                    debug!(version = to, "Revision is superseded by a later rebuild");
                    0
                }
                MigrationStrategy::NoReindex => {
                    self.push_schema(index, schema, from, to).await?;
                    0
                }
                MigrationStrategy::ReindexInPlace => {
                    self.push_schema(index, schema, from, to).await?;
                    self.touch(index, group, mapping.type_name())
                        .await
                        .map_err(step_failed(index, from, to, "in-place reindex"))?;
                    outcome.refresh_types.insert(mapping.type_name().to_string());
                    0
                }
                MigrationStrategy::ReindexScript(migrator) => {
                    self.rebuild(index, group, schema, mapping, revision, migrator, from)
                        .await?
                }
            };

            outcome.to_version = to;
            outcome.applied.push(AppliedRevision {
                type_name: mapping.type_name().to_string(),
                version: to,
                strategy: revision.strategy().name(),
                migrated,
            });
        }

        if outcome.to_version < target {
            // no revision is declared for the final version bump
            self.push_schema(index, schema, outcome.to_version, target)
                .await?;
            outcome.to_version = target;
        }

        info!(
            applied = outcome.applied.len(),
            "Index '{}' is at version {}", index, outcome.to_version
        );
        Ok(outcome)
    }

    async fn push_schema(
        &self,
        index: &str,
        schema: &IndexSchema,
        from: u32,
        to: u32,
    ) -> IndexResult<()> {
        self.client
            .put_mapping(index, &schema.with_version(to).to_json())
            .await
            .map_err(|e| step_failed(index, from, to, "mapping update")(e.into()))
    }

    /// Rewrites every document of `type_name` without a script.
    async fn touch(&self, index: &str, group: &MappingGroup, type_name: &str) -> IndexResult<bool> {
        let request = ByQueryRequest {
            index: index.to_string(),
            query: type_filter(group, type_name),
            script: None,
            batch_size: self.settings.result_window(),
            slices: self.settings.commit_concurrency_level(),
        };
        BulkMutator::new(self.client, self.policy)
            .execute(type_name, BulkCommand::Update, &request)
            .await
    }

    async fn wait_for(&self, indices: &[String]) -> IndexResult<()> {
        let timeout = self.settings.cluster_health_timeout();
        let poll_timeout = self.settings.socket_timeout() / 2;
        wait_for_health(self.client, indices, timeout, poll_timeout).await
    }

    /// Rebuilds `index` through a temporary index and returns the number of
    /// documents passed through the migrator.
    #[instrument(skip_all, fields(index = %index, type_name = mapping.type_name(), to = revision.version()))]
    #[allow(clippy::too_many_arguments)]
    async fn rebuild(
        &self,
        index: &str,
        group: &MappingGroup,
        schema: &IndexSchema,
        mapping: &Arc<DocumentMapping>,
        revision: &SchemaRevision,
        migrator: &Arc<dyn DocumentMigrator>,
        from: u32,
    ) -> IndexResult<u64> {
        let to = revision.version();
        let temporary = temporary_index_name(index, to);
        let original = [index.to_string()];
        let staging = [temporary.clone()];
        let index_settings = self
            .settings
            .index_creation_settings(group.root().type_name());

        let copy = match self.completed_copy(index, &temporary, from, to).await? {
            Some(copy) => {
                warn!(
                    temporary = %temporary,
                    written = copy.written,
                    "Resuming interrupted migration from its temporary index"
                );
                copy
            }
            None => {
                self.wait_for(&original)
                    .await
                    .map_err(step_failed(index, from, to, "health check"))?;
                self.client
                    .create_index(&temporary, &schema.with_version(to).to_json(), &index_settings)
                    .await
                    .map_err(|e| step_failed(index, from, to, "temporary index creation")(e.into()))?;
                self.wait_for(&staging)
                    .await
                    .map_err(step_failed(index, from, to, "temporary index health check"))?;

                let (written, migrated) = self
                    .copy_migrated(index, &temporary, group, mapping, migrator, from, to)
                    .await?;
                let copy = CompletedCopy {
                    from,
                    written,
                    migrated,
                };
                self.client
                    .put_mapping(&temporary, &copy.to_mapping(to))
                    .await
                    .map_err(|e| step_failed(index, from, to, "temporary index completion")(e.into()))?;
                copy
            }
        };

        let exists = self
            .client
            .index_exists(index)
            .await
            .map_err(|e| step_failed(index, from, to, "index lookup")(e.into()))?;
        if exists {
            self.client
                .delete_index(&original)
                .await
                .map_err(|e| step_failed(index, from, to, "original index removal")(e.into()))?;
        }
        // the stored version stays at `from` until the copy back is verified
        self.client
            .create_index(index, &schema.with_version(from).to_json(), &index_settings)
            .await
            .map_err(|e| step_failed(index, from, to, "index recreation")(e.into()))?;
        self.wait_for(&original)
            .await
            .map_err(step_failed(index, from, to, "recreated index health check"))?;

        let request = ReindexRequest::new(temporary.clone(), index, self.stream_batch_size(mapping));
        let result = Reindexer::new(self.client)
            .reindex(&request)
            .await
            .map_err(step_failed(index, from, to, "copy back"))?;
        let copied = result.created + result.updated;
        if copied != copy.written {
            return Err(MigrationError::DocumentCountMismatch {
                index: index.to_string(),
                temporary,
                version: to,
                migrated: copy.written,
                copied,
            }
            .into());
        }

        self.push_schema(index, schema, from, to).await?;
        self.client
            .delete_index(&staging)
            .await
            .map_err(|e| step_failed(index, from, to, "temporary index removal")(e.into()))?;

        info!(
            migrated = copy.migrated,
            written = copy.written,
            "Rebuilt index '{}' at version {}", index, to
        );
        Ok(copy.migrated)
    }

    /// Looks up the temporary index of a rebuild. A complete copy started
    /// from `from` is returned; anything else is deleted.
    async fn completed_copy(
        &self,
        index: &str,
        temporary: &str,
        from: u32,
        to: u32,
    ) -> IndexResult<Option<CompletedCopy>> {
        let lookup = |e: BackendError| step_failed(index, from, to, "temporary index lookup")(e.into());
        if !self.client.index_exists(temporary).await.map_err(lookup)? {
            return Ok(None);
        }
        let mapping = self.client.get_mapping(temporary).await.map_err(lookup)?;
        if let Some(copy) = CompletedCopy::from_mapping(&mapping)
            && copy.from == from
        {
            return Ok(Some(copy));
        }

        warn!(temporary = %temporary, "Deleting temporary index left by an interrupted migration");
        self.client
            .delete_index(&[temporary.to_string()])
            .await
            .map_err(|e| step_failed(index, from, to, "stale temporary index removal")(e.into()))?;
        Ok(None)
    }

    /// Streams `index` into `temporary`, migrating the documents of the
    /// revision's type. Returns the documents written and migrated.
    #[allow(clippy::too_many_arguments)]
    async fn copy_migrated(
        &self,
        index: &str,
        temporary: &str,
        group: &MappingGroup,
        mapping: &DocumentMapping,
        migrator: &Arc<dyn DocumentMigrator>,
        from: u32,
        to: u32,
    ) -> IndexResult<(u64, u64)> {
        let mut stream = self
            .client
            .stream_documents(index, self.stream_batch_size(mapping))
            .await
            .map_err(|e| step_failed(index, from, to, "document stream")(e.into()))?;
        let total = stream.total();
        let mut written: u64 = 0;
        let mut migrated: u64 = 0;

        loop {
            let batch = stream
                .next_batch()
                .await
                .map_err(|e| step_failed(index, from, to, "document stream")(e.into()))?;
            if batch.is_empty() {
                break;
            }

            let mut output = Vec::with_capacity(batch.len());
            for document in batch {
                if !belongs_to(group, mapping.type_name(), &document.source) {
                    output.push(document);
                    continue;
                }
                let Document { id, source } = document;
                let context = MigrationContext {
                    index,
                    type_name: mapping.type_name(),
                    id: &id,
                    from_version: from,
                    to_version: to,
                };
                let Some(mut source) = migrator.migrate(source, &context) else {
                    if let Err(e) = stream.finish().await {
                        debug!(error = %e, "Failed to release document stream");
                    }
                    return Err(MigrationError::MissingMigratorOutput {
                        index: index.to_string(),
                        type_name: mapping.type_name().to_string(),
                        version: to,
                        id,
                    }
                    .into());
                };
                if group.is_shared()
                    && let Value::Object(fields) = &mut source
                {
                    fields.insert(TYPE_FIELD.to_string(), Value::from(mapping.type_name()));
                }
                migrated += 1;
                output.push(Document::new(id, source));
            }

            self.client
                .bulk_index(temporary, &output)
                .await
                .map_err(|e| step_failed(index, from, to, "temporary index write")(e.into()))?;
            self.client
                .refresh(&[temporary.to_string()])
                .await
                .map_err(|e| step_failed(index, from, to, "temporary index refresh")(e.into()))?;
            written += output.len() as u64;
            info!("{}/{} documents migrated", written, total);
        }

        stream
            .finish()
            .await
            .map_err(|e| step_failed(index, from, to, "document stream")(e.into()))?;
        Ok((written, migrated))
    }

    fn stream_batch_size(&self, mapping: &DocumentMapping) -> u64 {
        if mapping.has_large_documents() {
            LARGE_DOCUMENT_BATCH_SIZE.min(self.settings.result_window())
        } else {
            self.settings.result_window()
        }
    }
}

fn belongs_to(group: &MappingGroup, type_name: &str, source: &Value) -> bool {
    !group.is_shared() || source.get(TYPE_FIELD).and_then(Value::as_str) == Some(type_name)
}

/// Wraps a failure with the revision and the step it interrupted.
fn step_failed(index: &str, from: u32, to: u32, step: &str) -> impl FnOnce(IndexError) -> IndexError {
    let index = index.to_string();
    let step = step.to_string();
    move |source| match source {
        IndexError::Migration(_) | IndexError::Configuration(_) => source,
        source => MigrationError::StepFailed {
            index,
            from,
            to,
            step,
            source: Box::new(source),
        }
        .into(),
    }
}
