//! The index lifecycle façade.
//!
//! [`IndexAdmin`] is the API services use at boot and at runtime: creating
//! and migrating indices, changing settings, swapping mappings and running
//! bulk mutations. [`ClusterIndexAdmin`] implements it on top of any
//! [`IndexClusterClient`].
//!
//! # Creating indices
//!
//! [`IndexAdmin::create`] works in two phases. The planning phase only reads
//! from the cluster: for each physical index it computes the declared schema,
//! fetches the stored mapping when the index exists and checks the schema
//! version rules. Any violation aborts before the cluster is modified. The
//! apply phase then creates missing indices and replays pending revisions,
//! waits for health, refreshes types rewritten in place and registers the
//! indices.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use helios_index::admin::{ClusterIndexAdmin, IndexAdmin};
//! use helios_index::client::memory::InMemoryCluster;
//! use helios_index::mapping::{DocumentMapping, FieldMapping, Mappings};
//! use helios_index::settings::Settings;
//!
//! # async fn example() -> helios_index::IndexResult<()> {
//! let mappings = Mappings::new([
//!     DocumentMapping::new("concept").with_field(FieldMapping::string("id")),
//! ])?;
//! let admin = ClusterIndexAdmin::new(
//!     Arc::new(InMemoryCluster::new()),
//!     "snomed",
//!     mappings,
//!     Settings::default(),
//! );
//! admin.create().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::bulk::{BulkCommand, BulkDelete, BulkMutator, BulkUpdate, RetryPolicy, Update, type_filter};
use crate::client::{ByQueryRequest, IndexClusterClient, Query, Script, UpdateRequest};
use crate::diff::{self, SchemaDiff};
use crate::error::{BackendError, ConfigurationError, IndexResult};
use crate::health::wait_for_health;
use crate::mapping::{IndexSchema, MappingGroup, Mappings, TYPE_FIELD, group_schema};
use crate::migration::{MigrationExecutor, interrupted_rebuild};
use crate::registry::{IndexMapping, IndexNaming};
use crate::reindex::{ReindexRequest, ReindexResult, Reindexer, RemoteSource};
use crate::settings::{SettingKind, Settings, classify};

/// Lifecycle operations over the indices of one set of document mappings.
#[async_trait]
pub trait IndexAdmin: Send + Sync {
    /// Returns true if the index of every root type exists.
    async fn exists(&self) -> IndexResult<bool>;

    /// Creates missing indices and migrates existing ones to the declared
    /// schema versions.
    async fn create(&self) -> IndexResult<()>;

    /// Deletes every index of this admin.
    async fn delete(&self) -> IndexResult<()>;

    /// Deletes all documents of the given types, keeping their indices.
    async fn clear(&self, types: &[String]) -> IndexResult<()>;

    /// Returns the settings snapshot.
    fn settings(&self) -> Settings;

    /// Validates and applies settings. Dynamic keys are pushed to every
    /// existing index; all keys are recorded in the snapshot.
    ///
    /// If the first index fails nothing is recorded. If a later index fails
    /// the snapshot is still recorded and the error lists the indices that
    /// were updated; repeating the call completes the update.
    async fn update_settings(&self, settings: Map<String, Value>) -> IndexResult<()>;

    /// Replaces the document mappings and returns the names of indices no
    /// longer backed by any mapping. The caller decides whether to delete them.
    async fn update_mappings(&self, mappings: Mappings) -> IndexResult<Vec<String>>;

    /// Returns the current document mappings.
    fn mappings(&self) -> Mappings;

    /// Returns the admin name.
    fn name(&self) -> &str;

    /// Refreshes the indices of the given types.
    async fn refresh(&self, types: &BTreeSet<String>) -> IndexResult<()>;

    /// Copies one index into another with the cluster reindex.
    async fn reindex(
        &self,
        source: &str,
        destination: &str,
        remote: Option<RemoteSource>,
        refresh: bool,
    ) -> IndexResult<ReindexResult>;

    /// Runs a named script over matching documents. Types with changed
    /// documents are added to `to_refresh`.
    async fn bulk_update(
        &self,
        update: &BulkUpdate,
        to_refresh: &mut BTreeSet<String>,
    ) -> IndexResult<bool>;

    /// Deletes matching documents. Types with deleted documents are added to
    /// `to_refresh`.
    async fn bulk_delete(
        &self,
        delete: &BulkDelete,
        to_refresh: &mut BTreeSet<String>,
    ) -> IndexResult<bool>;

    /// Runs a named script on one document and refreshes its index.
    async fn update_immediately(&self, update: &Update) -> IndexResult<Value>;

    /// Merges index segments. Currently does nothing.
    async fn optimize(&self, max_segments: u32) -> IndexResult<()>;

    /// Releases the cluster client.
    async fn close(&self) -> IndexResult<()>;
}

enum PlannedAction {
    Create,
    UpToDate,
    Migrate { stored_version: u32, breaking: bool },
}

struct IndexPlan {
    index: String,
    group: MappingGroup,
    schema: IndexSchema,
    action: PlannedAction,
}

/// [`IndexAdmin`] backed by an index cluster client.
pub struct ClusterIndexAdmin {
    client: Arc<dyn IndexClusterClient>,
    naming: IndexNaming,
    mappings: RwLock<Mappings>,
    registry: RwLock<IndexMapping>,
    settings: RwLock<Settings>,
    retry_policy: RetryPolicy,
}

impl ClusterIndexAdmin {
    /// Creates an admin. Index names are derived from `name` and the
    /// `indexPrefix` setting.
    pub fn new(
        client: Arc<dyn IndexClusterClient>,
        name: &str,
        mappings: Mappings,
        settings: Settings,
    ) -> Self {
        let naming = IndexNaming::new(name, settings.index_prefix());
        Self {
            client,
            naming,
            mappings: RwLock::new(mappings),
            registry: RwLock::new(IndexMapping::new()),
            settings: RwLock::new(settings),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Overrides the version conflict retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Returns the physical index name of a type, derived from its root type.
    pub fn index_name(&self, type_name: &str) -> String {
        let mappings = self.mappings.read();
        self.naming.index_name(mappings.root_type(type_name))
    }

    /// Returns the registered index of a type, if `create` has run.
    pub fn get_type_index(&self, type_name: &str) -> Option<String> {
        let root = self.mappings.read().root_type(type_name).to_string();
        self.registry
            .read()
            .get_type_index(&root)
            .map(str::to_string)
    }

    /// Returns a copy of the type-to-index registry.
    pub fn index_mapping(&self) -> IndexMapping {
        self.registry.read().clone()
    }

    fn group_of(&self, type_name: &str) -> IndexResult<(MappingGroup, String)> {
        let mappings = self.mappings.read();
        mappings.require(type_name)?;
        let group = mappings
            .group_of(type_name)
            .ok_or_else(|| ConfigurationError::UnknownType {
                type_name: type_name.to_string(),
            })?;
        let index = self.naming.index_name(group.root().type_name());
        Ok((group, index))
    }

    fn script(&self, type_name: &str, name: &str, params: &Map<String, Value>) -> IndexResult<Script> {
        let mappings = self.mappings.read();
        let source = mappings
            .require(type_name)?
            .script(name)
            .ok_or_else(|| ConfigurationError::UnknownScript {
                type_name: type_name.to_string(),
                script: name.to_string(),
            })?;
        Ok(Script::with_params(source, params.clone()))
    }

    async fn wait_for(&self, indices: &[String]) -> IndexResult<()> {
        let (timeout, socket_timeout) = {
            let settings = self.settings.read();
            (settings.cluster_health_timeout(), settings.socket_timeout())
        };
        wait_for_health(self.client.as_ref(), indices, timeout, socket_timeout / 2).await
    }

    /// Reads the cluster state of every index and checks the version rules.
    async fn plan(&self, mappings: &Mappings) -> IndexResult<Vec<IndexPlan>> {
        let mut plans = Vec::new();
        for group in mappings.groups() {
            let index = self.naming.index_name(group.root().type_name());
            let schema = group_schema(&group)?;

            let action = if self.client.index_exists(&index).await? {
                let stored = self.client.get_mapping(&index).await?;
                let stored_version = IndexSchema::stored_version(&stored);
                let changes = diff::compare(&stored, &schema.to_json());
                check_evolution(&index, &group, &schema, stored_version, &changes)?
            } else if let Some(stored_version) =
                interrupted_rebuild(self.client.as_ref(), &index, &group, schema.version()).await?
            {
                warn!(
                    index = %index,
                    version = stored_version,
                    "Index '{}' is missing but an interrupted migration left a complete copy", index
                );
                PlannedAction::Migrate {
                    stored_version,
                    breaking: true,
                }
            } else {
                PlannedAction::Create
            };

            plans.push(IndexPlan {
                index,
                group,
                schema,
                action,
            });
        }
        Ok(plans)
    }

    async fn mutate(
        &self,
        type_name: &str,
        command: BulkCommand,
        filter: &Query,
        script: Option<Script>,
        to_refresh: &mut BTreeSet<String>,
    ) -> IndexResult<bool> {
        let (group, index) = self.group_of(type_name)?;
        let (batch_size, slices) = {
            let settings = self.settings.read();
            (settings.result_window(), settings.commit_concurrency_level())
        };
        let request = ByQueryRequest {
            index,
            query: type_filter(&group, type_name).and(filter.clone()),
            script,
            batch_size,
            slices,
        };
        let changed = BulkMutator::new(self.client.as_ref(), &self.retry_policy)
            .execute(type_name, command, &request)
            .await?;
        if changed {
            to_refresh.insert(type_name.to_string());
        }
        Ok(changed)
    }
}

/// Decides what to do with an existing index.
fn check_evolution(
    index: &str,
    group: &MappingGroup,
    schema: &IndexSchema,
    stored_version: u32,
    changes: &SchemaDiff,
) -> Result<PlannedAction, ConfigurationError> {
    let declared = schema.version();
    if stored_version > declared {
        return Err(ConfigurationError::SchemaVersionRegressed {
            index: index.to_string(),
            stored: stored_version,
            declared,
        });
    }
    if stored_version == declared {
        if !changes.is_empty() {
            return Err(ConfigurationError::UnversionedMappingChange {
                index: index.to_string(),
                version: declared,
                changes: changes.relevant_paths(),
            });
        }
        return Ok(PlannedAction::UpToDate);
    }

    let breaking = changes.is_breaking();
    if breaking {
        let rebuilds = group
            .pending_revisions(stored_version, declared)
            .iter()
            .any(|(_, revision)| revision.strategy().rebuilds());
        if !rebuilds {
            return Err(ConfigurationError::BreakingChangeWithoutRebuild {
                index: index.to_string(),
                from: stored_version,
                to: declared,
                fields: changes.incompatible().map(|c| c.path.clone()).collect(),
            });
        }
    }
    Ok(PlannedAction::Migrate {
        stored_version,
        breaking,
    })
}

#[async_trait]
impl IndexAdmin for ClusterIndexAdmin {
    async fn exists(&self) -> IndexResult<bool> {
        let mappings = self.mappings.read().clone();
        for group in mappings.groups() {
            let index = self.naming.index_name(group.root().type_name());
            if !self.client.index_exists(&index).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    #[instrument(skip(self), fields(name = %self.naming.name()))]
    async fn create(&self) -> IndexResult<()> {
        let mappings = self.mappings.read().clone();
        let settings = self.settings.read().clone();
        let plans = self.plan(&mappings).await?;

        let executor = MigrationExecutor::new(self.client.as_ref(), &settings, &self.retry_policy);
        let mut to_refresh = BTreeSet::new();
        for plan in &plans {
            match plan.action {
                PlannedAction::Create => {
                    let root = plan.group.root().type_name();
                    self.client
                        .create_index(
                            &plan.index,
                            &plan.schema.to_json(),
                            &settings.index_creation_settings(root),
                        )
                        .await?;
                    info!(
                        index = %plan.index,
                        version = plan.schema.version(),
                        "Created index '{}'", plan.index
                    );
                }
                PlannedAction::UpToDate => {
                    debug!(
                        index = %plan.index,
                        version = plan.schema.version(),
                        "Index '{}' is up to date", plan.index
                    );
                }
                PlannedAction::Migrate {
                    stored_version,
                    breaking,
                } => {
                    let outcome = executor
                        .migrate(&plan.index, &plan.group, &plan.schema, stored_version, breaking)
                        .await?;
                    to_refresh.extend(outcome.refresh_types);
                }
            }
        }

        let indices: Vec<String> = plans.iter().map(|p| p.index.clone()).collect();
        self.wait_for(&indices).await?;
        if !to_refresh.is_empty() {
            self.refresh(&to_refresh).await?;
        }

        let mut registry = self.registry.write();
        for plan in &plans {
            registry
                .register(plan.group.root().type_name(), &plan.index)
                .map_err(ConfigurationError::from)?;
        }
        Ok(())
    }

    async fn delete(&self) -> IndexResult<()> {
        let pattern = self.naming.pattern();
        self.client.delete_index(std::slice::from_ref(&pattern)).await?;
        self.registry.write().clear();
        info!(pattern = %pattern, "Deleted indices of '{}'", self.naming.name());
        Ok(())
    }

    async fn clear(&self, types: &[String]) -> IndexResult<()> {
        let mut to_refresh = BTreeSet::new();
        for type_name in types {
            self.mutate(
                type_name,
                BulkCommand::Delete,
                &Query::MatchAll,
                None,
                &mut to_refresh,
            )
            .await?;
        }
        if !to_refresh.is_empty() {
            self.refresh(&to_refresh).await?;
        }
        Ok(())
    }

    fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    async fn update_settings(&self, updates: Map<String, Value>) -> IndexResult<()> {
        let mappings = self.mappings.read().clone();
        let mut snapshot = self.settings.read().clone();
        for (key, value) in &updates {
            match classify(key, &mappings) {
                None => {
                    return Err(ConfigurationError::UnsupportedSetting { key: key.clone() }.into());
                }
                Some(SettingKind::Static) => {
                    return Err(ConfigurationError::StaticSetting { key: key.clone() }.into());
                }
                Some(_) => snapshot.insert(key.clone(), value.clone())?,
            }
        }

        if let Some(dynamic) = Settings::dynamic_settings(&updates) {
            let mut applied: Vec<String> = Vec::new();
            for group in mappings.groups() {
                let index = self.naming.index_name(group.root().type_name());
                let result = match self.client.index_exists(&index).await {
                    Ok(true) => self.client.update_settings(&index, &dynamic).await,
                    Ok(false) => continue,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {
                        info!(index = %index, settings = %dynamic, "Applied dynamic settings");
                        applied.push(index);
                    }
                    Err(e) if applied.is_empty() => return Err(e.into()),
                    Err(e) => {
                        // the snapshot follows the indices that already carry the update
                        warn!(
                            index = %index,
                            applied = %applied.join(", "),
                            error = %e,
                            "Dynamic settings were only partially applied"
                        );
                        *self.settings.write() = snapshot;
                        return Err(BackendError::SettingsPartiallyApplied {
                            index,
                            applied,
                            source: Box::new(e),
                        }
                        .into());
                    }
                }
            }
        }

        *self.settings.write() = snapshot;
        Ok(())
    }

    async fn update_mappings(&self, mappings: Mappings) -> IndexResult<Vec<String>> {
        let declared: BTreeSet<String> = mappings
            .groups()
            .iter()
            .map(|g| self.naming.index_name(g.root().type_name()))
            .collect();

        let mut orphaned = Vec::new();
        {
            let mut current = self.mappings.write();
            let mut registry = self.registry.write();

            let mut known: BTreeSet<String> = current
                .groups()
                .iter()
                .map(|g| self.naming.index_name(g.root().type_name()))
                .collect();
            known.extend(registry.indices().map(str::to_string));

            for index in known.difference(&declared) {
                if let Some(type_name) = registry.get_index_type(index).map(str::to_string) {
                    registry.unregister(&type_name);
                }
                orphaned.push(index.clone());
            }
            *current = mappings;
        }

        if !orphaned.is_empty() {
            warn!(indices = %orphaned.join(", "), "Indices are no longer backed by a mapping");
        }
        Ok(orphaned)
    }

    fn mappings(&self) -> Mappings {
        self.mappings.read().clone()
    }

    fn name(&self) -> &str {
        self.naming.name()
    }

    async fn refresh(&self, types: &BTreeSet<String>) -> IndexResult<()> {
        let mut indices = BTreeSet::new();
        for type_name in types {
            let (_, index) = self.group_of(type_name)?;
            indices.insert(index);
        }
        if indices.is_empty() {
            return Ok(());
        }
        let indices: Vec<String> = indices.into_iter().collect();
        self.client.refresh(&indices).await?;
        debug!(indices = %indices.join(", "), "Refreshed indices");
        Ok(())
    }

    async fn reindex(
        &self,
        source: &str,
        destination: &str,
        remote: Option<RemoteSource>,
        refresh: bool,
    ) -> IndexResult<ReindexResult> {
        let batch_size = self.settings.read().result_window();
        let mut request = ReindexRequest::new(source, destination, batch_size).with_refresh(refresh);
        if let Some(remote) = remote {
            request = request.with_remote(remote);
        }
        Reindexer::new(self.client.as_ref()).reindex(&request).await
    }

    async fn bulk_update(
        &self,
        update: &BulkUpdate,
        to_refresh: &mut BTreeSet<String>,
    ) -> IndexResult<bool> {
        let script = self.script(&update.type_name, &update.script, &update.params)?;
        self.mutate(
            &update.type_name,
            BulkCommand::Update,
            &update.filter,
            Some(script),
            to_refresh,
        )
        .await
    }

    async fn bulk_delete(
        &self,
        delete: &BulkDelete,
        to_refresh: &mut BTreeSet<String>,
    ) -> IndexResult<bool> {
        self.mutate(
            &delete.type_name,
            BulkCommand::Delete,
            &delete.filter,
            None,
            to_refresh,
        )
        .await
    }

    async fn update_immediately(&self, update: &Update) -> IndexResult<Value> {
        let script = self.script(&update.type_name, &update.script, &update.params)?;
        let (group, index) = self.group_of(&update.type_name)?;
        let upsert = update.upsert.clone().map(|mut upsert| {
            if group.is_shared()
                && let Value::Object(fields) = &mut upsert
            {
                fields.insert(TYPE_FIELD.to_string(), Value::from(update.type_name.as_str()));
            }
            upsert
        });
        let request = UpdateRequest {
            index,
            id: update.id.clone(),
            script,
            upsert,
            refresh: true,
        };
        Ok(self.client.update(&request).await?)
    }

    async fn optimize(&self, max_segments: u32) -> IndexResult<()> {
        debug!(max_segments, "Index optimization is not supported, skipping");
        Ok(())
    }

    async fn close(&self) -> IndexResult<()> {
        match self.client.close().await {
            Ok(()) => Ok(()),
            Err(BackendError::ConnectionClosed) => {
                debug!("Cluster client was already closed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryCluster;
    use crate::mapping::{DocumentMapping, FieldMapping, FieldType, SchemaRevision};
    use serde_json::json;

    fn admin(cluster: Arc<InMemoryCluster>, mappings: Vec<DocumentMapping>) -> ClusterIndexAdmin {
        ClusterIndexAdmin::new(
            cluster,
            "Test",
            Mappings::new(mappings).unwrap(),
            Settings::default(),
        )
    }

    #[test]
    fn test_check_evolution_rules() {
        let mappings = Mappings::new([DocumentMapping::new("a")
            .with_field(FieldMapping::string("id"))
            .with_revision(SchemaRevision::no_reindex(2, "add id"))])
        .unwrap();
        let group = mappings.groups().remove(0);
        let schema = group_schema(&group).unwrap();
        let none = SchemaDiff::default();

        assert!(matches!(
            check_evolution("i", &group, &schema, 3, &none),
            Err(ConfigurationError::SchemaVersionRegressed { stored: 3, declared: 2, .. })
        ));
        assert!(matches!(
            check_evolution("i", &group, &schema, 2, &none),
            Ok(PlannedAction::UpToDate)
        ));
        assert!(matches!(
            check_evolution("i", &group, &schema, 1, &none),
            Ok(PlannedAction::Migrate { stored_version: 1, breaking: false })
        ));

        let breaking = diff::compare(
            &json!({ "properties": { "id": { "type": "long" } } }),
            &schema.to_json(),
        );
        assert!(matches!(
            check_evolution("i", &group, &schema, 1, &breaking),
            Err(ConfigurationError::BreakingChangeWithoutRebuild { .. })
        ));
    }

    #[tokio::test]
    async fn test_index_names_follow_root_type() {
        let cluster = Arc::new(InMemoryCluster::new());
        let admin = admin(
            cluster,
            vec![
                DocumentMapping::new("concept"),
                DocumentMapping::new("description").with_parent("concept"),
            ],
        );
        assert_eq!(admin.name(), "test");
        assert_eq!(admin.index_name("description"), "test-concept");
    }

    #[tokio::test]
    async fn test_unknown_script_is_rejected() {
        let cluster = Arc::new(InMemoryCluster::new());
        let admin = admin(
            cluster.clone(),
            vec![DocumentMapping::new("concept").with_field(FieldMapping::new("active", FieldType::Boolean))],
        );
        admin.create().await.unwrap();
        cluster.clear_calls();

        let err = admin
            .bulk_update(
                &BulkUpdate::new("concept", Query::MatchAll, "missing"),
                &mut BTreeSet::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_optimize_is_noop() {
        let cluster = Arc::new(InMemoryCluster::new());
        let admin = admin(cluster.clone(), vec![DocumentMapping::new("concept")]);
        admin.optimize(1).await.unwrap();
        assert!(cluster.calls().is_empty());
    }
}
