//! Document mappings, schema revisions and the mapping collection.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ConfigurationError;

use super::field::FieldMapping;
use super::migrator::{DocumentMigrator, FnMigrator, MigrationContext};

/// How a schema revision is applied to an existing index.
#[derive(Clone)]
pub enum MigrationStrategy {
    /// Push the new mapping only.
    NoReindex,
    /// Push the new mapping, then rewrite every document of the type in place.
    ReindexInPlace,
    /// Rebuild the index through a temporary index, transforming each document.
    ReindexScript(Arc<dyn DocumentMigrator>),
}

impl MigrationStrategy {
    /// Returns the strategy name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            MigrationStrategy::NoReindex => "no_reindex",
            MigrationStrategy::ReindexInPlace => "reindex_inplace",
            MigrationStrategy::ReindexScript(_) => "reindex_script",
        }
    }

    /// Returns true if the strategy rebuilds the index.
    pub fn rebuilds(&self) -> bool {
        matches!(self, MigrationStrategy::ReindexScript(_))
    }
}

impl fmt::Debug for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One versioned step in the evolution of a mapping.
#[derive(Debug, Clone)]
pub struct SchemaRevision {
    version: u32,
    description: String,
    strategy: MigrationStrategy,
}

impl SchemaRevision {
    /// Creates a revision.
    pub fn new(version: u32, description: impl Into<String>, strategy: MigrationStrategy) -> Self {
        Self {
            version,
            description: description.into(),
            strategy,
        }
    }

    /// Mapping-only revision.
    pub fn no_reindex(version: u32, description: impl Into<String>) -> Self {
        Self::new(version, description, MigrationStrategy::NoReindex)
    }

    /// Revision that rewrites documents in place.
    pub fn reindex_in_place(version: u32, description: impl Into<String>) -> Self {
        Self::new(version, description, MigrationStrategy::ReindexInPlace)
    }

    /// Revision that rebuilds the index with the given migrator.
    pub fn reindex_script(
        version: u32,
        description: impl Into<String>,
        migrator: impl DocumentMigrator + 'static,
    ) -> Self {
        Self::new(
            version,
            description,
            MigrationStrategy::ReindexScript(Arc::new(migrator)),
        )
    }

    /// Revision that rebuilds the index, transforming documents with a closure.
    pub fn reindex_with<F>(version: u32, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, &MigrationContext<'_>) -> Option<Value> + Send + Sync + 'static,
    {
        Self::reindex_script(version, description, FnMigrator::new(f))
    }

    /// Returns the version this revision migrates to.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the strategy.
    pub fn strategy(&self) -> &MigrationStrategy {
        &self.strategy
    }
}

/// Logical schema of one document type.
#[derive(Debug, Clone)]
pub struct DocumentMapping {
    type_name: String,
    fields: Vec<FieldMapping>,
    parent: Option<String>,
    revisions: Vec<SchemaRevision>,
    schema_version: u32,
    hashed_fields: Vec<String>,
    scripts: BTreeMap<String, String>,
    large_documents: bool,
}

impl DocumentMapping {
    /// Name of the document identifier field, never mapped as a property.
    pub const ID_FIELD: &'static str = "_id";

    /// Name of the system property holding the hash of hashed fields.
    pub const HASH_FIELD: &'static str = "_hash";

    /// Creates a mapping at schema version 1.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
            parent: None,
            revisions: Vec::new(),
            schema_version: 1,
            hashed_fields: Vec::new(),
            scripts: BTreeMap::new(),
            large_documents: false,
        }
    }

    /// Adds a field.
    pub fn with_field(mut self, field: FieldMapping) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds several fields.
    pub fn with_fields<I>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = FieldMapping>,
    {
        self.fields.extend(fields);
        self
    }

    /// Stores documents of this type in the parent type's index.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Adds a revision, raising the schema version to its version if needed.
    pub fn with_revision(mut self, revision: SchemaRevision) -> Self {
        self.schema_version = self.schema_version.max(revision.version);
        self.revisions.push(revision);
        self
    }

    /// Sets the schema version explicitly.
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Includes a field in the document hash.
    pub fn with_hashed_field(mut self, field: impl Into<String>) -> Self {
        self.hashed_fields.push(field.into());
        self
    }

    /// Declares a named update script.
    pub fn with_script(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.scripts.insert(name.into(), source.into());
        self
    }

    /// Marks documents of this type as very large, which lowers migration batch sizes.
    pub fn with_large_documents(mut self) -> Self {
        self.large_documents = true;
        self
    }

    /// Returns the type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the declared fields in order.
    pub fn fields(&self) -> &[FieldMapping] {
        &self.fields
    }

    /// Returns the parent type name, if any.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Returns the revisions in declaration order.
    pub fn revisions(&self) -> &[SchemaRevision] {
        &self.revisions
    }

    /// Returns the current schema version.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Returns the hashed field names.
    pub fn hashed_fields(&self) -> &[String] {
        &self.hashed_fields
    }

    /// Returns the source of a named script.
    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }

    /// Returns true if documents of this type are very large.
    pub fn has_large_documents(&self) -> bool {
        self.large_documents
    }

    /// Returns the field with the given name.
    pub fn field(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checks field declarations and revision ordering.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |message: String| ConfigurationError::InvalidMapping {
            type_name: self.type_name.clone(),
            message,
        };

        if self.type_name.is_empty() {
            return Err(invalid("type name must not be empty".to_string()));
        }
        if self.type_name.chars().any(|c| c.is_ascii_uppercase() || c == '*' || c == ',') {
            return Err(invalid(
                "type names must be lowercase and must not contain '*' or ','".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(invalid(format!("duplicate field '{}'", field.name)));
            }
            field.validate().map_err(invalid)?;
        }

        let mut previous = 0;
        for revision in &self.revisions {
            if revision.version <= previous {
                return Err(invalid(format!(
                    "revision versions must be strictly increasing, found {} after {}",
                    revision.version, previous
                )));
            }
            previous = revision.version;
        }
        if previous > self.schema_version {
            return Err(invalid(format!(
                "revision {} is newer than schema version {}",
                previous, self.schema_version
            )));
        }

        Ok(())
    }
}

/// A root mapping and the child mappings stored in its index.
#[derive(Debug, Clone)]
pub struct MappingGroup {
    root: Arc<DocumentMapping>,
    children: Vec<Arc<DocumentMapping>>,
}

impl MappingGroup {
    /// Returns the mapping that owns the physical index.
    pub fn root(&self) -> &Arc<DocumentMapping> {
        &self.root
    }

    /// Returns the child mappings.
    pub fn children(&self) -> &[Arc<DocumentMapping>] {
        &self.children
    }

    /// Returns the root followed by its children.
    pub fn members(&self) -> impl Iterator<Item = &Arc<DocumentMapping>> {
        std::iter::once(&self.root).chain(self.children.iter())
    }

    /// Returns true if more than one type shares the index.
    pub fn is_shared(&self) -> bool {
        !self.children.is_empty()
    }

    /// Returns the schema version of the index, the highest member version.
    pub fn schema_version(&self) -> u32 {
        self.members()
            .map(|m| m.schema_version())
            .max()
            .unwrap_or(1)
    }

    /// Returns the revisions with `stored < version <= target`, ascending by
    /// version, the root's revision first when versions tie.
    pub fn pending_revisions(
        &self,
        stored: u32,
        target: u32,
    ) -> Vec<(Arc<DocumentMapping>, SchemaRevision)> {
        let mut pending: Vec<_> = self
            .members()
            .flat_map(|m| {
                m.revisions()
                    .iter()
                    .filter(|r| r.version() > stored && r.version() <= target)
                    .map(move |r| (Arc::clone(m), r.clone()))
            })
            .collect();
        // stable sort keeps member order for equal versions
        pending.sort_by_key(|(_, r)| r.version());
        pending
    }
}

/// The set of document mappings managed by one index admin.
#[derive(Debug, Clone, Default)]
pub struct Mappings {
    mappings: Vec<Arc<DocumentMapping>>,
}

impl Mappings {
    /// Validates and collects mappings.
    pub fn new<I>(mappings: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = DocumentMapping>,
    {
        let mappings: Vec<Arc<DocumentMapping>> = mappings.into_iter().map(Arc::new).collect();

        let mut types = HashSet::new();
        for mapping in &mappings {
            mapping.validate()?;
            if !types.insert(mapping.type_name()) {
                return Err(ConfigurationError::InvalidMapping {
                    type_name: mapping.type_name().to_string(),
                    message: "type is declared more than once".to_string(),
                });
            }
        }

        for mapping in &mappings {
            let Some(parent) = mapping.parent() else {
                continue;
            };
            let parent_mapping = mappings.iter().find(|m| m.type_name() == parent);
            let message = match parent_mapping {
                None => Some(format!("parent type '{}' is not declared", parent)),
                Some(p) if p.type_name() == mapping.type_name() => {
                    Some("a type cannot be its own parent".to_string())
                }
                Some(p) if p.parent().is_some() => {
                    Some(format!("parent type '{}' is itself a child type", parent))
                }
                Some(_) => None,
            };
            if let Some(message) = message {
                return Err(ConfigurationError::InvalidMapping {
                    type_name: mapping.type_name().to_string(),
                    message,
                });
            }
        }

        Ok(Self { mappings })
    }

    /// Returns the mapping of a type.
    pub fn get_mapping(&self, type_name: &str) -> Option<&Arc<DocumentMapping>> {
        self.mappings.iter().find(|m| m.type_name() == type_name)
    }

    /// Returns the mapping of a type or an unknown type error.
    pub fn require(&self, type_name: &str) -> Result<&Arc<DocumentMapping>, ConfigurationError> {
        self.get_mapping(type_name)
            .ok_or_else(|| ConfigurationError::UnknownType {
                type_name: type_name.to_string(),
            })
    }

    /// Iterates over all mappings in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DocumentMapping>> {
        self.mappings.iter()
    }

    /// Returns the number of mappings.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Returns true if there are no mappings.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Returns the type name of the mapping that owns the index of `type_name`.
    pub fn root_type<'a>(&'a self, type_name: &'a str) -> &'a str {
        self.get_mapping(type_name)
            .and_then(|m| m.parent())
            .unwrap_or(type_name)
    }

    /// Groups mappings by the physical index they share, in declaration order.
    pub fn groups(&self) -> Vec<MappingGroup> {
        self.mappings
            .iter()
            .filter(|m| m.parent().is_none())
            .map(|root| MappingGroup {
                root: Arc::clone(root),
                children: self
                    .mappings
                    .iter()
                    .filter(|m| m.parent() == Some(root.type_name()))
                    .cloned()
                    .collect(),
            })
            .collect()
    }

    /// Returns the group of the index that stores `type_name`.
    pub fn group_of(&self, type_name: &str) -> Option<MappingGroup> {
        let root = self.root_type(type_name);
        self.groups()
            .into_iter()
            .find(|g| g.root().type_name() == root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::field::FieldType;

    fn concept() -> DocumentMapping {
        DocumentMapping::new("concept")
            .with_field(FieldMapping::string("id"))
            .with_field(FieldMapping::new("active", FieldType::Boolean))
    }

    #[test]
    fn test_revision_raises_schema_version() {
        let mapping = concept()
            .with_revision(SchemaRevision::no_reindex(2, "add module"))
            .with_revision(SchemaRevision::reindex_in_place(3, "reanalyze term"));
        assert_eq!(mapping.schema_version(), 3);
        assert!(mapping.validate().is_ok());
    }

    #[test]
    fn test_revisions_must_increase() {
        let mapping = concept()
            .with_revision(SchemaRevision::no_reindex(3, "b"))
            .with_revision(SchemaRevision::no_reindex(2, "a"));
        let err = mapping.validate().unwrap_err();
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn test_revision_newer_than_schema_version() {
        let mapping = concept()
            .with_revision(SchemaRevision::no_reindex(4, "a"))
            .with_schema_version(2);
        assert!(mapping.validate().is_err());
    }

    #[test]
    fn test_uppercase_type_rejected() {
        assert!(DocumentMapping::new("Concept").validate().is_err());
    }

    #[test]
    fn test_mappings_reject_duplicates_and_missing_parents() {
        assert!(Mappings::new(vec![concept(), concept()]).is_err());

        let orphan = DocumentMapping::new("description").with_parent("missing");
        assert!(Mappings::new(vec![concept(), orphan]).is_err());

        let grandchild = DocumentMapping::new("member").with_parent("description");
        let child = DocumentMapping::new("description").with_parent("concept");
        assert!(Mappings::new(vec![concept(), child, grandchild]).is_err());
    }

    #[test]
    fn test_groups_share_parent_index() {
        let mappings = Mappings::new(vec![
            concept(),
            DocumentMapping::new("description").with_parent("concept"),
            DocumentMapping::new("relationship"),
        ])
        .unwrap();

        let groups = mappings.groups();
        assert_eq!(groups.len(), 2);
        assert!(groups[0].is_shared());
        assert_eq!(groups[0].children()[0].type_name(), "description");
        assert!(!groups[1].is_shared());
        assert_eq!(mappings.root_type("description"), "concept");
        assert_eq!(mappings.root_type("relationship"), "relationship");
    }

    #[test]
    fn test_pending_revisions_are_ordered() {
        let mappings = Mappings::new(vec![
            concept()
                .with_revision(SchemaRevision::no_reindex(1, "initial"))
                .with_revision(SchemaRevision::no_reindex(3, "c")),
            DocumentMapping::new("description")
                .with_parent("concept")
                .with_revision(SchemaRevision::reindex_in_place(2, "d"))
                .with_revision(SchemaRevision::no_reindex(3, "e")),
        ])
        .unwrap();

        let group = &mappings.groups()[0];
        assert_eq!(group.schema_version(), 3);

        let pending = group.pending_revisions(1, 3);
        let order: Vec<_> = pending
            .iter()
            .map(|(m, r)| (m.type_name().to_string(), r.version()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("description".to_string(), 2),
                ("concept".to_string(), 3),
                ("description".to_string(), 3),
            ]
        );
    }
}
