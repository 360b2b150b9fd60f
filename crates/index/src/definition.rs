//! Declarative mapping definitions.
//!
//! Mappings can be declared in JSON instead of code. Each definition converts
//! into a [`DocumentMapping`]; script revisions in a definition carry an
//! RFC 6902 patch applied to every document of the type.
//!
//! ```json
//! {
//!   "type": "concept",
//!   "fields": [
//!     { "name": "id", "type": "string" },
//!     { "name": "term", "type": "string",
//!       "analysis": { "type": "text", "analyzer": "tokenized" },
//!       "aliases": [ { "name": "exact", "type": "keyword", "normalizer": "case_insensitive" } ] }
//!   ],
//!   "revisions": [
//!     { "version": 2, "description": "rename a to b", "strategy": "reindex_script",
//!       "patch": [ { "op": "move", "from": "/a", "path": "/b" } ] }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigurationError;
use crate::mapping::{
    DocumentMapping, FieldAlias, FieldMapping, FieldType, JsonPatchMigrator, KeywordAnalysis,
    Mappings, SchemaRevision, TextAnalysis,
};

/// Serialized form of a [`DocumentMapping`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingDefinition {
    /// Type name.
    #[serde(rename = "type")]
    pub type_name: String,

    /// Parent type whose index stores this type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Explicit schema version; defaults to the newest revision or 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,

    /// Field declarations.
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,

    /// Schema revisions in ascending version order.
    #[serde(default)]
    pub revisions: Vec<RevisionDefinition>,

    /// Fields included in the document hash.
    #[serde(default)]
    pub hashed_fields: Vec<String>,

    /// Named update scripts.
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,

    /// Whether documents of this type are very large.
    #[serde(default)]
    pub large_documents: bool,
}

/// Serialized form of a [`FieldMapping`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Property name.
    pub name: String,

    /// Declared value type.
    #[serde(rename = "type")]
    pub kind: FieldKind,

    /// Whether the field is searchable.
    #[serde(default = "default_true")]
    pub index: bool,

    /// Whether the field is stored separately from the source.
    #[serde(default)]
    pub store: bool,

    /// Transient fields are never written to the index.
    #[serde(default)]
    pub transient: bool,

    /// Primary analysis of string fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisDefinition>,

    /// Alias sub-fields of string fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<AliasDefinition>,

    /// Fields of an embedded object or nested document.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldDefinition>,
}

fn default_true() -> bool {
    true
}

/// Field kinds accepted in definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum FieldKind {
    String,
    Enum,
    Decimal,
    Double,
    Float,
    Integer,
    Short,
    Long,
    Date,
    Boolean,
    Ip,
    StringValued,
    Map,
    Object,
    Nested,
    Opaque,
}

/// Keyword or text analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisDefinition {
    /// Exact keyword.
    Keyword {
        /// Normalizer name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        normalizer: Option<String>,
        /// Whether the keyword is searchable.
        #[serde(default = "default_true")]
        index: bool,
        /// Explicit doc-values flag.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        doc_values: Option<bool>,
    },
    /// Analyzed text.
    Text {
        /// Index-time analyzer.
        analyzer: String,
        /// Search-time analyzer.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        search_analyzer: Option<String>,
    },
}

impl AnalysisDefinition {
    fn keyword(&self) -> Option<KeywordAnalysis> {
        match self {
            AnalysisDefinition::Keyword {
                normalizer,
                index,
                doc_values,
            } => Some(KeywordAnalysis {
                normalizer: normalizer.clone(),
                index: *index,
                doc_values: *doc_values,
            }),
            AnalysisDefinition::Text { .. } => None,
        }
    }

    fn text(&self) -> Option<TextAnalysis> {
        match self {
            AnalysisDefinition::Text {
                analyzer,
                search_analyzer,
            } => Some(TextAnalysis {
                analyzer: analyzer.clone(),
                search_analyzer: search_analyzer.clone(),
            }),
            AnalysisDefinition::Keyword { .. } => None,
        }
    }
}

/// A named alias sub-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasDefinition {
    /// Sub-field name.
    pub name: String,
    /// Analysis of the sub-field.
    #[serde(flatten)]
    pub analysis: AnalysisDefinition,
}

/// Serialized form of a [`SchemaRevision`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionDefinition {
    /// Version the revision migrates to.
    pub version: u32,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Migration strategy.
    #[serde(flatten)]
    pub strategy: StrategyDefinition,
}

/// Serialized form of a [`MigrationStrategy`](crate::mapping::MigrationStrategy).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyDefinition {
    /// Mapping update only.
    NoReindex,
    /// Mapping update plus in-place rewrite.
    ReindexInPlace,
    /// Rebuild through a temporary index, applying a JSON patch to each document.
    ReindexScript {
        /// RFC 6902 patch.
        patch: Value,
    },
}

impl MappingDefinition {
    /// Converts the definition into a document mapping.
    pub fn into_mapping(self) -> Result<DocumentMapping, ConfigurationError> {
        let type_name = self.type_name;
        let mut mapping = DocumentMapping::new(type_name.clone())
            .with_fields(self.fields.into_iter().map(FieldDefinition::into_field));

        if let Some(parent) = self.parent {
            mapping = mapping.with_parent(parent);
        }
        for revision in self.revisions {
            let strategy_revision = match revision.strategy {
                StrategyDefinition::NoReindex => {
                    SchemaRevision::no_reindex(revision.version, revision.description)
                }
                StrategyDefinition::ReindexInPlace => {
                    SchemaRevision::reindex_in_place(revision.version, revision.description)
                }
                StrategyDefinition::ReindexScript { patch } => {
                    let migrator = JsonPatchMigrator::from_json(patch).map_err(|e| {
                        ConfigurationError::InvalidMapping {
                            type_name: type_name.clone(),
                            message: format!(
                                "revision {} has an invalid patch: {}",
                                revision.version, e
                            ),
                        }
                    })?;
                    SchemaRevision::reindex_script(
                        revision.version,
                        revision.description,
                        migrator,
                    )
                }
            };
            mapping = mapping.with_revision(strategy_revision);
        }
        if let Some(version) = self.schema_version {
            mapping = mapping.with_schema_version(version);
        }
        for field in self.hashed_fields {
            mapping = mapping.with_hashed_field(field);
        }
        for (name, source) in self.scripts {
            mapping = mapping.with_script(name, source);
        }
        if self.large_documents {
            mapping = mapping.with_large_documents();
        }
        Ok(mapping)
    }
}

impl FieldDefinition {
    fn into_field(self) -> FieldMapping {
        let embedded = || {
            Arc::new(
                DocumentMapping::new(self.name.clone())
                    .with_fields(self.fields.iter().cloned().map(FieldDefinition::into_field)),
            )
        };
        let field_type = match self.kind {
            FieldKind::String => FieldType::String,
            FieldKind::Enum => FieldType::Enum,
            FieldKind::Decimal => FieldType::Decimal,
            FieldKind::Double => FieldType::Double,
            FieldKind::Float => FieldType::Float,
            FieldKind::Integer => FieldType::Integer,
            FieldKind::Short => FieldType::Short,
            FieldKind::Long => FieldType::Long,
            FieldKind::Date => FieldType::Date,
            FieldKind::Boolean => FieldType::Boolean,
            FieldKind::Ip => FieldType::Ip,
            FieldKind::StringValued => FieldType::StringValued,
            FieldKind::Map => FieldType::Map,
            FieldKind::Object => FieldType::Object(embedded()),
            FieldKind::Nested => FieldType::Nested(embedded()),
            FieldKind::Opaque => FieldType::Opaque,
        };

        let mut field = FieldMapping::new(self.name.clone(), field_type);
        field.indexed = self.index;
        field.stored = self.store;
        field.transient = self.transient;

        if let Some(analysis) = &self.analysis {
            field = match (analysis.keyword(), analysis.text()) {
                (Some(keyword), _) => field.with_keyword(keyword),
                (_, Some(text)) => field.with_text(text),
                (None, None) => field,
            };
        }
        for alias in &self.aliases {
            let alias = match (alias.analysis.keyword(), alias.analysis.text()) {
                (Some(analysis), _) => FieldAlias::Keyword {
                    name: alias.name.clone(),
                    analysis,
                },
                (_, Some(analysis)) => FieldAlias::Text {
                    name: alias.name.clone(),
                    analysis,
                },
                (None, None) => continue,
            };
            field = field.with_alias(alias);
        }
        field
    }
}

/// Converts and validates a list of definitions.
pub fn load_mappings(definitions: Vec<MappingDefinition>) -> Result<Mappings, ConfigurationError> {
    let mappings = definitions
        .into_iter()
        .map(MappingDefinition::into_mapping)
        .collect::<Result<Vec<_>, _>>()?;
    Mappings::new(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{MigrationStrategy, StringAnalysis, to_properties};
    use serde_json::json;

    fn definitions() -> Vec<MappingDefinition> {
        serde_json::from_value(json!([
            {
                "type": "concept",
                "fields": [
                    { "name": "id", "type": "string" },
                    { "name": "active", "type": "boolean" },
                    {
                        "name": "term",
                        "type": "string",
                        "analysis": { "type": "text", "analyzer": "tokenized" },
                        "aliases": [
                            { "name": "exact", "type": "keyword", "normalizer": "case_insensitive" }
                        ]
                    },
                    {
                        "name": "members",
                        "type": "nested",
                        "fields": [ { "name": "refsetId", "type": "string" } ]
                    }
                ],
                "revisions": [
                    { "version": 2, "description": "add active", "strategy": "no_reindex" },
                    {
                        "version": 3,
                        "description": "rename a to b",
                        "strategy": "reindex_script",
                        "patch": [ { "op": "move", "from": "/a", "path": "/b" } ]
                    }
                ],
                "scripts": { "activate": "ctx._source.active = true" }
            },
            { "type": "description", "parent": "concept", "large_documents": true }
        ]))
        .unwrap()
    }

    #[test]
    fn test_definitions_convert_to_mappings() {
        let mappings = load_mappings(definitions()).unwrap();
        assert_eq!(mappings.len(), 2);

        let concept = mappings.get_mapping("concept").unwrap();
        assert_eq!(concept.schema_version(), 3);
        assert_eq!(concept.script("activate"), Some("ctx._source.active = true"));
        assert!(matches!(
            concept.revisions()[1].strategy(),
            MigrationStrategy::ReindexScript(_)
        ));
        assert!(matches!(
            concept.field("term").unwrap().analysis,
            Some(StringAnalysis::Text(_))
        ));

        let properties = to_properties(concept);
        assert_eq!(properties["members"]["type"], "nested");
        assert_eq!(
            properties["term"]["fields"]["exact"]["normalizer"],
            "case_insensitive"
        );

        let description = mappings.get_mapping("description").unwrap();
        assert_eq!(description.parent(), Some("concept"));
        assert!(description.has_large_documents());
    }

    #[test]
    fn test_invalid_patch_is_configuration_error() {
        let definition: MappingDefinition = serde_json::from_value(json!({
            "type": "concept",
            "revisions": [
                { "version": 2, "strategy": "reindex_script", "patch": { "op": "nope" } }
            ]
        }))
        .unwrap();
        let err = definition.into_mapping().unwrap_err();
        assert!(err.to_string().contains("invalid patch"));
    }
}
