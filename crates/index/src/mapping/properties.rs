//! Conversion of document mappings into backend property schemas.

use serde_json::{Map, Value, json};

use crate::error::ConfigurationError;

use super::document::{DocumentMapping, MappingGroup};
use super::field::{FieldAlias, FieldMapping, FieldType, KeywordAnalysis, StringAnalysis, TextAnalysis};

/// Name of the discriminator property of indices shared by several types.
pub const TYPE_FIELD: &str = "doc_type";

/// The versioned property schema of one physical index.
///
/// Values are immutable: bumping the version produces a new schema.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSchema {
    version: u32,
    properties: Map<String, Value>,
}

impl IndexSchema {
    /// Creates a schema from a version and its properties.
    pub fn new(version: u32, properties: Map<String, Value>) -> Self {
        Self {
            version,
            properties,
        }
    }

    /// Returns the schema version recorded under `_meta.version`.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the top-level properties.
    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Returns the same properties under another version.
    pub fn with_version(&self, version: u32) -> Self {
        Self {
            version,
            properties: self.properties.clone(),
        }
    }

    /// Renders the mapping body sent to the cluster.
    pub fn to_json(&self) -> Value {
        json!({
            "date_detection": false,
            "numeric_detection": false,
            "_meta": { "version": self.version },
            "properties": self.properties,
        })
    }

    /// Reads the schema version of a stored mapping body, 0 when absent.
    pub fn stored_version(mapping: &Value) -> u32 {
        mapping
            .pointer("/_meta/version")
            .and_then(|v| match v {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    }
}

/// Converts a document mapping into its property tree.
///
/// Transient fields and the identifier field are skipped. A mapping with
/// hashed fields also gets the `_hash` system property.
pub fn to_properties(mapping: &DocumentMapping) -> Map<String, Value> {
    let mut properties = fields_to_properties(mapping.fields(), true);
    if !mapping.hashed_fields().is_empty() {
        properties.insert(
            DocumentMapping::HASH_FIELD.to_string(),
            json!({ "type": "keyword", "index": false }),
        );
    }
    properties
}

/// Builds the schema of the index shared by the members of `group`.
///
/// Members may declare the same property only with an identical definition.
pub fn group_schema(group: &MappingGroup) -> Result<IndexSchema, ConfigurationError> {
    let mut properties = Map::new();
    for member in group.members() {
        for (name, property) in to_properties(member) {
            match properties.get(&name) {
                Some(existing) if existing != &property => {
                    return Err(ConfigurationError::InvalidMapping {
                        type_name: member.type_name().to_string(),
                        message: format!(
                            "property '{}' conflicts with another type stored in the same index",
                            name
                        ),
                    });
                }
                Some(_) => {}
                None => {
                    properties.insert(name, property);
                }
            }
        }
    }

    if group.is_shared() {
        properties.insert(TYPE_FIELD.to_string(), json!({ "type": "keyword" }));
    }

    Ok(IndexSchema::new(group.schema_version(), properties))
}

fn fields_to_properties(fields: &[FieldMapping], parent_indexed: bool) -> Map<String, Value> {
    fields
        .iter()
        .filter(|f| !f.transient && f.name != DocumentMapping::ID_FIELD)
        .map(|f| (f.name.clone(), field_property(f, parent_indexed)))
        .collect()
}

fn field_property(field: &FieldMapping, parent_indexed: bool) -> Value {
    let indexed = parent_indexed && field.indexed;
    let mut property = match &field.field_type {
        FieldType::Map if indexed => json!({ "type": "object", "dynamic": "true" }),
        FieldType::Object(embedded) if indexed => json!({
            "type": "object",
            "properties": fields_to_properties(embedded.fields(), true),
        }),
        FieldType::Map | FieldType::Object(_) | FieldType::Opaque => {
            json!({ "type": "object", "enabled": false })
        }
        FieldType::Nested(embedded) => json!({
            "type": "nested",
            "properties": fields_to_properties(embedded.fields(), indexed),
        }),
        FieldType::String => string_property(field, indexed),
        FieldType::Enum | FieldType::Decimal | FieldType::StringValued => {
            keyword_property(&KeywordAnalysis::new(), indexed)
        }
        FieldType::Double => scalar_property("double", indexed),
        FieldType::Float => scalar_property("float", indexed),
        FieldType::Integer => scalar_property("integer", indexed),
        FieldType::Short => scalar_property("short", indexed),
        FieldType::Date | FieldType::Long => scalar_property("long", indexed),
        FieldType::Boolean => scalar_property("boolean", indexed),
        FieldType::Ip => scalar_property("ip", indexed),
    };

    if field.stored {
        property["store"] = Value::Bool(true);
    }
    property
}

fn scalar_property(kind: &str, indexed: bool) -> Value {
    let mut property = json!({ "type": kind });
    if !indexed {
        property["index"] = Value::Bool(false);
    }
    property
}

fn string_property(field: &FieldMapping, indexed: bool) -> Value {
    let mut property = match &field.analysis {
        Some(StringAnalysis::Text(analysis)) => text_property(analysis, indexed),
        Some(StringAnalysis::Keyword(analysis)) => keyword_property(analysis, indexed),
        None => keyword_property(&KeywordAnalysis::new(), indexed),
    };

    if !field.aliases.is_empty() {
        let fields: Map<String, Value> = field
            .aliases
            .iter()
            .map(|alias| {
                let sub = match alias {
                    FieldAlias::Keyword { analysis, .. } => keyword_property(analysis, indexed),
                    FieldAlias::Text { analysis, .. } => text_property(analysis, indexed),
                };
                (alias.name().to_string(), sub)
            })
            .collect();
        property["fields"] = Value::Object(fields);
    }
    property
}

fn keyword_property(analysis: &KeywordAnalysis, indexed: bool) -> Value {
    let mut property = json!({ "type": "keyword" });
    if let Some(normalizer) = &analysis.normalizer {
        property["normalizer"] = json!(normalizer);
    }
    // index: true is the cluster default and is never echoed back in stored mappings
    if !(indexed && analysis.index) {
        property["index"] = Value::Bool(false);
    }
    if let Some(doc_values) = analysis.doc_values {
        property["doc_values"] = Value::Bool(doc_values);
    }
    property
}

fn text_property(analysis: &TextAnalysis, indexed: bool) -> Value {
    let mut property = json!({ "type": "text", "analyzer": analysis.analyzer });
    if let Some(search_analyzer) = &analysis.search_analyzer {
        property["search_analyzer"] = json!(search_analyzer);
    }
    if !indexed {
        property["index"] = Value::Bool(false);
    }
    property
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mapping::document::Mappings;

    fn description() -> DocumentMapping {
        DocumentMapping::new("description")
            .with_field(FieldMapping::string("_id"))
            .with_field(
                FieldMapping::string("term")
                    .with_text(TextAnalysis::new("tokenized").with_search_analyzer("search"))
                    .with_alias(FieldAlias::normalized_keyword("exact", "case_insensitive"))
                    .with_alias(FieldAlias::Keyword {
                        name: "raw".to_string(),
                        analysis: KeywordAnalysis::new().not_indexed(),
                    }),
            )
            .with_field(FieldMapping::new("released", FieldType::Boolean))
            .with_field(FieldMapping::new("effectiveTime", FieldType::Date))
            .with_field(FieldMapping::new("score", FieldType::Float).stored())
            .with_field(FieldMapping::new("status", FieldType::Enum))
            .with_field(FieldMapping::new("cache", FieldType::Opaque).transient())
            .with_field(FieldMapping::new("extensions", FieldType::Map))
    }

    #[test]
    fn test_field_type_table() {
        let properties = to_properties(&description());

        assert!(!properties.contains_key("_id"));
        assert!(!properties.contains_key("cache"));
        assert_eq!(properties["released"], json!({ "type": "boolean" }));
        assert_eq!(properties["effectiveTime"], json!({ "type": "long" }));
        assert_eq!(properties["score"], json!({ "type": "float", "store": true }));
        assert_eq!(properties["status"], json!({ "type": "keyword" }));
        assert_eq!(
            properties["extensions"],
            json!({ "type": "object", "dynamic": "true" })
        );
        assert_eq!(
            properties["term"],
            json!({
                "type": "text",
                "analyzer": "tokenized",
                "search_analyzer": "search",
                "fields": {
                    "exact": { "type": "keyword", "normalizer": "case_insensitive" },
                    "raw": { "type": "keyword", "index": false, "doc_values": false },
                },
            })
        );
    }

    #[test]
    fn test_embedded_mappings() {
        let member = Arc::new(
            DocumentMapping::new("member")
                .with_field(FieldMapping::string("referencedComponentId"))
                .with_field(FieldMapping::new("active", FieldType::Boolean)),
        );
        let mapping = DocumentMapping::new("concept")
            .with_field(FieldMapping::new("members", FieldType::Nested(member.clone())).not_indexed())
            .with_field(FieldMapping::new("preferred", FieldType::Object(member.clone())))
            .with_field(FieldMapping::new("hidden", FieldType::Object(member)).not_indexed())
            .with_field(FieldMapping::new("properties", FieldType::Map).not_indexed());

        let properties = to_properties(&mapping);
        assert_eq!(
            properties["members"],
            json!({
                "type": "nested",
                "properties": {
                    "active": { "type": "boolean", "index": false },
                    "referencedComponentId": { "type": "keyword", "index": false },
                },
            })
        );
        assert_eq!(
            properties["preferred"]["properties"]["active"],
            json!({ "type": "boolean" })
        );
        assert_eq!(properties["hidden"], json!({ "type": "object", "enabled": false }));
        assert_eq!(
            properties["properties"],
            json!({ "type": "object", "enabled": false })
        );
    }

    #[test]
    fn test_hash_field() {
        let mapping = DocumentMapping::new("concept")
            .with_field(FieldMapping::string("id"))
            .with_hashed_field("id");
        assert_eq!(
            to_properties(&mapping)["_hash"],
            json!({ "type": "keyword", "index": false })
        );
    }

    #[test]
    fn test_schema_output_is_reproducible() {
        let first = serde_json::to_string(&to_properties(&description())).unwrap();
        let second = serde_json::to_string(&to_properties(&description())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_group_schema_adds_discriminator() {
        let mappings = Mappings::new(vec![
            DocumentMapping::new("concept").with_field(FieldMapping::string("id")),
            description().with_parent("concept").with_schema_version(4),
        ])
        .unwrap();

        let schema = group_schema(&mappings.groups()[0]).unwrap();
        assert_eq!(schema.version(), 4);
        assert_eq!(schema.properties()[TYPE_FIELD], json!({ "type": "keyword" }));
        assert!(schema.properties().contains_key("term"));

        let body = schema.to_json();
        assert_eq!(body["_meta"]["version"], 4);
        assert_eq!(body["date_detection"], false);
        assert_eq!(IndexSchema::stored_version(&body), 4);
        assert_eq!(IndexSchema::stored_version(&json!({})), 0);
    }

    #[test]
    fn test_group_schema_rejects_conflicting_properties() {
        let mappings = Mappings::new(vec![
            DocumentMapping::new("concept").with_field(FieldMapping::string("id")),
            DocumentMapping::new("description")
                .with_parent("concept")
                .with_field(FieldMapping::new("id", FieldType::Long)),
        ])
        .unwrap();
        assert!(group_schema(&mappings.groups()[0]).is_err());
    }

    #[test]
    fn test_with_version_keeps_properties() {
        let schema = IndexSchema::new(1, to_properties(&description()));
        let bumped = schema.with_version(2);
        assert_eq!(schema.version(), 1);
        assert_eq!(bumped.version(), 2);
        assert_eq!(schema.properties(), bumped.properties());
    }
}
