//! Mapping and admin fixtures.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use helios_index::admin::ClusterIndexAdmin;
use helios_index::client::memory::InMemoryCluster;
use helios_index::client::{Document, IndexClusterClient};
use helios_index::mapping::{DocumentMapping, FieldMapping, FieldType, IndexSchema, Mappings};
use helios_index::settings::Settings;

/// Admin name used by every fixture; indices are named `test-<type>`.
pub const ADMIN_NAME: &str = "test";

/// Index of the concept type.
pub const CONCEPT_INDEX: &str = "test-concept";

/// Script source registered for the `activate` script.
pub const ACTIVATE_SCRIPT: &str = "ctx._source.active = params.active";

/// Concept mapping at version 1 with an `id` and a boolean `active` field.
pub fn concept_mapping() -> DocumentMapping {
    DocumentMapping::new("concept")
        .with_field(FieldMapping::string("id"))
        .with_field(FieldMapping::new("active", FieldType::Boolean))
        .with_script("activate", ACTIVATE_SCRIPT)
}

/// Description mapping stored in the concept index.
pub fn description_mapping() -> DocumentMapping {
    DocumentMapping::new("description")
        .with_parent("concept")
        .with_field(FieldMapping::string("conceptId"))
        .with_field(FieldMapping::string("term"))
        .with_script("activate", ACTIVATE_SCRIPT)
}

/// Relationship mapping with its own index.
pub fn relationship_mapping() -> DocumentMapping {
    DocumentMapping::new("relationship")
        .with_field(FieldMapping::string("sourceId"))
        .with_field(FieldMapping::string("destinationId"))
}

/// Creates a cluster that knows the `activate` script.
pub fn create_cluster() -> Arc<InMemoryCluster> {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.register_script(ACTIVATE_SCRIPT, |source, params| {
        if let Some(active) = params.get("active") {
            source["active"] = active.clone();
        }
    });
    cluster
}

/// Creates an admin with default settings.
pub fn create_admin(
    cluster: &Arc<InMemoryCluster>,
    mappings: Vec<DocumentMapping>,
) -> ClusterIndexAdmin {
    create_admin_with_settings(cluster, mappings, Settings::default())
}

/// Creates an admin with the given settings.
pub fn create_admin_with_settings(
    cluster: &Arc<InMemoryCluster>,
    mappings: Vec<DocumentMapping>,
    settings: Settings,
) -> ClusterIndexAdmin {
    let client: Arc<dyn IndexClusterClient> = cluster.clone();
    ClusterIndexAdmin::new(
        client,
        ADMIN_NAME,
        Mappings::new(mappings).expect("valid fixture mappings"),
        settings,
    )
}

/// Builds a settings snapshot from a JSON object.
pub fn settings(values: Value) -> Settings {
    let Value::Object(values) = values else {
        panic!("settings fixture must be a JSON object");
    };
    Settings::new(values).expect("valid fixture settings")
}

/// Builds a settings update from a JSON object.
pub fn updates(values: Value) -> Map<String, Value> {
    match values {
        Value::Object(values) => values,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Concept documents with identifiers `1..=count`.
pub fn concepts(count: usize) -> Vec<Document> {
    (1..=count)
        .map(|i| {
            Document::new(
                i.to_string(),
                json!({ "id": i.to_string(), "active": false }),
            )
        })
        .collect()
}

/// Returns the schema version recorded in the stored mapping of an index.
pub fn stored_version(cluster: &InMemoryCluster, index: &str) -> u32 {
    let mapping = cluster
        .mapping(index)
        .unwrap_or_else(|| panic!("index '{index}' does not exist"));
    IndexSchema::stored_version(&mapping)
}
