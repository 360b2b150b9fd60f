//! Structural comparison of stored and declared index schemas.
//!
//! The stored mapping returned by the cluster and the freshly computed one are
//! compared with an RFC 6902 diff. Each operation is classified:
//!
//! | Operation | Classification |
//! |-----------|----------------|
//! | anything under `/_meta` | ignored |
//! | add of a leaf `type: object` | ignored (the cluster omits it on read) |
//! | add | compatible |
//! | remove below a nested `properties` level | ignored |
//! | remove at the top level | incompatible |
//! | move, replace, copy, test | incompatible |

use std::fmt;

use json_patch::PatchOperation;
use serde_json::Value;

/// Kind of a schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChangeKind {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Add => "add",
            ChangeKind::Remove => "remove",
            ChangeKind::Replace => "replace",
            ChangeKind::Move => "move",
            ChangeKind::Copy => "copy",
            ChangeKind::Test => "test",
        };
        f.write_str(name)
    }
}

/// How a change affects the live index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// The mapping can be updated in place.
    Compatible,
    /// Existing documents must be rebuilt.
    Incompatible,
    /// No effect on the index.
    Ignored,
}

/// One entry of a schema diff.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChange {
    /// JSON pointer of the changed node.
    pub path: String,
    /// Kind of change.
    pub kind: ChangeKind,
    /// New value for add, replace and test changes.
    pub value: Option<Value>,
    /// Classification of the change.
    pub compatibility: Compatibility,
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}

/// Classified difference between two schemas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaDiff {
    changes: Vec<SchemaChange>,
}

impl SchemaDiff {
    /// Returns every change, including ignored ones.
    pub fn changes(&self) -> &[SchemaChange] {
        &self.changes
    }

    /// Returns the compatible changes.
    pub fn compatible(&self) -> impl Iterator<Item = &SchemaChange> {
        self.with(Compatibility::Compatible)
    }

    /// Returns the incompatible changes.
    pub fn incompatible(&self) -> impl Iterator<Item = &SchemaChange> {
        self.with(Compatibility::Incompatible)
    }

    /// Returns true if no change requires a mapping update.
    pub fn is_empty(&self) -> bool {
        self.changes
            .iter()
            .all(|c| c.compatibility == Compatibility::Ignored)
    }

    /// Returns true if at least one change is incompatible.
    pub fn is_breaking(&self) -> bool {
        self.incompatible().next().is_some()
    }

    /// Returns the paths of all relevant changes.
    pub fn relevant_paths(&self) -> Vec<String> {
        self.changes
            .iter()
            .filter(|c| c.compatibility != Compatibility::Ignored)
            .map(|c| c.path.clone())
            .collect()
    }

    fn with(&self, compatibility: Compatibility) -> impl Iterator<Item = &SchemaChange> {
        self.changes
            .iter()
            .filter(move |c| c.compatibility == compatibility)
    }
}

/// Compares a stored mapping with a newly computed one.
pub fn compare(stored: &Value, declared: &Value) -> SchemaDiff {
    let patch = json_patch::diff(stored, declared);
    let changes = patch
        .0
        .into_iter()
        .map(|op| {
            let (path, kind, value) = match op {
                PatchOperation::Add(op) => (op.path.to_string(), ChangeKind::Add, Some(op.value)),
                PatchOperation::Remove(op) => (op.path.to_string(), ChangeKind::Remove, None),
                PatchOperation::Replace(op) => {
                    (op.path.to_string(), ChangeKind::Replace, Some(op.value))
                }
                PatchOperation::Move(op) => (op.path.to_string(), ChangeKind::Move, None),
                PatchOperation::Copy(op) => (op.path.to_string(), ChangeKind::Copy, None),
                PatchOperation::Test(op) => (op.path.to_string(), ChangeKind::Test, Some(op.value)),
            };
            let compatibility = classify(&path, kind, value.as_ref());
            SchemaChange {
                path,
                kind,
                value,
                compatibility,
            }
        })
        .collect();
    SchemaDiff { changes }
}

fn classify(path: &str, kind: ChangeKind, value: Option<&Value>) -> Compatibility {
    if path == "/_meta" || path.starts_with("/_meta/") {
        return Compatibility::Ignored;
    }
    match kind {
        ChangeKind::Add => {
            let implicit_object =
                path.ends_with("/type") && value.and_then(Value::as_str) == Some("object");
            if implicit_object {
                Compatibility::Ignored
            } else {
                Compatibility::Compatible
            }
        }
        ChangeKind::Remove => {
            let depth = path.split('/').filter(|s| *s == "properties").count();
            if depth >= 2 {
                Compatibility::Ignored
            } else {
                Compatibility::Incompatible
            }
        }
        ChangeKind::Replace | ChangeKind::Move | ChangeKind::Copy | ChangeKind::Test => {
            Compatibility::Incompatible
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(version: u32, properties: Value) -> Value {
        json!({
            "date_detection": false,
            "numeric_detection": false,
            "_meta": { "version": version },
            "properties": properties,
        })
    }

    #[test]
    fn test_identical_schemas() {
        let a = schema(1, json!({ "id": { "type": "keyword" } }));
        assert!(compare(&a, &a).changes().is_empty());
    }

    #[test]
    fn test_version_only_change_is_ignored() {
        let props = json!({ "id": { "type": "keyword" } });
        let diff = compare(&schema(1, props.clone()), &schema(2, props));
        assert!(!diff.changes().is_empty());
        assert!(diff.is_empty());
    }

    #[test]
    fn test_added_field_is_compatible() {
        let diff = compare(
            &schema(1, json!({ "id": { "type": "keyword" } })),
            &schema(2, json!({ "id": { "type": "keyword" }, "active": { "type": "boolean" } })),
        );
        assert!(!diff.is_empty());
        assert!(!diff.is_breaking());
        assert_eq!(diff.relevant_paths(), vec!["/properties/active".to_string()]);
    }

    #[test]
    fn test_changed_type_is_incompatible() {
        let diff = compare(
            &schema(1, json!({ "a": { "type": "keyword" } })),
            &schema(2, json!({ "a": { "type": "long" } })),
        );
        assert!(diff.is_breaking());
        assert_eq!(diff.incompatible().next().unwrap().kind, ChangeKind::Replace);
    }

    #[test]
    fn test_removed_top_level_field_is_incompatible() {
        let diff = compare(
            &schema(1, json!({ "a": { "type": "keyword" }, "b": { "type": "keyword" } })),
            &schema(2, json!({ "b": { "type": "keyword" } })),
        );
        assert!(diff.is_breaking());
        assert_eq!(diff.relevant_paths(), vec!["/properties/a".to_string()]);
    }

    #[test]
    fn test_nested_removal_and_implicit_object_type_are_ignored() {
        let stored = schema(
            1,
            json!({
                "members": {
                    "properties": {
                        "active": { "type": "boolean" },
                        "legacy": { "type": "keyword" }
                    }
                }
            }),
        );
        let declared = schema(
            1,
            json!({
                "members": {
                    "type": "object",
                    "properties": { "active": { "type": "boolean" } }
                }
            }),
        );
        let diff = compare(&stored, &declared);
        assert_eq!(diff.changes().len(), 2);
        assert!(diff.is_empty());
    }
}
