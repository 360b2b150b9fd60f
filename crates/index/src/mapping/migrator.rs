//! Per-document transforms used by script reindex revisions.

use serde_json::Value;

/// Context handed to a migrator for every document it rewrites.
#[derive(Debug, Clone, Copy)]
pub struct MigrationContext<'a> {
    /// Physical index the document is read from.
    pub index: &'a str,
    /// Type of the document.
    pub type_name: &'a str,
    /// Document identifier.
    pub id: &'a str,
    /// Schema version the document was written under.
    pub from_version: u32,
    /// Schema version the document is migrated to.
    pub to_version: u32,
}

/// Rewrites a raw document from one schema version to the next.
///
/// Migrators must be pure and must always produce a document: returning
/// `None` aborts the migration.
pub trait DocumentMigrator: Send + Sync {
    /// Returns the migrated form of `document`.
    fn migrate(&self, document: Value, context: &MigrationContext<'_>) -> Option<Value>;
}

/// Adapts a closure into a [`DocumentMigrator`].
pub struct FnMigrator<F>(F);

impl<F> FnMigrator<F>
where
    F: Fn(Value, &MigrationContext<'_>) -> Option<Value> + Send + Sync,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> DocumentMigrator for FnMigrator<F>
where
    F: Fn(Value, &MigrationContext<'_>) -> Option<Value> + Send + Sync,
{
    fn migrate(&self, document: Value, context: &MigrationContext<'_>) -> Option<Value> {
        (self.0)(document, context)
    }
}

/// Applies an RFC 6902 JSON patch to every document.
#[derive(Debug, Clone)]
pub struct JsonPatchMigrator {
    patch: json_patch::Patch,
}

impl JsonPatchMigrator {
    /// Creates a migrator from a parsed patch.
    pub fn new(patch: json_patch::Patch) -> Self {
        Self { patch }
    }

    /// Parses the patch from its JSON form.
    pub fn from_json(patch: Value) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_value(patch)?))
    }
}

impl DocumentMigrator for JsonPatchMigrator {
    fn migrate(&self, mut document: Value, context: &MigrationContext<'_>) -> Option<Value> {
        match json_patch::patch(&mut document, &self.patch) {
            Ok(()) => Some(document),
            Err(e) => {
                tracing::error!(
                    index = context.index,
                    id = context.id,
                    version = context.to_version,
                    error = %e,
                    "JSON patch could not be applied to document"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> MigrationContext<'static> {
        MigrationContext {
            index: "test-concept",
            type_name: "concept",
            id: "1",
            from_version: 1,
            to_version: 2,
        }
    }

    #[test]
    fn test_json_patch_rename() {
        let migrator = JsonPatchMigrator::from_json(json!([
            { "op": "move", "from": "/a", "path": "/b" }
        ]))
        .unwrap();

        let migrated = migrator
            .migrate(json!({ "a": 1, "c": true }), &context())
            .unwrap();
        assert_eq!(migrated, json!({ "b": 1, "c": true }));
    }

    #[test]
    fn test_json_patch_failure_yields_none() {
        let migrator = JsonPatchMigrator::from_json(json!([
            { "op": "move", "from": "/missing", "path": "/b" }
        ]))
        .unwrap();
        assert!(migrator.migrate(json!({ "a": 1 }), &context()).is_none());
    }

    #[test]
    fn test_fn_migrator() {
        let migrator = FnMigrator::new(|mut doc: Value, ctx: &MigrationContext<'_>| {
            doc["version"] = json!(ctx.to_version);
            Some(doc)
        });
        let migrated = migrator.migrate(json!({}), &context()).unwrap();
        assert_eq!(migrated["version"], 2);
    }
}
