//! Document mappings and their translation into index schemas.
//!
//! A [`DocumentMapping`] declares the fields of one document type together
//! with the ordered [`SchemaRevision`]s that produced its current version.
//! Types that declare a parent are stored in the parent's index; the set of
//! types sharing an index is a [`MappingGroup`] and [`group_schema`] turns it
//! into the versioned [`IndexSchema`] pushed to the cluster.

mod document;
mod field;
mod migrator;
mod properties;

pub use document::{DocumentMapping, MappingGroup, Mappings, MigrationStrategy, SchemaRevision};
pub use field::{
    FieldAlias, FieldMapping, FieldType, KeywordAnalysis, StringAnalysis, TextAnalysis,
};
pub use migrator::{DocumentMigrator, FnMigrator, JsonPatchMigrator, MigrationContext};
pub use properties::{IndexSchema, TYPE_FIELD, group_schema, to_properties};
