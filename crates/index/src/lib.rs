//! Helios Index Administration
//!
//! This crate creates, verifies, evolves and reindexes the physical indices
//! that back Helios search. Document types are declared as
//! [`DocumentMapping`]s carrying an ordered list of schema revisions; at boot
//! the [`IndexAdmin`] compares every live index with its declared schema and
//! replays the revisions it is missing.
//!
//! # Features
//!
//! - **Schema versioning**: every index records its schema version under
//!   `_meta.version`; versions never go backwards and a mapping change without
//!   a version bump is rejected
//! - **Three migration strategies**: mapping update only, mapping update plus
//!   an in-place rewrite, or a full rebuild through a temporary index with a
//!   per-document [`DocumentMigrator`]
//! - **Bounded retries**: bulk mutations retry version conflicts with jittered
//!   backoff, reindexing halves its batch size when the cluster is overloaded
//! - **Shared indices**: child types live in their parent's index, separated
//!   by a `doc_type` discriminator
//!
//! # Backend Features
//!
//! - `elasticsearch` - [`IndexClusterClient`] for Elasticsearch clusters
//! - `cli` - the `index-admin` command line tool
//!
//! The in-memory cluster in [`client::memory`] is always available and is
//! what the test suite runs against.
//!
//! # Architecture
//!
//! - [`mapping`] - document mappings, revisions and their index schemas
//! - [`definition`] - serde form of mappings for configuration files
//! - [`diff`] - classification of stored versus declared schema differences
//! - [`registry`] - index naming and the type-to-index registry
//! - [`settings`] - the settings snapshot and its key families
//! - [`client`] - the cluster client capability and its implementations
//! - [`health`], [`bulk`], [`reindex`], [`migration`] - the engine steps
//! - [`admin`] - the [`IndexAdmin`] façade
//!
//! # Quick Start
//!
//! ```
//! use helios_index::mapping::{DocumentMapping, FieldMapping, FieldType, Mappings, SchemaRevision};
//!
//! let concept = DocumentMapping::new("concept")
//!     .with_field(FieldMapping::string("id"))
//!     .with_field(FieldMapping::new("active", FieldType::Boolean))
//!     .with_revision(SchemaRevision::no_reindex(2, "add active flag"));
//!
//! let mappings = Mappings::new([concept]).unwrap();
//! assert_eq!(mappings.groups()[0].schema_version(), 2);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod admin;
pub mod bulk;
pub mod client;
pub mod definition;
pub mod diff;
pub mod error;
pub mod health;
pub mod mapping;
pub mod migration;
pub mod registry;
pub mod reindex;
pub mod settings;

// Re-export commonly used types at crate root
pub use admin::{ClusterIndexAdmin, IndexAdmin};
pub use client::IndexClusterClient;
pub use error::{
    BackendError, ConfigurationError, IndexError, IndexResult, MigrationError,
    TransientBackendError, UnavailableError,
};
pub use mapping::{
    DocumentMapping, DocumentMigrator, FieldMapping, FieldType, Mappings, MigrationStrategy,
    SchemaRevision,
};
pub use settings::Settings;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
