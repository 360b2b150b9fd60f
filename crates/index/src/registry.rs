//! Index naming and the type-to-index registry.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::error::ConfigurationError;

/// Derives physical index names from the admin name and an optional prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNaming {
    prefix: String,
    name: String,
}

impl IndexNaming {
    /// Creates a naming scheme. Names are lowercased; a non-empty prefix is
    /// separated by a dot.
    pub fn new(name: &str, prefix: Option<&str>) -> Self {
        let prefix = match prefix {
            Some(p) if !p.is_empty() => format!("{}.", p.to_lowercase()),
            _ => String::new(),
        };
        Self {
            prefix,
            name: name.to_lowercase(),
        }
    }

    /// Returns the lowercased admin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the physical index of a root type.
    pub fn index_name(&self, root_type: &str) -> String {
        format!("{}{}-{}", self.prefix, self.name, root_type.to_lowercase())
    }

    /// Returns the wildcard pattern matching every index of this admin.
    pub fn pattern(&self) -> String {
        format!("{}{}-*", self.prefix, self.name)
    }
}

/// Outcome of [`IndexMapping::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The type was not registered before.
    Added,
    /// The type was already registered to the same index.
    Unchanged,
    /// The type moved from another index, which is now unregistered.
    Replaced {
        /// Index the type was registered to before.
        previous: String,
    },
}

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The index already belongs to another type.
    #[error("index '{index}' is already registered to type '{owner}'")]
    IndexTaken {
        /// Contested index.
        index: String,
        /// Type that owns it.
        owner: String,
    },
}

impl From<RegistryError> for ConfigurationError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::IndexTaken { ref owner, .. } => ConfigurationError::InvalidMapping {
                type_name: owner.clone(),
                message: err.to_string(),
            },
        }
    }
}

/// Bijection between document types and the physical indices that store them.
///
/// A type maps to at most one index and an index to at most one type.
#[derive(Debug, Clone, Default)]
pub struct IndexMapping {
    by_type: BTreeMap<String, String>,
    by_index: BTreeMap<String, String>,
}

impl IndexMapping {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `type_name` with `index`.
    pub fn register(
        &mut self,
        type_name: &str,
        index: &str,
    ) -> Result<Registration, RegistryError> {
        if let Some(owner) = self.by_index.get(index) {
            if owner == type_name {
                return Ok(Registration::Unchanged);
            }
            return Err(RegistryError::IndexTaken {
                index: index.to_string(),
                owner: owner.clone(),
            });
        }

        let previous = self
            .by_type
            .insert(type_name.to_string(), index.to_string());
        self.by_index
            .insert(index.to_string(), type_name.to_string());

        Ok(match previous {
            Some(previous) => {
                self.by_index.remove(&previous);
                Registration::Replaced { previous }
            }
            None => Registration::Added,
        })
    }

    /// Removes a type, returning the index it was registered to.
    pub fn unregister(&mut self, type_name: &str) -> Option<String> {
        let index = self.by_type.remove(type_name)?;
        self.by_index.remove(&index);
        Some(index)
    }

    /// Returns the index of a type.
    pub fn get_type_index(&self, type_name: &str) -> Option<&str> {
        self.by_type.get(type_name).map(String::as_str)
    }

    /// Returns the type stored in an index.
    pub fn get_index_type(&self, index: &str) -> Option<&str> {
        self.by_index.get(index).map(String::as_str)
    }

    /// Returns all registered indices in name order.
    pub fn indices(&self) -> impl Iterator<Item = &str> {
        self.by_index.keys().map(String::as_str)
    }

    /// Returns all registered `(type, index)` pairs in type order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_type.iter().map(|(t, i)| (t.as_str(), i.as_str()))
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Removes every registration.
    pub fn clear(&mut self) {
        self.by_type.clear();
        self.by_index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_naming() {
        let naming = IndexNaming::new("Snomed", Some("Dev"));
        assert_eq!(naming.name(), "snomed");
        assert_eq!(naming.index_name("Concept"), "dev.snomed-concept");
        assert_eq!(naming.pattern(), "dev.snomed-*");

        let naming = IndexNaming::new("snomed", Some(""));
        assert_eq!(naming.index_name("concept"), "snomed-concept");
    }

    #[test]
    fn test_register_is_bijective() {
        let mut registry = IndexMapping::new();
        assert_eq!(
            registry.register("concept", "snomed-concept").unwrap(),
            Registration::Added
        );
        assert_eq!(
            registry.register("concept", "snomed-concept").unwrap(),
            Registration::Unchanged
        );

        let err = registry
            .register("description", "snomed-concept")
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::IndexTaken {
                index: "snomed-concept".to_string(),
                owner: "concept".to_string(),
            }
        );

        assert_eq!(
            registry.register("concept", "snomed-concept-v2").unwrap(),
            Registration::Replaced {
                previous: "snomed-concept".to_string(),
            }
        );
        assert_eq!(registry.get_index_type("snomed-concept"), None);
        assert_eq!(registry.get_type_index("concept"), Some("snomed-concept-v2"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.indices().count(), 1);
    }

    #[test]
    fn test_unregister_frees_index() {
        let mut registry = IndexMapping::new();
        registry.register("concept", "snomed-concept").unwrap();
        assert_eq!(
            registry.unregister("concept"),
            Some("snomed-concept".to_string())
        );
        assert!(registry.is_empty());
        assert_eq!(registry.unregister("concept"), None);
        assert_eq!(
            registry.register("description", "snomed-concept").unwrap(),
            Registration::Added
        );
    }
}
