//! Field declarations of a document mapping.

use std::sync::Arc;

use super::document::DocumentMapping;

/// Declared value type of a field.
///
/// Every type a document field can hold is named here when the mapping is
/// built, so the property schema can be derived without inspecting values.
#[derive(Debug, Clone)]
pub enum FieldType {
    /// Free-form string.
    String,
    /// Enumerated constant, stored by name.
    Enum,
    /// Arbitrary precision decimal, stored as its string form.
    Decimal,
    /// 64-bit floating point number.
    Double,
    /// 32-bit floating point number.
    Float,
    /// 32-bit integer.
    Integer,
    /// 16-bit integer.
    Short,
    /// 64-bit integer.
    Long,
    /// Timestamp, stored as epoch milliseconds.
    Date,
    /// Boolean flag.
    Boolean,
    /// IPv4 or IPv6 address.
    Ip,
    /// Value whose serialized form is a string (identifiers, URIs, codes).
    StringValued,
    /// Key-value map with dynamic keys.
    Map,
    /// Embedded document mapped as an implicit object.
    Object(Arc<DocumentMapping>),
    /// Embedded document mapped as a nested document.
    Nested(Arc<DocumentMapping>),
    /// Any other value; kept in the source but never searchable.
    Opaque,
}

impl FieldType {
    /// Returns the embedded mapping of object and nested fields.
    pub fn embedded(&self) -> Option<&DocumentMapping> {
        match self {
            FieldType::Object(mapping) | FieldType::Nested(mapping) => Some(mapping),
            _ => None,
        }
    }

    /// Returns true for types that hold plain strings.
    pub fn is_string(&self) -> bool {
        matches!(self, FieldType::String)
    }
}

/// Keyword analysis of a string field or alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordAnalysis {
    /// Normalizer applied before indexing.
    pub normalizer: Option<String>,
    /// Whether the value is searchable.
    pub index: bool,
    /// Explicit doc-values flag; omitted from the schema when `None`.
    pub doc_values: Option<bool>,
}

impl KeywordAnalysis {
    /// An indexed keyword without normalizer.
    pub fn new() -> Self {
        Self {
            normalizer: None,
            index: true,
            doc_values: None,
        }
    }

    /// Sets the normalizer.
    pub fn with_normalizer(mut self, normalizer: impl Into<String>) -> Self {
        self.normalizer = Some(normalizer.into());
        self
    }

    /// Disables indexing and doc values.
    pub fn not_indexed(mut self) -> Self {
        self.index = false;
        self.doc_values = Some(false);
        self
    }
}

impl Default for KeywordAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

/// Text analysis of a string field or alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextAnalysis {
    /// Analyzer used at index time.
    pub analyzer: String,
    /// Analyzer used at search time, when different.
    pub search_analyzer: Option<String>,
}

impl TextAnalysis {
    /// Text analysis with a single analyzer.
    pub fn new(analyzer: impl Into<String>) -> Self {
        Self {
            analyzer: analyzer.into(),
            search_analyzer: None,
        }
    }

    /// Sets a distinct search-time analyzer.
    pub fn with_search_analyzer(mut self, analyzer: impl Into<String>) -> Self {
        self.search_analyzer = Some(analyzer.into());
        self
    }
}

/// An alternate indexed representation of a field, emitted under `fields`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldAlias {
    /// Keyword sub-field.
    Keyword {
        /// Sub-field name.
        name: String,
        /// Keyword analysis of the sub-field.
        analysis: KeywordAnalysis,
    },
    /// Analyzed text sub-field.
    Text {
        /// Sub-field name.
        name: String,
        /// Text analysis of the sub-field.
        analysis: TextAnalysis,
    },
}

impl FieldAlias {
    /// Keyword alias with default analysis.
    pub fn keyword(name: impl Into<String>) -> Self {
        FieldAlias::Keyword {
            name: name.into(),
            analysis: KeywordAnalysis::new(),
        }
    }

    /// Keyword alias with a normalizer.
    pub fn normalized_keyword(name: impl Into<String>, normalizer: impl Into<String>) -> Self {
        FieldAlias::Keyword {
            name: name.into(),
            analysis: KeywordAnalysis::new().with_normalizer(normalizer),
        }
    }

    /// Text alias.
    pub fn text(name: impl Into<String>, analysis: TextAnalysis) -> Self {
        FieldAlias::Text {
            name: name.into(),
            analysis,
        }
    }

    /// Returns the sub-field name.
    pub fn name(&self) -> &str {
        match self {
            FieldAlias::Keyword { name, .. } | FieldAlias::Text { name, .. } => name,
        }
    }
}

/// Primary analysis of a string field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringAnalysis {
    /// Indexed as an exact keyword.
    Keyword(KeywordAnalysis),
    /// Indexed as analyzed text.
    Text(TextAnalysis),
}

/// A single field of a document mapping.
#[derive(Debug, Clone)]
pub struct FieldMapping {
    /// Property name.
    pub name: String,
    /// Declared value type.
    pub field_type: FieldType,
    /// Whether the field is searchable.
    pub indexed: bool,
    /// Whether the field is stored separately from the source.
    pub stored: bool,
    /// Transient fields are never written to the index.
    pub transient: bool,
    /// Primary analysis of string fields.
    pub analysis: Option<StringAnalysis>,
    /// Alternate indexed representations.
    pub aliases: Vec<FieldAlias>,
}

impl FieldMapping {
    /// Creates an indexed, non-stored field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            indexed: true,
            stored: false,
            transient: false,
            analysis: None,
            aliases: Vec::new(),
        }
    }

    /// Shorthand for a string field.
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    /// Marks the field as not searchable.
    pub fn not_indexed(mut self) -> Self {
        self.indexed = false;
        self
    }

    /// Marks the field as stored.
    pub fn stored(mut self) -> Self {
        self.stored = true;
        self
    }

    /// Marks the field as transient.
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Indexes a string field as a keyword.
    pub fn with_keyword(mut self, analysis: KeywordAnalysis) -> Self {
        self.analysis = Some(StringAnalysis::Keyword(analysis));
        self
    }

    /// Indexes a string field as analyzed text.
    pub fn with_text(mut self, analysis: TextAnalysis) -> Self {
        self.analysis = Some(StringAnalysis::Text(analysis));
        self
    }

    /// Adds an alias sub-field.
    pub fn with_alias(mut self, alias: FieldAlias) -> Self {
        self.aliases.push(alias);
        self
    }

    /// Checks that analysis and aliases are only declared where they apply.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if (self.analysis.is_some() || !self.aliases.is_empty()) && !self.field_type.is_string() {
            return Err(format!(
                "only string fields can carry text or keyword analysis, found it on '{}'",
                self.name
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for alias in &self.aliases {
            if alias.name().is_empty() || !seen.insert(alias.name()) {
                return Err(format!(
                    "field '{}' declares an empty or duplicate alias '{}'",
                    self.name,
                    alias.name()
                ));
            }
        }
        if let Some(embedded) = self.field_type.embedded() {
            for field in embedded.fields() {
                field.validate()?;
            }
        }
        Ok(())
    }
}
