//! Backend-neutral queries and scripts.

use serde_json::{Map, Value, json};

/// Document filter sent with by-query operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Matches every document.
    MatchAll,
    /// Exact value of a field (dotted path).
    Term {
        /// Field path.
        field: String,
        /// Expected value.
        value: Value,
    },
    /// Any of several values of a field.
    Terms {
        /// Field path.
        field: String,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// Documents with one of the given identifiers.
    Ids(Vec<String>),
    /// Documents where the field has a value.
    Exists(String),
    /// Boolean combination.
    Bool {
        /// Clauses that must all match.
        must: Vec<Query>,
        /// Clauses that must not match.
        must_not: Vec<Query>,
    },
}

impl Query {
    /// Exact match on a field.
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Match on any of several values.
    pub fn terms<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Query::Terms {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Match on identifiers.
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Query::Ids(ids.into_iter().map(Into::into).collect())
    }

    /// Restricts this query with another clause. Match-all sides collapse.
    pub fn and(self, other: Query) -> Self {
        match (self, other) {
            (Query::MatchAll, q) | (q, Query::MatchAll) => q,
            (Query::Bool { mut must, must_not }, q) => {
                must.push(q);
                Query::Bool { must, must_not }
            }
            (a, b) => Query::Bool {
                must: vec![a, b],
                must_not: Vec::new(),
            },
        }
    }

    /// Renders the query DSL.
    pub fn to_json(&self) -> Value {
        match self {
            Query::MatchAll => json!({ "match_all": {} }),
            Query::Term { field, value } => json!({ "term": { field.as_str(): value } }),
            Query::Terms { field, values } => json!({ "terms": { field.as_str(): values } }),
            Query::Ids(ids) => json!({ "ids": { "values": ids } }),
            Query::Exists(field) => json!({ "exists": { "field": field } }),
            Query::Bool { must, must_not } => {
                let mut clauses = Map::new();
                if !must.is_empty() {
                    clauses.insert(
                        "filter".to_string(),
                        Value::Array(must.iter().map(Query::to_json).collect()),
                    );
                }
                if !must_not.is_empty() {
                    clauses.insert(
                        "must_not".to_string(),
                        Value::Array(must_not.iter().map(Query::to_json).collect()),
                    );
                }
                json!({ "bool": clauses })
            }
        }
    }

    /// Evaluates the query against a document source.
    pub fn matches(&self, id: &str, source: &Value) -> bool {
        match self {
            Query::MatchAll => true,
            Query::Term { field, value } => field_values(source, field).any(|v| v == value),
            Query::Terms { field, values } => {
                field_values(source, field).any(|v| values.contains(v))
            }
            Query::Ids(ids) => ids.iter().any(|i| i == id),
            Query::Exists(field) => field_values(source, field).any(|v| !v.is_null()),
            Query::Bool { must, must_not } => {
                must.iter().all(|q| q.matches(id, source))
                    && !must_not.iter().any(|q| q.matches(id, source))
            }
        }
    }
}

fn field_values<'a>(source: &'a Value, field: &str) -> Box<dyn Iterator<Item = &'a Value> + 'a> {
    let pointer = format!("/{}", field.replace('.', "/"));
    match source.pointer(&pointer) {
        Some(Value::Array(values)) => Box::new(values.iter()),
        Some(value) => Box::new(std::iter::once(value)),
        None => Box::new(std::iter::empty()),
    }
}

/// An inline update script with parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    /// Script source.
    pub source: String,
    /// Script parameters.
    pub params: Map<String, Value>,
}

impl Script {
    /// Creates a script without parameters.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            params: Map::new(),
        }
    }

    /// Creates a script with parameters.
    pub fn with_params(source: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            source: source.into(),
            params,
        }
    }

    /// Renders the script object.
    pub fn to_json(&self) -> Value {
        json!({
            "source": self.source,
            "lang": "painless",
            "params": self.params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_collapses_match_all() {
        let q = Query::MatchAll.and(Query::term("doc_type", "concept"));
        assert_eq!(q, Query::term("doc_type", "concept"));

        let q = Query::term("active", true).and(Query::term("doc_type", "concept"));
        assert!(matches!(q, Query::Bool { ref must, .. } if must.len() == 2));
    }

    #[test]
    fn test_to_json() {
        let q = Query::term("active", true).and(Query::ids(["1", "2"]));
        assert_eq!(
            q.to_json(),
            json!({
                "bool": {
                    "filter": [
                        { "term": { "active": true } },
                        { "ids": { "values": ["1", "2"] } }
                    ]
                }
            })
        );
    }

    #[test]
    fn test_matches() {
        let doc = json!({ "active": true, "members": { "refsetId": ["a", "b"] } });
        assert!(Query::term("active", true).matches("1", &doc));
        assert!(Query::term("members.refsetId", "b").matches("1", &doc));
        assert!(Query::terms("members.refsetId", ["x", "a"]).matches("1", &doc));
        assert!(!Query::Exists("missing".to_string()).matches("1", &doc));
        assert!(Query::ids(["1"]).matches("1", &doc));
        assert!(
            !Query::Bool {
                must: vec![Query::MatchAll],
                must_not: vec![Query::term("active", true)],
            }
            .matches("1", &doc)
        );
    }
}
