//! Query filter model
//!
//! Filters are JSON objects in the shape data providers understand:
//! `{"field": value}` for equality, nested objects for relationships and the
//! `_and` / `_or` / `_not` combinators.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single entity row as seen by providers and hooks
pub type Entity = Map<String, Value>;

pub const AND: &str = "_and";
pub const OR: &str = "_or";
pub const NOT: &str = "_not";

const IN_SUFFIX: &str = "_in";
const NE_SUFFIX: &str = "_ne";

/// Query filter; the empty filter matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(Map<String, Value>);

impl Filter {
    #[must_use]
    pub fn empty() -> Self {
        Self(Map::new())
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut map = Map::new();
        map.insert(field.into(), value.into());
        Self(map)
    }

    /// Build from a JSON value; anything but an object is rejected
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Logical AND that drops empty operands
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => other,
            (false, true) => self,
            (false, false) => {
                let mut map = Map::new();
                map.insert(
                    AND.to_string(),
                    Value::Array(vec![self.into_value(), other.into_value()]),
                );
                Self(map)
            }
        }
    }

    /// Logical OR; an empty operand makes the whole expression unconditional
    #[must_use]
    pub fn or(filters: Vec<Self>) -> Self {
        if filters.iter().any(Self::is_empty) {
            return Self::empty();
        }

        let mut filters = filters;
        if filters.len() == 1 {
            return filters.remove(0);
        }

        let mut map = Map::new();
        map.insert(
            OR.to_string(),
            Value::Array(filters.into_iter().map(Self::into_value).collect()),
        );
        Self(map)
    }

    /// Evaluate the filter against an entity in memory
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        matches_object(&self.0, entity)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

impl From<Map<String, Value>> for Filter {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn matches_object(filter: &Map<String, Value>, entity: &Entity) -> bool {
    filter
        .iter()
        .all(|(key, expected)| matches_clause(key, expected, entity))
}

fn matches_clause(key: &str, expected: &Value, entity: &Entity) -> bool {
    match key {
        AND => sub_filters(expected).all(|f| matches_object(f, entity)),
        OR => sub_filters(expected).any(|f| matches_object(f, entity)),
        NOT => expected
            .as_object()
            .is_none_or(|f| !matches_object(f, entity)),
        _ => {
            if let Some(field) = key.strip_suffix(IN_SUFFIX)
                && !entity.contains_key(key)
            {
                let actual = entity.get(field).unwrap_or(&Value::Null);
                return expected
                    .as_array()
                    .is_some_and(|values| values.iter().any(|v| values_equal(v, actual)));
            }

            if let Some(field) = key.strip_suffix(NE_SUFFIX)
                && !entity.contains_key(key)
            {
                let actual = entity.get(field).unwrap_or(&Value::Null);
                return !values_equal(expected, actual);
            }

            let actual = entity.get(key).unwrap_or(&Value::Null);
            matches_value(expected, actual)
        }
    }
}

fn sub_filters(value: &Value) -> impl Iterator<Item = &Map<String, Value>> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn matches_value(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(nested), Value::Object(related)) => matches_object(nested, related),
        // to-many relationship: any related row may satisfy the nested filter
        (Value::Object(nested), Value::Array(rows)) => rows
            .iter()
            .filter_map(Value::as_object)
            .any(|row| matches_object(nested, row)),
        (Value::Object(_), _) => false,
        _ => values_equal(expected, actual),
    }
}

fn values_equal(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        // ids arrive as strings from the API and as numbers from storage
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            *s == n.to_string()
        }
        _ => expected == actual,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entity(value: Value) -> Entity {
        value.as_object().cloned().unwrap()
    }

    fn filter(value: Value) -> Filter {
        Filter::from_value(value).unwrap()
    }

    #[test]
    fn test_and_drops_empty_operands() {
        let a = Filter::eq("id", 1);
        assert_eq!(Filter::empty().and(a.clone()), a);
        assert_eq!(a.clone().and(Filter::empty()), a);
        assert!(Filter::empty().and(Filter::empty()).is_empty());

        let combined = a.and(Filter::eq("owner", "u1"));
        assert_eq!(
            combined.into_value(),
            json!({"_and": [{"id": 1}, {"owner": "u1"}]})
        );
    }

    #[test]
    fn test_or_single_passes_through() {
        let a = Filter::eq("owner", "u1");
        assert_eq!(Filter::or(vec![a.clone()]), a);
    }

    #[test]
    fn test_or_many_and_unconditional() {
        let combined = Filter::or(vec![Filter::eq("a", 1), Filter::eq("b", 2)]);
        assert_eq!(combined.into_value(), json!({"_or": [{"a": 1}, {"b": 2}]}));

        let unconditional = Filter::or(vec![Filter::eq("a", 1), Filter::empty()]);
        assert!(unconditional.is_empty());
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(Filter::from_value(json!([1, 2])).is_none());
        assert!(Filter::from_value(json!("x")).is_none());
    }

    #[test]
    fn test_matches_equality_and_combinators() {
        let row = entity(json!({"id": 7, "owner": "u1", "status": "open"}));

        assert!(Filter::empty().matches(&row));
        assert!(filter(json!({"owner": "u1"})).matches(&row));
        assert!(!filter(json!({"owner": "u2"})).matches(&row));
        assert!(filter(json!({"_and": [{"id": "7"}, {"owner": "u1"}]})).matches(&row));
        assert!(filter(json!({"_or": [{"owner": "u2"}, {"status": "open"}]})).matches(&row));
        assert!(!filter(json!({"_or": [{"owner": "u2"}, {"status": "closed"}]})).matches(&row));
        assert!(filter(json!({"_not": {"owner": "u2"}})).matches(&row));
    }

    #[test]
    fn test_matches_in_and_ne() {
        let row = entity(json!({"id": 7, "status": "open"}));

        assert!(filter(json!({"status_in": ["open", "draft"]})).matches(&row));
        assert!(!filter(json!({"status_in": ["closed"]})).matches(&row));
        assert!(filter(json!({"status_ne": "closed"})).matches(&row));
        assert!(!filter(json!({"status_ne": "open"})).matches(&row));
    }

    #[test]
    fn test_matches_nested_relationships() {
        let row = entity(json!({
            "id": 1,
            "owner": {"id": 3, "name": "ada"},
            "tags": [{"id": 1, "label": "a"}, {"id": 2, "label": "b"}]
        }));

        assert!(filter(json!({"owner": {"id": 3}})).matches(&row));
        assert!(!filter(json!({"owner": {"id": 4}})).matches(&row));
        assert!(filter(json!({"tags": {"label": "b"}})).matches(&row));
        assert!(!filter(json!({"tags": {"label": "c"}})).matches(&row));
        assert!(!filter(json!({"missing": {"id": 1}})).matches(&row));
    }

    #[test]
    fn test_display_renders_json() {
        assert_eq!(Filter::eq("id", 1).to_string(), r#"{"id":1}"#);
    }
}
