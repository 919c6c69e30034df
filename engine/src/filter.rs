//! Single-field equality filters.

use crate::{error::Result, Error, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

/// Prefix of the equality operator in query parameters (`field=eq.value`).
pub const EQ_PREFIX: &str = "eq.";

/// An equality predicate on one record field.
///
/// Two filters are equal when both the field name and the value are equal;
/// a session treats any change as a new synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    field: String,
    value: Value,
}

impl Filter {
    /// Create a filter `field == value`. The value must be a JSON scalar.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Result<Self> {
        let field = field.into();
        let value = value.into();

        if field.trim().is_empty() {
            return Err(Error::InvalidFilter("empty field name".into()));
        }
        if literal(&value).is_none() {
            return Err(Error::InvalidFilter(format!(
                "value for '{}' must be a scalar",
                field
            )));
        }

        Ok(Self { field, value })
    }

    /// Parse a query parameter pair such as `("client_id", "eq.X")`.
    ///
    /// `null`, `true` and `false` parse as JSON null and booleans, a
    /// double-quoted literal is a string, anything else is kept as text. Numbers
    /// stay strings; matching compares numbers and strings by literal text.
    pub fn from_query_param(field: &str, raw: &str) -> Result<Self> {
        let text = raw.strip_prefix(EQ_PREFIX).ok_or_else(|| {
            Error::InvalidFilter(format!("unsupported operator in '{}={}'", field, raw))
        })?;
        let value = match text {
            "null" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            quoted if quoted.len() >= 2 && quoted.starts_with('"') && quoted.ends_with('"') => {
                Value::String(quoted[1..quoted.len() - 1].to_string())
            }
            text => Value::String(text.to_string()),
        };
        Self::eq(field, value)
    }

    /// Render as a query parameter pair that [`Filter::from_query_param`]
    /// reads back to an equivalent filter.
    pub fn to_query_param(&self) -> (String, String) {
        let literal = match &self.value {
            Value::String(s) if needs_quotes(s) => Cow::Owned(format!("\"{}\"", s)),
            value => literal(value).unwrap_or(Cow::Borrowed("null")),
        };
        (self.field.clone(), format!("{}{}", EQ_PREFIX, literal))
    }

    /// The filtered field.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The expected value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Check whether a record satisfies this filter.
    ///
    /// A missing field reads as null. Null and booleans only match their own
    /// kind; strings and numbers match by literal text.
    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.get(&self.field).unwrap_or(&Value::Null);
        match (&self.value, actual) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(expected), Value::Bool(actual)) => expected == actual,
            (
                expected @ (Value::String(_) | Value::Number(_)),
                actual @ (Value::String(_) | Value::Number(_)),
            ) => literal(expected) == literal(actual),
            _ => false,
        }
    }
}

/// Check an optional filter; `None` matches every record.
pub fn matches(filter: Option<&Filter>, record: &Record) -> bool {
    filter.map_or(true, |f| f.matches(record))
}

/// Strings that would otherwise read back as another literal.
fn needs_quotes(s: &str) -> bool {
    matches!(s, "null" | "true" | "false") || s.starts_with('"')
}

/// Canonical text of a scalar value, `None` for arrays and objects.
fn literal(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::Null => Some(Cow::Borrowed("null")),
        Value::Bool(true) => Some(Cow::Borrowed("true")),
        Value::Bool(false) => Some(Cow::Borrowed("false")),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project(id: &str, client: Value) -> Record {
        Record::new(id, json!({"client_id": client, "title": "Education"})).unwrap()
    }

    #[test]
    fn matches_equal_values() {
        let filter = Filter::eq("client_id", "X").unwrap();
        assert!(filter.matches(&project("1", json!("X"))));
        assert!(!filter.matches(&project("2", json!("Y"))));
    }

    #[test]
    fn matches_by_literal_text() {
        let filter = Filter::eq("client_id", "42").unwrap();
        assert!(filter.matches(&project("1", json!(42))));

        let filter = Filter::eq("client_id", 42).unwrap();
        assert!(filter.matches(&project("1", json!("42"))));
    }

    #[test]
    fn missing_field() {
        let record = Record::new("1", json!({"title": "x"})).unwrap();
        assert!(!Filter::eq("client_id", "X").unwrap().matches(&record));
        assert!(Filter::eq("client_id", Value::Null).unwrap().matches(&record));
    }

    #[test]
    fn rejects_invalid_filters() {
        assert!(Filter::eq("", "X").is_err());
        assert!(Filter::eq("tags", json!(["a"])).is_err());
        assert!(Filter::eq("meta", json!({"a": 1})).is_err());
    }

    #[test]
    fn equality_by_field_and_value() {
        let a = Filter::eq("client_id", "X").unwrap();
        assert_eq!(a, Filter::eq("client_id", "X").unwrap());
        assert_ne!(a, Filter::eq("client_id", "Y").unwrap());
        assert_ne!(a, Filter::eq("ngo_id", "X").unwrap());
    }

    #[test]
    fn query_param_round_trip() {
        let filter = Filter::eq("client_id", "X").unwrap();
        let (field, raw) = filter.to_query_param();
        assert_eq!(field, "client_id");
        assert_eq!(raw, "eq.X");

        let parsed = Filter::from_query_param(&field, &raw).unwrap();
        assert!(parsed.matches(&project("1", json!("X"))));

        assert!(Filter::from_query_param("client_id", "gt.3").is_err());
    }

    #[test]
    fn null_and_bool_are_not_text() {
        let untitled = Record::new("1", json!({"title": "x"})).unwrap();
        let explicit = Record::new("2", json!({"owner": null})).unwrap();
        let text = Record::new("3", json!({"owner": "null"})).unwrap();

        let null = Filter::eq("owner", Value::Null).unwrap();
        assert!(null.matches(&untitled));
        assert!(null.matches(&explicit));
        assert!(!null.matches(&text));

        let word = Filter::eq("owner", "null").unwrap();
        assert!(!word.matches(&explicit));
        assert!(word.matches(&text));

        let flag = Record::new("4", json!({"done": true})).unwrap();
        assert!(Filter::eq("done", true).unwrap().matches(&flag));
        assert!(!Filter::eq("done", "true").unwrap().matches(&flag));
    }

    #[test]
    fn query_param_keeps_meaning() {
        let records = [
            Record::new("1", json!({"title": "x"})).unwrap(),
            Record::new("2", json!({"owner": null})).unwrap(),
            Record::new("3", json!({"owner": "null"})).unwrap(),
            Record::new("4", json!({"owner": true})).unwrap(),
            Record::new("5", json!({"owner": "true"})).unwrap(),
            Record::new("6", json!({"owner": 42})).unwrap(),
            Record::new("7", json!({"owner": "\"quoted\""})).unwrap(),
        ];
        let filters = [
            Filter::eq("owner", Value::Null).unwrap(),
            Filter::eq("owner", "null").unwrap(),
            Filter::eq("owner", true).unwrap(),
            Filter::eq("owner", false).unwrap(),
            Filter::eq("owner", "true").unwrap(),
            Filter::eq("owner", 42).unwrap(),
            Filter::eq("owner", "42").unwrap(),
            Filter::eq("owner", "\"quoted\"").unwrap(),
        ];

        for filter in &filters {
            let (field, raw) = filter.to_query_param();
            let parsed = Filter::from_query_param(&field, &raw).unwrap();
            for record in &records {
                assert_eq!(
                    filter.matches(record),
                    parsed.matches(record),
                    "{}={} on record {}",
                    field,
                    raw,
                    record.id()
                );
            }
        }

        assert_eq!(Filter::eq("owner", Value::Null).unwrap().to_query_param().1, "eq.null");
        assert_eq!(Filter::eq("owner", "null").unwrap().to_query_param().1, "eq.\"null\"");
    }

    #[test]
    fn optional_filter_matches_everything() {
        assert!(matches(None, &project("1", json!("Z"))));
    }
}
