//! Record types for mirrored data.

use crate::{error::Result, Error, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the field that identifies a record within its collection.
pub const ID_FIELD: &str = "id";

/// A schema-less record: a flat JSON object with a mandatory `id`.
///
/// Numeric ids are accepted and normalized to their decimal string form so
/// that `{"id": 7}` and `{"id": "7"}` address the same mirror entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Record {
    id: RecordId,
    fields: Map<String, Value>,
}

impl Record {
    /// Create a record from an id and an object payload.
    ///
    /// Any `id` already present in the payload is overwritten.
    pub fn new(id: impl Into<RecordId>, payload: Value) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidRecord("empty id".into()));
        }

        let mut fields = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::InvalidRecord(format!(
                    "payload must be an object, got {}",
                    kind_of(&other)
                )))
            }
        };
        fields.insert(ID_FIELD.to_string(), Value::String(id.clone()));

        Ok(Self { id, fields })
    }

    /// Build a record from a JSON value that carries its own `id`.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::try_from(map),
            other => Err(Error::InvalidRecord(format!(
                "expected an object, got {}",
                kind_of(&other)
            ))),
        }
    }

    /// The record id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Look up a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// All fields, including `id`.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Merge fields from a patch object. The id cannot be changed.
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if key == ID_FIELD {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Convert into a plain JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl TryFrom<Map<String, Value>> for Record {
    type Error = Error;

    fn try_from(mut fields: Map<String, Value>) -> Result<Self> {
        let id = match fields.get(ID_FIELD) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(Error::InvalidRecord(format!(
                    "id must be a non-empty string or number, got {}",
                    kind_of(other)
                )))
            }
            None => return Err(Error::InvalidRecord("missing id".into())),
        };
        fields.insert(ID_FIELD.to_string(), Value::String(id.clone()));

        Ok(Self { id, fields })
    }
}

impl From<Record> for Map<String, Value> {
    fn from(record: Record) -> Self {
        record.fields
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
