//! Change events delivered by a collection's change feed.

use crate::{CollectionName, Record, RecordId, Sequence};
use serde::{Deserialize, Serialize};

/// Kind of change, used when requesting a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    /// Every kind; sessions always subscribe to all of them.
    pub const ALL: [EventKind; 3] = [EventKind::Created, EventKind::Updated, EventKind::Deleted];
}

/// A single create, update, or delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Created { record: Record },
    Updated { record: Record },
    Deleted { id: RecordId },
}

impl Change {
    /// The kind of this change.
    pub fn kind(&self) -> EventKind {
        match self {
            Change::Created { .. } => EventKind::Created,
            Change::Updated { .. } => EventKind::Updated,
            Change::Deleted { .. } => EventKind::Deleted,
        }
    }

    /// Id of the affected record.
    pub fn record_id(&self) -> &str {
        match self {
            Change::Created { record } | Change::Updated { record } => record.id(),
            Change::Deleted { id } => id,
        }
    }
}

/// A change tagged with its collection and, when the source provides one,
/// a monotonic sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: CollectionName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Sequence>,
    pub change: Change,
}

impl ChangeEvent {
    pub fn created(collection: impl Into<CollectionName>, record: Record) -> Self {
        Self::new(collection, Change::Created { record })
    }

    pub fn updated(collection: impl Into<CollectionName>, record: Record) -> Self {
        Self::new(collection, Change::Updated { record })
    }

    pub fn deleted(collection: impl Into<CollectionName>, id: impl Into<RecordId>) -> Self {
        Self::new(collection, Change::Deleted { id: id.into() })
    }

    fn new(collection: impl Into<CollectionName>, change: Change) -> Self {
        Self {
            collection: collection.into(),
            sequence: None,
            change,
        }
    }

    /// Attach a source sequence number.
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn kind(&self) -> EventKind {
        self.change.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_wire_format() {
        let record = Record::new("3", json!({"title": "Health"})).unwrap();
        let event = ChangeEvent::created("projects", record).with_sequence(9);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "collection": "projects",
                "sequence": 9,
                "change": {"kind": "created", "record": {"id": "3", "title": "Health"}}
            })
        );

        let parsed: ChangeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn delete_without_sequence() {
        let json = r#"{"collection": "projects", "change": {"kind": "deleted", "id": "1"}}"#;
        let event: ChangeEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event.sequence, None);
        assert_eq!(event.kind(), EventKind::Deleted);
        assert_eq!(event.change.record_id(), "1");
    }

    #[test]
    fn rejects_record_without_id() {
        let json = r#"{"collection": "p", "change": {"kind": "updated", "record": {"v": 1}}}"#;
        assert!(serde_json::from_str::<ChangeEvent>(json).is_err());
    }
}
