// ============================================================================
// Application Event Log
// ============================================================================
//
// Records inserts, updates and deletes of entities. `ApplicationEvent` is
// itself an entity whose type is marked as the audit-log type, so saving it
// is never logged again.
//
// ============================================================================

use crate::core::{EntityId, EntityRecord, EntityType, IdStrategy, Result};
use crate::database::Database;
use crate::entity::{Entity, EntityHeader};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::sync::{Mutex, PoisonError};

pub static APPLICATION_EVENT: EntityType = EntityType::new("ApplicationEvent", "olive")
    .id_strategy(IdStrategy::Guid)
    .audit_log();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationEvent {
    #[serde(skip)]
    header: EntityHeader,
    /// `Insert`, `Update` or `Delete`.
    pub event: String,
    pub item_type: String,
    /// Text form of the item's id, empty when it had none yet.
    pub item_key: String,
    item_id: Option<EntityId>,
    pub data: JsonValue,
    pub date: DateTime<Utc>,
}

impl ApplicationEvent {
    pub fn new(event: &str, item_type: &str, item_id: Option<EntityId>, data: JsonValue) -> Self {
        Self {
            header: EntityHeader::new(),
            event: event.to_string(),
            item_type: item_type.to_string(),
            item_key: item_id.as_ref().map(EntityId::to_string).unwrap_or_default(),
            item_id,
            data,
            date: Utc::now(),
        }
    }

    /// Event for an insert, carrying every field of the new record.
    pub fn inserted(record: &EntityRecord) -> Self {
        Self::new("Insert", &record.type_name, record.id.clone(), record.fields.clone())
    }

    /// Event for an update, carrying `{field: {"old": .., "new": ..}}` for
    /// each field that differs from the stored record.
    pub fn updated(record: &EntityRecord, stored: Option<&EntityRecord>) -> Self {
        let changes = match stored {
            Some(stored) => diff_fields(&stored.fields, &record.fields),
            None => record.fields.clone(),
        };
        Self::new("Update", &record.type_name, record.id.clone(), changes)
    }

    pub fn deleted(record: &EntityRecord) -> Self {
        Self::new("Delete", &record.type_name, record.id.clone(), record.fields.clone())
    }

    /// The item's id in the form its type uses.
    pub fn item_id(&self) -> Option<&EntityId> {
        self.item_id.as_ref()
    }
}

impl Entity for ApplicationEvent {
    fn entity_type() -> &'static EntityType {
        &APPLICATION_EVENT
    }

    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntityHeader {
        &mut self.header
    }
}

fn diff_fields(old: &JsonValue, new: &JsonValue) -> JsonValue {
    let empty = Map::new();
    let old = old.as_object().unwrap_or(&empty);
    let new = new.as_object().unwrap_or(&empty);

    let mut changes = Map::new();
    for (key, value) in new {
        let before = old.get(key).unwrap_or(&JsonValue::Null);
        if before != value {
            changes.insert(key.clone(), json!({ "old": before, "new": value }));
        }
    }
    for (key, before) in old {
        if !new.contains_key(key) {
            changes.insert(key.clone(), json!({ "old": before, "new": JsonValue::Null }));
        }
    }
    JsonValue::Object(changes)
}

/// Destination of application events.
///
/// The engine hands over the handle it is saving through so that a log can
/// write inside the caller's transaction.
#[async_trait]
pub trait ApplicationEventLog: Send + Sync {
    async fn record(&self, db: &Database, event: ApplicationEvent) -> Result<()>;
}

/// Saves events as `ApplicationEvent` entities through the database.
#[derive(Debug, Default, Clone, Copy)]
pub struct PersistentEventLog;

#[async_trait]
impl ApplicationEventLog for PersistentEventLog {
    async fn record(&self, db: &Database, mut event: ApplicationEvent) -> Result<()> {
        db.save(&mut event).await?;
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<ApplicationEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ApplicationEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[async_trait]
impl ApplicationEventLog for MemoryEventLog {
    async fn record(&self, _db: &Database, event: ApplicationEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_event_records_changed_fields_only() {
        let mut stored = EntityRecord::new("Person", Some(EntityId::Int(1)), json!({ "name": "Ann", "age": 30 }));
        stored.is_new = false;
        let current = EntityRecord::new("Person", Some(EntityId::Int(1)), json!({ "name": "Ann", "age": 31 }));

        let event = ApplicationEvent::updated(&current, Some(&stored));
        assert_eq!(event.event, "Update");
        assert_eq!(event.item_key, "1");
        assert_eq!(event.item_id(), Some(&EntityId::Int(1)));
        assert_eq!(event.data, json!({ "age": { "old": 30, "new": 31 } }));
    }

    #[test]
    fn test_insert_event_carries_all_fields() {
        let record = EntityRecord::new("Person", None, json!({ "name": "Ann" }));
        let event = ApplicationEvent::inserted(&record);
        assert_eq!(event.data, json!({ "name": "Ann" }));
        assert!(event.item_id().is_none());
    }

    #[test]
    fn test_item_id_keeps_its_kind_through_serialization() {
        let guid = EntityId::new_guid();
        let numeric_text = EntityId::from("1001");
        for id in [EntityId::Int(7), guid, numeric_text] {
            let record = EntityRecord::new("Item", Some(id.clone()), json!({}));
            let event = ApplicationEvent::deleted(&record);
            assert_eq!(event.item_key, id.to_string());

            let restored: ApplicationEvent = serde_json::from_value(serde_json::to_value(&event).unwrap()).unwrap();
            assert_eq!(restored.item_id(), Some(&id));
        }
    }

    #[test]
    fn test_event_type_is_audit_log() {
        assert!(ApplicationEvent::entity_type().is_audit_log());
    }
}
