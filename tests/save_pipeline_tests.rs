/// Save pipeline tests
///
/// Insert finalization, validation, saving/saved events, audit events and
/// the cache guarantees of a single save.
/// Run with: cargo test --test save_pipeline_tests

mod common;

use common::*;
use olive_entities::entity::{Entity, EntityChange};
use olive_entities::{
    ApplicationEvent, Database, DataProviderFactoryInfo, EntityError, EntityId, MemoryEventLog, PersistentEventLog,
    SaveBehaviour, SaveMode, SaveOutcome,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_save_new_person_finalizes_identity() {
    let db = memory_database();
    let mut ann = Person::new("Ann", 34);
    assert!(ann.is_new());
    assert!(ann.id().is_none());

    let outcome = db.save(&mut ann).await.unwrap();

    assert_eq!(outcome, SaveOutcome::Saved(SaveMode::Insert));
    assert!(!ann.is_new());
    let id = ann.id().cloned().expect("identity assigned on insert");
    assert_eq!(id, EntityId::Int(1));
    assert_eq!(ann.header.original_id(), Some(&id));
    assert!(db.cache().get("Person", &id).is_none());

    // Identity stays stable across later saves
    ann.age = 35;
    let outcome = db.save(&mut ann).await.unwrap();
    assert_eq!(outcome, SaveOutcome::Saved(SaveMode::Update));
    assert_eq!(ann.id(), Some(&id));
    assert_eq!(ann.header.row_version(), 2);
    assert!(db.cache().get("Person", &id).is_none());
}

#[tokio::test]
async fn test_guid_identity_is_assigned_before_write() {
    let db = memory_database();
    let mut doc = Document::new("Handbook");

    db.save(&mut doc).await.unwrap();

    match doc.id() {
        Some(EntityId::Guid(_)) => {}
        other => panic!("expected a guid identity, got {:?}", other),
    }
    let loaded: Document = db.get(doc.id().cloned().unwrap()).await.unwrap();
    assert_eq!(loaded.title, "Handbook");
}

#[tokio::test]
async fn test_validation_errors_are_aggregated() {
    let db = memory_database();
    let mut nobody = Person::new("  ", -1);

    let err = db.save(&mut nobody).await.unwrap_err();

    match err {
        EntityError::Validation(errors) => {
            assert_eq!(errors.len(), 2);
            let properties: Vec<_> = errors.errors().iter().filter_map(|e| e.property.as_deref()).collect();
            assert!(properties.contains(&"Name"));
            assert!(properties.contains(&"Age"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(nobody.is_new());
}

#[tokio::test]
async fn test_global_validating_handler_adds_rules() {
    let db = memory_database();
    db.events().on_validating::<Person, _>(|person, errors| {
        errors.require(person.name != "Mallory", "Name", "Mallory is not welcome");
    });

    let mut mallory = Person::new("Mallory", 40);
    let err = assert_err!(db.save(&mut mallory).await);
    assert!(err.is_validation());

    let mut bob = Person::new("Bob", 40);
    assert_ok!(db.save(&mut bob).await);
}

#[tokio::test]
async fn test_bypass_validation_writes_invalid_entity_when_supported() {
    let db = memory_database();
    let mut nobody = Person::new("", 3);

    let outcome = db
        .save_with(&mut nobody, SaveBehaviour::BYPASS_VALIDATION)
        .await
        .unwrap();

    assert!(outcome.is_saved());
    assert!(!nobody.is_new());
}

#[tokio::test]
async fn test_bypass_validation_without_provider_support_fails_without_writing() {
    let probe = Probe::new();
    let db = probed_database(Arc::clone(&probe));
    let mut ann = Person::new("Ann", 34);

    let err = db
        .save_with(&mut ann, SaveBehaviour::BYPASS_VALIDATION)
        .await
        .unwrap_err();

    assert!(matches!(err, EntityError::Capability(_)));
    assert_eq!(probe.writes(), 0);
    assert!(ann.is_new());
}

#[tokio::test]
async fn test_no_validation_bypass_mapping_disables_bypass() {
    let config = memory_config().provider(
        DataProviderFactoryInfo::for_type("Document", "memory")
            .with_connection_string("memory://strict")
            .with_mapping("no-validation-bypass"),
    );
    let db = Database::new(config).unwrap();
    let mut doc = Document::new("Draft");

    let err = db
        .save_with(&mut doc, SaveBehaviour::BYPASS_VALIDATION)
        .await
        .unwrap_err();

    assert!(matches!(err, EntityError::Capability(_)));
    let access = db.providers().get_access("memory://strict").unwrap();
    assert!(access.tables().await.is_empty());
}

#[tokio::test]
async fn test_saving_handler_cancels_without_provider_write() {
    let probe = Probe::new();
    let db = probed_database(Arc::clone(&probe));
    db.events().on_saving::<Person, _>(|person, args| {
        if person.name == "Ann" {
            args.cancel();
        }
    });

    let mut ann = Person::new("Ann", 34);
    let outcome = db.save(&mut ann).await.unwrap();

    assert_eq!(outcome, SaveOutcome::Cancelled);
    assert_eq!(probe.writes(), 0);
    assert!(ann.is_new());

    let mut bob = Person::new("Bob", 50);
    assert_eq!(db.save(&mut bob).await.unwrap(), SaveOutcome::Saved(SaveMode::Insert));
    assert_eq!(probe.writes(), 1);
}

#[tokio::test]
async fn test_bypass_saving_skips_cancelling_handler() {
    let db = memory_database();
    db.events().on_saving::<Person, _>(|_, args| args.cancel());

    let mut ann = Person::new("Ann", 34);
    let outcome = db.save_with(&mut ann, SaveBehaviour::BYPASS_SAVING).await.unwrap();

    assert!(outcome.is_saved());
}

#[tokio::test]
async fn test_saved_and_updated_events_fire_in_order() {
    let db = memory_database();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let updated = Arc::clone(&seen);
    db.events().on_updated(move |event| {
        updated
            .lock()
            .unwrap()
            .push(format!("updated {} {:?}", event.type_name, event.change));
    });
    let saved = Arc::clone(&seen);
    db.events().on_saved::<Person, _>(move |person, mode| {
        saved.lock().unwrap().push(format!("saved {} {}", person.name, mode));
    });

    let mut ann = Person::new("Ann", 34);
    db.save(&mut ann).await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], format!("updated Person {:?}", EntityChange::Inserted));
    assert!(seen[1].starts_with("saved Ann"));
}

#[tokio::test]
async fn test_bypass_saved_skips_saved_handlers() {
    let db = memory_database();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    db.events().on_saved::<Person, _>(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut ann = Person::new("Ann", 34);
    db.save_with(&mut ann, SaveBehaviour::BYPASS_SAVED).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    db.save(&mut ann).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_loaded_instances_are_immutable_until_cloned() {
    let db = memory_database();
    let mut ann = Person::new("Ann", 34);
    db.save(&mut ann).await.unwrap();

    let mut loaded: Person = db.get(1i64).await.unwrap();
    assert!(loaded.header.is_immutable());
    let err = db.save(&mut loaded).await.unwrap_err();
    assert!(matches!(err, EntityError::ImmutableEntity(_)));

    let mut copy = loaded.clone();
    copy.age = 36;
    assert_ok!(db.save(&mut copy).await);
    let reread: Person = db.get(1i64).await.unwrap();
    assert_eq!(reread.age, 36);
}

#[tokio::test]
async fn test_memory_event_log_records_insert_update_delete() {
    let log = Arc::new(MemoryEventLog::new());
    let db = Database::builder(memory_config())
        .event_log(Arc::clone(&log) as _)
        .build()
        .unwrap();

    let mut ann = Person::new("Ann", 34);
    db.save(&mut ann).await.unwrap();
    ann.age = 35;
    db.save(&mut ann).await.unwrap();
    db.delete(&ann).await.unwrap();

    let events = log.events();
    let kinds: Vec<_> = events.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(kinds, vec!["Insert", "Update", "Delete"]);
    assert_eq!(events[1].item_key, "1");
    assert_eq!(events[1].item_id(), Some(&EntityId::Int(1)));
    assert_eq!(events[1].data, serde_json::json!({ "age": { "old": 34, "new": 35 } }));
}

#[tokio::test]
async fn test_bypass_logging_and_disabled_logging_record_nothing() {
    let log = Arc::new(MemoryEventLog::new());
    let db = Database::builder(memory_config())
        .event_log(Arc::clone(&log) as _)
        .build()
        .unwrap();

    let mut ann = Person::new("Ann", 34);
    db.save_with(&mut ann, SaveBehaviour::BYPASS_LOGGING).await.unwrap();
    assert!(log.events().is_empty());

    let quiet_log = Arc::new(MemoryEventLog::new());
    let quiet = Database::builder(memory_config().log_application_events(false))
        .event_log(Arc::clone(&quiet_log) as _)
        .build()
        .unwrap();
    let mut bob = Person::new("Bob", 50);
    quiet.save(&mut bob).await.unwrap();
    assert!(quiet_log.events().is_empty());
}

#[tokio::test]
async fn test_persistent_event_log_saves_events_as_entities() {
    let config = memory_config()
        .provider(DataProviderFactoryInfo::for_module("olive", "memory").with_connection_string_key("main"));
    let db = Database::builder(config)
        .event_log(Arc::new(PersistentEventLog))
        .build()
        .unwrap();

    // Guid identities exist before the event is written
    let mut handbook = Document::new("Handbook");
    db.save(&mut handbook).await.unwrap();
    let id = handbook.id().cloned().unwrap();

    let events: Vec<ApplicationEvent> = db.get_list(&Default::default()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "Insert");
    assert_eq!(events[0].item_type, "Document");
    assert_eq!(events[0].item_key, id.to_string());
    assert_eq!(events[0].item_id(), Some(&id));
}
