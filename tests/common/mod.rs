// Shared fixtures for the integration tests
//
// Entities, database builders and a probing provider that counts writes,
// tracks overlapping writes and can be told to fail.

#![allow(dead_code)]

use async_trait::async_trait;
use olive_entities::core::{AggregateFunction, EntityError, EntityId, EntityRecord, EntityType, IdStrategy, Query, Result};
use olive_entities::entity::{Entity, EntityHeader, ValidationErrors};
use olive_entities::provider::{
    DataAccess, DataProvider, DataProviderFactory, DataProviderFactoryInfo, MemoryProviderFactory, MemoryStore,
    ProviderRegistry,
};
use olive_entities::transaction::TransactionContext;
use olive_entities::{Database, DatabaseConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MAIN: &str = "memory://main";

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

pub static PERSON: EntityType = EntityType::new("Person", "hr").id_strategy(IdStrategy::Int);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Person {
    #[serde(skip)]
    pub header: EntityHeader,
    pub name: String,
    pub age: i64,
}

impl Person {
    pub fn new(name: &str, age: i64) -> Self {
        Self {
            name: name.to_string(),
            age,
            ..Default::default()
        }
    }
}

impl Entity for Person {
    fn entity_type() -> &'static EntityType {
        &PERSON
    }

    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntityHeader {
        &mut self.header
    }

    fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.require(!self.name.trim().is_empty(), "Name", "Name is required");
        errors.require(self.age >= 0, "Age", "Age cannot be negative");
        errors.into_result()
    }
}

pub static DOCUMENT: EntityType = EntityType::new("Document", "docs").id_strategy(IdStrategy::Guid);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(skip)]
    pub header: EntityHeader,
    pub title: String,
}

impl Document {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Default::default()
        }
    }
}

impl Entity for Document {
    fn entity_type() -> &'static EntityType {
        &DOCUMENT
    }

    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntityHeader {
        &mut self.header
    }
}

pub static PARTY: EntityType = EntityType::new("Party", "crm").abstract_type();
pub static CUSTOMER: EntityType = EntityType::new("Customer", "crm")
    .with_bases(&["Party"])
    .id_strategy(IdStrategy::Guid);
pub static SUPPLIER: EntityType = EntityType::new("Supplier", "crm")
    .with_bases(&["Party"])
    .id_strategy(IdStrategy::Guid);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Customer {
    #[serde(skip)]
    pub header: EntityHeader,
    pub name: String,
}

impl Entity for Customer {
    fn entity_type() -> &'static EntityType {
        &CUSTOMER
    }

    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntityHeader {
        &mut self.header
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Supplier {
    #[serde(skip)]
    pub header: EntityHeader,
    pub name: String,
}

impl Entity for Supplier {
    fn entity_type() -> &'static EntityType {
        &SUPPLIER
    }

    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut EntityHeader {
        &mut self.header
    }
}

// ---------------------------------------------------------------------------
// Databases
// ---------------------------------------------------------------------------

pub fn memory_config() -> DatabaseConfig {
    DatabaseConfig::new()
        .connection_string("main", MAIN)
        .provider(DataProviderFactoryInfo::for_module("hr", "memory").with_connection_string_key("main"))
        .provider(DataProviderFactoryInfo::for_module("docs", "memory").with_connection_string_key("main"))
        .provider(DataProviderFactoryInfo::for_module("crm", "memory").with_connection_string_key("main"))
}

pub fn memory_database() -> Database {
    Database::new(memory_config()).unwrap()
}

/// A database whose `hr` module is served by a probing provider.
pub fn probed_database(probe: Arc<Probe>) -> Database {
    probed_database_with(DatabaseConfig::new(), probe)
}

pub fn probed_database_with(config: DatabaseConfig, probe: Arc<Probe>) -> Database {
    let registry = ProviderRegistry::new();
    registry.register_factory_constructor(
        "probe",
        Arc::new(move |info: &DataProviderFactoryInfo, connection_string: &str| -> Result<Arc<dyn DataProviderFactory>> {
            let factory: Arc<dyn DataProviderFactory> =
                Arc::new(ProbeFactory::new(info.clone(), connection_string, Arc::clone(&probe)));
            Ok(factory)
        }),
    );

    let config = config
        .provider(DataProviderFactoryInfo::for_module("hr", "probe").with_connection_string("memory://probe"));
    Database::builder(config).provider_registry(registry).build().unwrap()
}

// ---------------------------------------------------------------------------
// Probing provider
// ---------------------------------------------------------------------------

/// Observations shared by every provider a `ProbeFactory` hands out.
#[derive(Debug, Default)]
pub struct Probe {
    pub writes: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub write_delay: Mutex<Duration>,
    /// Writes of a record whose `name` equals this value fail.
    pub fail_on_name: Mutex<Option<String>>,
    pub log: Mutex<Vec<String>>,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let probe = Self::default();
        *probe.write_delay.lock().unwrap() = delay;
        Arc::new(probe)
    }

    pub fn fail_on(&self, name: &str) {
        *self.fail_on_name.lock().unwrap() = Some(name.to_string());
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn check(&self, record: &EntityRecord) -> Result<()> {
        let fail_on = self.fail_on_name.lock().unwrap().clone();
        match (fail_on, record.field("name").and_then(JsonValue::as_str)) {
            (Some(expected), Some(name)) if expected == name => {
                Err(EntityError::Provider(format!("simulated failure writing '{}'", name)))
            }
            _ => Ok(()),
        }
    }

    async fn enter(&self, label: String) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("start {}", label));

        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self, label: String) {
        self.log.lock().unwrap().push(format!("end {}", label));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ProbeFactory {
    inner: MemoryProviderFactory,
    probe: Arc<Probe>,
}

impl ProbeFactory {
    pub fn new(info: DataProviderFactoryInfo, connection_string: &str, probe: Arc<Probe>) -> Self {
        let store = Arc::new(MemoryStore::new(connection_string));
        Self {
            inner: MemoryProviderFactory::new(info, connection_string, store),
            probe,
        }
    }
}

impl DataProviderFactory for ProbeFactory {
    fn info(&self) -> &DataProviderFactoryInfo {
        self.inner.info()
    }

    fn connection_string(&self) -> &str {
        self.inner.connection_string()
    }

    fn supports_polymorphism(&self) -> bool {
        false
    }

    fn get_provider(&self, entity_type: &'static EntityType) -> Result<Arc<dyn DataProvider>> {
        Ok(Arc::new(ProbeProvider {
            inner: self.inner.get_provider(entity_type)?,
            probe: Arc::clone(&self.probe),
        }))
    }

    fn get_access(&self) -> Arc<dyn DataAccess> {
        self.inner.get_access()
    }
}

pub struct ProbeProvider {
    inner: Arc<dyn DataProvider>,
    probe: Arc<Probe>,
}

#[async_trait]
impl DataProvider for ProbeProvider {
    fn entity_type(&self) -> &'static EntityType {
        self.inner.entity_type()
    }

    fn connection_string(&self) -> &str {
        self.inner.connection_string()
    }

    fn support_validation_bypassing(&self) -> bool {
        false
    }

    async fn get(&self, id: &EntityId, tx: Option<&TransactionContext>) -> Result<Option<EntityRecord>> {
        self.inner.get(id, tx).await
    }

    async fn save(&self, record: EntityRecord, tx: Option<&TransactionContext>) -> Result<EntityRecord> {
        let label = record.id_text();
        self.probe.enter(label.clone()).await;
        let result = match self.probe.check(&record) {
            Ok(()) => self.inner.save(record, tx).await,
            Err(err) => Err(err),
        };
        if result.is_ok() {
            self.probe.writes.fetch_add(1, Ordering::SeqCst);
        }
        self.probe.leave(label);
        result
    }

    async fn delete(&self, record: &EntityRecord, tx: Option<&TransactionContext>) -> Result<()> {
        self.inner.delete(record, tx).await
    }

    async fn get_list(&self, query: &Query, tx: Option<&TransactionContext>) -> Result<Vec<EntityRecord>> {
        self.inner.get_list(query, tx).await
    }

    async fn count(&self, query: &Query, tx: Option<&TransactionContext>) -> Result<usize> {
        self.inner.count(query, tx).await
    }

    async fn aggregate(
        &self,
        query: &Query,
        function: AggregateFunction,
        property: &str,
        tx: Option<&TransactionContext>,
    ) -> Result<Option<JsonValue>> {
        self.inner.aggregate(query, function, property, tx).await
    }

    async fn bulk_insert(
        &self,
        records: Vec<EntityRecord>,
        batch_size: usize,
        tx: Option<&TransactionContext>,
    ) -> Result<Vec<EntityRecord>> {
        let mut stored = Vec::with_capacity(records.len());
        for batch in records.chunks(batch_size) {
            for record in batch {
                self.probe.check(record)?;
                let row = self.inner.save(record.clone(), tx).await?;
                self.probe.writes.fetch_add(1, Ordering::SeqCst);
                stored.push(row);
            }
        }
        Ok(stored)
    }

    async fn bulk_update(
        &self,
        records: Vec<EntityRecord>,
        batch_size: usize,
        tx: Option<&TransactionContext>,
    ) -> Result<Vec<EntityRecord>> {
        for record in &records {
            self.probe.check(record)?;
        }
        let stored = self.inner.bulk_update(records, batch_size, tx).await?;
        self.probe.writes.fetch_add(stored.len(), Ordering::SeqCst);
        Ok(stored)
    }
}
