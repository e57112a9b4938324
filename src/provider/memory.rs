// ============================================================================
// In-Memory Provider
// ============================================================================
//
// Stores records per entity type in a shared `MemoryStore`. Each table has
// its own lock so writes to unrelated types do not contend. Writes made
// inside a transaction register an undo action on the context.
//
// ============================================================================

use super::{DataAccess, DataProvider, DataProviderFactory, DataProviderFactoryInfo};
use crate::core::{
    AggregateFunction, EntityError, EntityId, EntityRecord, EntityType, IdStrategy, Query, Result,
};
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

struct MemoryTable {
    entity_type: &'static EntityType,
    rows: BTreeMap<EntityId, EntityRecord>,
    next_id: i64,
}

impl MemoryTable {
    fn new(entity_type: &'static EntityType) -> Self {
        Self {
            entity_type,
            rows: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn name(&self) -> &'static str {
        self.entity_type.name()
    }

    fn insert(&mut self, mut record: EntityRecord) -> Result<EntityRecord> {
        let id = match record.id.clone() {
            Some(id) => id,
            None if self.entity_type.strategy() == IdStrategy::Int => {
                self.next_id += 1;
                EntityId::Int(self.next_id)
            }
            None => {
                return Err(EntityError::Provider(format!(
                    "Cannot insert into '{}': the record has no ID",
                    self.name()
                )));
            }
        };

        if self.rows.contains_key(&id) {
            return Err(EntityError::AlreadySaved(self.name().to_string(), id.to_string()));
        }
        if let EntityId::Int(value) = id {
            self.next_id = self.next_id.max(value);
        }

        record.id = Some(id.clone());
        record.row_version = 1;
        record.is_new = false;
        self.rows.insert(id, record.clone());
        Ok(record)
    }

    /// Replaces an existing row. Returns the stored record and the row it replaced.
    fn update(&mut self, mut record: EntityRecord) -> Result<(EntityRecord, EntityRecord)> {
        let id = record.id.clone().ok_or_else(|| {
            EntityError::Provider(format!("Cannot update '{}': the record has no ID", self.name()))
        })?;
        let previous = self
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| zero_rows(self.name(), "Updating", &id))?;

        record.row_version = previous.row_version + 1;
        record.is_new = false;
        self.rows.insert(id, record.clone());
        Ok((record, previous))
    }

    fn remove(&mut self, id: &EntityId) -> Result<EntityRecord> {
        self.rows
            .remove(id)
            .ok_or_else(|| zero_rows(self.name(), "Deleting from", id))
    }
}

fn zero_rows(table: &str, action: &str, id: &EntityId) -> EntityError {
    EntityError::Concurrency(format!(
        "{} the '{}' table affected zero rows for ID '{}'. The record may have been deleted or its ID is wrong.",
        action, table, id
    ))
}

type TableHandle = Arc<Mutex<MemoryTable>>;

fn undo_inserts(table: TableHandle, ids: Vec<EntityId>) -> impl FnOnce() + Send + 'static {
    move || {
        let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &ids {
            table.rows.remove(id);
        }
    }
}

fn restore_rows(table: TableHandle, rows: Vec<EntityRecord>) -> impl FnOnce() + Send + 'static {
    move || {
        let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
        for row in rows {
            if let Some(id) = row.id.clone() {
                table.rows.insert(id, row);
            }
        }
    }
}

/// Named set of in-memory tables, shared by every factory that uses the
/// same connection string.
pub struct MemoryStore {
    name: String,
    tables: RwLock<HashMap<String, TableHandle>>,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn table(&self, entity_type: &'static EntityType) -> TableHandle {
        if let Some(table) = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_type.name())
        {
            return Arc::clone(table);
        }
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            tables
                .entry(entity_type.name().to_string())
                .or_insert_with(|| Arc::new(Mutex::new(MemoryTable::new(entity_type)))),
        )
    }

    fn existing_table(&self, name: &str) -> Option<TableHandle> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Concrete tables whose type satisfies `base`.
    fn tables_of(&self, base: &EntityType) -> Vec<TableHandle> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|table| {
                let table = table.lock().unwrap_or_else(PoisonError::into_inner);
                !table.entity_type.is_abstract() && table.entity_type.is_subtype_of(base.name())
            })
            .cloned()
            .collect()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.existing_table(table)
            .map(|t| t.lock().unwrap_or_else(PoisonError::into_inner).rows.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.name)
            .field("tables", &self.table_names())
            .finish()
    }
}

pub struct MemoryDataProvider {
    entity_type: &'static EntityType,
    store: Arc<MemoryStore>,
    connection_string: String,
    validation_bypassing: bool,
}

impl MemoryDataProvider {
    pub fn new(entity_type: &'static EntityType, store: Arc<MemoryStore>, connection_string: &str) -> Self {
        Self {
            entity_type,
            store,
            connection_string: connection_string.to_string(),
            validation_bypassing: true,
        }
    }

    pub fn with_validation_bypassing(mut self, supported: bool) -> Self {
        self.validation_bypassing = supported;
        self
    }

    fn writable_table(&self) -> Result<TableHandle> {
        if self.entity_type.is_abstract() {
            return Err(EntityError::InvalidOperation(format!(
                "{} is abstract and cannot be written to directly",
                self.entity_type
            )));
        }
        Ok(self.store.table(self.entity_type))
    }

    fn readable_tables(&self) -> Vec<TableHandle> {
        if self.entity_type.is_abstract() {
            self.store.tables_of(self.entity_type)
        } else {
            vec![self.store.table(self.entity_type)]
        }
    }

    fn snapshot(&self, query: &Query) -> Vec<EntityRecord> {
        let rows: Vec<EntityRecord> = self
            .readable_tables()
            .iter()
            .flat_map(|table| {
                table
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .rows
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        query.apply(rows)
    }
}

#[async_trait]
impl DataProvider for MemoryDataProvider {
    fn entity_type(&self) -> &'static EntityType {
        self.entity_type
    }

    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    fn support_validation_bypassing(&self) -> bool {
        self.validation_bypassing
    }

    async fn get(&self, id: &EntityId, _tx: Option<&TransactionContext>) -> Result<Option<EntityRecord>> {
        for table in self.readable_tables() {
            let table = table.lock()?;
            if let Some(row) = table.rows.get(id) {
                return Ok(Some(row.clone()));
            }
        }
        Ok(None)
    }

    async fn save(&self, record: EntityRecord, tx: Option<&TransactionContext>) -> Result<EntityRecord> {
        let handle = self.writable_table()?;
        let inserting = record.is_new;

        let (stored, undo) = {
            let mut table = handle.lock()?;
            if inserting {
                let stored = table.insert(record)?;
                (stored, None)
            } else {
                let (stored, previous) = table.update(record)?;
                (stored, Some(previous))
            }
        };

        if let Some(tx) = tx {
            match undo {
                None => tx.on_rollback(undo_inserts(handle, stored.id.iter().cloned().collect())),
                Some(previous) => tx.on_rollback(restore_rows(handle, vec![previous])),
            }
        }

        debug!(
            table = self.entity_type.name(),
            id = %stored.id_text(),
            row_version = stored.row_version,
            "memory provider saved record"
        );
        Ok(stored)
    }

    async fn delete(&self, record: &EntityRecord, tx: Option<&TransactionContext>) -> Result<()> {
        let handle = self.writable_table()?;
        let id = record.id.clone().ok_or_else(|| {
            EntityError::Provider(format!(
                "Cannot delete from '{}': the record has no ID",
                self.entity_type.name()
            ))
        })?;

        let removed = handle.lock()?.remove(&id)?;
        if let Some(tx) = tx {
            tx.on_rollback(restore_rows(handle, vec![removed]));
        }
        Ok(())
    }

    async fn get_list(&self, query: &Query, _tx: Option<&TransactionContext>) -> Result<Vec<EntityRecord>> {
        Ok(self.snapshot(query))
    }

    async fn count(&self, query: &Query, _tx: Option<&TransactionContext>) -> Result<usize> {
        Ok(self.snapshot(query).len())
    }

    async fn aggregate(
        &self,
        query: &Query,
        function: AggregateFunction,
        property: &str,
        _tx: Option<&TransactionContext>,
    ) -> Result<Option<JsonValue>> {
        let rows = self.snapshot(query);
        Ok(function.apply(rows.iter().filter_map(|row| row.field(property))))
    }

    async fn bulk_insert(
        &self,
        records: Vec<EntityRecord>,
        batch_size: usize,
        tx: Option<&TransactionContext>,
    ) -> Result<Vec<EntityRecord>> {
        let handle = self.writable_table()?;
        let mut stored = Vec::with_capacity(records.len());

        for batch in records.chunks(batch_size.max(1)) {
            let mut inserted = Vec::with_capacity(batch.len());
            let result = {
                let mut table = handle.lock()?;
                batch.iter().try_for_each(|record| {
                    let row = table.insert(record.clone())?;
                    inserted.extend(row.id.clone());
                    stored.push(row);
                    Ok::<_, EntityError>(())
                })
            };
            if let Some(tx) = tx {
                tx.on_rollback(undo_inserts(Arc::clone(&handle), inserted));
            }
            result?;
        }

        debug!(table = self.entity_type.name(), rows = stored.len(), "memory provider bulk insert");
        Ok(stored)
    }

    async fn bulk_update(
        &self,
        records: Vec<EntityRecord>,
        batch_size: usize,
        tx: Option<&TransactionContext>,
    ) -> Result<Vec<EntityRecord>> {
        let handle = self.writable_table()?;

        // Every target must exist before the first batch is written.
        {
            let table = handle.lock()?;
            for record in &records {
                match &record.id {
                    Some(id) if table.rows.contains_key(id) => {}
                    Some(id) => return Err(zero_rows(table.name(), "Updating", id)),
                    None => {
                        return Err(EntityError::Provider(format!(
                            "Cannot update '{}': the record has no ID",
                            table.name()
                        )));
                    }
                }
            }
        }

        let mut stored = Vec::with_capacity(records.len());
        for batch in records.chunks(batch_size.max(1)) {
            let mut replaced = Vec::with_capacity(batch.len());
            let result = {
                let mut table = handle.lock()?;
                batch.iter().try_for_each(|record| {
                    let (row, previous) = table.update(record.clone())?;
                    replaced.push(previous);
                    stored.push(row);
                    Ok::<_, EntityError>(())
                })
            };
            if let Some(tx) = tx {
                tx.on_rollback(restore_rows(Arc::clone(&handle), replaced));
            }
            result?;
        }

        debug!(table = self.entity_type.name(), rows = stored.len(), "memory provider bulk update");
        Ok(stored)
    }
}

pub struct MemoryDataAccess {
    store: Arc<MemoryStore>,
    connection_string: String,
}

impl MemoryDataAccess {
    pub fn new(store: Arc<MemoryStore>, connection_string: &str) -> Self {
        Self {
            store,
            connection_string: connection_string.to_string(),
        }
    }
}

#[async_trait]
impl DataAccess for MemoryDataAccess {
    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    async fn tables(&self) -> Vec<String> {
        self.store.table_names()
    }

    async fn scan(&self, table: &str) -> Result<Vec<EntityRecord>> {
        let handle = self
            .store
            .existing_table(table)
            .ok_or_else(|| EntityError::NotFound("Table".to_string(), table.to_string()))?;
        let rows = handle.lock()?.rows.values().cloned().collect();
        Ok(rows)
    }

    async fn truncate(&self, table: &str) -> Result<usize> {
        let Some(handle) = self.store.existing_table(table) else {
            return Ok(0);
        };
        let mut table = handle.lock()?;
        let removed = table.rows.len();
        table.rows.clear();
        Ok(removed)
    }
}

/// Factory behind the built-in `"memory"` factory type.
pub struct MemoryProviderFactory {
    info: DataProviderFactoryInfo,
    connection_string: String,
    store: Arc<MemoryStore>,
    validation_bypassing: bool,
}

impl MemoryProviderFactory {
    pub fn new(info: DataProviderFactoryInfo, connection_string: &str, store: Arc<MemoryStore>) -> Self {
        Self {
            info,
            connection_string: connection_string.to_string(),
            store,
            validation_bypassing: true,
        }
    }

    pub fn with_validation_bypassing(mut self, supported: bool) -> Self {
        self.validation_bypassing = supported;
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

impl DataProviderFactory for MemoryProviderFactory {
    fn info(&self) -> &DataProviderFactoryInfo {
        &self.info
    }

    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    fn supports_polymorphism(&self) -> bool {
        true
    }

    fn get_provider(&self, entity_type: &'static EntityType) -> Result<Arc<dyn DataProvider>> {
        Ok(Arc::new(
            MemoryDataProvider::new(entity_type, Arc::clone(&self.store), &self.connection_string)
                .with_validation_bypassing(self.validation_bypassing),
        ))
    }

    fn get_access(&self) -> Arc<dyn DataAccess> {
        Arc::new(MemoryDataAccess::new(Arc::clone(&self.store), &self.connection_string))
    }
}
