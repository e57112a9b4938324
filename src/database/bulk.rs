use super::{Database, finish_scope};
use crate::core::{EntityError, EntityId, EntityRecord, EntityType, IdStrategy, Result, SaveBehaviour};
use crate::entity::{DynEntity, ValidationErrors};
use crate::provider::DataProvider;
use crate::transaction::ScopeOption;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkMode {
    Insert,
    Update,
}

impl BulkMode {
    fn name(self) -> &'static str {
        match self {
            BulkMode::Insert => "bulk insert",
            BulkMode::Update => "bulk update",
        }
    }
}

/// Items of one concrete type, by position in the caller's slice.
struct BulkGroup {
    entity_type: &'static EntityType,
    provider: Arc<dyn DataProvider>,
    positions: Vec<usize>,
}

impl Database {
    /// Inserts new entities through the provider's batched insert.
    pub async fn bulk_insert<T: DynEntity>(
        &self,
        items: &mut [T],
        batch_size: usize,
        behaviour: SaveBehaviour,
    ) -> Result<()> {
        let mut items: Vec<&mut dyn DynEntity> = items.iter_mut().map(|item| item as &mut dyn DynEntity).collect();
        self.bulk_insert_mixed(&mut items, batch_size, behaviour).await
    }

    pub async fn bulk_update<T: DynEntity>(
        &self,
        items: &mut [T],
        batch_size: usize,
        behaviour: SaveBehaviour,
    ) -> Result<()> {
        let mut items: Vec<&mut dyn DynEntity> = items.iter_mut().map(|item| item as &mut dyn DynEntity).collect();
        self.bulk_update_mixed(&mut items, batch_size, behaviour).await
    }

    /// Inserts entities of several types. Each concrete type is written by
    /// its own provider, in order of first appearance.
    pub async fn bulk_insert_mixed(
        &self,
        items: &mut [&mut dyn DynEntity],
        batch_size: usize,
        behaviour: SaveBehaviour,
    ) -> Result<()> {
        self.run_bulk(items, batch_size, behaviour, BulkMode::Insert).await
    }

    pub async fn bulk_update_mixed(
        &self,
        items: &mut [&mut dyn DynEntity],
        batch_size: usize,
        behaviour: SaveBehaviour,
    ) -> Result<()> {
        self.run_bulk(items, batch_size, behaviour, BulkMode::Update).await
    }

    async fn run_bulk(
        &self,
        items: &mut [&mut dyn DynEntity],
        batch_size: usize,
        behaviour: SaveBehaviour,
        mode: BulkMode,
    ) -> Result<()> {
        if batch_size == 0 {
            return Err(EntityError::InvalidOperation(format!(
                "The batch size of a {} must be at least 1",
                mode.name()
            )));
        }
        if items.is_empty() {
            return Ok(());
        }

        check_bulk_preconditions(items, mode)?;
        let groups = self.group_by_type(items)?;

        if behaviour.contains(SaveBehaviour::BYPASS_VALIDATION) {
            if let Some(group) = groups.iter().find(|g| !g.provider.support_validation_bypassing()) {
                return Err(EntityError::Capability(format!(
                    "The data provider of {} does not support bypassing validation",
                    group.entity_type
                )));
            }
        } else {
            let mut errors = ValidationErrors::new();
            for item in items.iter_mut() {
                if let Err(own) = item.run_validation(self.events()) {
                    errors.merge(own);
                }
            }
            errors.into_result()?;
        }

        if mode == BulkMode::Insert {
            for item in items.iter_mut() {
                if item.entity_header().id().is_none() && item.descriptor().strategy() == IdStrategy::Guid {
                    item.entity_header_mut().set_id(EntityId::new_guid());
                }
            }
        }

        debug!(mode = mode.name(), items = items.len(), groups = groups.len(), batch_size, "running bulk write");

        // Scoped even without an open transaction: a failure undoes earlier batches.
        let scope = self.create_transaction_scope(ScopeOption::Required).await?;
        let result = self.in_scope(&scope).write_groups(items, &groups, batch_size, mode).await;
        let written = finish_scope(scope, result).await;

        let stored = match written {
            Ok(stored) => stored,
            Err(err) => {
                warn!(mode = mode.name(), error = %err, "bulk write failed, refreshing the entity cache");
                self.refresh();
                return Err(err);
            }
        };

        for (position, record) in stored {
            let Some(id) = record.id else { continue };
            let item = &mut items[position];
            self.record_row_version(item.descriptor().name(), &id, record.row_version);
            let header = item.entity_header_mut();
            header.set_row_version(record.row_version);
            if mode == BulkMode::Insert {
                header.set_saved(id);
            }
        }
        for group in &groups {
            self.invalidate_type(group.entity_type.name());
        }
        Ok(())
    }

    /// Groups items by concrete type and resolves every provider before
    /// anything is written.
    fn group_by_type(&self, items: &[&mut dyn DynEntity]) -> Result<Vec<BulkGroup>> {
        let mut groups: Vec<BulkGroup> = Vec::new();
        for (position, item) in items.iter().enumerate() {
            let entity_type = item.descriptor();
            match groups.iter_mut().find(|g| g.entity_type == entity_type) {
                Some(group) => group.positions.push(position),
                None => groups.push(BulkGroup {
                    entity_type,
                    provider: self.providers().get_provider(entity_type)?,
                    positions: vec![position],
                }),
            }
        }
        Ok(groups)
    }

    /// Writes each group through its provider. Returns the stored record of
    /// every item with its position.
    async fn write_groups(
        &self,
        items: &[&mut dyn DynEntity],
        groups: &[BulkGroup],
        batch_size: usize,
        mode: BulkMode,
    ) -> Result<Vec<(usize, EntityRecord)>> {
        let mut stored_all = Vec::with_capacity(items.len());
        for group in groups {
            let records = group
                .positions
                .iter()
                .map(|&position| items[position].record())
                .collect::<Result<Vec<_>>>()?;

            let tx = self.open_transaction();
            let stored = match mode {
                BulkMode::Insert => group.provider.bulk_insert(records, batch_size, tx).await?,
                BulkMode::Update => group.provider.bulk_update(records, batch_size, tx).await?,
            };

            if stored.len() != group.positions.len() || stored.iter().any(|record| record.id.is_none()) {
                return Err(EntityError::Provider(format!(
                    "The data provider of {} returned {} records for a {} of {} items, some without an ID",
                    group.entity_type,
                    stored.len(),
                    mode.name(),
                    group.positions.len()
                )));
            }

            debug!(entity = %group.entity_type, count = stored.len(), mode = mode.name(), "bulk group written");
            stored_all.extend(group.positions.iter().copied().zip(stored));
        }
        Ok(stored_all)
    }
}

fn check_bulk_preconditions(items: &[&mut dyn DynEntity], mode: BulkMode) -> Result<()> {
    for item in items {
        let header = item.entity_header();
        let entity_type = item.descriptor();
        match mode {
            BulkMode::Insert if !header.is_new() => {
                return Err(EntityError::AlreadySaved(
                    entity_type.to_string(),
                    header.id().map(ToString::to_string).unwrap_or_default(),
                ));
            }
            BulkMode::Update if header.is_new() => {
                return Err(EntityError::InvalidOperation(format!(
                    "A bulk update cannot write a new {} instance. Use bulk_insert for new ones.",
                    entity_type
                )));
            }
            BulkMode::Update if header.is_immutable() => {
                return Err(EntityError::ImmutableEntity(entity_type.to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}
