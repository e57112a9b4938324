use super::{Database, finish_scope};
use crate::core::{EntityError, Result};
use crate::entity::Entity;
use crate::transaction::ScopeOption;
use tracing::debug;

impl Database {
    /// Applies `action` to a persisted entity and saves it.
    ///
    /// A stale instance is reloaded first when a transaction is open. An
    /// immutable instance is cloned and the clone is changed and saved;
    /// outside a transaction the same action is then applied to `item` so
    /// it reflects the saved state. Returns the saved instance.
    pub async fn update<T, F>(&self, item: &mut T, action: F) -> Result<T>
    where
        T: Entity,
        F: Fn(&mut T),
    {
        if item.is_new() {
            return Err(EntityError::InvalidOperation(format!(
                "Database.update() can only be used for persisted {} instances. Use save() for new ones.",
                T::entity_type()
            )));
        }

        if self.any_open_transaction() && (item.header().is_stale() || item.header().is_cloned_from_stale()) {
            debug!(entity = %T::entity_type(), id = ?item.id(), "reloading stale instance before update");
            let fresh = self.reload(item).await?;
            *item = fresh;
        }

        if item.header().is_immutable() {
            let mut clone = item.clone();
            action(&mut clone);
            self.save(&mut clone).await?;
            if !self.any_open_transaction() {
                action(item);
            }
            Ok(clone)
        } else {
            action(item);
            self.save(item).await?;
            Ok(item.clone())
        }
    }

    /// Updates every item in one transaction. Returns the updated instances
    /// in input order.
    pub async fn update_all<T, F>(&self, items: &mut [T], action: F) -> Result<Vec<T>>
    where
        T: Entity,
        F: Fn(&mut T),
    {
        let scope = self.create_transaction_scope(ScopeOption::Required).await?;
        let scoped = self.in_scope(&scope);
        let result = async {
            let mut updated = Vec::with_capacity(items.len());
            for item in items.iter_mut() {
                updated.push(scoped.update(item, &action).await?);
            }
            Ok::<_, EntityError>(updated)
        }
        .await;
        finish_scope(scope, result).await
    }
}
