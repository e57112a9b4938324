use crate::core::EntityType;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// Known entity types and module references.
///
/// Replaces runtime type scanning: every type that should take part in
/// polymorphic reads is registered up front (or on first provider lookup).
/// Possible-type sets are cached per base type and dropped whenever the
/// catalog changes.
#[derive(Debug, Default)]
pub struct TypeCatalog {
    types: RwLock<Vec<&'static EntityType>>,
    /// module -> modules it references
    modules: RwLock<HashMap<String, HashSet<String>>>,
    possible_types: RwLock<HashMap<String, Arc<Vec<&'static EntityType>>>>,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the type was already known.
    pub fn register_type(&self, entity_type: &'static EntityType) -> bool {
        {
            let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
            if types.iter().any(|known| *known == entity_type) {
                return false;
            }
            types.push(entity_type);
        }
        self.invalidate();
        true
    }

    /// Declares which modules `module` references.
    pub fn register_module(&self, module: &str, references: &[&str]) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(module.to_string())
            .or_default()
            .extend(references.iter().map(|r| r.to_string()));
        self.invalidate();
    }

    /// A module always references itself.
    pub fn references(&self, module: &str, target: &str) -> bool {
        module == target
            || self
                .modules
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(module)
                .is_some_and(|refs| refs.contains(target))
    }

    /// Looks a type up by name or by `module.name`.
    pub fn find(&self, name: &str) -> Option<&'static EntityType> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .find(|t| t.name() == name || t.to_string() == name)
    }

    pub fn types(&self) -> Vec<&'static EntityType> {
        self.types.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Concrete types that satisfy `base`, including `base` itself when it is concrete.
    pub fn possible_types(&self, base: &EntityType) -> Arc<Vec<&'static EntityType>> {
        let key = base.to_string();
        if let Some(cached) = self
            .possible_types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Arc::clone(cached);
        }

        let found: Arc<Vec<&'static EntityType>> = Arc::new(
            self.types
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .copied()
                .filter(|t| !t.is_abstract() && t.is_subtype_of(base.name()))
                .collect(),
        );
        self.possible_types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&found));
        found
    }

    /// Drops cached possible-type sets.
    pub fn invalidate(&self) {
        self.possible_types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
