// ============================================================================
// Provider Registry
// ============================================================================
//
// Resolution order for an entity type:
//   1. a factory registered for the type itself
//   2. the factory registered for the type's module
//
// Resolved providers are cached per type. Registering a factory drops the
// cached providers and the catalog's possible-type sets, since a new
// polymorphic factory changes which providers serve a base type.
//
// ============================================================================

use super::{
    DataAccess, DataProvider, DataProviderFactory, DataProviderFactoryInfo, FactoryTarget, MemoryProviderFactory,
    MemoryStore, TypeCatalog,
};
use crate::core::{EntityError, EntityType, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

/// Builds a factory from its registration entry and resolved connection string.
pub type FactoryConstructor =
    Arc<dyn Fn(&DataProviderFactoryInfo, &str) -> Result<Arc<dyn DataProviderFactory>> + Send + Sync>;

pub const MEMORY_FACTORY_TYPE: &str = "memory";

#[derive(Default)]
struct Factories {
    by_type: HashMap<String, Arc<dyn DataProviderFactory>>,
    by_module: HashMap<String, Arc<dyn DataProviderFactory>>,
}

pub struct ProviderRegistry {
    factories: RwLock<Factories>,
    constructors: RwLock<HashMap<String, FactoryConstructor>>,
    providers: RwLock<HashMap<String, Arc<dyn DataProvider>>>,
    connection_strings: RwLock<HashMap<String, String>>,
    catalog: TypeCatalog,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(Factories::default()),
            constructors: RwLock::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
            connection_strings: RwLock::new(HashMap::new()),
            catalog: TypeCatalog::new(),
        };
        registry.register_factory_constructor(MEMORY_FACTORY_TYPE, memory_constructor());
        registry
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    /// Named connection strings used to resolve `connection_string_key`s.
    pub fn set_connection_strings(&self, connection_strings: HashMap<String, String>) {
        *self
            .connection_strings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = connection_strings;
    }

    pub fn register_factory_constructor(&self, factory_type: &str, constructor: FactoryConstructor) {
        self.constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(factory_type.to_string(), constructor);
    }

    /// Builds the factory named by `info.factory_type` and registers it for
    /// the target type or module, replacing any earlier registration.
    pub fn register_data_provider_factory(&self, info: DataProviderFactoryInfo) -> Result<()> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&info.factory_type)
            .cloned()
            .ok_or_else(|| {
                EntityError::Configuration(format!(
                    "Could not find the data provider factory type '{}'",
                    info.factory_type
                ))
            })?;

        let connection_string = {
            let named = self.connection_strings.read().unwrap_or_else(PoisonError::into_inner);
            info.resolve_connection_string(&named)?
        };
        let factory = constructor(&info, &connection_string)?;
        self.register_factory(factory);
        Ok(())
    }

    /// Registers an already built factory under the target of its info.
    pub fn register_factory(&self, factory: Arc<dyn DataProviderFactory>) {
        let target = factory.info().target.clone();
        {
            let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
            match &target {
                FactoryTarget::Type(name) => factories.by_type.insert(name.clone(), factory),
                FactoryTarget::Module(name) => factories.by_module.insert(name.clone(), factory),
            };
            self.providers.write().unwrap_or_else(PoisonError::into_inner).clear();
            self.catalog.invalidate();
        }
        info!(target = %target, "registered data provider factory");
    }

    fn factory_for(&self, entity_type: &EntityType) -> Option<Arc<dyn DataProviderFactory>> {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        factories
            .by_type
            .get(entity_type.name())
            .or_else(|| factories.by_type.get(&entity_type.to_string()))
            .or_else(|| factories.by_module.get(entity_type.module()))
            .cloned()
    }

    fn type_factory(&self, entity_type: &EntityType) -> Option<Arc<dyn DataProviderFactory>> {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        factories
            .by_type
            .get(entity_type.name())
            .or_else(|| factories.by_type.get(&entity_type.to_string()))
            .cloned()
    }

    /// Resolves the provider of a type, type-specific factory first.
    pub fn get_provider(&self, entity_type: &'static EntityType) -> Result<Arc<dyn DataProvider>> {
        let key = entity_type.to_string();
        if let Some(provider) = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(provider));
        }

        let factory = self.factory_for(entity_type).ok_or_else(|| {
            EntityError::InvalidOperation(format!(
                "No data provider factory is registered for {} or its module '{}'",
                entity_type,
                entity_type.module()
            ))
        })?;

        let provider = factory.get_provider(entity_type)?;
        self.catalog.register_type(entity_type);
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&provider));
        debug!(entity = %entity_type, connection = factory.connection_string(), "resolved data provider");
        Ok(provider)
    }

    /// Direct access to the store of the factory using `connection_string`.
    pub fn get_access(&self, connection_string: &str) -> Result<Arc<dyn DataAccess>> {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        factories
            .by_type
            .values()
            .chain(factories.by_module.values())
            .find(|f| f.connection_string() == connection_string)
            .map(|f| f.get_access())
            .ok_or_else(|| {
                EntityError::Configuration(format!(
                    "No data provider factory uses the connection string '{}'",
                    connection_string
                ))
            })
    }

    /// Providers that together serve every record of `base_type`.
    ///
    /// Combines the base-type providers of polymorphic module factories whose
    /// module references the base type's module with the providers of
    /// type-specific factories for each concrete subtype in the catalog.
    pub fn resolve_data_providers(&self, base_type: &'static EntityType) -> Result<Vec<Arc<dyn DataProvider>>> {
        self.catalog.register_type(base_type);

        let polymorphic: Vec<Arc<dyn DataProviderFactory>> = {
            let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
            factories
                .by_module
                .iter()
                .filter(|(module, f)| f.supports_polymorphism() && self.catalog.references(module, base_type.module()))
                .map(|(_, f)| Arc::clone(f))
                .collect()
        };

        let mut result: Vec<Arc<dyn DataProvider>> = Vec::new();
        for factory in &polymorphic {
            push_distinct(&mut result, factory.get_provider(base_type)?);
        }

        for &subtype in self.catalog.possible_types(base_type).iter() {
            if self.type_factory(subtype).is_some() {
                push_distinct(&mut result, self.get_provider(subtype)?);
            }
        }

        if result.is_empty() {
            return Err(EntityError::InvalidOperation(format!(
                "No data provider can serve {}: no polymorphic factory references module '{}' and no subtype has its own factory",
                base_type,
                base_type.module()
            )));
        }
        Ok(result)
    }
}

fn push_distinct(providers: &mut Vec<Arc<dyn DataProvider>>, provider: Arc<dyn DataProvider>) {
    let duplicate = providers.iter().any(|p| {
        Arc::ptr_eq(p, &provider)
            || (p.entity_type() == provider.entity_type() && p.connection_string() == provider.connection_string())
    });
    if !duplicate {
        providers.push(provider);
    }
}

/// The built-in constructor. Factories with the same connection string share one store.
fn memory_constructor() -> FactoryConstructor {
    let stores: Mutex<HashMap<String, Arc<MemoryStore>>> = Mutex::new(HashMap::new());
    Arc::new(move |info: &DataProviderFactoryInfo, connection_string: &str| -> Result<Arc<dyn DataProviderFactory>> {
        let store = {
            let mut stores = stores.lock()?;
            Arc::clone(
                stores
                    .entry(connection_string.to_string())
                    .or_insert_with(|| Arc::new(MemoryStore::new(connection_string))),
            )
        };
        let bypass = info
            .mapping
            .as_deref()
            .map(|mapping| !mapping.contains("no-validation-bypass"))
            .unwrap_or(true);
        Ok(Arc::new(
            MemoryProviderFactory::new(info.clone(), connection_string, store).with_validation_bypassing(bypass),
        ))
    })
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ProviderRegistry")
            .field("type_factories", &factories.by_type.keys().collect::<Vec<_>>())
            .field("module_factories", &factories.by_module.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EntityRecord, Query};
    use serde_json::json;

    static PARTY: EntityType = EntityType::new("Party", "crm").abstract_type();
    static PERSON: EntityType = EntityType::new("Person", "crm")
        .with_bases(&["Party"])
        .id_strategy(crate::core::IdStrategy::Int);
    static SUPPLIER: EntityType = EntityType::new("Supplier", "purchasing")
        .with_bases(&["Party"])
        .id_strategy(crate::core::IdStrategy::Int);

    #[test]
    fn test_unknown_factory_type_is_configuration_error() {
        let registry = ProviderRegistry::new();
        let err = registry
            .register_data_provider_factory(DataProviderFactoryInfo::for_module("crm", "oracle"))
            .unwrap_err();
        assert!(matches!(err, EntityError::Configuration(_)));
    }

    #[test]
    fn test_type_factory_overrides_module_factory() {
        let registry = ProviderRegistry::new();
        registry
            .register_data_provider_factory(
                DataProviderFactoryInfo::for_module("crm", "memory").with_connection_string("memory://crm"),
            )
            .unwrap();
        assert_eq!(registry.get_provider(&PERSON).unwrap().connection_string(), "memory://crm");

        registry
            .register_data_provider_factory(
                DataProviderFactoryInfo::for_type("Person", "memory").with_connection_string("memory://people"),
            )
            .unwrap();
        assert_eq!(registry.get_provider(&PERSON).unwrap().connection_string(), "memory://people");
    }

    #[test]
    fn test_missing_factory_is_invalid_operation() {
        let registry = ProviderRegistry::new();
        assert!(matches!(registry.get_provider(&PERSON), Err(EntityError::InvalidOperation(_))));
    }

    #[test]
    fn test_resolved_provider_is_cached() {
        let registry = ProviderRegistry::new();
        registry
            .register_data_provider_factory(DataProviderFactoryInfo::for_module("crm", "memory"))
            .unwrap();
        let first = registry.get_provider(&PERSON).unwrap();
        let second = registry.get_provider(&PERSON).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_get_access_by_connection_string() {
        let registry = ProviderRegistry::new();
        let mut named = HashMap::new();
        named.insert("Crm".to_string(), "memory://crm".to_string());
        registry.set_connection_strings(named);
        registry
            .register_data_provider_factory(DataProviderFactoryInfo::for_module("crm", "memory").with_connection_string_key("Crm"))
            .unwrap();

        assert_eq!(registry.get_access("memory://crm").unwrap().connection_string(), "memory://crm");
        assert!(matches!(registry.get_access("memory://other"), Err(EntityError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_resolve_data_providers_fans_out() {
        let registry = ProviderRegistry::new();
        registry
            .register_data_provider_factory(DataProviderFactoryInfo::for_module("crm", "memory").with_connection_string("memory://crm"))
            .unwrap();
        registry
            .register_data_provider_factory(
                DataProviderFactoryInfo::for_type("Supplier", "memory").with_connection_string("memory://purchasing"),
            )
            .unwrap();
        registry.catalog().register_type(&PERSON);
        registry.catalog().register_type(&SUPPLIER);

        registry
            .get_provider(&PERSON)
            .unwrap()
            .save(EntityRecord::new("Person", None, json!({ "name": "Ann" })), None)
            .await
            .unwrap();
        registry
            .get_provider(&SUPPLIER)
            .unwrap()
            .save(EntityRecord::new("Supplier", None, json!({ "name": "Acme" })), None)
            .await
            .unwrap();

        let providers = registry.resolve_data_providers(&PARTY).unwrap();
        assert_eq!(providers.len(), 2);

        let mut total = 0;
        for provider in providers {
            total += provider.count(&Query::new(), None).await.unwrap();
        }
        assert_eq!(total, 2);
    }
}
