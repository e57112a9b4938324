use crate::core::{EntityError, Result};
use std::collections::HashMap;
use std::fmt;

/// What a provider factory serves: one entity type, or every type of a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FactoryTarget {
    Type(String),
    Module(String),
}

impl fmt::Display for FactoryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactoryTarget::Type(name) => write!(f, "type {}", name),
            FactoryTarget::Module(name) => write!(f, "module {}", name),
        }
    }
}

/// Registration entry for a data provider factory.
///
/// `factory_type` names a constructor registered with
/// [`ProviderRegistry::register_factory_constructor`](super::ProviderRegistry::register_factory_constructor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataProviderFactoryInfo {
    pub target: FactoryTarget,
    pub factory_type: String,
    pub connection_string: Option<String>,
    pub connection_string_key: Option<String>,
    pub mapping: Option<String>,
}

impl DataProviderFactoryInfo {
    pub fn new(target: FactoryTarget, factory_type: &str) -> Self {
        Self {
            target,
            factory_type: factory_type.to_string(),
            connection_string: None,
            connection_string_key: None,
            mapping: None,
        }
    }

    pub fn for_type(type_name: &str, factory_type: &str) -> Self {
        Self::new(FactoryTarget::Type(type_name.to_string()), factory_type)
    }

    pub fn for_module(module: &str, factory_type: &str) -> Self {
        Self::new(FactoryTarget::Module(module.to_string()), factory_type)
    }

    pub fn with_connection_string(mut self, connection_string: &str) -> Self {
        self.connection_string = Some(connection_string.to_string());
        self
    }

    pub fn with_connection_string_key(mut self, key: &str) -> Self {
        self.connection_string_key = Some(key.to_string());
        self
    }

    pub fn with_mapping(mut self, mapping: &str) -> Self {
        self.mapping = Some(mapping.to_string());
        self
    }

    /// Returns the explicit connection string, else the one named by the
    /// key, else an empty string.
    pub fn resolve_connection_string(&self, named: &HashMap<String, String>) -> Result<String> {
        if let Some(value) = &self.connection_string {
            return Ok(value.clone());
        }
        match &self.connection_string_key {
            Some(key) => named.get(key).cloned().ok_or_else(|| {
                EntityError::Configuration(format!(
                    "Connection string '{}' used by the provider factory for {} is not defined",
                    key, self.target
                ))
            }),
            None => Ok(String::new()),
        }
    }
}
