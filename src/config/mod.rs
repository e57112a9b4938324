use crate::core::{EntityError, Result};
use crate::provider::{DataProviderFactoryInfo, FactoryTarget};
use crate::transaction::IsolationLevel;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const KEY_ENFORCE_SAVE_TRANSACTION: &str = "Database:Save.Enforce.Transaction";
pub const KEY_ISOLATION_LEVEL: &str = "Default.Transaction.IsolationLevel";
pub const KEY_TRANSACTION_SCOPE_TYPE: &str = "Default.TransactionScope.Type";
pub const KEY_LOG_APPLICATION_EVENTS: &str = "Log.Record:Application:Events";
pub const KEY_CACHE_CAPACITY: &str = "Database:Cache.Capacity";

pub const DEFAULT_SCOPE_TYPE: &str = "default";

lazy_static! {
    static ref PROVIDER_KEY: Regex = Regex::new(
        r"^Database:Providers:(\d+):(Type|Module|ProviderFactoryType|ConnectionString|ConnectionStringKey|Mapping)$"
    )
    .expect("provider key pattern is valid");
    static ref CONNECTION_STRING_KEY: Regex =
        Regex::new(r"^ConnectionStrings:(.+)$").expect("connection string pattern is valid");
}

/// Save engine configuration
///
/// Mirrors the flat settings keys of the hosting application
/// (`Database:Save.Enforce.Transaction`, `Default.Transaction.IsolationLevel`, ...)
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Wrap every save that is not already inside a transaction in its own scope
    pub enforce_save_transaction: bool,

    /// Isolation level of newly created transaction scopes
    pub isolation_level: IsolationLevel,

    /// Name of the transaction backend used for new scopes
    pub transaction_scope_type: String,

    /// Record inserts, updates and deletes in the application-event log
    pub log_application_events: bool,

    /// Maximum number of records held by the default entity cache
    pub cache_capacity: usize,

    /// Named connection strings
    pub connection_strings: HashMap<String, String>,

    /// Data provider factories registered at startup
    pub providers: Vec<DataProviderFactoryInfo>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self {
            enforce_save_transaction: false,
            isolation_level: IsolationLevel::Serializable,
            transaction_scope_type: DEFAULT_SCOPE_TYPE.to_string(),
            log_application_events: true,
            cache_capacity: 10_000,
            connection_strings: HashMap::new(),
            providers: Vec::new(),
        }
    }

    pub fn enforce_save_transaction(mut self, enforce: bool) -> Self {
        self.enforce_save_transaction = enforce;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn transaction_scope_type(mut self, scope_type: &str) -> Self {
        self.transaction_scope_type = scope_type.to_string();
        self
    }

    pub fn log_application_events(mut self, enabled: bool) -> Self {
        self.log_application_events = enabled;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn connection_string(mut self, name: &str, value: &str) -> Self {
        self.connection_strings.insert(name.to_string(), value.to_string());
        self
    }

    pub fn provider(mut self, info: DataProviderFactoryInfo) -> Self {
        self.providers.push(info);
        self
    }

    /// Resolves a connection string by key.
    pub fn get_connection_string(&self, key: &str) -> Result<&str> {
        self.connection_strings
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| EntityError::Configuration(format!("Connection string '{}' is not defined", key)))
    }

    /// Builds a configuration from flat `key → value` settings.
    ///
    /// Provider factories are read from `Database:Providers:<n>:<field>` keys
    /// and connection strings from `ConnectionStrings:<name>`.
    ///
    /// ```
    /// # use std::collections::HashMap;
    /// # use olive_entities::config::DatabaseConfig;
    /// let mut settings = HashMap::new();
    /// settings.insert("Database:Save.Enforce.Transaction".to_string(), "true".to_string());
    /// settings.insert("Database:Providers:0:Module".to_string(), "hr".to_string());
    /// settings.insert("Database:Providers:0:ProviderFactoryType".to_string(), "memory".to_string());
    ///
    /// let config = DatabaseConfig::from_settings(&settings).unwrap();
    /// assert!(config.enforce_save_transaction);
    /// assert_eq!(config.providers.len(), 1);
    /// ```
    pub fn from_settings(settings: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::new();

        if let Some(value) = settings.get(KEY_ENFORCE_SAVE_TRANSACTION) {
            config.enforce_save_transaction = parse_bool(KEY_ENFORCE_SAVE_TRANSACTION, value)?;
        }
        if let Some(value) = settings.get(KEY_ISOLATION_LEVEL) {
            config.isolation_level = value.parse()?;
        }
        if let Some(value) = settings.get(KEY_TRANSACTION_SCOPE_TYPE) {
            config.transaction_scope_type = value.trim().to_string();
        }
        if let Some(value) = settings.get(KEY_LOG_APPLICATION_EVENTS) {
            config.log_application_events = parse_bool(KEY_LOG_APPLICATION_EVENTS, value)?;
        }
        if let Some(value) = settings.get(KEY_CACHE_CAPACITY) {
            config.cache_capacity = value.trim().parse().map_err(|_| {
                EntityError::Configuration(format!("'{}' must be a positive integer", KEY_CACHE_CAPACITY))
            })?;
        }

        let mut provider_fields: BTreeMap<usize, HashMap<&str, &str>> = BTreeMap::new();
        for (key, value) in settings {
            if let Some(captures) = CONNECTION_STRING_KEY.captures(key) {
                config
                    .connection_strings
                    .insert(captures[1].to_string(), value.clone());
            } else if let Some(captures) = PROVIDER_KEY.captures(key) {
                let index: usize = captures[1].parse().map_err(|_| {
                    EntityError::Configuration(format!("Invalid provider index in '{}'", key))
                })?;
                let field = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
                provider_fields.entry(index).or_default().insert(field, value.as_str());
            }
        }

        for (index, fields) in provider_fields {
            config.providers.push(provider_from_fields(index, &fields)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads flat settings from a JSON object file (`{"key": value, ...}`).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EntityError::Configuration(format!("Cannot read '{}': {}", path.display(), e))
        })?;
        let json: serde_json::Value = serde_json::from_str(&text)?;
        let object = json.as_object().ok_or_else(|| {
            EntityError::Configuration(format!("'{}' must contain a JSON object", path.display()))
        })?;

        let settings = object
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), text)
            })
            .collect();
        Self::from_settings(&settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.transaction_scope_type.is_empty() {
            return Err(EntityError::Configuration(format!(
                "'{}' cannot be empty",
                KEY_TRANSACTION_SCOPE_TYPE
            )));
        }

        if self.cache_capacity == 0 {
            return Err(EntityError::Configuration("cache capacity must be > 0".into()));
        }

        for info in &self.providers {
            if let Some(key) = &info.connection_string_key {
                self.get_connection_string(key)?;
            }
        }

        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(EntityError::Configuration(format!(
            "'{}' must be a boolean, got '{}'",
            key, value
        ))),
    }
}

fn provider_from_fields(index: usize, fields: &HashMap<&str, &str>) -> Result<DataProviderFactoryInfo> {
    let target = match (fields.get("Type"), fields.get("Module")) {
        (Some(type_name), None) => FactoryTarget::Type(type_name.to_string()),
        (None, Some(module)) => FactoryTarget::Module(module.to_string()),
        (Some(_), Some(_)) => {
            return Err(EntityError::Configuration(format!(
                "Provider {} must target either a type or a module, not both",
                index
            )));
        }
        (None, None) => {
            return Err(EntityError::Configuration(format!(
                "Provider {} must target a type or a module",
                index
            )));
        }
    };

    let factory_type = fields.get("ProviderFactoryType").ok_or_else(|| {
        EntityError::Configuration(format!("Provider {} has no ProviderFactoryType", index))
    })?;

    let mut info = DataProviderFactoryInfo::new(target, factory_type);
    if let Some(connection_string) = fields.get("ConnectionString") {
        info = info.with_connection_string(connection_string);
    }
    if let Some(key) = fields.get("ConnectionStringKey") {
        info = info.with_connection_string_key(key);
    }
    if let Some(mapping) = fields.get("Mapping") {
        info = info.with_mapping(mapping);
    }
    Ok(info)
}
