//! Schema-validated configuration store.
//!
//! A [`ConfigManager`] holds a JSON object of settings. Once a [`ConfigSchema`]
//! is set, every write is validated against it first and applied all-or-nothing:
//! a single failing field rejects the whole call and the error lists every
//! failing field. Watchers registered per key fire only when that key's value
//! actually changes (deep equality).

use crate::error::{ConfigError, FieldError};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

lazy_static! {
    static ref EMAIL_PATTERN: Regex =
        Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid");
}

/// Predicate deciding whether a value satisfies a named type.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Callback invoked with `(new_value, old_value)`. Absent values are `Null`.
pub type Watcher = Box<dyn Fn(&Value, &Value) + Send + Sync>;

/// Handle returned by [`ConfigManager::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Named type validators. Shared by the config manager and by plugins that
/// validate user input against the same type names.
#[derive(Clone)]
pub struct ValidatorSet {
    validators: HashMap<String, Validator>,
}

impl ValidatorSet {
    /// Creates a set holding the built-in validators.
    pub fn with_defaults() -> Self {
        let mut set = Self {
            validators: HashMap::new(),
        };
        set.add("string", |v| v.is_string());
        set.add("number", |v| v.is_number());
        set.add("boolean", |v| v.is_boolean());
        set.add("object", |v| v.is_object());
        set.add("array", |v| v.is_array());
        set.add("positive", |v| v.as_f64().map(|n| n > 0.0).unwrap_or(false));
        set.add("integer", is_integer);
        set.add("url", |v| {
            v.as_str()
                .map(|s| url::Url::parse(s).is_ok())
                .unwrap_or(false)
        });
        set.add("email", |v| {
            v.as_str().map(|s| EMAIL_PATTERN.is_match(s)).unwrap_or(false)
        });
        set
    }

    /// Registers or replaces a named validator.
    pub fn add<F>(&mut self, type_name: &str, predicate: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validators
            .insert(type_name.to_string(), Arc::new(predicate));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.validators.contains_key(type_name)
    }

    /// Checks a value against a named type. Unknown types are an error.
    pub fn check(&self, type_name: &str, value: &Value) -> Result<bool, ConfigError> {
        self.validators
            .get(type_name)
            .map(|validator| validator(value))
            .ok_or_else(|| ConfigError::UnknownValidator(type_name.to_string()))
    }
}

impl Default for ValidatorSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn is_integer(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            n.is_i64() || n.is_u64() || n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
        }
        _ => false,
    }
}

fn check_field(validators: &ValidatorSet, field: &FieldSchema, value: &Value) -> Result<(), String> {
    match validators.check(&field.field_type, value) {
        Ok(true) => {}
        Ok(false) => return Err(format!("expected {}, got {}", field.field_type, value)),
        Err(e) => return Err(e.to_string()),
    }
    if let Some(validator) = &field.validator {
        if !validator(value) {
            return Err(format!("custom validation failed for {value}"));
        }
    }
    Ok(())
}

/// Declaration of one configuration field.
#[derive(Clone)]
pub struct FieldSchema {
    /// Name of the validator type this field must satisfy
    pub field_type: String,
    /// Value used when the field is absent
    pub default: Option<Value>,
    /// Whether the field must be present after defaults are applied
    pub required: bool,
    /// Additional custom check run after the type check
    pub validator: Option<Validator>,
}

impl FieldSchema {
    pub fn new(field_type: &str) -> Self {
        Self {
            field_type: field_type.to_string(),
            default: None,
            required: false,
            validator: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }
}

impl std::fmt::Debug for FieldSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldSchema")
            .field("field_type", &self.field_type)
            .field("default", &self.default)
            .field("required", &self.required)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// A set of field declarations keyed by config key.
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    fields: BTreeMap<String, FieldSchema>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field declaration, replacing any earlier one with the same key.
    pub fn field(mut self, key: &str, field: FieldSchema) -> Self {
        self.fields.insert(key.to_string(), field);
        self
    }

    /// Merges another schema into this one. Fields in `other` win.
    pub fn merge(mut self, other: ConfigSchema) -> Self {
        self.fields.extend(other.fields);
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldSchema)> {
        self.fields.iter()
    }

    pub fn get(&self, key: &str) -> Option<&FieldSchema> {
        self.fields.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Object holding every declared default.
    pub fn defaults(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter_map(|(key, field)| field.default.clone().map(|d| (key.clone(), d)))
            .collect()
    }
}

/// Schema-validated configuration store with per-key change watchers.
pub struct ConfigManager {
    validators: ValidatorSet,
    schema: Option<ConfigSchema>,
    config: Map<String, Value>,
    watchers: HashMap<String, Vec<(WatchId, Watcher)>>,
    next_watch_id: u64,
}

impl ConfigManager {
    /// Creates an empty manager with the built-in validators and no schema.
    pub fn new() -> Self {
        Self {
            validators: ValidatorSet::with_defaults(),
            schema: None,
            config: Map::new(),
            watchers: HashMap::new(),
            next_watch_id: 0,
        }
    }

    /// Creates a manager with a schema already applied.
    pub fn with_schema(schema: ConfigSchema) -> Result<Self, ConfigError> {
        let mut manager = Self::new();
        manager.set_schema(schema)?;
        Ok(manager)
    }

    /// Registers a named type check usable by schema fields.
    pub fn add_validator<F>(&mut self, type_name: &str, predicate: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validators.add(type_name, predicate);
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Validates the schema shape, then re-validates the current config
    /// against it. On any failure the previous schema and config stay in place.
    pub fn set_schema(&mut self, schema: ConfigSchema) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        for (key, field) in schema.fields() {
            if !self.validators.contains(&field.field_type) {
                problems.push(FieldError::new(
                    key,
                    format!("unknown validator type '{}'", field.field_type),
                ));
                continue;
            }
            if let Some(default) = &field.default {
                if let Err(message) = check_field(&self.validators, field, default) {
                    problems.push(FieldError::new(key, format!("invalid default: {message}")));
                }
            }
        }
        if !problems.is_empty() {
            return Err(ConfigError::InvalidSchema(problems));
        }

        let current = self.config.clone();
        let merged = Self::validate_against(&self.validators, &schema, &current)?;
        self.schema = Some(schema);
        self.apply(merged);
        Ok(())
    }

    /// Replaces the whole configuration. All fields are validated before
    /// anything is applied; schema defaults fill absent keys.
    pub fn set_config(&mut self, new_config: Map<String, Value>) -> Result<(), ConfigError> {
        let candidate = new_config.clone();
        let merged = match &self.schema {
            Some(schema) => Self::validate_against(&self.validators, schema, &candidate)?,
            None => candidate,
        };
        self.apply(merged);
        Ok(())
    }

    /// Updates a single key through the same all-or-nothing path.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut candidate = self.config.clone();
        candidate.insert(key.to_string(), value);
        self.set_config(candidate)
    }

    /// Returns a copy of one value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.config.get(key).cloned()
    }

    /// Returns a copy of the whole configuration.
    pub fn get_all(&self) -> Map<String, Value> {
        self.config.clone()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(Value::as_bool)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
        })
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.config
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Subscribes to future changes of one key.
    pub fn watch<F>(&mut self, key: &str, callback: F) -> WatchId
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.next_watch_id += 1;
        let id = WatchId(self.next_watch_id);
        self.watchers
            .entry(key.to_string())
            .or_default()
            .push((id, Box::new(callback)));
        id
    }

    /// Removes a watcher. Returns `false` if it was already gone.
    pub fn unwatch(&mut self, id: WatchId) -> bool {
        let mut removed = false;
        for watchers in self.watchers.values_mut() {
            let before = watchers.len();
            watchers.retain(|(watch_id, _)| *watch_id != id);
            removed |= watchers.len() != before;
        }
        self.watchers.retain(|_, watchers| !watchers.is_empty());
        removed
    }

    /// Validates `candidate` against `schema` and returns it merged over the
    /// schema defaults. Collects every failing field.
    fn validate_against(
        validators: &ValidatorSet,
        schema: &ConfigSchema,
        candidate: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ConfigError> {
        let mut merged = schema.defaults();
        for (key, value) in candidate {
            merged.insert(key.clone(), value.clone());
        }

        let mut errors = Vec::new();
        for (key, field) in schema.fields() {
            match merged.get(key) {
                None | Some(Value::Null) if field.required => {
                    errors.push(FieldError::new(key, "required field missing"));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    if let Err(message) = check_field(validators, field, value) {
                        errors.push(FieldError::new(key, message));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(merged)
        } else {
            warn!(
                failing = errors.len(),
                "Rejected configuration: {}",
                errors
                    .iter()
                    .map(|e| e.field.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            Err(ConfigError::Validation(errors))
        }
    }

    fn apply(&mut self, merged: Map<String, Value>) {
        let previous = std::mem::replace(&mut self.config, merged);

        let mut keys: Vec<&String> = previous.keys().chain(self.config.keys()).collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let old = previous.get(key).unwrap_or(&Value::Null);
            let new = self.config.get(key).unwrap_or(&Value::Null);
            if old == new {
                continue;
            }
            debug!(key = %key, "Config value changed");
            if let Some(watchers) = self.watchers.get(key.as_str()) {
                for (_, watcher) in watchers {
                    watcher(new, old);
                }
            }
        }
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("schema", &self.schema)
            .field("config", &self.config)
            .field("watchers", &self.watchers.len())
            .finish()
    }
}
