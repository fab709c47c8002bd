//! Per-column validation of edited values.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tableflow_core::{
    CellRef, ConfigError, ConfigSchema, FieldError, FieldSchema, HookOutcome, HostTable, LogLevel,
    PluginContext, PluginCore, PluginError, SimplePlugin, ValidationRule, ValidatorSet,
};
use tracing::debug;

/// Attribute set on a cell whose last save was rejected.
pub const ERROR_ATTRIBUTE: &str = "data-validation-error";

struct RuleSet {
    validators: ValidatorSet,
    /// Column index to (header, rule)
    rules: HashMap<usize, (String, ValidationRule)>,
}

impl RuleSet {
    /// Returns the failure message for `raw` in `column`, if any.
    fn check(&self, column: usize, raw: &str) -> Option<String> {
        let (header, rule) = self.rules.get(&column)?;
        if raw.trim().is_empty() {
            return rule.required.then(|| format!("{} is required", header));
        }

        let candidate = coerce(&rule.rule_type, raw);
        match self.validators.check(&rule.rule_type, &candidate) {
            Ok(true) => None,
            Ok(false) => Some(format!("{} must be a valid {}", header, rule.rule_type)),
            Err(e) => Some(e.to_string()),
        }
    }
}

/// Converts raw cell text into the JSON shape the named validator expects.
fn coerce(rule_type: &str, raw: &str) -> Value {
    let trimmed = raw.trim();
    match rule_type {
        "number" | "integer" | "positive" => {
            if let Ok(n) = trimmed.parse::<i64>() {
                json!(n)
            } else if let Ok(f) = trimmed.parse::<f64>() {
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(raw.to_string()))
            } else {
                Value::String(raw.to_string())
            }
        }
        "boolean" => match trimmed.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        _ => Value::String(raw.to_string()),
    }
}

/// Vetoes `beforeSave` for values that break a column rule and marks the
/// offending cell with [`ERROR_ATTRIBUTE`].
///
/// Options:
/// - `rules` (object): column header or index to `{ "type": ..., "required": bool }`,
///   where `type` is any validator type known to the config manager
pub struct ValidationPlugin {
    core: PluginCore,
    rules: parking_lot::RwLock<Option<Arc<RuleSet>>>,
}

impl ValidationPlugin {
    pub fn new(options: Value) -> Self {
        Self {
            core: PluginCore::new(options),
            rules: parking_lot::RwLock::new(None),
        }
    }

    /// Checks `value` against the rule for `column` without saving anything.
    pub fn validate(&self, column: usize, value: &str) -> Result<(), String> {
        match self.rules.read().as_ref().and_then(|rules| rules.check(column, value)) {
            Some(message) => Err(message),
            None => Ok(()),
        }
    }

    /// Number of columns with an active rule.
    pub fn rule_count(&self) -> usize {
        self.rules
            .read()
            .as_ref()
            .map(|rules| rules.rules.len())
            .unwrap_or(0)
    }

    fn resolve_rules(&self, table: &dyn HostTable) -> Result<RuleSet, PluginError> {
        let (validators, raw) = {
            let config = self.core.config();
            (
                config.validators().clone(),
                config.get("rules").unwrap_or_else(|| json!({})),
            )
        };

        let parsed: BTreeMap<String, ValidationRule> = serde_json::from_value(raw).map_err(|e| {
            ConfigError::Validation(vec![FieldError::new("rules", e.to_string())])
        })?;

        let headers = table.headers();
        let mut rules = HashMap::new();
        for (key, rule) in parsed {
            if !validators.contains(&rule.rule_type) {
                return Err(ConfigError::UnknownValidator(rule.rule_type).into());
            }
            let column = table
                .column_index(&key)
                .or_else(|| key.parse::<usize>().ok().filter(|&c| c < headers.len()));
            match column {
                Some(column) => {
                    rules.insert(column, (headers[column].clone(), rule));
                }
                None => self
                    .core
                    .log(LogLevel::Warn, &format!("ignoring rule for unknown column {}", key)),
            }
        }

        Ok(RuleSet { validators, rules })
    }
}

#[async_trait]
impl SimplePlugin for ValidationPlugin {
    fn name(&self) -> &str {
        "validation"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["edit".to_string()]
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new().field("rules", FieldSchema::new("object").with_default(json!({})))
    }

    fn core(&self) -> &PluginCore {
        &self.core
    }

    async fn on_init(&self, context: &Arc<PluginContext>) -> Result<(), PluginError> {
        let rules = Arc::new(self.resolve_rules(context.table().as_ref())?);
        *self.rules.write() = Some(rules.clone());

        let weak: Weak<PluginContext> = Arc::downgrade(context);
        self.core
            .hook_sync("beforeSave", move |payload| {
                let (Some(row), Some(column)) = (
                    payload["row"].as_u64().map(|r| r as usize),
                    payload["column"].as_u64().map(|c| c as usize),
                ) else {
                    return HookOutcome::Proceed;
                };
                let value = payload["new_value"].as_str().unwrap_or_default();
                let cell = CellRef::new(row, column);
                let context = weak.upgrade();

                match rules.check(column, value) {
                    Some(message) => {
                        debug!("Validation failed for cell {}: {}", cell, message);
                        if let Some(context) = &context {
                            if let Err(e) =
                                context.table().set_attribute(cell, ERROR_ATTRIBUTE, &message)
                            {
                                debug!(%cell, error = %e, "Could not mark invalid cell");
                            }
                            context.metrics().increment("validation.failed");
                        }
                        HookOutcome::abort(message)
                    }
                    None => {
                        if let Some(context) = &context {
                            context.table().remove_attribute(cell, ERROR_ATTRIBUTE);
                        }
                        HookOutcome::Proceed
                    }
                }
            })
            .await?;
        Ok(())
    }

    async fn on_destroy(&self) -> Result<(), PluginError> {
        *self.rules.write() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(rule_type: &str, required: bool) -> ValidationRule {
        ValidationRule {
            rule_type: rule_type.to_string(),
            required,
        }
    }

    fn rule_set() -> RuleSet {
        let mut rules = HashMap::new();
        rules.insert(0, ("email".to_string(), rule("email", true)));
        rules.insert(1, ("age".to_string(), rule("integer", false)));
        RuleSet {
            validators: ValidatorSet::with_defaults(),
            rules,
        }
    }

    #[test]
    fn test_required_and_type_checks() {
        let rules = rule_set();
        assert_eq!(rules.check(0, ""), Some("email is required".to_string()));
        assert!(rules.check(0, "not-an-email").is_some());
        assert_eq!(rules.check(0, "ada@example.com"), None);

        assert_eq!(rules.check(1, ""), None);
        assert_eq!(rules.check(1, " 42 "), None);
        assert!(rules.check(1, "4.5").is_some());
        assert_eq!(rules.check(7, "anything"), None);
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce("integer", "12"), json!(12));
        assert_eq!(coerce("number", "1.5"), json!(1.5));
        assert_eq!(coerce("boolean", "TRUE"), json!(true));
        assert_eq!(coerce("string", " padded "), json!(" padded "));
    }
}
