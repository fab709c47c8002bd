//! Error types for the table runtime.
//!
//! Lifecycle errors ([`PluginError`]) propagate to the owning table instance.
//! Hook, cache, config and table errors are folded into [`PluginError`] when
//! they cross a plugin operation boundary. A veto from a `before*` hook is not
//! an error and never appears here.

use serde::{Deserialize, Serialize};

/// Errors that can occur during plugin lifecycle and plugin operations.
///
/// # Error Categories
///
/// - **Configuration / MissingDependency**: raised by `init`, plugin stays uninitialized
/// - **NotInitialized / Destroyed**: lifecycle call made in the wrong state
/// - **ExecutionError / Hook / Table**: operation failures, the plugin stays usable
/// - **Runtime**: a panic caught inside a plugin hook
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Plugin initialization failed during startup
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),
    /// Plugin options did not satisfy the plugin's schema
    #[error("Plugin configuration error: {0}")]
    Configuration(#[from] ConfigError),
    /// A declared dependency is not present in the table context
    #[error("Plugin {plugin} requires missing dependency {dependency}")]
    MissingDependency { plugin: String, dependency: String },
    /// Plugins declare dependencies on each other in a cycle
    #[error("Plugin dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    /// A plugin with the same name is already registered
    #[error("Plugin already registered: {0}")]
    AlreadyRegistered(String),
    /// Lifecycle call requires an initialized plugin
    #[error("Plugin not initialized: {0}")]
    NotInitialized(String),
    /// Lifecycle call made after destroy
    #[error("Plugin already destroyed: {0}")]
    Destroyed(String),
    /// Requested plugin was not found
    #[error("Plugin not found: {0}")]
    NotFound(String),
    /// Error occurred during plugin execution
    #[error("Plugin execution error: {0}")]
    ExecutionError(String),
    /// A hook callback failed
    #[error("Hook error: {0}")]
    Hook(#[from] HookError),
    /// The host table rejected an operation
    #[error("Table error: {0}")]
    Table(#[from] TableError),
    /// Runtime error such as panic or system failure
    #[error("Plugin runtime error: {0}")]
    Runtime(String),
}

/// Errors raised by hook callbacks. They propagate out of `trigger` unchanged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HookError {
    /// A callback returned an error
    #[error("Hook callback for {hook} failed: {message}")]
    Callback { hook: String, message: String },
    /// A callback payload could not be (de)serialized
    #[error("Hook payload error: {0}")]
    Payload(String),
}

impl HookError {
    /// Convenience constructor used by callbacks.
    pub fn callback(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Callback {
            hook: hook.into(),
            message: message.into(),
        }
    }
}

/// Cache errors. `Clone` so a shared in-flight producer can hand the same
/// failure to every waiter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    /// The value producer passed to `get_or_set` failed
    #[error("Cache producer failed: {0}")]
    ProducerFailed(String),
}

/// A single failing configuration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Configuration errors. Validation errors always carry every failing field.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// One or more fields failed validation; nothing was applied
    #[error("Configuration validation failed: {}", format_field_errors(.0))]
    Validation(Vec<FieldError>),
    /// A schema field names a validator type that is not registered
    #[error("Unknown validator type: {0}")]
    UnknownValidator(String),
    /// The schema itself is malformed
    #[error("Invalid configuration schema: {}", format_field_errors(.0))]
    InvalidSchema(Vec<FieldError>),
}

impl ConfigError {
    /// Every failing field carried by this error.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            ConfigError::Validation(errors) | ConfigError::InvalidSchema(errors) => {
                errors.iter().map(|e| e.field.as_str()).collect()
            }
            ConfigError::UnknownValidator(_) => Vec::new(),
        }
    }
}

/// Errors raised by a host table.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TableError {
    #[error("Cell out of range: row {row}, column {column}")]
    CellOutOfRange { row: usize, column: usize },
    #[error("Row out of range: {0}")]
    RowOutOfRange(usize),
    #[error("Column out of range: {0}")]
    ColumnOutOfRange(usize),
    #[error("Invalid row order: {0}")]
    InvalidRowOrder(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_every_field() {
        let error = ConfigError::Validation(vec![
            FieldError::new("port", "expected integer"),
            FieldError::new("host", "required field missing"),
        ]);

        let message = error.to_string();
        assert!(message.contains("port: expected integer"));
        assert!(message.contains("host: required field missing"));
        assert_eq!(error.fields(), vec!["port", "host"]);
    }

    #[test]
    fn test_config_error_converts_into_plugin_error() {
        let error: PluginError = ConfigError::UnknownValidator("uuid".to_string()).into();
        assert!(matches!(error, PluginError::Configuration(_)));
        assert!(error.to_string().contains("uuid"));
    }

    #[test]
    fn test_dependency_cycle_message() {
        let error = PluginError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(error.to_string(), "Plugin dependency cycle detected: a -> b -> a");
    }
}
