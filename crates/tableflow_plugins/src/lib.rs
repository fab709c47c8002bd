//! # TableFlow Plugins
//!
//! Stock plugins for [`tableflow_core`]:
//!
//! - [`SortPlugin`]: orders rows by a column
//! - [`FilterPlugin`]: hides rows that do not match a query, with debounced input
//! - [`EditPlugin`]: cell editing with a vetoable `beforeSave` hook
//! - [`ValidationPlugin`]: per-column rules enforced through `beforeSave`
//! - [`HidePlugin`]: column visibility persisted in storage
//!
//! Every operation triggers its `before*` hook first and returns
//! [`OperationOutcome::Vetoed`] without touching the table when a callback
//! aborts. Failures are logged, reported through the table's notifier and
//! returned; the plugin stays usable.

pub mod edit;
pub mod filter;
pub mod hide;
pub mod sort;
pub mod validation;

pub use edit::EditPlugin;
pub use filter::FilterPlugin;
pub use hide::HidePlugin;
pub use sort::{SortDirection, SortPlugin, SortState};
pub use validation::ValidationPlugin;

use serde_json::{json, Map, Value};
use tableflow_core::{LogLevel, PluginCore, PluginError, RuntimeSettings, TableInstance, TriggerResult};
use tracing::info;

/// Result of a plugin operation that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// The table was changed
    Applied,
    /// A `before*` hook declined the operation
    Vetoed(Option<String>),
    /// Nothing to do: the plugin is disabled or the change is a no-op
    Skipped,
}

impl OperationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, OperationOutcome::Applied)
    }

    pub fn is_vetoed(&self) -> bool {
        matches!(self, OperationOutcome::Vetoed(_))
    }

    pub(crate) fn from_veto(result: &TriggerResult) -> Self {
        OperationOutcome::Vetoed(result.veto_reason().map(str::to_string))
    }
}

/// Logs an operation failure, reports it through the notifier and hands the
/// error back for propagation.
pub(crate) fn report_failure(core: &PluginCore, operation: &str, error: PluginError) -> PluginError {
    core.log(LogLevel::Error, &format!("{} failed: {}", operation, error));
    if let Some(context) = core.context() {
        context.notifier().error(&format!("{} failed: {}", operation, error));
    }
    error
}

/// Column headers keyed by index, for hook payloads.
pub(crate) fn header_of(headers: &[String], column: usize) -> Value {
    headers
        .get(column)
        .map(|h| Value::String(h.clone()))
        .unwrap_or(Value::Null)
}

fn options(entries: Vec<(&str, Value)>) -> Value {
    let map: Map<String, Value> = entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();
    Value::Object(map)
}

/// Installs the plugins named in `settings.plugins.enabled`, in that order.
///
/// Unknown names are rejected. `validation` pulls in `edit` as a dependency,
/// so both must be listed when validation is wanted.
pub fn install_from_settings(
    instance: &TableInstance,
    settings: &RuntimeSettings,
) -> Result<(), PluginError> {
    for name in &settings.plugins.enabled {
        match name.as_str() {
            "sort" => {
                instance.add_plugin(SortPlugin::new(json!({})))?;
            }
            "filter" => {
                instance.add_plugin(FilterPlugin::new(options(vec![(
                    "debounce_ms",
                    json!(settings.plugins.debounce_ms),
                )])))?;
            }
            "edit" => {
                instance.add_plugin(EditPlugin::new(json!({})))?;
            }
            "validation" => {
                let rules = serde_json::to_value(&settings.plugins.validation_rules)
                    .map_err(|e| PluginError::InitializationFailed(e.to_string()))?;
                instance.add_plugin(ValidationPlugin::new(options(vec![("rules", rules)])))?;
            }
            "hide" => {
                instance.add_plugin(HidePlugin::new(json!({})))?;
            }
            other => return Err(PluginError::NotFound(other.to_string())),
        }
        info!("Installed plugin {}", name);
    }
    Ok(())
}
