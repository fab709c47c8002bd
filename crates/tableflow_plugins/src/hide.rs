//! Column visibility with persistence.

use crate::{header_of, report_failure, OperationOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tableflow_core::{
    ConfigSchema, FieldSchema, LogLevel, PluginContext, PluginCore, PluginError, SimplePlugin,
    TableError,
};
use tracing::debug;

/// Storage key holding the hidden headers of a table.
pub fn storage_key(table_id: &str) -> String {
    format!("tableflow:{}:hidden", table_id)
}

/// Hides and shows columns, remembering the hidden set across instances.
///
/// The hidden set is stored as a JSON array of header names so it survives
/// column reordering. Options: `persist` (boolean, default `true`).
pub struct HidePlugin {
    core: PluginCore,
    hidden: Mutex<BTreeSet<usize>>,
}

impl HidePlugin {
    pub fn new(options: Value) -> Self {
        Self {
            core: PluginCore::new(options),
            hidden: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn hidden_columns(&self) -> Vec<usize> {
        self.hidden.lock().iter().copied().collect()
    }

    pub fn is_hidden(&self, column: usize) -> bool {
        self.hidden.lock().contains(&column)
    }

    pub async fn hide_column(&self, column: usize) -> Result<OperationOutcome, PluginError> {
        self.set_visibility(column, false).await
    }

    pub async fn show_column(&self, column: usize) -> Result<OperationOutcome, PluginError> {
        self.set_visibility(column, true).await
    }

    pub async fn toggle_column(&self, column: usize) -> Result<OperationOutcome, PluginError> {
        let visible = self.is_hidden(column);
        self.set_visibility(column, visible).await
    }

    /// Hides the column with header `header`.
    pub async fn hide_by_header(&self, header: &str) -> Result<OperationOutcome, PluginError> {
        let context = self.core.require_context()?;
        match context.table().column_index(header) {
            Some(column) => self.hide_column(column).await,
            None => Err(report_failure(
                &self.core,
                "hide",
                PluginError::ExecutionError(format!("unknown column: {}", header)),
            )),
        }
    }

    async fn set_visibility(
        &self,
        column: usize,
        visible: bool,
    ) -> Result<OperationOutcome, PluginError> {
        self.toggle(column, visible)
            .await
            .map_err(|e| report_failure(&self.core, "column toggle", e))
    }

    async fn toggle(&self, column: usize, visible: bool) -> Result<OperationOutcome, PluginError> {
        let context = self.core.require_context()?;
        if !self.core.is_enabled() {
            return Ok(OperationOutcome::Skipped);
        }

        let table = context.table();
        if column >= table.column_count() {
            return Err(TableError::ColumnOutOfRange(column).into());
        }
        if table.is_column_visible(column) == visible {
            return Ok(OperationOutcome::Skipped);
        }

        let payload = json!({
            "table": context.table_id(),
            "column": column,
            "header": header_of(&table.headers(), column),
            "visible": visible,
        });
        let before = context
            .hooks()
            .trigger("beforeColumnToggle", payload.clone())
            .await?;
        if before.is_vetoed() {
            self.core.log(LogLevel::Warn, "column toggle vetoed");
            return Ok(OperationOutcome::from_veto(&before));
        }

        table.set_column_visible(column, visible)?;
        {
            let mut hidden = self.hidden.lock();
            if visible {
                hidden.remove(&column);
            } else {
                hidden.insert(column);
            }
        }
        self.persist(&context);

        context.hooks().trigger("afterColumnToggle", payload.clone()).await?;
        table.emit("column:visibility", payload);
        context.metrics().increment("hide.toggled");
        Ok(OperationOutcome::Applied)
    }

    fn persist(&self, context: &PluginContext) {
        if !self.core.config().get_bool("persist").unwrap_or(true) {
            return;
        }
        let headers = context.table().headers();
        let names: Vec<&str> = self
            .hidden
            .lock()
            .iter()
            .filter_map(|&column| headers.get(column).map(String::as_str))
            .collect();
        context
            .storage()
            .set_item(&storage_key(context.table_id()), json!(names).to_string());
    }

    /// Applies the hidden set saved by a previous instance.
    fn restore(&self, context: &PluginContext) {
        let key = storage_key(context.table_id());
        let Some(saved) = context.storage().get_item(&key) else {
            return;
        };
        let names: Vec<String> = match serde_json::from_str(&saved) {
            Ok(names) => names,
            Err(e) => {
                self.core
                    .log(LogLevel::Warn, &format!("ignoring corrupt {}: {}", key, e));
                return;
            }
        };

        let table = context.table();
        let mut hidden = self.hidden.lock();
        for name in names {
            if let Some(column) = table.column_index(&name) {
                if table.set_column_visible(column, false).is_ok() {
                    hidden.insert(column);
                }
            }
        }
        debug!("Restored {} hidden columns for {}", hidden.len(), context.table_id());
    }
}

#[async_trait]
impl SimplePlugin for HidePlugin {
    fn name(&self) -> &str {
        "hide"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new().field("persist", FieldSchema::new("boolean").with_default(json!(true)))
    }

    fn core(&self) -> &PluginCore {
        &self.core
    }

    async fn on_init(&self, context: &Arc<PluginContext>) -> Result<(), PluginError> {
        self.hidden.lock().clear();
        if self.core.config().get_bool("persist").unwrap_or(true) {
            self.restore(context);
        }
        Ok(())
    }
}
