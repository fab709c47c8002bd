//! Cell editing.
//!
//! `begin_edit` claims the cell in the table's ownership registry so no other
//! plugin rewrites it while the editor is open. `save` runs the `beforeSave`
//! chain; a veto keeps the editor open and surfaces the reason through the
//! notifier. A successful save writes the cell, releases it and announces the
//! change with `afterSave`, `cell:change` and `row:saved`.

use crate::{header_of, report_failure, OperationOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tableflow_core::{
    CellRef, ConfigSchema, FieldSchema, PluginContext, PluginCore, PluginError, SimplePlugin,
};
use tracing::{debug, warn};

const ORIGINAL_VALUE: &str = "edit.original";

pub struct EditPlugin {
    core: PluginCore,
    editing: Mutex<BTreeSet<CellRef>>,
}

impl EditPlugin {
    pub fn new(options: Value) -> Self {
        Self {
            core: PluginCore::new(options),
            editing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn is_editing(&self, cell: CellRef) -> bool {
        self.editing.lock().contains(&cell)
    }

    pub fn editing_cells(&self) -> Vec<CellRef> {
        self.editing.lock().iter().copied().collect()
    }

    /// Whether `column` may be edited under the `editable_columns` option.
    pub fn is_editable(&self, context: &PluginContext, column: usize) -> bool {
        let Some(allowed) = self.core.config().get("editable_columns") else {
            return true;
        };
        let header = context.table().headers().get(column).cloned();
        allowed
            .as_array()
            .map(|items| {
                items.iter().any(|item| match item {
                    Value::Number(n) => n.as_u64() == Some(column as u64),
                    Value::String(s) => header.as_deref() == Some(s.as_str()),
                    _ => false,
                })
            })
            .unwrap_or(true)
    }

    /// Opens an editor on `cell`.
    pub fn begin_edit(&self, cell: CellRef) -> Result<OperationOutcome, PluginError> {
        self.open(cell)
            .map_err(|e| report_failure(&self.core, "edit", e))
    }

    fn open(&self, cell: CellRef) -> Result<OperationOutcome, PluginError> {
        let context = self.core.require_context()?;
        if !self.core.is_enabled() {
            return Ok(OperationOutcome::Skipped);
        }
        if self.is_editing(cell) {
            return Ok(OperationOutcome::Applied);
        }

        let original = context.table().cell_value(cell)?;
        if !self.is_editable(&context, cell.column) {
            return Err(PluginError::ExecutionError(format!(
                "column {} is not editable",
                cell.column
            )));
        }
        if !context.ownership().claim(cell, self.name()) {
            let owner = context.ownership().owner(cell).unwrap_or_default();
            return Err(PluginError::ExecutionError(format!(
                "cell {} is owned by {}",
                cell, owner
            )));
        }

        context.set_cell_state(cell, ORIGINAL_VALUE, Value::String(original));
        self.editing.lock().insert(cell);
        context.table().emit("cell:edit", json!({ "row": cell.row, "column": cell.column }));
        debug!("Editing cell {}", cell);
        Ok(OperationOutcome::Applied)
    }

    /// Saves `value` into `cell`, opening an editor first if none is open.
    pub async fn save(&self, cell: CellRef, value: &str) -> Result<OperationOutcome, PluginError> {
        self.commit(cell, value)
            .await
            .map_err(|e| report_failure(&self.core, "save", e))
    }

    async fn commit(&self, cell: CellRef, value: &str) -> Result<OperationOutcome, PluginError> {
        let context = self.core.require_context()?;
        if !self.core.is_enabled() {
            return Ok(OperationOutcome::Skipped);
        }
        if self.open(cell)? == OperationOutcome::Skipped {
            return Ok(OperationOutcome::Skipped);
        }

        let table = context.table();
        let old_value = table.cell_value(cell)?;
        if old_value == value {
            self.close(&context, cell);
            return Ok(OperationOutcome::Skipped);
        }

        let headers = table.headers();
        let payload = json!({
            "table": context.table_id(),
            "row": cell.row,
            "column": cell.column,
            "header": header_of(&headers, cell.column),
            "old_value": old_value,
            "new_value": value,
        });

        let before = context.hooks().trigger("beforeSave", payload.clone()).await?;
        if before.is_vetoed() {
            let reason = before
                .veto_reason()
                .map(str::to_string)
                .unwrap_or_else(|| "save rejected".to_string());
            warn!("Save of cell {} vetoed: {}", cell, reason);
            context.notifier().error(&reason);
            context.metrics().increment("edit.vetoed");
            return Ok(OperationOutcome::from_veto(&before));
        }

        if !context.ownership().can_mutate(cell, self.name()) {
            return Err(PluginError::ExecutionError(format!(
                "cell {} was claimed by another plugin",
                cell
            )));
        }
        table.set_cell_value(cell, value.to_string())?;
        self.close(&context, cell);

        context.hooks().trigger("afterSave", payload).await?;
        table.emit(
            "cell:change",
            json!({
                "row": cell.row,
                "column": cell.column,
                "old_value": old_value,
                "new_value": value,
            }),
        );

        let mut row = Map::new();
        for (column, header) in headers.iter().enumerate() {
            let cell_value = table.cell_value(CellRef::new(cell.row, column))?;
            row.insert(header.clone(), Value::String(cell_value));
        }
        table.emit(
            "row:saved",
            json!({ "table": context.table_id(), "row": cell.row, "values": row }),
        );
        context.metrics().increment("edit.saved");
        Ok(OperationOutcome::Applied)
    }

    /// Closes the editor on `cell` without saving. Returns `false` if none was open.
    pub fn cancel(&self, cell: CellRef) -> bool {
        let Some(context) = self.core.context() else {
            return false;
        };
        if !self.is_editing(cell) {
            return false;
        }
        self.close(&context, cell);
        context
            .table()
            .emit("cell:cancel", json!({ "row": cell.row, "column": cell.column }));
        true
    }

    /// The value the cell held when its editor was opened.
    pub fn original_value(&self, cell: CellRef) -> Option<String> {
        self.core
            .context()?
            .cell_state(cell, ORIGINAL_VALUE)
            .and_then(|value| value.as_str().map(str::to_string))
    }

    fn close(&self, context: &PluginContext, cell: CellRef) {
        self.editing.lock().remove(&cell);
        context.clear_cell_state(cell, Some(ORIGINAL_VALUE));
        context.ownership().release(cell, self.name());
    }
}

#[async_trait]
impl SimplePlugin for EditPlugin {
    fn name(&self) -> &str {
        "edit"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new().field(
            "editable_columns",
            FieldSchema::new("array").with_validator(|v| {
                v.as_array()
                    .map(|items| items.iter().all(|i| i.is_string() || i.is_u64()))
                    .unwrap_or(false)
            }),
        )
    }

    fn core(&self) -> &PluginCore {
        &self.core
    }

    async fn on_init(&self, _context: &Arc<PluginContext>) -> Result<(), PluginError> {
        self.editing.lock().clear();
        Ok(())
    }

    async fn on_destroy(&self) -> Result<(), PluginError> {
        for cell in self.editing_cells() {
            self.cancel(cell);
        }
        Ok(())
    }
}
