//! Row ordering by column.

use crate::{header_of, report_failure, OperationOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::Arc;
use tableflow_core::{
    CellRef, ConfigSchema, FieldSchema, LogLevel, PluginContext, PluginCore, PluginError,
    SimplePlugin, TableError,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn reversed(self) -> Self {
        match self {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortDirection::Asc),
            "desc" | "descending" => Ok(SortDirection::Desc),
            other => Err(format!("unknown sort direction: {}", other)),
        }
    }
}

/// The active sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortState {
    pub column: usize,
    pub direction: SortDirection,
}

/// Sorts the display order of the table by one column.
///
/// Options:
/// - `numeric` (boolean, default `true`): cells that parse as numbers compare
///   numerically and sort before text cells
/// - `case_sensitive` (boolean, default `false`)
pub struct SortPlugin {
    core: PluginCore,
    current: Mutex<Option<SortState>>,
}

impl SortPlugin {
    pub fn new(options: Value) -> Self {
        Self {
            core: PluginCore::new(options),
            current: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<SortState> {
        *self.current.lock()
    }

    /// Sorts by `column`. The sort is stable, so equal cells keep their
    /// current relative order.
    pub async fn sort_by(
        &self,
        column: usize,
        direction: SortDirection,
    ) -> Result<OperationOutcome, PluginError> {
        self.apply(column, direction)
            .await
            .map_err(|e| report_failure(&self.core, "sort", e))
    }

    /// Sorts by the column with header `header`.
    pub async fn sort_by_header(
        &self,
        header: &str,
        direction: SortDirection,
    ) -> Result<OperationOutcome, PluginError> {
        let context = self.core.require_context()?;
        let column = context.table().column_index(header).ok_or_else(|| {
            report_failure(
                &self.core,
                "sort",
                PluginError::ExecutionError(format!("unknown column: {}", header)),
            )
        })?;
        self.sort_by(column, direction).await
    }

    /// Ascending on a new column, otherwise flips the current direction.
    pub async fn toggle(&self, column: usize) -> Result<OperationOutcome, PluginError> {
        let direction = match self.current() {
            Some(state) if state.column == column => state.direction.reversed(),
            _ => SortDirection::Asc,
        };
        self.sort_by(column, direction).await
    }

    async fn apply(
        &self,
        column: usize,
        direction: SortDirection,
    ) -> Result<OperationOutcome, PluginError> {
        let context = self.core.require_context()?;
        if !self.core.is_enabled() {
            return Ok(OperationOutcome::Skipped);
        }

        let table = context.table();
        if column >= table.column_count() {
            return Err(TableError::ColumnOutOfRange(column).into());
        }

        let payload = json!({
            "table": context.table_id(),
            "column": column,
            "header": header_of(&table.headers(), column),
            "direction": direction.as_str(),
        });
        let before = context.hooks().trigger("beforeSort", payload.clone()).await?;
        if before.is_vetoed() {
            self.core.log(LogLevel::Warn, "sort vetoed by beforeSort hook");
            return Ok(OperationOutcome::from_veto(&before));
        }

        let (numeric, case_sensitive) = {
            let config = self.core.config();
            (
                config.get_bool("numeric").unwrap_or(true),
                config.get_bool("case_sensitive").unwrap_or(false),
            )
        };

        let order = context
            .metrics()
            .measure("sort.duration", async {
                let mut keyed = Vec::with_capacity(table.row_count());
                for row in table.row_order() {
                    let value = table.cell_value(CellRef::new(row, column))?;
                    keyed.push((row, SortKey::new(&value, numeric, case_sensitive)));
                }
                keyed.sort_by(|(_, a), (_, b)| {
                    let ordering = a.compare(b);
                    match direction {
                        SortDirection::Asc => ordering,
                        SortDirection::Desc => ordering.reverse(),
                    }
                });
                Ok::<_, TableError>(keyed.into_iter().map(|(row, _)| row).collect::<Vec<_>>())
            })
            .await?;

        table.set_row_order(order)?;
        *self.current.lock() = Some(SortState { column, direction });
        debug!("Sorted table {} by column {} {}", context.table_id(), column, direction.as_str());

        context.hooks().trigger("afterSort", payload.clone()).await?;
        table.emit("sort:change", payload);
        context.metrics().increment("sort.applied");
        Ok(OperationOutcome::Applied)
    }
}

/// Comparison key of one cell. Numbers order before text, so a column
/// mixing both still sorts by a total order.
#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Number(f64),
    Text(String),
}

impl SortKey {
    fn new(value: &str, numeric: bool, case_sensitive: bool) -> Self {
        if numeric {
            if let Ok(number) = value.trim().parse::<f64>() {
                return SortKey::Number(number);
            }
        }
        if case_sensitive {
            SortKey::Text(value.to_string())
        } else {
            SortKey::Text(value.to_lowercase())
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Number(_), SortKey::Text(_)) => Ordering::Less,
            (SortKey::Text(_), SortKey::Number(_)) => Ordering::Greater,
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
        }
    }
}

#[cfg(test)]
fn compare_cells(a: &str, b: &str, numeric: bool, case_sensitive: bool) -> Ordering {
    SortKey::new(a, numeric, case_sensitive).compare(&SortKey::new(b, numeric, case_sensitive))
}

#[async_trait]
impl SimplePlugin for SortPlugin {
    fn name(&self) -> &str {
        "sort"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new()
            .field("numeric", FieldSchema::new("boolean").with_default(json!(true)))
            .field(
                "case_sensitive",
                FieldSchema::new("boolean").with_default(json!(false)),
            )
    }

    fn core(&self) -> &PluginCore {
        &self.core
    }

    async fn on_init(&self, _context: &Arc<PluginContext>) -> Result<(), PluginError> {
        *self.current.lock() = None;
        Ok(())
    }

    /// Re-applies the active sort, picking up edited cells.
    async fn on_refresh(&self) -> Result<(), PluginError> {
        if let Some(state) = self.current() {
            self.sort_by(state.column, state.direction).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_comparison() {
        assert_eq!(compare_cells("9", "10", true, false), Ordering::Less);
        assert_eq!(compare_cells("9", "10", false, false), Ordering::Greater);
        assert_eq!(compare_cells("2.5", " 2.50", true, false), Ordering::Equal);
    }

    #[test]
    fn test_text_comparison_case() {
        assert_eq!(compare_cells("apple", "Banana", true, false), Ordering::Less);
        assert_eq!(compare_cells("apple", "Banana", true, true), Ordering::Greater);
    }

    #[test]
    fn test_mixed_cells_order_numbers_first() {
        assert_eq!(compare_cells("10", "1a", true, false), Ordering::Less);
        assert_eq!(compare_cells("1a", "9", true, false), Ordering::Greater);
        assert_eq!(compare_cells("9", "10", true, false), Ordering::Less);
        assert_eq!(compare_cells("inf", "NaN", true, false), Ordering::Less);
        assert_eq!(compare_cells("NaN", "NaN", true, false), Ordering::Equal);
        assert_eq!(compare_cells("NaN", "a", true, false), Ordering::Less);
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("DESC".parse::<SortDirection>(), Ok(SortDirection::Desc));
        assert_eq!("asc".parse::<SortDirection>(), Ok(SortDirection::Asc));
        assert!("sideways".parse::<SortDirection>().is_err());
        assert_eq!(SortDirection::Asc.reversed(), SortDirection::Desc);
    }
}
