//! Row filtering by a free-text query.

use crate::{report_failure, OperationOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tableflow_core::{
    CellRef, ConfigSchema, Debouncer, FieldSchema, HostTable, LogLevel, PluginContext, PluginCore,
    PluginError, SetOptions, SimplePlugin,
};
use tracing::{debug, error};

#[derive(Debug, Clone, Default)]
struct FilterOptions {
    case_sensitive: bool,
    /// Headers to search; `None` searches every visible column
    columns: Option<Vec<String>>,
}

struct FilterShared {
    options: Mutex<FilterOptions>,
    query: Mutex<String>,
    /// Mirror of the `enabled` option, read when a debounced query fires
    enabled: AtomicBool,
}

impl Default for FilterShared {
    fn default() -> Self {
        Self {
            options: Mutex::new(FilterOptions::default()),
            query: Mutex::new(String::new()),
            enabled: AtomicBool::new(true),
        }
    }
}

/// Hides rows whose searched cells do not contain the query.
///
/// Options:
/// - `debounce_ms` (integer, default 300): quiet period for [`FilterPlugin::input`]
/// - `case_sensitive` (boolean, default `false`)
/// - `columns` (array of header names): restricts the searched columns
///
/// Match results are cached in the table's shared cache keyed by table
/// revision, searched columns and query, so repeating a query on unchanged
/// data skips the scan.
pub struct FilterPlugin {
    core: PluginCore,
    shared: Arc<FilterShared>,
    debouncer: Mutex<Option<Debouncer<String>>>,
}

impl FilterPlugin {
    pub fn new(options: Value) -> Self {
        Self {
            core: PluginCore::new(options),
            shared: Arc::new(FilterShared::default()),
            debouncer: Mutex::new(None),
        }
    }

    /// The last applied query.
    pub fn query(&self) -> String {
        self.shared.query.lock().clone()
    }

    /// Whether a debounced query is waiting to be applied.
    pub fn is_pending(&self) -> bool {
        self.debouncer
            .lock()
            .as_ref()
            .map(|d| d.is_pending())
            .unwrap_or(false)
    }

    /// Schedules `query`; only the last query of a burst is applied.
    pub fn input(&self, query: &str) -> Result<(), PluginError> {
        self.core.require_context()?;
        if !self.core.is_enabled() {
            return Ok(());
        }
        match self.debouncer.lock().as_ref() {
            Some(debouncer) => {
                debouncer.call(query.to_string());
                Ok(())
            }
            None => Err(PluginError::NotInitialized(self.name().to_string())),
        }
    }

    /// Applies `query` immediately, discarding any pending input.
    pub async fn apply(&self, query: &str) -> Result<OperationOutcome, PluginError> {
        let context = self.core.require_context()?;
        if !self.core.is_enabled() {
            return Ok(OperationOutcome::Skipped);
        }
        if let Some(debouncer) = self.debouncer.lock().as_ref() {
            debouncer.cancel();
        }
        run_filter(&context, &self.shared, query.to_string())
            .await
            .map_err(|e| report_failure(&self.core, "filter", e))
    }

    /// Clears the query, showing every row.
    pub async fn clear(&self) -> Result<OperationOutcome, PluginError> {
        self.apply("").await
    }
}

/// Columns searched by a query: the configured headers or every visible column.
fn searched_columns(table: &dyn HostTable, options: &FilterOptions) -> Vec<usize> {
    match &options.columns {
        Some(headers) => headers
            .iter()
            .filter_map(|header| table.column_index(header))
            .collect(),
        None => (0..table.column_count())
            .filter(|&column| table.is_column_visible(column))
            .collect(),
    }
}

fn matching_rows(
    table: &dyn HostTable,
    columns: &[usize],
    query: &str,
    case_sensitive: bool,
) -> Vec<usize> {
    let needle = if case_sensitive {
        query.to_string()
    } else {
        query.to_lowercase()
    };

    (0..table.row_count())
        .filter(|&row| {
            needle.is_empty()
                || columns.iter().any(|&column| {
                    table
                        .cell_value(CellRef::new(row, column))
                        .map(|value| {
                            if case_sensitive {
                                value.contains(&needle)
                            } else {
                                value.to_lowercase().contains(&needle)
                            }
                        })
                        .unwrap_or(false)
                })
        })
        .collect()
}

async fn run_filter(
    context: &Arc<PluginContext>,
    shared: &FilterShared,
    query: String,
) -> Result<OperationOutcome, PluginError> {
    let payload = json!({ "table": context.table_id(), "query": query });
    let before = context.hooks().trigger("beforeFilter", payload).await?;
    if before.is_vetoed() {
        debug!("Filter vetoed by beforeFilter hook");
        return Ok(OperationOutcome::from_veto(&before));
    }

    let options = shared.options.lock().clone();
    let table = context.table().clone();
    let columns = searched_columns(table.as_ref(), &options);
    let key = format!(
        "filter:{}:{}:{:?}:{}:{}",
        context.table_id(),
        table.revision(),
        columns,
        options.case_sensitive,
        query
    );

    let producer_table = table.clone();
    let producer_columns = columns.clone();
    let producer_query = query.clone();
    let case_sensitive = options.case_sensitive;
    let matched = context
        .cache()
        .get_or_set(
            key,
            move || async move {
                let rows = matching_rows(
                    producer_table.as_ref(),
                    &producer_columns,
                    &producer_query,
                    case_sensitive,
                );
                serde_json::to_value(rows)
            },
            SetOptions::default(),
        )
        .await
        .map_err(|e| PluginError::ExecutionError(e.to_string()))?;

    let matched: Vec<usize> = serde_json::from_value(matched)
        .map_err(|e| PluginError::ExecutionError(e.to_string()))?;
    let mut visible = vec![false; table.row_count()];
    for &row in &matched {
        if let Some(slot) = visible.get_mut(row) {
            *slot = true;
        }
    }
    for (row, show) in visible.iter().enumerate() {
        table.set_row_visible(row, *show)?;
    }
    *shared.query.lock() = query.clone();

    let after = json!({
        "table": context.table_id(),
        "query": query,
        "matched": matched.len(),
        "total": table.row_count(),
    });
    context.hooks().trigger("afterFilter", after.clone()).await?;
    table.emit("filter:change", after);
    context.metrics().increment("filter.applied");
    context.metrics().gauge("filter.visible_rows", matched.len() as f64);
    Ok(OperationOutcome::Applied)
}

#[async_trait]
impl SimplePlugin for FilterPlugin {
    fn name(&self) -> &str {
        "filter"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new()
            .field("debounce_ms", FieldSchema::new("integer").with_default(json!(300)))
            .field(
                "case_sensitive",
                FieldSchema::new("boolean").with_default(json!(false)),
            )
            .field(
                "columns",
                FieldSchema::new("array").with_validator(|v| {
                    v.as_array()
                        .map(|items| items.iter().all(Value::is_string))
                        .unwrap_or(false)
                }),
            )
    }

    fn core(&self) -> &PluginCore {
        &self.core
    }

    async fn on_init(&self, context: &Arc<PluginContext>) -> Result<(), PluginError> {
        let (delay, options) = {
            let config = self.core.config();
            let columns = config.get("columns").and_then(|value| {
                value.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect()
                })
            });
            (
                Duration::from_millis(config.get_u64("debounce_ms").unwrap_or(300)),
                FilterOptions {
                    case_sensitive: config.get_bool("case_sensitive").unwrap_or(false),
                    columns,
                },
            )
        };
        *self.shared.options.lock() = options;
        self.shared.query.lock().clear();
        self.shared
            .enabled
            .store(self.core.is_enabled(), Ordering::SeqCst);

        let watched = self.shared.clone();
        self.core.config_mut().watch("enabled", move |new, _old| {
            watched
                .enabled
                .store(new.as_bool().unwrap_or(true), Ordering::SeqCst);
        });

        let weak: Weak<PluginContext> = Arc::downgrade(context);
        let shared = self.shared.clone();
        let debouncer = Debouncer::new(delay, move |query: String| {
            let weak = weak.clone();
            let shared = shared.clone();
            async move {
                let Some(context) = weak.upgrade() else {
                    return;
                };
                if !shared.enabled.load(Ordering::SeqCst) {
                    debug!("Dropping debounced filter query while disabled");
                    return;
                }
                if let Err(e) = run_filter(&context, &shared, query).await {
                    error!("Debounced filter failed: {}", e);
                    context.notifier().error(&format!("filter failed: {}", e));
                }
            }
        });
        *self.debouncer.lock() = Some(debouncer);
        self.core.log(LogLevel::Debug, &format!("filter debounce {:?}", delay));
        Ok(())
    }

    /// Re-applies the current query against changed data.
    async fn on_refresh(&self) -> Result<(), PluginError> {
        let query = self.query();
        self.apply(&query).await?;
        Ok(())
    }

    async fn on_destroy(&self) -> Result<(), PluginError> {
        if let Some(debouncer) = self.debouncer.lock().take() {
            debouncer.shutdown();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tableflow_core::{MemoryTable, TableData};

    fn table() -> MemoryTable {
        MemoryTable::from_data(TableData {
            id: "t".into(),
            headers: vec!["name".into(), "city".into()],
            rows: vec![
                vec!["Ada".into(), "London".into()],
                vec!["Grace".into(), "New York".into()],
                vec!["Alan".into(), "london".into()],
            ],
        })
    }

    #[test]
    fn test_matching_rows_case_insensitive() {
        let table = table();
        assert_eq!(matching_rows(&table, &[0, 1], "LONDON", false), vec![0, 2]);
        assert_eq!(matching_rows(&table, &[0, 1], "London", true), vec![0]);
        assert_eq!(matching_rows(&table, &[0], "london", false), Vec::<usize>::new());
        assert_eq!(matching_rows(&table, &[0, 1], "", false), vec![0, 1, 2]);
    }

    #[test]
    fn test_searched_columns_follow_visibility() {
        let table = table();
        table.set_column_visible(1, false).unwrap();
        assert_eq!(searched_columns(&table, &FilterOptions::default()), vec![0]);

        let options = FilterOptions {
            columns: Some(vec!["city".into(), "missing".into()]),
            ..FilterOptions::default()
        };
        assert_eq!(searched_columns(&table, &options), vec![1]);
    }
}
