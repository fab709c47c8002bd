//! Services shared by every plugin installed on one table.

use crate::cache::{CacheConfig, CacheManager};
use crate::hooks::HookBus;
use crate::metrics::{MetricsConfig, MetricsManager};
use crate::ownership::CellOwnership;
use crate::plugin::{Plugin, PluginWrapper, SimplePlugin};
use crate::registry::PluginRegistry;
use crate::services::{Notifier, Storage};
use crate::table::{CellRef, HostTable};
use crate::LogLevel;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Everything a plugin may reach: the host table, the hook bus, the plugin
/// registry, shared cache and metrics, cell ownership and the storage and
/// notification collaborators.
///
/// One context exists per table instance and is handed to every plugin at
/// `init`, so no plugin depends on process-wide state.
pub struct PluginContext {
    table: Arc<dyn HostTable>,
    hooks: Arc<HookBus>,
    registry: Arc<PluginRegistry>,
    cache: Arc<CacheManager<String, Value>>,
    metrics: Arc<MetricsManager>,
    ownership: Arc<CellOwnership>,
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    cell_state: DashMap<CellRef, Map<String, Value>>,
}

impl PluginContext {
    pub fn new(
        table: Arc<dyn HostTable>,
        cache: CacheConfig,
        metrics: MetricsConfig,
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            ownership: Arc::new(CellOwnership::new(table.clone())),
            table,
            hooks: Arc::new(HookBus::new()),
            registry: Arc::new(PluginRegistry::new()),
            cache: Arc::new(CacheManager::new(cache)),
            metrics: Arc::new(MetricsManager::new(metrics)),
            storage,
            notifier,
            cell_state: DashMap::new(),
        }
    }

    pub fn table_id(&self) -> &str {
        self.table.id()
    }

    pub fn table(&self) -> &Arc<dyn HostTable> {
        &self.table
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CacheManager<String, Value>> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<MetricsManager> {
        &self.metrics
    }

    pub fn ownership(&self) -> &Arc<CellOwnership> {
        &self.ownership
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.registry.has(name)
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.registry.get(name)
    }

    /// Typed lookup. `None` when absent or when `name` is a different type.
    pub fn plugin_as<T: SimplePlugin>(&self, name: &str) -> Option<Arc<PluginWrapper<T>>> {
        self.registry
            .get(name)?
            .as_any()
            .downcast::<PluginWrapper<T>>()
            .ok()
    }

    /// Logs on behalf of the table, tagged with the table id.
    pub fn log(&self, level: LogLevel, message: &str) {
        let table = self.table.id();
        match level {
            LogLevel::Error => error!(table, "{}", message),
            LogLevel::Warn => warn!(table, "{}", message),
            LogLevel::Info => info!(table, "{}", message),
            LogLevel::Debug => debug!(table, "{}", message),
            LogLevel::Trace => trace!(table, "{}", message),
        }
    }

    /// Stores one key of per-cell bookkeeping.
    pub fn set_cell_state(&self, cell: CellRef, key: &str, value: Value) {
        self.cell_state
            .entry(cell)
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn cell_state(&self, cell: CellRef, key: &str) -> Option<Value> {
        self.cell_state.get(&cell)?.get(key).cloned()
    }

    /// Removes one key, or the whole cell entry when `key` is `None`.
    pub fn clear_cell_state(&self, cell: CellRef, key: Option<&str>) -> bool {
        match key {
            None => self.cell_state.remove(&cell).is_some(),
            Some(key) => {
                let removed = self
                    .cell_state
                    .get_mut(&cell)
                    .map(|mut state| state.remove(key).is_some())
                    .unwrap_or(false);
                self.cell_state.remove_if(&cell, |_, state| state.is_empty());
                removed
            }
        }
    }

    pub(crate) fn clear_all_cell_state(&self) {
        self.cell_state.clear();
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("table", &self.table.id())
            .field("plugins", &self.registry.names())
            .finish()
    }
}
