//! The per-table plugin container.

use crate::context::PluginContext;
use crate::error::PluginError;
use crate::plugin::{Plugin, PluginMetadata, PluginState, PluginWrapper, SimplePlugin};
use crate::services::{MemoryStorage, Notifier, Storage, TracingNotifier};
use crate::settings::RuntimeSettings;
use crate::table::{CellRef, HostTable};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceState {
    Created,
    Initialized,
    Destroyed,
}

/// Builder for [`TableInstance`].
pub struct TableInstanceBuilder {
    table: Arc<dyn HostTable>,
    settings: RuntimeSettings,
    storage: Option<Arc<dyn Storage>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl TableInstanceBuilder {
    pub fn settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> TableInstance {
        let context = PluginContext::new(
            self.table,
            self.settings.cache_config(),
            self.settings.metrics_config(),
            self.storage
                .unwrap_or_else(|| Arc::new(MemoryStorage::new())),
            self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
        );
        TableInstance {
            context: Arc::new(context),
            settings: self.settings,
            plugins: RwLock::new(Vec::new()),
            state: Mutex::new(InstanceState::Created),
        }
    }
}

/// Owns the plugins of one table and drives their lifecycle.
///
/// Holds the only strong reference to each plugin. Plugins initialize in
/// dependency order (registration order breaks ties) and are destroyed in the
/// reverse of that order.
pub struct TableInstance {
    context: Arc<PluginContext>,
    settings: RuntimeSettings,
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    state: Mutex<InstanceState>,
}

impl TableInstance {
    pub fn builder(table: Arc<dyn HostTable>) -> TableInstanceBuilder {
        TableInstanceBuilder {
            table,
            settings: RuntimeSettings::default(),
            storage: None,
            notifier: None,
        }
    }

    /// Instance with default settings and in-memory collaborators.
    pub fn new(table: Arc<dyn HostTable>) -> Self {
        Self::builder(table).build()
    }

    pub fn context(&self) -> &Arc<PluginContext> {
        &self.context
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn table(&self) -> &Arc<dyn HostTable> {
        self.context.table()
    }

    pub fn is_initialized(&self) -> bool {
        *self.state.lock() == InstanceState::Initialized
    }

    pub fn is_destroyed(&self) -> bool {
        *self.state.lock() == InstanceState::Destroyed
    }

    /// Registers a plugin and keeps it alive for the lifetime of the table.
    ///
    /// The plugin is not initialized until the next call to [`TableInstance::init`].
    pub fn add_plugin<T: SimplePlugin>(&self, plugin: T) -> Result<Arc<PluginWrapper<T>>, PluginError> {
        if self.is_destroyed() {
            return Err(PluginError::Destroyed(self.context.table_id().to_string()));
        }

        let wrapper = Arc::new(PluginWrapper::new(plugin));
        let name = wrapper.name().to_string();
        let handle: Arc<dyn Plugin> = wrapper.clone();

        if !self.context.registry().register(&name, &handle) {
            return Err(PluginError::AlreadyRegistered(name));
        }
        self.plugins.write().push(handle);
        debug!("Added plugin {} to table {}", name, self.context.table_id());
        Ok(wrapper)
    }

    pub fn get_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.context.plugin(name)
    }

    /// Typed lookup of an installed plugin.
    pub fn plugin<T: SimplePlugin>(&self, name: &str) -> Option<Arc<PluginWrapper<T>>> {
        self.context.plugin_as::<T>(name)
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .read()
            .iter()
            .map(|plugin| plugin.name().to_string())
            .collect()
    }

    pub fn plugin_metadata(&self) -> Vec<PluginMetadata> {
        self.plugins.read().iter().map(|p| p.metadata()).collect()
    }

    /// Plugins ordered so every plugin follows the plugins it depends on.
    ///
    /// Dependencies on plugins not installed here do not constrain the order;
    /// they surface as `MissingDependency` when the dependent plugin inits.
    pub fn dependency_order(&self) -> Result<Vec<Arc<dyn Plugin>>, PluginError> {
        let plugins = self.plugins.read().clone();
        let names: Vec<String> = plugins.iter().map(|p| p.name().to_string()).collect();
        let installed: HashSet<&str> = names.iter().map(String::as_str).collect();
        let deps: Vec<Vec<String>> = plugins
            .iter()
            .map(|p| {
                p.dependencies()
                    .into_iter()
                    .filter(|d| installed.contains(d.as_str()))
                    .collect()
            })
            .collect();

        let mut placed: HashSet<String> = HashSet::new();
        let mut order = Vec::with_capacity(plugins.len());

        while order.len() < plugins.len() {
            // First unplaced plugin, in registration order, whose deps are all placed
            let next = (0..plugins.len()).find(|&i| {
                !placed.contains(&names[i]) && deps[i].iter().all(|d| placed.contains(d))
            });

            match next {
                Some(i) => {
                    placed.insert(names[i].clone());
                    order.push(plugins[i].clone());
                }
                None => {
                    return Err(PluginError::DependencyCycle(Self::find_cycle(
                        &names, &deps, &placed,
                    )));
                }
            }
        }

        Ok(order)
    }

    /// Walks unplaced dependencies from the first unplaced plugin until a name
    /// repeats, returning the cycle path.
    fn find_cycle(names: &[String], deps: &[Vec<String>], placed: &HashSet<String>) -> Vec<String> {
        let index_of = |name: &str| names.iter().position(|n| n == name);
        let Some(mut current) = (0..names.len()).find(|&i| !placed.contains(&names[i])) else {
            return Vec::new();
        };

        let mut path: Vec<usize> = Vec::new();
        loop {
            if let Some(start) = path.iter().position(|&i| i == current) {
                let mut cycle: Vec<String> = path[start..].iter().map(|&i| names[i].clone()).collect();
                cycle.push(names[current].clone());
                return cycle;
            }
            path.push(current);
            match deps[current]
                .iter()
                .find(|d| !placed.contains(*d))
                .and_then(|d| index_of(d.as_str()))
            {
                Some(next) => current = next,
                None => return path.iter().map(|&i| names[i].clone()).collect(),
            }
        }
    }

    /// Initializes every plugin not yet initialized, in dependency order.
    ///
    /// The first plugin failure aborts and is returned; plugins initialized
    /// before it stay initialized. Calling again after adding plugins
    /// initializes only the new ones.
    pub async fn init(&self) -> Result<(), PluginError> {
        if self.is_destroyed() {
            return Err(PluginError::Destroyed(self.context.table_id().to_string()));
        }

        let order = self.dependency_order()?;
        for plugin in &order {
            if plugin.state() == PluginState::Initialized {
                continue;
            }
            let name = plugin.name().to_string();
            let result = self
                .context
                .metrics()
                .measure("plugin.init", plugin.init(self.context.clone()))
                .await;
            if let Err(e) = result {
                self.context.registry().report_error(&name, &e);
                return Err(e);
            }
        }

        let first = {
            let mut state = self.state.lock();
            let first = *state == InstanceState::Created;
            *state = InstanceState::Initialized;
            first
        };

        if first {
            self.context.cache().start_sweeper();
            self.context.metrics().start_flush_task();
            let names: Vec<String> = order.iter().map(|p| p.name().to_string()).collect();
            info!(
                "Table {} initialized with {} plugins",
                self.context.table_id(),
                names.len()
            );
            self.context
                .table()
                .emit("table:initialized", json!({ "plugins": names }));
        }
        Ok(())
    }

    /// Enables every initialized plugin.
    pub fn activate(&self) -> Result<(), PluginError> {
        self.for_each_initialized(|plugin| plugin.enable())
    }

    /// Disables every initialized plugin.
    pub fn deactivate(&self) -> Result<(), PluginError> {
        self.for_each_initialized(|plugin| plugin.disable())
    }

    fn for_each_initialized<F>(&self, action: F) -> Result<(), PluginError>
    where
        F: Fn(&Arc<dyn Plugin>) -> Result<(), PluginError>,
    {
        let plugins = self.plugins.read().clone();
        for plugin in plugins
            .iter()
            .filter(|p| p.state() == PluginState::Initialized)
        {
            action(plugin)?;
        }
        Ok(())
    }

    /// Refreshes every initialized plugin in dependency order.
    pub async fn refresh(&self) -> Result<(), PluginError> {
        for plugin in self.dependency_order()? {
            if plugin.state() == PluginState::Initialized {
                plugin.refresh().await?;
            }
        }
        Ok(())
    }

    /// Destroys every plugin in reverse dependency order and stops the shared
    /// background tasks. Plugin errors are logged and teardown continues.
    pub async fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if *state == InstanceState::Destroyed {
                debug!("Table {} already destroyed", self.context.table_id());
                return;
            }
            *state = InstanceState::Destroyed;
        }

        let order = self
            .dependency_order()
            .unwrap_or_else(|_| self.plugins.read().clone());

        for plugin in order.iter().rev() {
            let name = plugin.name().to_string();
            if let Err(e) = plugin.destroy().await {
                error!("Error destroying plugin {}: {}", name, e);
                self.context.registry().report_error(&name, &e);
            }
            self.context.registry().unregister(&name);
        }
        self.plugins.write().clear();

        self.context.cache().stop_sweeper();
        self.context.metrics().stop_flush_task();
        self.context.metrics().flush();
        self.context.clear_all_cell_state();

        info!("Table {} destroyed", self.context.table_id());
        self.context.table().emit("table:destroyed", Value::Null);
    }

    pub fn set_cell_state(&self, cell: CellRef, key: &str, value: Value) {
        self.context.set_cell_state(cell, key, value);
    }

    pub fn cell_state(&self, cell: CellRef, key: &str) -> Option<Value> {
        self.context.cell_state(cell, key)
    }

    pub fn clear_cell_state(&self, cell: CellRef, key: Option<&str>) -> bool {
        self.context.clear_cell_state(cell, key)
    }
}

impl std::fmt::Debug for TableInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableInstance")
            .field("table", &self.context.table_id())
            .field("plugins", &self.plugin_names())
            .field("state", &*self.state.lock())
            .finish()
    }
}
