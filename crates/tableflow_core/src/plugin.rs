//! Plugin trait definitions and the lifecycle wrapper.
//!
//! Plugins implement [`SimplePlugin`]: identity, an options schema and the
//! `on_init` / `on_refresh` / `on_destroy` hooks. The table never calls those
//! directly. It stores each plugin as a [`PluginWrapper`], which implements the
//! object-safe [`Plugin`] lifecycle API and enforces the state machine:
//!
//! ```text
//! Uninitialized --init--> Initialized --destroy--> Destroyed
//!       |                                              ^
//!       +--------------------destroy-------------------+
//! ```
//!
//! Everything a plugin acquires through its [`PluginCore`] (hook
//! registrations, table listeners, background tasks, owned cells) is released
//! by the wrapper when `init` fails or the plugin is destroyed.
//!
//! # Examples
//!
//! ```rust,no_run
//! use tableflow_core::*;
//! use std::sync::Arc;
//!
//! struct Audit {
//!     core: PluginCore,
//! }
//!
//! #[async_trait::async_trait]
//! impl SimplePlugin for Audit {
//!     fn name(&self) -> &str { "audit" }
//!     fn version(&self) -> &str { "1.0.0" }
//!     fn core(&self) -> &PluginCore { &self.core }
//!
//!     async fn on_init(&self, _context: &Arc<PluginContext>) -> Result<(), PluginError> {
//!         self.core
//!             .hook_sync("afterSave", |payload| {
//!                 tracing::info!("saved {}", payload);
//!                 HookOutcome::Proceed
//!             })
//!             .await?;
//!         Ok(())
//!     }
//! }
//! ```

use crate::config::{ConfigManager, ConfigSchema, FieldSchema};
use crate::context::PluginContext;
use crate::error::{HookError, PluginError};
use crate::hooks::{HookCallback, HookId, HookOutcome};
use crate::table::{ListenerId, TableEvent};
use crate::LogLevel;
use async_trait::async_trait;
use futures::future::FutureExt;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle state of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginState {
    Uninitialized,
    Initialized,
    Destroyed,
}

/// Snapshot describing a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub state: PluginState,
    pub enabled: bool,
}

/// High-level trait implemented by every table plugin.
///
/// All methods take `&self`: plugins are shared as `Arc` and keep mutable
/// state behind interior mutability, usually inside their [`PluginCore`].
#[async_trait]
pub trait SimplePlugin: Send + Sync + 'static {
    /// Unique name within a table
    fn name(&self) -> &str;

    /// Semantic version string
    fn version(&self) -> &str;

    /// Names of plugins that must be registered on the same table
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Schema for this plugin's options. The base `enabled` field is added
    /// automatically.
    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new()
    }

    /// Shared lifecycle bookkeeping embedded in the plugin
    fn core(&self) -> &PluginCore;

    /// Called once by `init` after options and dependencies are validated.
    async fn on_init(&self, _context: &Arc<PluginContext>) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called by `refresh` while the plugin is enabled.
    async fn on_refresh(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once by `destroy`, before tracked resources are released.
    async fn on_destroy(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Object-safe lifecycle API the table stores for each plugin.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn dependencies(&self) -> Vec<String>;
    fn state(&self) -> PluginState;
    fn is_enabled(&self) -> bool;
    fn metadata(&self) -> PluginMetadata;

    async fn init(&self, context: Arc<PluginContext>) -> Result<(), PluginError>;
    fn enable(&self) -> Result<(), PluginError>;
    fn disable(&self) -> Result<(), PluginError>;
    async fn refresh(&self) -> Result<(), PluginError>;
    async fn destroy(&self) -> Result<(), PluginError>;

    /// Upcast used for typed lookups.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Per-plugin state shared by every [`SimplePlugin`]: construction options,
/// the validated config, the attached context and tracked resources.
pub struct PluginCore {
    options: Map<String, Value>,
    config: RwLock<ConfigManager>,
    owner: RwLock<String>,
    context: RwLock<Option<Arc<PluginContext>>>,
    hooks: Mutex<Vec<HookId>>,
    listeners: Mutex<Vec<ListenerId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PluginCore {
    /// Creates a core from an options object. Non-object values are treated
    /// as empty options.
    pub fn new(options: Value) -> Self {
        let options = match options {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            options,
            config: RwLock::new(ConfigManager::new()),
            owner: RwLock::new(String::new()),
            context: RwLock::new(None),
            hooks: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Options as passed at construction, before validation and defaults.
    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    /// The validated configuration.
    pub fn config(&self) -> RwLockReadGuard<'_, ConfigManager> {
        self.config.read()
    }

    pub fn config_mut(&self) -> RwLockWriteGuard<'_, ConfigManager> {
        self.config.write()
    }

    pub fn is_enabled(&self) -> bool {
        self.config
            .read()
            .get_bool("enabled")
            .or_else(|| self.options.get("enabled").and_then(Value::as_bool))
            .unwrap_or(true)
    }

    /// The context attached by `init`; `None` before init and after destroy.
    pub fn context(&self) -> Option<Arc<PluginContext>> {
        self.context.read().clone()
    }

    /// Like [`PluginCore::context`] but fails with `NotInitialized`.
    pub fn require_context(&self) -> Result<Arc<PluginContext>, PluginError> {
        self.context()
            .ok_or_else(|| PluginError::NotInitialized(self.owner.read().clone()))
    }

    /// Registers a hook callback owned by this plugin.
    pub async fn hook<F, Fut>(&self, hook: &str, callback: F) -> Result<HookId, PluginError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutcome, HookError>> + Send + 'static,
    {
        let context = self.require_context()?;
        let callback: HookCallback = Arc::new(move |payload| callback(payload).boxed());
        let owner = self.owner.read().clone();
        let id = context.hooks().register_owned(&owner, hook, callback).await;
        self.hooks.lock().push(id);
        Ok(id)
    }

    /// Registers a synchronous hook callback owned by this plugin.
    pub async fn hook_sync<F>(&self, hook: &str, callback: F) -> Result<HookId, PluginError>
    where
        F: Fn(&Value) -> HookOutcome + Send + Sync + 'static,
    {
        self.hook(hook, move |payload: Value| {
            futures::future::ready(Ok::<_, HookError>(callback(&payload)))
        })
        .await
    }

    /// Subscribes to a table event for the lifetime of the plugin.
    pub fn listen<F>(&self, event: &str, listener: F) -> Result<ListenerId, PluginError>
    where
        F: Fn(&TableEvent) + Send + Sync + 'static,
    {
        let context = self.require_context()?;
        let id = context.table().on(event, Arc::new(listener));
        self.listeners.lock().push(id);
        Ok(id)
    }

    /// Spawns a background task aborted when the plugin is destroyed.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(tokio::spawn(task));
    }

    /// Logs tagged with the table id and plugin name.
    pub fn log(&self, level: LogLevel, message: &str) {
        let owner = self.owner.read().clone();
        let table = self
            .context()
            .map(|context| context.table_id().to_string())
            .unwrap_or_default();
        match level {
            LogLevel::Error => error!(table = %table, plugin = %owner, "{}", message),
            LogLevel::Warn => warn!(table = %table, plugin = %owner, "{}", message),
            LogLevel::Info => info!(table = %table, plugin = %owner, "{}", message),
            LogLevel::Debug => debug!(table = %table, plugin = %owner, "{}", message),
            LogLevel::Trace => trace!(table = %table, plugin = %owner, "{}", message),
        }
    }

    pub fn tracked_hooks(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn tracked_listeners(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Validates the options against the base schema merged with `schema`.
    fn configure(&self, schema: ConfigSchema) -> Result<(), PluginError> {
        let schema = ConfigSchema::new()
            .field(
                "enabled",
                FieldSchema::new("boolean").with_default(Value::Bool(true)),
            )
            .merge(schema);

        let mut manager = ConfigManager::new();
        manager.set_config(self.options.clone())?;
        manager.set_schema(schema)?;
        *self.config.write() = manager;
        Ok(())
    }

    fn attach(&self, owner: &str, context: Arc<PluginContext>) {
        *self.owner.write() = owner.to_string();
        *self.context.write() = Some(context);
    }

    /// Releases every tracked hook, listener, task and owned cell, then
    /// detaches the context.
    async fn release(&self) {
        let hooks: Vec<HookId> = self.hooks.lock().drain(..).collect();
        let listeners: Vec<ListenerId> = self.listeners.lock().drain(..).collect();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let Some(context) = self.context.write().take() else {
            return;
        };
        for id in hooks {
            context.hooks().unregister(id).await;
        }
        for id in listeners {
            context.table().off(id);
        }
        let owner = self.owner.read().clone();
        let released = context.ownership().release_all(&owner);
        if released > 0 {
            debug!("Plugin {} released {} owned cells", owner, released);
        }
    }
}

impl Default for PluginCore {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

impl std::fmt::Debug for PluginCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCore")
            .field("options", &self.options)
            .field("hooks", &self.hooks.lock().len())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

/// Wrapper to bridge [`SimplePlugin`] and [`Plugin`] with panic protection.
pub struct PluginWrapper<T> {
    inner: T,
    state: Mutex<PluginState>,
    /// Serializes async lifecycle transitions
    lifecycle: tokio::sync::Mutex<()>,
}

impl<T: SimplePlugin> std::fmt::Debug for PluginWrapper<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginWrapper")
            .field("name", &self.inner.name())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl<T: SimplePlugin> PluginWrapper<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            state: Mutex::new(PluginState::Uninitialized),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Helper to convert panics to PluginError
    fn panic_to_error(panic_info: Box<dyn Any + Send>) -> PluginError {
        let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
            format!("Plugin panicked: {}", s)
        } else if let Some(s) = panic_info.downcast_ref::<String>() {
            format!("Plugin panicked: {}", s)
        } else {
            "Plugin panicked with unknown error".to_string()
        };
        PluginError::Runtime(message)
    }

    async fn guarded<F>(future: F) -> Result<(), PluginError>
    where
        F: Future<Output = Result<(), PluginError>>,
    {
        AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Self::panic_to_error(panic)))
    }

    fn require_initialized(&self) -> Result<(), PluginError> {
        match *self.state.lock() {
            PluginState::Initialized => Ok(()),
            PluginState::Uninitialized => Err(PluginError::NotInitialized(self.name().to_string())),
            PluginState::Destroyed => Err(PluginError::Destroyed(self.name().to_string())),
        }
    }

    fn set_enabled(&self, enabled: bool) -> Result<(), PluginError> {
        self.require_initialized()?;
        self.inner
            .core()
            .config_mut()
            .set("enabled", Value::Bool(enabled))?;
        debug!(
            "Plugin {} {}",
            self.name(),
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }
}

impl<T> std::ops::Deref for PluginWrapper<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: SimplePlugin> Plugin for PluginWrapper<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn version(&self) -> &str {
        self.inner.version()
    }

    fn dependencies(&self) -> Vec<String> {
        self.inner.dependencies()
    }

    fn state(&self) -> PluginState {
        *self.state.lock()
    }

    fn is_enabled(&self) -> bool {
        self.inner.core().is_enabled()
    }

    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            name: self.name().to_string(),
            version: self.version().to_string(),
            dependencies: self.dependencies(),
            state: self.state(),
            enabled: self.is_enabled(),
        }
    }

    async fn init(&self, context: Arc<PluginContext>) -> Result<(), PluginError> {
        let _lifecycle = self.lifecycle.lock().await;
        let name = self.name().to_string();

        match self.state() {
            PluginState::Initialized => {
                warn!("Plugin {} is already initialized", name);
                return Ok(());
            }
            PluginState::Destroyed => return Err(PluginError::Destroyed(name)),
            PluginState::Uninitialized => {}
        }

        let core = self.inner.core();
        core.configure(self.inner.config_schema())?;

        for dependency in self.inner.dependencies() {
            if !context.has_plugin(&dependency) {
                return Err(PluginError::MissingDependency {
                    plugin: name,
                    dependency,
                });
            }
        }

        core.attach(&name, context.clone());
        if let Err(e) = Self::guarded(self.inner.on_init(&context)).await {
            error!("Plugin {} failed to initialize: {}", name, e);
            core.release().await;
            return Err(e);
        }

        *self.state.lock() = PluginState::Initialized;
        info!("Initialized plugin {} v{}", name, self.version());
        Ok(())
    }

    fn enable(&self) -> Result<(), PluginError> {
        self.set_enabled(true)
    }

    fn disable(&self) -> Result<(), PluginError> {
        self.set_enabled(false)
    }

    async fn refresh(&self) -> Result<(), PluginError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.require_initialized()?;
        if !self.is_enabled() {
            debug!("Skipping refresh of disabled plugin {}", self.name());
            return Ok(());
        }
        Self::guarded(self.inner.on_refresh()).await
    }

    async fn destroy(&self) -> Result<(), PluginError> {
        let _lifecycle = self.lifecycle.lock().await;
        let previous = self.state();
        if previous == PluginState::Destroyed {
            debug!("Plugin {} already destroyed", self.name());
            return Ok(());
        }

        let result = if previous == PluginState::Initialized {
            Self::guarded(self.inner.on_destroy()).await
        } else {
            Ok(())
        };

        self.inner.core().release().await;
        *self.state.lock() = PluginState::Destroyed;

        match &result {
            Ok(()) => info!("Destroyed plugin {}", self.name()),
            Err(e) => error!("Plugin {} failed during destroy: {}", self.name(), e),
        }
        result
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::error::ConfigError;
    use crate::metrics::MetricsConfig;
    use crate::services::{MemoryStorage, TracingNotifier};
    use crate::table::{HostTable, MemoryTable, TableData};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        core: PluginCore,
        deps: Vec<String>,
        inits: AtomicUsize,
        destroys: AtomicUsize,
        fail_init: bool,
        panic_refresh: bool,
    }

    impl Probe {
        fn new(options: Value) -> Self {
            Self {
                core: PluginCore::new(options),
                deps: Vec::new(),
                inits: AtomicUsize::new(0),
                destroys: AtomicUsize::new(0),
                fail_init: false,
                panic_refresh: false,
            }
        }
    }

    #[async_trait]
    impl SimplePlugin for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn version(&self) -> &str {
            "0.1.0"
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        fn config_schema(&self) -> ConfigSchema {
            ConfigSchema::new().field("limit", FieldSchema::new("integer").with_default(json!(10)))
        }

        fn core(&self) -> &PluginCore {
            &self.core
        }

        async fn on_init(&self, _context: &Arc<PluginContext>) -> Result<(), PluginError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            self.core.hook_sync("beforeSave", |_| HookOutcome::Proceed).await?;
            self.core.listen("sort:change", |_| {})?;
            if self.fail_init {
                return Err(PluginError::InitializationFailed("probe refused".into()));
            }
            Ok(())
        }

        async fn on_refresh(&self) -> Result<(), PluginError> {
            if self.panic_refresh {
                panic!("refresh exploded");
            }
            Ok(())
        }

        async fn on_destroy(&self) -> Result<(), PluginError> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context() -> (Arc<MemoryTable>, Arc<PluginContext>) {
        let table = Arc::new(MemoryTable::from_data(TableData {
            id: "t".into(),
            headers: vec!["a".into()],
            rows: vec![vec!["1".into()]],
        }));
        let context = Arc::new(PluginContext::new(
            table.clone(),
            CacheConfig::default(),
            MetricsConfig::default(),
            Arc::new(MemoryStorage::new()),
            Arc::new(TracingNotifier),
        ));
        (table, context)
    }

    #[tokio::test]
    async fn test_init_applies_defaults_and_tracks_resources() {
        let (_table, context) = context();
        let plugin = PluginWrapper::new(Probe::new(json!({})));

        plugin.init(context.clone()).await.unwrap();

        assert_eq!(plugin.state(), PluginState::Initialized);
        assert!(plugin.is_enabled());
        assert_eq!(plugin.core().config().get_u64("limit"), Some(10));
        assert_eq!(plugin.core().tracked_hooks(), 1);
        assert_eq!(context.hooks().handler_count("beforeSave").await, 1);
    }

    #[tokio::test]
    async fn test_second_init_is_noop() {
        let (_table, context) = context();
        let plugin = PluginWrapper::new(Probe::new(json!({})));

        plugin.init(context.clone()).await.unwrap();
        plugin.init(context.clone()).await.unwrap();

        assert_eq!(plugin.inits.load(Ordering::SeqCst), 1);
        assert_eq!(context.hooks().handler_count("beforeSave").await, 1);
    }

    #[tokio::test]
    async fn test_invalid_options_reject_init() {
        let (_table, context) = context();
        let plugin = PluginWrapper::new(Probe::new(json!({"enabled": "yes", "limit": 2.5})));

        let err = plugin.init(context).await.unwrap_err();
        match err {
            PluginError::Configuration(ConfigError::Validation(fields)) => {
                let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
                assert!(names.contains(&"enabled"));
                assert!(names.contains(&"limit"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(plugin.state(), PluginState::Uninitialized);
        assert_eq!(plugin.inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_dependency_blocks_on_init() {
        let (_table, context) = context();
        let mut probe = Probe::new(json!({}));
        probe.deps = vec!["edit".into()];
        let plugin = PluginWrapper::new(probe);

        let err = plugin.init(context).await.unwrap_err();
        assert!(matches!(
            err,
            PluginError::MissingDependency { ref dependency, .. } if dependency == "edit"
        ));
        assert_eq!(plugin.inits.load(Ordering::SeqCst), 0);
        assert_eq!(plugin.state(), PluginState::Uninitialized);
    }

    #[tokio::test]
    async fn test_failed_init_releases_acquired_resources() {
        let (table, context) = context();
        let mut probe = Probe::new(json!({}));
        probe.fail_init = true;
        let plugin = PluginWrapper::new(probe);

        assert!(plugin.init(context.clone()).await.is_err());
        assert_eq!(plugin.state(), PluginState::Uninitialized);
        assert_eq!(context.hooks().handler_count("beforeSave").await, 0);
        assert_eq!(table.listener_count(), 0);
        assert!(plugin.core().context().is_none());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (table, context) = context();
        let plugin = PluginWrapper::new(Probe::new(json!({})));
        plugin.init(context.clone()).await.unwrap();

        plugin.destroy().await.unwrap();
        plugin.destroy().await.unwrap();

        assert_eq!(plugin.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(plugin.state(), PluginState::Destroyed);
        assert_eq!(context.hooks().total_handlers().await, 0);
        assert_eq!(table.listener_count(), 0);
        assert!(matches!(
            plugin.init(context).await,
            Err(PluginError::Destroyed(_))
        ));
        assert!(matches!(plugin.refresh().await, Err(PluginError::Destroyed(_))));
        assert!(matches!(plugin.enable(), Err(PluginError::Destroyed(_))));
    }

    #[tokio::test]
    async fn test_enable_requires_init() {
        let (_table, context) = context();
        let plugin = PluginWrapper::new(Probe::new(json!({})));
        assert!(matches!(plugin.disable(), Err(PluginError::NotInitialized(_))));
        assert!(matches!(plugin.refresh().await, Err(PluginError::NotInitialized(_))));

        plugin.init(context).await.unwrap();
        plugin.disable().unwrap();
        assert!(!plugin.is_enabled());
        plugin.enable().unwrap();
        assert!(plugin.metadata().enabled);
    }

    #[tokio::test]
    async fn test_panic_in_refresh_becomes_runtime_error() {
        let (_table, context) = context();
        let mut probe = Probe::new(json!({}));
        probe.panic_refresh = true;
        let plugin = PluginWrapper::new(probe);
        plugin.init(context).await.unwrap();

        let err = plugin.refresh().await.unwrap_err();
        assert!(matches!(err, PluginError::Runtime(ref m) if m.contains("refresh exploded")));
        assert_eq!(plugin.state(), PluginState::Initialized);

        // Disabled plugins skip refresh entirely
        plugin.disable().unwrap();
        assert!(plugin.refresh().await.is_ok());
    }
}
