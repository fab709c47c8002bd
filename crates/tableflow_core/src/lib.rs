//! # TableFlow Core
//!
//! Plugin runtime for extensible tables. A [`TableInstance`] owns a set of
//! plugins that cooperate over a shared [`HostTable`] through:
//!
//! - **Lifecycle**: [`SimplePlugin`] implementations wrapped in a
//!   [`PluginWrapper`], initialized in dependency order, destroyed in reverse
//! - **Hooks**: a [`HookBus`] where `before*` hooks may veto an operation
//! - **Cache**: a TTL [`CacheManager`] with LRU, LFU or FIFO eviction
//! - **Metrics**: a sampling [`MetricsManager`] with periodic flush
//! - **Config**: schema-validated [`ConfigManager`] per plugin
//! - **Ownership**: [`CellOwnership`] so only one plugin mutates a cell at a time
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tableflow_core::*;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), PluginError> {
//! let table = Arc::new(MemoryTable::from_data(TableData {
//!     id: "people".into(),
//!     headers: vec!["name".into(), "email".into()],
//!     rows: vec![vec!["Ada".into(), "ada@example.com".into()]],
//! }));
//!
//! let instance = TableInstance::new(table);
//! instance.init().await?;
//! instance.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod debounce;
pub mod error;
pub mod hooks;
pub mod instance;
pub mod metrics;
pub mod ownership;
pub mod plugin;
pub mod registry;
pub mod services;
pub mod settings;
pub mod table;

pub use cache::{CacheConfig, CacheManager, CacheStats, EvictionStrategy, SetOptions};
pub use config::{ConfigManager, ConfigSchema, FieldSchema, Validator, ValidatorSet, WatchId};
pub use context::PluginContext;
pub use debounce::Debouncer;
pub use error::{CacheError, ConfigError, FieldError, HookError, PluginError, TableError};
pub use hooks::{HookBus, HookId, HookOutcome, TriggerResult, Veto};
pub use instance::{TableInstance, TableInstanceBuilder};
pub use metrics::{MetricSample, MetricSummary, MetricType, MetricsConfig, MetricsManager, TimerHandle};
pub use ownership::{CellOwnership, OWNER_ATTRIBUTE};
pub use plugin::{Plugin, PluginCore, PluginMetadata, PluginState, PluginWrapper, SimplePlugin};
pub use registry::{PluginRegistry, RegistryEvent};
pub use services::{
    MemoryStorage, Notification, NotificationKind, Notifier, RecordingNotifier, Storage,
    TracingNotifier,
};
pub use settings::{
    CacheSettings, LoggingSettings, MetricsSettings, PluginSettings, RuntimeSettings,
    ValidationRule,
};
pub use table::{CellRef, HostTable, ListenerId, MemoryTable, TableData, TableEvent, TableListener};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use serde_json::{json, Value};

/// Result alias used across the runtime.
pub type Result<T, E = PluginError> = std::result::Result<T, E>;

/// Current runtime version
pub const TABLEFLOW_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log levels for plugin and table messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Failures that abort an operation
    Error,
    /// Rejected or vetoed operations
    Warn,
    /// Lifecycle messages
    Info,
    /// Per-operation detail
    Debug,
    /// Very detailed trace information
    Trace,
}

/// Milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
