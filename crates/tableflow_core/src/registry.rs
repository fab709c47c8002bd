//! Name-keyed lookup of the plugins installed on a table.
//!
//! The registry never owns a plugin. The table instance holds the strong
//! reference; the registry keeps a `Weak` so a dropped plugin simply stops
//! being found.

use crate::plugin::Plugin;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Registry change notifications delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(String),
    Unregistered(String),
    /// A registration was refused because the name is taken
    Rejected(String),
    /// A plugin failed to load or initialize
    Error { plugin: String, message: String },
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: DashMap<String, Weak<dyn Plugin>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RegistryEvent>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` under `name`.
    ///
    /// Returns `false` without touching the existing entry when a live plugin
    /// already uses the name. A stale entry whose plugin was dropped is
    /// replaced.
    pub fn register(&self, name: &str, plugin: &Arc<dyn Plugin>) -> bool {
        let accepted = match self.plugins.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().strong_count() > 0 {
                    false
                } else {
                    entry.insert(Arc::downgrade(plugin));
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(plugin));
                true
            }
        };

        if accepted {
            debug!("Registered plugin: {}", name);
            self.publish(RegistryEvent::Registered(name.to_string()));
        } else {
            warn!("Plugin {} is already registered", name);
            self.publish(RegistryEvent::Rejected(name.to_string()));
        }
        accepted
    }

    pub fn unregister(&self, name: &str) -> bool {
        if self.plugins.remove(name).is_some() {
            debug!("Unregistered plugin: {}", name);
            self.publish(RegistryEvent::Unregistered(name.to_string()));
            true
        } else {
            warn!("Cannot unregister unknown plugin: {}", name);
            false
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let plugin = self.plugins.get(name)?.upgrade();
        if plugin.is_none() {
            self.plugins.remove_if(name, |_, weak| weak.strong_count() == 0);
        }
        plugin
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Names of every live plugin, sorted.
    pub fn names(&self) -> Vec<String> {
        self.plugins.retain(|_, weak| weak.strong_count() > 0);
        let mut names: Vec<String> = self.plugins.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.plugins
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Logs a plugin failure and forwards it to subscribers.
    pub fn report_error(&self, plugin: &str, err: &dyn std::error::Error) {
        error!("Plugin {} failed: {}", plugin, err);
        self.publish(RegistryEvent::Error {
            plugin: plugin.to_string(),
            message: err.to_string(),
        });
    }

    fn publish(&self, event: RegistryEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.len())
            .finish()
    }
}
