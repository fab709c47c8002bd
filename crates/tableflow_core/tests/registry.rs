use std::sync::Arc;
use tableflow_core::*;

struct Named {
    name: &'static str,
    core: PluginCore,
}

#[async_trait]
impl SimplePlugin for Named {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn core(&self) -> &PluginCore {
        &self.core
    }
}

fn plugin(name: &'static str) -> Arc<dyn Plugin> {
    Arc::new(PluginWrapper::new(Named {
        name,
        core: PluginCore::default(),
    }))
}

#[test]
fn test_register_rejects_live_duplicate() {
    let registry = PluginRegistry::new();
    let first = plugin("sort");
    let second = plugin("sort");

    assert!(registry.register("sort", &first));
    assert!(!registry.register("sort", &second));

    let found = registry.get("sort").unwrap();
    assert!(Arc::ptr_eq(&found, &first));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_dropped_plugin_is_absent_and_replaceable() {
    let registry = PluginRegistry::new();
    let first = plugin("hide");
    assert!(registry.register("hide", &first));
    drop(first);

    assert!(!registry.has("hide"));
    assert!(registry.is_empty());

    let second = plugin("hide");
    assert!(registry.register("hide", &second));
    assert!(registry.has("hide"));
}

#[test]
fn test_unregister_unknown_returns_false() {
    let registry = PluginRegistry::new();
    let edit = plugin("edit");
    registry.register("edit", &edit);

    assert!(registry.unregister("edit"));
    assert!(!registry.unregister("edit"));
    assert!(registry.get("edit").is_none());
}

#[test]
fn test_names_are_sorted() {
    let registry = PluginRegistry::new();
    let plugins: Vec<_> = ["sort", "edit", "filter"].iter().map(|n| plugin(n)).collect();
    for p in &plugins {
        registry.register(p.name(), p);
    }
    assert_eq!(registry.names(), vec!["edit", "filter", "sort"]);
}

#[tokio::test]
async fn test_subscribers_see_registry_events() {
    let registry = PluginRegistry::new();
    let mut events = registry.subscribe();
    let sort = plugin("sort");
    let again = plugin("sort");

    registry.register("sort", &sort);
    registry.register("sort", &again);
    registry.report_error("sort", &PluginError::Runtime("boom".into()));
    registry.unregister("sort");

    assert_eq!(events.recv().await, Some(RegistryEvent::Registered("sort".into())));
    assert_eq!(events.recv().await, Some(RegistryEvent::Rejected("sort".into())));
    match events.recv().await {
        Some(RegistryEvent::Error { plugin, message }) => {
            assert_eq!(plugin, "sort");
            assert!(message.contains("boom"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(events.recv().await, Some(RegistryEvent::Unregistered("sort".into())));
}
