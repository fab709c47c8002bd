//! Publish/subscribe hook bus for cross-plugin coordination.
//!
//! Callbacks registered for a hook name run in registration order, one after
//! another. Hooks whose name starts with `before` carry veto semantics: the
//! first callback returning [`HookOutcome::Abort`] stops the chain and the
//! caller must abort its pending operation. For every other hook all callbacks
//! run and their outcomes carry no veto meaning.
//!
//! # Examples
//!
//! ```rust,no_run
//! use tableflow_core::hooks::{HookBus, HookOutcome};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), tableflow_core::HookError> {
//! let hooks = HookBus::new();
//! hooks
//!     .register_sync("beforeSave", |payload| {
//!         if payload["new_value"] == "" {
//!             HookOutcome::abort("value cannot be empty")
//!         } else {
//!             HookOutcome::Proceed
//!         }
//!     })
//!     .await;
//!
//! let result = hooks.trigger("beforeSave", json!({"new_value": ""})).await?;
//! assert!(result.is_vetoed());
//! # Ok(())
//! # }
//! ```

use crate::error::HookError;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Result of a single hook callback.
///
/// A tagged type instead of a sentinel return value, so a legitimate falsy
/// payload can never be mistaken for a veto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Let the pending operation continue
    Proceed,
    /// Decline the pending operation, with an optional reason
    Abort(Option<String>),
}

impl HookOutcome {
    pub fn abort(reason: impl Into<String>) -> Self {
        HookOutcome::Abort(Some(reason.into()))
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, HookOutcome::Abort(_))
    }
}

/// Identifier of a single registration, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Boxed async hook callback.
pub type HookCallback =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<HookOutcome, HookError>> + Send + Sync>;

#[derive(Clone)]
struct RegisteredHook {
    id: HookId,
    owner: Option<String>,
    callback: HookCallback,
}

/// A veto raised by a `before*` hook callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veto {
    /// Position of the vetoing callback in the chain
    pub index: usize,
    pub reason: Option<String>,
}

/// Outcome of [`HookBus::trigger`].
#[derive(Debug, Clone)]
pub struct TriggerResult {
    pub hook: String,
    /// Outcome of every callback that ran, in order
    pub outcomes: Vec<HookOutcome>,
    /// Set when a `before*` hook callback vetoed
    pub veto: Option<Veto>,
}

impl TriggerResult {
    pub fn is_vetoed(&self) -> bool {
        self.veto.is_some()
    }

    /// Veto reason, if a callback supplied one.
    pub fn veto_reason(&self) -> Option<&str> {
        self.veto.as_ref().and_then(|v| v.reason.as_deref())
    }
}

/// Returns whether a hook name carries veto semantics.
pub fn is_before_hook(hook: &str) -> bool {
    hook.starts_with("before")
}

/// Ordered hook registry with sequential async dispatch.
pub struct HookBus {
    hooks: RwLock<HashMap<String, Vec<RegisteredHook>>>,
    next_id: AtomicU64,
}

impl HookBus {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Appends an async callback to the chain for `hook`. No de-duplication.
    pub async fn register<F, Fut>(&self, hook: &str, callback: F) -> HookId
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutcome, HookError>> + Send + 'static,
    {
        self.insert(hook, None, Arc::new(move |payload| callback(payload).boxed()))
            .await
    }

    /// Appends a synchronous callback to the chain for `hook`.
    pub async fn register_sync<F>(&self, hook: &str, callback: F) -> HookId
    where
        F: Fn(&Value) -> HookOutcome + Send + Sync + 'static,
    {
        self.insert(
            hook,
            None,
            Arc::new(move |payload| {
                let outcome = callback(&payload);
                futures::future::ready(Ok::<_, HookError>(outcome)).boxed()
            }),
        )
        .await
    }

    /// Appends a callback tagged with the registering plugin's name so it can
    /// be removed in bulk on teardown.
    pub async fn register_owned(&self, owner: &str, hook: &str, callback: HookCallback) -> HookId {
        self.insert(hook, Some(owner.to_string()), callback).await
    }

    async fn insert(&self, hook: &str, owner: Option<String>, callback: HookCallback) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut hooks = self.hooks.write().await;
        hooks.entry(hook.to_string()).or_default().push(RegisteredHook {
            id,
            owner,
            callback,
        });
        debug!(hook = %hook, "Registered hook callback");
        id
    }

    /// Removes a single registration.
    pub async fn unregister(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.write().await;
        let mut removed = false;
        for callbacks in hooks.values_mut() {
            let before = callbacks.len();
            callbacks.retain(|registered| registered.id != id);
            removed |= callbacks.len() != before;
        }
        hooks.retain(|_, callbacks| !callbacks.is_empty());
        removed
    }

    /// Removes every registration owned by `owner`. Returns how many were removed.
    pub async fn remove_owner(&self, owner: &str) -> usize {
        let mut hooks = self.hooks.write().await;
        let mut removed = 0;
        for callbacks in hooks.values_mut() {
            let before = callbacks.len();
            callbacks.retain(|registered| registered.owner.as_deref() != Some(owner));
            removed += before - callbacks.len();
        }
        hooks.retain(|_, callbacks| !callbacks.is_empty());
        removed
    }

    /// Number of callbacks registered for `hook`.
    pub async fn handler_count(&self, hook: &str) -> usize {
        self.hooks
            .read()
            .await
            .get(hook)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Total number of callbacks across all hooks.
    pub async fn total_handlers(&self) -> usize {
        self.hooks.read().await.values().map(Vec::len).sum()
    }

    /// Invokes every callback for `hook` in registration order, awaiting each
    /// before starting the next.
    ///
    /// The callback list is snapshotted before dispatch, so callbacks may
    /// register or unregister hooks without deadlocking. Callback errors are
    /// returned as-is.
    pub async fn trigger(&self, hook: &str, payload: Value) -> Result<TriggerResult, HookError> {
        let callbacks: Vec<RegisteredHook> = {
            let hooks = self.hooks.read().await;
            hooks.get(hook).cloned().unwrap_or_default()
        };

        let vetoable = is_before_hook(hook);
        let mut outcomes = Vec::with_capacity(callbacks.len());
        let mut veto = None;

        for (index, registered) in callbacks.iter().enumerate() {
            let outcome = (registered.callback)(payload.clone()).await?;
            let aborted = match &outcome {
                HookOutcome::Abort(reason) => Some(reason.clone()),
                HookOutcome::Proceed => None,
            };
            outcomes.push(outcome);

            if let Some(reason) = aborted {
                if vetoable {
                    warn!(
                        hook = %hook,
                        owner = registered.owner.as_deref().unwrap_or("-"),
                        "Hook vetoed: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    );
                    veto = Some(Veto { index, reason });
                    break;
                }
            }
        }

        Ok(TriggerResult {
            hook: hook.to_string(),
            outcomes,
            veto,
        })
    }
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookBus")
            .field("hooks", &"[hooks]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_callbacks_run_in_registration_order() {
        let bus = HookBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            bus.register_sync("afterSort", move |_| {
                order.lock().push(i);
                HookOutcome::Proceed
            })
            .await;
        }

        let result = bus.trigger("afterSort", json!({})).await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(result.outcomes.len(), 3);
        assert!(!result.is_vetoed());
    }

    #[tokio::test]
    async fn test_before_hook_veto_short_circuits() {
        let bus = HookBus::new();
        let second_calls = Arc::new(AtomicUsize::new(0));

        bus.register_sync("beforeSave", |_| HookOutcome::abort("locked"))
            .await;
        let calls = second_calls.clone();
        bus.register_sync("beforeSave", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            HookOutcome::Proceed
        })
        .await;

        let result = bus.trigger("beforeSave", json!({"row": 1})).await.unwrap();
        assert!(result.is_vetoed());
        assert_eq!(result.veto_reason(), Some("locked"));
        assert_eq!(result.veto.as_ref().unwrap().index, 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_after_hook_ignores_abort() {
        let bus = HookBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.register_sync("afterSave", |_| HookOutcome::Abort(None)).await;
        let seen = calls.clone();
        bus.register_sync("afterSave", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            HookOutcome::Proceed
        })
        .await;

        let result = bus.trigger("afterSave", json!(null)).await.unwrap();
        assert!(!result.is_vetoed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_falsy_payloads_are_not_vetoes() {
        let bus = HookBus::new();
        bus.register_sync("beforeSave", |payload| {
            // Zero and empty strings are ordinary values
            assert!(payload["value"] == json!(0) || payload["value"] == json!(""));
            HookOutcome::Proceed
        })
        .await;

        assert!(!bus.trigger("beforeSave", json!({"value": 0})).await.unwrap().is_vetoed());
        assert!(!bus.trigger("beforeSave", json!({"value": ""})).await.unwrap().is_vetoed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_callbacks_are_awaited_sequentially() {
        let bus = HookBus::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = log.clone();
        bus.register("beforeFilter", move |_| {
            let log = first.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                log.lock().push("slow");
                Ok(HookOutcome::Proceed)
            }
        })
        .await;
        let second = log.clone();
        bus.register("beforeFilter", move |_| {
            let log = second.clone();
            async move {
                log.lock().push("fast");
                Ok(HookOutcome::Proceed)
            }
        })
        .await;

        bus.trigger("beforeFilter", json!({})).await.unwrap();
        assert_eq!(*log.lock(), vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn test_callback_error_propagates() {
        let bus = HookBus::new();
        bus.register("beforeSave", |_| async {
            Err(HookError::callback("beforeSave", "storage offline"))
        })
        .await;

        let error = bus.trigger("beforeSave", json!({})).await.unwrap_err();
        assert!(error.to_string().contains("storage offline"));
    }

    #[tokio::test]
    async fn test_unregister_and_remove_owner() {
        let bus = HookBus::new();
        let id = bus.register_sync("afterSort", |_| HookOutcome::Proceed).await;
        let owned: HookCallback = Arc::new(|_: Value| {
            futures::future::ready(Ok::<_, HookError>(HookOutcome::Proceed)).boxed()
        });
        bus.register_owned("edit", "beforeSave", owned.clone()).await;
        bus.register_owned("edit", "afterSave", owned).await;

        assert_eq!(bus.total_handlers().await, 3);
        assert!(bus.unregister(id).await);
        assert!(!bus.unregister(id).await);
        assert_eq!(bus.remove_owner("edit").await, 2);
        assert_eq!(bus.total_handlers().await, 0);
    }

    #[tokio::test]
    async fn test_trigger_without_callbacks() {
        let bus = HookBus::new();
        let result = bus.trigger("beforeSort", json!({})).await.unwrap();
        assert!(result.outcomes.is_empty());
        assert!(!result.is_vetoed());
    }
}
