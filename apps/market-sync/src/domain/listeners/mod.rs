//! Listener Registry
//!
//! Type-keyed publish/subscribe store for [`FeedEvent`]s.
//!
//! - Handlers subscribe to one event type or to the wildcard channel `"*"`.
//! - A dispatch runs type-specific handlers first, then wildcard handlers,
//!   each list in registration order.
//! - A panicking handler is caught and logged; its siblings still run.
//! - Handlers are invoked outside the registry lock, so a handler may
//!   subscribe or unsubscribe without deadlocking.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::events::{FeedEvent, WILDCARD};

/// Event handler.
pub type Handler = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

type HandlerList = Vec<(u64, Handler)>;

#[derive(Default)]
struct RegistryState {
    channels: HashMap<String, HandlerList>,
    suppressed: bool,
}

#[derive(Default)]
struct RegistryInner {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn remove(&self, channel: &str, id: u64) -> bool {
        let mut state = self.state.lock();
        let Some(handlers) = state.channels.get_mut(channel) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            state.channels.remove(channel);
        }
        removed
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that returned normally.
    pub delivered: usize,
    /// Handlers that panicked.
    pub failed: usize,
    /// The event was dropped because dispatch is suppressed.
    pub suppressed: bool,
}

/// Handle returned by [`ListenerRegistry::subscribe`].
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    registry: Weak<RegistryInner>,
    channel: String,
    id: u64,
}

impl SubscriptionHandle {
    /// Channel this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Remove the subscription.
    ///
    /// Returns `true` the first time; later calls are no-ops returning `false`.
    pub fn unsubscribe(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|inner| inner.remove(&self.channel, self.id))
    }
}

/// Publish/subscribe registry keyed by event type.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ListenerRegistry")
            .field("channels", &state.channels.len())
            .field("suppressed", &state.suppressed)
            .finish()
    }
}

impl ListenerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of type `kind` (or `"*"` for all).
    pub fn subscribe<F>(&self, kind: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        let channel = kind.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .state
            .lock()
            .channels
            .entry(channel.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        tracing::debug!(channel = %channel, id, "Listener subscribed");

        SubscriptionHandle {
            registry: Arc::downgrade(&self.inner),
            channel,
            id,
        }
    }

    /// Deliver `event` to its type-specific handlers, then to wildcard handlers.
    pub fn dispatch(&self, event: &FeedEvent) -> DispatchReport {
        let kind = event.kind();
        let (specific, wildcard) = {
            let state = self.inner.state.lock();
            if state.suppressed && !event.is_control() {
                return DispatchReport {
                    suppressed: true,
                    ..DispatchReport::default()
                };
            }
            let specific = if kind == WILDCARD {
                Vec::new()
            } else {
                state.channels.get(kind).cloned().unwrap_or_default()
            };
            let wildcard = state.channels.get(WILDCARD).cloned().unwrap_or_default();
            (specific, wildcard)
        };

        let mut report = DispatchReport::default();
        for (id, handler) in specific.iter().chain(wildcard.iter()) {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_ok() {
                report.delivered += 1;
            } else {
                report.failed += 1;
                tracing::error!(event = kind, handler = id, "Listener panicked during dispatch");
            }
        }
        report
    }

    /// Suppress (or re-enable) delivery of non-control events.
    pub fn suppress(&self, suppressed: bool) {
        self.inner.state.lock().suppressed = suppressed;
        tracing::debug!(suppressed, "Listener dispatch suppression changed");
    }

    /// Check whether non-control events are being dropped.
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.inner.state.lock().suppressed
    }

    /// Number of handlers subscribed to `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: &str) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .get(kind)
            .map_or(0, Vec::len)
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        self.inner.state.lock().channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for = {
            let log = Arc::clone(&log);
            move |label: &str| -> Handler {
                let log = Arc::clone(&log);
                let label = label.to_string();
                Arc::new(move |_event: &FeedEvent| log.lock().push(label.clone()))
            }
        };
        (log, log_for)
    }

    #[test]
    fn specific_handlers_run_before_wildcard_in_order() {
        let registry = ListenerRegistry::new();
        let (log, handler) = recorder();

        let h = handler("wild-1");
        registry.subscribe("*", move |e| h(e));
        let h = handler("conn-1");
        registry.subscribe("connected", move |e| h(e));
        let h = handler("wild-2");
        registry.subscribe("*", move |e| h(e));
        let h = handler("conn-2");
        registry.subscribe("connected", move |e| h(e));

        let report = registry.dispatch(&FeedEvent::Connected);

        assert_eq!(report.delivered, 4);
        assert_eq!(*log.lock(), vec!["conn-1", "conn-2", "wild-1", "wild-2"]);
    }

    #[test]
    fn other_types_are_not_delivered() {
        let registry = ListenerRegistry::new();
        let (log, handler) = recorder();
        let h = handler("disconnected");
        registry.subscribe("disconnected", move |e| h(e));

        registry.dispatch(&FeedEvent::Connected);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let registry = ListenerRegistry::new();
        let (log, handler) = recorder();

        registry.subscribe("connected", |_e| panic!("boom"));
        let h = handler("sibling");
        registry.subscribe("connected", move |e| h(e));
        let h = handler("wildcard");
        registry.subscribe("*", move |e| h(e));

        let report = registry.dispatch(&FeedEvent::Connected);

        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 2);
        assert_eq!(*log.lock(), vec!["sibling", "wildcard"]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let registry = ListenerRegistry::new();
        let handle = registry.subscribe("connected", |_e| {});
        assert_eq!(registry.handler_count("connected"), 1);

        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        assert_eq!(registry.handler_count("connected"), 0);
    }

    #[test]
    fn unsubscribe_after_registry_dropped_is_noop() {
        let registry = ListenerRegistry::new();
        let handle = registry.subscribe("connected", |_e| {});
        drop(registry);
        assert!(!handle.unsubscribe());
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_dispatch() {
        let registry = ListenerRegistry::new();
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let handle = {
            let slot = Arc::clone(&slot);
            let calls = Arc::clone(&calls);
            registry.subscribe("connected", move |_e| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = slot.lock().take() {
                    handle.unsubscribe();
                }
            })
        };
        *slot.lock() = Some(handle);

        registry.dispatch(&FeedEvent::Connected);
        registry.dispatch(&FeedEvent::Connected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn suppression_drops_data_but_not_control() {
        let registry = ListenerRegistry::new();
        let (log, handler) = recorder();
        let h = handler("any");
        registry.subscribe("*", move |e| h(e));

        registry.suppress(true);
        let news = FeedEvent::Record(crate::domain::events::FeedRecord {
            kind: "news".to_string(),
            payload: serde_json::json!({"type": "news"}),
        });
        assert!(registry.dispatch(&news).suppressed);
        assert!(!registry.dispatch(&FeedEvent::CooldownEnded).suppressed);
        assert_eq!(log.lock().len(), 1);

        registry.suppress(false);
        registry.dispatch(&news);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn clear_removes_everything() {
        let registry = ListenerRegistry::new();
        registry.subscribe("connected", |_e| {});
        registry.subscribe("*", |_e| {});
        registry.clear();
        assert_eq!(registry.handler_count("connected"), 0);
        assert_eq!(registry.handler_count("*"), 0);
        assert_eq!(registry.dispatch(&FeedEvent::Connected).delivered, 0);
    }
}
