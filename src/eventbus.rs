//! A namespaced, synchronous pub/sub bus. The library is written against the
//! [`EventBus`] trait; [`LocalEventBus`] is the default, in-process
//! implementation, consistent with the single-threaded execution model of
//! the cache (see the crate-level docs).

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

/// Opaque handle returned by [`EventBus::on`], passed back to
/// [`EventBus::off`] to detach exactly that handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

fn next_handler_id() -> HandlerId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    HandlerId(NEXT.fetch_add(1, Ordering::Relaxed))
}

pub trait EventBus {
    /// Attaches `handler` for each space-separated event name in `events`,
    /// scoped to `target` within `namespace`. Returns a handle for `off`.
    fn on(
        &self,
        target: &str,
        events: &str,
        namespace: &str,
        handler: Box<dyn FnMut(&Value)>,
    ) -> HandlerId;

    /// Detaches the handler previously returned by `on`.
    fn off(&self, target: &str, events: &str, namespace: &str, handler: HandlerId);

    /// Synchronously dispatches `data` to every handler registered for
    /// `event_path` under `target`/`namespace`. Panics inside a handler are
    /// caught and logged, never propagated to the caller.
    fn emit(&self, target: &str, event_path: &str, data: &Value);
}

type Key = (String, String, String);
type SharedHandler = Rc<RefCell<dyn FnMut(&Value)>>;

#[derive(Default)]
pub struct LocalEventBus {
    handlers: Rc<RefCell<HashMap<Key, Vec<(HandlerId, SharedHandler)>>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBus for LocalEventBus {
    fn on(
        &self,
        target: &str,
        events: &str,
        namespace: &str,
        handler: Box<dyn FnMut(&Value)>,
    ) -> HandlerId {
        let id = next_handler_id();
        let shared: SharedHandler = Rc::new(RefCell::new(handler));
        let mut map = self.handlers.borrow_mut();
        for name in events.split_whitespace() {
            let key = (namespace.to_string(), target.to_string(), name.to_string());
            map.entry(key).or_default().push((id, shared.clone()));
        }
        id
    }

    fn off(&self, target: &str, events: &str, namespace: &str, handler: HandlerId) {
        let mut map = self.handlers.borrow_mut();
        for name in events.split_whitespace() {
            let key = (namespace.to_string(), target.to_string(), name.to_string());
            if let Some(list) = map.get_mut(&key) {
                list.retain(|(id, _)| *id != handler);
                if list.is_empty() {
                    map.remove(&key);
                }
            }
        }
    }

    fn emit(&self, target: &str, event_path: &str, data: &Value) {
        // `emit` takes no namespace: a handler fires regardless of which
        // namespace it was registered under, so we fan out over all
        // namespaces that have a registration for this (target, event).
        //
        // Handlers are temporarily removed from the map before being called,
        // and reinserted afterwards, so a handler that itself calls `on`/`off`
        // (re-entrant dispatch) cannot deadlock the `RefCell` or corrupt the
        // list it is being driven from.
        let matching_keys: Vec<Key> = {
            let map = self.handlers.borrow();
            map.keys()
                .filter(|(_, t, e)| t == target && e == event_path)
                .cloned()
                .collect()
        };
        for key in matching_keys {
            let taken = self.handlers.borrow_mut().remove(&key);
            let Some(handlers) = taken else { continue };
            for (_, handler) in handlers.iter() {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    (handler.borrow_mut())(data)
                }));
                if let Err(panic) = result {
                    tracing::warn!(target: "resclient::eventbus", ?panic, "event handler panicked");
                }
            }
            let mut map = self.handlers.borrow_mut();
            match map.get_mut(&key) {
                Some(existing) => existing.extend(handlers),
                None => {
                    map.insert(key, handlers);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn emit_invokes_matching_handlers_and_is_resilient_to_panics() {
        let bus = LocalEventBus::new();
        let seen = Rc::new(Cell::new(0));
        let seen2 = seen.clone();
        bus.on(
            "user.1",
            "change",
            "resclient",
            Box::new(move |_| seen2.set(seen2.get() + 1)),
        );
        bus.on(
            "user.1",
            "change",
            "resclient",
            Box::new(|_| panic!("boom")),
        );
        bus.emit("user.1", "change", &Value::Null);
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn off_detaches_only_the_matching_handle() {
        let bus = LocalEventBus::new();
        let count = Rc::new(Cell::new(0));
        let c1 = count.clone();
        let h1 = bus.on("r", "add", "ns", Box::new(move |_| c1.set(c1.get() + 1)));
        let c2 = count.clone();
        bus.on("r", "add", "ns", Box::new(move |_| c2.set(c2.get() + 10)));
        bus.off("r", "add", "ns", h1);
        bus.emit("r", "add", &Value::Null);
        assert_eq!(count.get(), 10);
    }
}
