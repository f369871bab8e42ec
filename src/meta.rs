//! Metadata hook registry.
//!
//! Hooks are invoked once per `filter == 0` publish, in registration order,
//! and may attach a typed metadata record to the in-flight message. The hook
//! list is copied out from under its lock before invocation, the same
//! "copy under lock, iterate without lock" idiom used for the engine
//! registry.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::value::Value;

/// A metadata record attached to an in-flight message.
pub struct Metadata {
    /// Identifies which hook produced this record; `Message::metadata`
    /// looks records up by this id.
    pub type_id: i64,
    /// The hook's typed payload, downcast by callers that know the
    /// concrete type behind `type_id`.
    pub data: Arc<dyn std::any::Any + Send + Sync>,
    /// Run once, when the owning message's last reference is dropped.
    pub on_finish: Option<Arc<dyn Fn(&Metadata) + Send + Sync>>,
}

impl Metadata {
    /// Builds a record with no `on_finish` hook.
    #[must_use]
    pub fn new(type_id: i64, data: Arc<dyn std::any::Any + Send + Sync>) -> Self {
        Self {
            type_id,
            data,
            on_finish: None,
        }
    }

    /// Attaches a callback run once the record's owning message is dropped.
    #[must_use]
    pub fn with_on_finish(
        mut self,
        on_finish: Arc<dyn Fn(&Metadata) + Send + Sync>,
    ) -> Self {
        self.on_finish = Some(on_finish);
        self
    }
}

/// A registered metadata hook. Called as `(channel, payload) -> Option<Metadata>`.
pub type MetaHookFn = Arc<dyn Fn(&Value, &Value) -> Option<Metadata> + Send + Sync>;

/// A metadata hook together with the handle `MetaRegistry::remove` accepts.
#[derive(Clone)]
pub struct MetaHook {
    id: usize,
    f: MetaHookFn,
}

/// Ordered registry of metadata hooks.
#[derive(Default)]
pub struct MetaRegistry {
    hooks: Mutex<Vec<MetaHook>>,
    next_id: std::sync::atomic::AtomicUsize,
}

impl MetaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook, returning a handle that `remove` accepts.
    pub fn set(&self, f: MetaHookFn) -> usize {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.hooks.lock().push(MetaHook { id, f });
        id
    }

    /// Removes a previously registered hook by handle.
    pub fn remove(&self, id: usize) {
        self.hooks.lock().retain(|h| h.id != id);
    }

    /// Removes every hook pointer-equal to `f`, the same `Arc::ptr_eq`
    /// identity test used for removing an engine.
    pub fn remove_by_ptr(&self, f: &MetaHookFn) {
        self.hooks.lock().retain(|h| !Arc::ptr_eq(&h.f, f));
    }

    /// Returns true when no hooks are registered. When `filter == 0` and no
    /// metadata hook is registered, `run` never allocates a metadata list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }

    /// Resets the hook-list lock to unlocked after `fork()`.
    ///
    /// # Safety
    /// Must only be called immediately after `fork()`, before any other
    /// thread in the child touches the registry.
    pub unsafe fn force_unlock_after_fork(&self) {
        if self.hooks.is_locked() {
            self.hooks.force_unlock_fair();
        }
    }

    /// Snapshots the hook list (copy under lock) and runs each hook against
    /// `(channel, payload)`, invoking them in registration order but
    /// returning their metadata records in reverse: the most-recently
    /// registered hook's record comes first. Matches the lookup semantics
    /// `Message::metadata` depends on, where the first record sharing a
    /// `type_id` wins.
    pub fn run(&self, channel: &Value, payload: &Value) -> Vec<Metadata> {
        let snapshot: Vec<MetaHook> = self.hooks.lock().clone();
        let mut metas: Vec<Metadata> = snapshot
            .into_iter()
            .filter_map(|hook| (hook.f)(channel, payload))
            .collect();
        metas.reverse();
        metas
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_hooks_run_in_registration_order() {
        let reg = MetaRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            reg.set(Arc::new(move |_c, _p| {
                order.lock().push(i);
                None
            }));
        }
        reg.run(&Value::str("x"), &Value::str("y"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_registry_allocates_nothing() {
        let reg = MetaRegistry::new();
        assert!(reg.is_empty());
        let metas = reg.run(&Value::str("x"), &Value::str("y"));
        assert!(metas.is_empty());
    }

    #[test]
    fn test_run_output_order_is_reverse_of_registration() {
        let reg = MetaRegistry::new();
        for i in 0..3 {
            reg.set(Arc::new(move |_c, _p| {
                Some(Metadata::new(i, Arc::new(i)))
            }));
        }
        let metas = reg.run(&Value::str("x"), &Value::str("y"));
        let ids: Vec<i64> = metas.iter().map(|m| m.type_id).collect();
        assert_eq!(ids, vec![2, 1, 0]);
    }

    #[test]
    fn test_hook_runs_exactly_once_per_publish() {
        let reg = MetaRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        reg.set(Arc::new(move |_c, _p| {
            calls2.fetch_add(1, Ordering::SeqCst);
            None
        }));
        reg.run(&Value::str("a"), &Value::str("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
