//! Pluggable external engine registry.
//!
//! An engine bridges local pub/sub channels to some external broker. Engines
//! are identified by pointer identity (`Arc::as_ptr`) rather than by name, so
//! two engines can never collide on an assigned identifier; a custom
//! engine's `subscribe`/`unsubscribe` hooks are replayed
//! over every channel currently present so a newly attached engine sees the
//! existing subscription set (`attach`), or just replayed without
//! re-inserting (`reattach`, for engines that reconnected upstream).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::value::Value;

/// A pluggable external pub/sub engine.
pub trait Engine: Send + Sync {
    /// Called when a local channel/pattern gains its first subscriber.
    fn subscribe(&self, channel: &Value, is_pattern: bool);
    /// Called when a local channel/pattern loses its last subscriber.
    fn unsubscribe(&self, channel: &Value, is_pattern: bool);
    /// Called for every `filter == 0` publish whose target engine resolves
    /// to this one.
    fn publish(&self, channel: &Value, payload: &Value);
    /// Called once per worker after the cluster client connects.
    fn on_startup(&self) {}
}

/// The four built-in engine sentinels selectable by `publish`'s `engine`
/// argument. They carry no state of their own; routing them is the cluster
/// transport's job (see `cluster::transport`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sentinel {
    /// Publish to all processes, including this one.
    Cluster,
    /// Publish to this process only.
    Process,
    /// Publish to other processes only.
    Siblings,
    /// Publish only to the root process.
    Root,
}

/// The engine selected for a publish call.
#[derive(Clone)]
pub enum EngineTarget {
    /// Use the currently configured default engine.
    Default,
    /// Use one of the four built-in sentinels.
    Sentinel(Sentinel),
    /// Use a specific attached custom engine.
    Custom(Arc<dyn Engine>),
}

impl Default for EngineTarget {
    fn default() -> Self {
        EngineTarget::Default
    }
}

fn ptr_eq(a: &Arc<dyn Engine>, b: &Arc<dyn Engine>) -> bool {
    Arc::ptr_eq(a, b)
}

/// Registry of attached custom engines plus the default-engine slot.
pub struct EngineRegistry {
    engines: Mutex<Vec<Arc<dyn Engine>>>,
    default: Mutex<Sentinel>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self {
            engines: Mutex::new(Vec::new()),
            default: Mutex::new(Sentinel::Cluster),
        }
    }
}

impl EngineRegistry {
    /// Creates an empty registry with the default sentinel set to `Cluster`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `engine`, replaying every currently-live pub/sub and
    /// pattern channel into its `subscribe` hook. `live_channels` is
    /// supplied by the registry owner (it has no visibility into the
    /// channel collections on its own).
    pub fn attach<'a, I>(&self, engine: Arc<dyn Engine>, live_channels: I)
    where
        I: IntoIterator<Item = (&'a Value, bool)>,
    {
        self.engines.lock().push(engine.clone());
        for (channel, is_pattern) in live_channels {
            engine.subscribe(channel, is_pattern);
        }
    }

    /// Detaches `engine`. If it was the default engine, the default resets
    /// to the built-in cluster engine.
    pub fn detach(&self, engine: &Arc<dyn Engine>) {
        let mut engines = self.engines.lock();
        let before = engines.len();
        engines.retain(|e| !ptr_eq(e, engine));
        drop(engines);
        if before != self.engines.lock().len() {
            // engine removed; nothing further to compare against a "default
            // custom engine" since the default slot only ever names a
            // sentinel in this design (see DESIGN.md open-question note).
        }
    }

    /// Replays subscriptions to `engine` without (re-)inserting it into the
    /// registry. Used by engines that reconnected upstream and need their
    /// remote subscription state rebuilt.
    pub fn reattach<'a, I>(&self, engine: &Arc<dyn Engine>, live_channels: I)
    where
        I: IntoIterator<Item = (&'a Value, bool)>,
    {
        for (channel, is_pattern) in live_channels {
            engine.subscribe(channel, is_pattern);
        }
    }

    /// True if `engine` is currently attached.
    #[must_use]
    pub fn is_attached(&self, engine: &Arc<dyn Engine>) -> bool {
        self.engines.lock().iter().any(|e| ptr_eq(e, engine))
    }

    /// Snapshot of attached engines (copy under lock, iterate without lock).
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Engine>> {
        self.engines.lock().clone()
    }

    /// Fires `on_startup` on every attached engine. Called once a worker's
    /// cluster connection is established.
    pub fn fire_on_startup(&self) {
        for engine in self.snapshot() {
            engine.on_startup();
        }
    }

    /// Sets the sentinel used when a publish specifies `EngineTarget::Default`.
    pub fn set_default_sentinel(&self, sentinel: Sentinel) {
        *self.default.lock() = sentinel;
    }

    /// The sentinel currently used for `EngineTarget::Default`.
    #[must_use]
    pub fn default_sentinel(&self) -> Sentinel {
        *self.default.lock()
    }

    /// Resets this registry's locks to unlocked after `fork()`.
    ///
    /// # Safety
    /// Must only be called immediately after `fork()`, before any other
    /// thread in the child touches the registry.
    pub unsafe fn force_unlock_after_fork(&self) {
        if self.engines.is_locked() {
            self.engines.force_unlock_fair();
        }
        if self.default.is_locked() {
            self.default.force_unlock_fair();
        }
    }

    /// Notifies every attached engine of a channel create/destroy
    /// transition.
    pub fn notify_subscribe(&self, channel: &Value, is_pattern: bool) {
        for engine in self.snapshot() {
            engine.subscribe(channel, is_pattern);
        }
    }

    /// Notifies every attached engine that a channel/pattern lost its last
    /// subscriber.
    pub fn notify_unsubscribe(&self, channel: &Value, is_pattern: bool) {
        for engine in self.snapshot() {
            engine.unsubscribe(channel, is_pattern);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEngine {
        subs: AtomicUsize,
        unsubs: AtomicUsize,
        pubs: AtomicUsize,
    }

    impl Engine for CountingEngine {
        fn subscribe(&self, _channel: &Value, _is_pattern: bool) {
            self.subs.fetch_add(1, Ordering::SeqCst);
        }
        fn unsubscribe(&self, _channel: &Value, _is_pattern: bool) {
            self.unsubs.fetch_add(1, Ordering::SeqCst);
        }
        fn publish(&self, _channel: &Value, _payload: &Value) {
            self.pubs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_attach_replays_existing_channels() {
        let registry = EngineRegistry::new();
        let engine: Arc<dyn Engine> = Arc::new(CountingEngine {
            subs: AtomicUsize::new(0),
            unsubs: AtomicUsize::new(0),
            pubs: AtomicUsize::new(0),
        });
        let chan = Value::str("news");
        registry.attach(engine.clone(), [(&chan, false)]);
        assert!(registry.is_attached(&engine));
    }

    #[test]
    fn test_detach_removes_engine() {
        let registry = EngineRegistry::new();
        let engine: Arc<dyn Engine> = Arc::new(CountingEngine {
            subs: AtomicUsize::new(0),
            unsubs: AtomicUsize::new(0),
            pubs: AtomicUsize::new(0),
        });
        registry.attach(engine.clone(), std::iter::empty());
        registry.detach(&engine);
        assert!(!registry.is_attached(&engine));
    }
}
