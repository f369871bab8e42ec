//! Subscription registry primitives: channels, subscriptions, and the
//! three collections (`filters`, `pubsub`, `patterns`) that back them.
//!
//! Lock ordering is `Collection.lock -> Channel.lock -> Subscription.lock`,
//! top-down only. `Collection`'s and `Channel`'s locks are
//! `parking_lot::Mutex`es held only for short critical sections (map/list
//! splice); `Subscription`'s lock is only ever attempted with `try_lock`
//! from the dispatcher, never blocked on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::dispatch::Message;
use crate::value::Value;

/// How a pattern channel decides whether a published channel matches it.
/// Carried across the cluster as a small tag rather than a raw function
/// pointer, since a function pointer has no meaning once it crosses a
/// process boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchFn {
    Glob,
}

impl MatchFn {
    /// True if `candidate` matches `pattern` under this matcher.
    #[must_use]
    pub fn matches(&self, pattern: &Value, candidate: &Value) -> bool {
        match self {
            MatchFn::Glob => match (pattern.as_str(), candidate.as_str()) {
                (Some(p), Some(c)) => crate::glob::match_glob(p, c),
                _ => false,
            },
        }
    }

    /// The wire-stable byte identifying this matcher in a cluster frame.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            MatchFn::Glob => 0,
        }
    }

    /// Recovers a `MatchFn` from a wire tag, or `None` if unrecognized.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MatchFn::Glob),
            _ => None,
        }
    }
}

/// A channel: exact pub/sub, filter, or pattern. `match_fn` is `Some` only
/// for pattern channels, whose `id` is the pattern string itself.
pub struct Channel {
    /// Channel name, filter integer, or pattern string.
    pub id: Value,
    /// Live subscriptions, in subscribe order.
    pub subscriptions: Mutex<Vec<Arc<Sub>>>,
    /// The matcher used to test published channel names against `id`,
    /// present only for pattern channels.
    pub match_fn: Option<MatchFn>,
}

impl Channel {
    fn new(id: Value, match_fn: Option<MatchFn>) -> Arc<Self> {
        Arc::new(Self {
            id,
            subscriptions: Mutex::new(Vec::new()),
            match_fn,
        })
    }
}

/// A live binding of a callback to a channel.
///
/// `on_unsubscribe` fires exactly once, when the last `Arc<Sub>` is
/// dropped -- every in-flight delivery holds its own `Arc` clone, so the
/// callback can never fire while a delivery is still outstanding, and it is
/// guaranteed (by `Arc`'s own drop glue) to fire exactly once overall.
pub struct Sub {
    /// Run for every message delivered to this subscription.
    pub on_message: Box<dyn Fn(&Message) + Send + Sync>,
    on_unsubscribe: Mutex<Option<Box<dyn FnOnce(usize, usize) + Send + Sync>>>,
    /// Opaque caller data, passed through to `on_message`/`on_unsubscribe`.
    pub udata1: usize,
    /// Opaque caller data, passed through to `on_message`/`on_unsubscribe`.
    pub udata2: usize,
    /// Back-reference to the owning channel. Filled in once by
    /// `Collection::subscribe` after the channel is known to exist --
    /// `Sub` and `Channel` are mutually referential, so this can't be
    /// supplied at construction time.
    parent: OnceCell<Weak<Channel>>,
    /// Prevents `on_message` from running concurrently for this subscription.
    /// Only ever `try_lock`ed.
    pub delivery_lock: Mutex<()>,
    unsubscribed: AtomicBool,
}

impl Sub {
    /// Builds a fresh, not-yet-attached subscription.
    #[must_use]
    pub fn new(
        on_message: Box<dyn Fn(&Message) + Send + Sync>,
        on_unsubscribe: Option<Box<dyn FnOnce(usize, usize) + Send + Sync>>,
        udata1: usize,
        udata2: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            on_message,
            on_unsubscribe: Mutex::new(on_unsubscribe),
            udata1,
            udata2,
            parent: OnceCell::new(),
            delivery_lock: Mutex::new(()),
            unsubscribed: AtomicBool::new(false),
        })
    }

    /// Records the owning channel. A no-op if already set.
    pub(crate) fn set_parent(&self, parent: Weak<Channel>) {
        let _ = self.parent.set(parent);
    }

    /// Borrowed channel identifier, valid while this subscription is live.
    #[must_use]
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    /// Marks this subscription as removed from its channel's list. Used so
    /// `perform_delivery` can tell a "channel gone, drain in-flight
    /// deliveries" subscription apart from a live one; purely informational,
    /// does not gate `on_unsubscribe` (that is `Drop`'s job).
    pub fn mark_unsubscribed(&self) {
        self.unsubscribed.store(true, Ordering::Release);
    }

    /// True once `mark_unsubscribed` has run.
    #[must_use]
    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::Acquire)
    }
}

impl Drop for Sub {
    fn drop(&mut self) {
        if let Some(cb) = self.on_unsubscribe.get_mut().take() {
            cb(self.udata1, self.udata2);
        }
    }
}

/// Arguments to `subscribe`.
pub struct SubscribeArgs {
    /// Non-zero for a filter-channel subscription; zero for pub/sub or pattern.
    pub filter: i32,
    /// The exact or pattern channel name; `None` for filter subscriptions.
    pub channel: Option<Value>,
    /// Present for a pattern subscription, `None` for exact/filter.
    pub match_fn: Option<MatchFn>,
    /// Run for every message delivered to this subscription.
    pub on_message: Box<dyn Fn(&Message) + Send + Sync>,
    /// Run exactly once, when the subscription is fully torn down.
    pub on_unsubscribe: Option<Box<dyn FnOnce(usize, usize) + Send + Sync>>,
    /// Opaque caller data, passed through to the callbacks above.
    pub udata1: usize,
    /// Opaque caller data, passed through to the callbacks above.
    pub udata2: usize,
}

/// Which of the three collections a subscription belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionKind {
    /// Filter channels, keyed by filter integer.
    Filters,
    /// Exact-match pub/sub channels, keyed by channel name.
    Pubsub,
    /// Pattern channels, keyed by pattern string.
    Patterns,
}

/// One of `filters`, `pubsub`, or `patterns`.
pub struct Collection {
    /// Which of the three collections this is.
    pub kind: CollectionKind,
    channels: Mutex<HashMap<Value, Arc<Channel>>>,
}

impl Collection {
    /// Creates an empty collection of the given kind.
    #[must_use]
    pub fn new(kind: CollectionKind) -> Self {
        Self {
            kind,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a live channel by id, if present, without creating it.
    #[must_use]
    pub fn get(&self, id: &Value) -> Option<Arc<Channel>> {
        self.channels.lock().get(id).cloned()
    }

    /// Snapshot of all channels currently in the collection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().values().cloned().collect()
    }

    /// Number of live channels in the collection.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// True if the collection currently holds no channels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds or creates the channel for `id`, pushes `sub` onto it, and
    /// returns `(channel, created)` where `created` is true iff this call
    /// allocated a brand new channel, so the caller can notify attached
    /// engines of the transition.
    pub fn subscribe(
        &self,
        id: Value,
        match_fn: Option<MatchFn>,
        sub: Arc<Sub>,
    ) -> (Arc<Channel>, bool) {
        let mut channels = self.channels.lock();
        let mut created = false;
        let channel = channels.entry(id.clone()).or_insert_with(|| {
            created = true;
            Channel::new(id, match_fn)
        });
        let channel = channel.clone();
        drop(channels); // Col.lock released before taking Ch.lock, per lock ordering
        sub.set_parent(Arc::downgrade(&channel));
        channel.subscriptions.lock().push(sub);
        (channel, created)
    }

    /// Removes `sub` from `channel`'s list. If the list becomes empty,
    /// removes `channel` from the collection (re-checking emptiness under
    /// `Col.lock` in case another subscriber raced in between releasing
    /// `Ch.lock` and taking `Col.lock`). Returns true iff the channel was
    /// removed from the collection as a result.
    ///
    /// Returns `None` if `Ch.lock` could not be acquired immediately; the
    /// caller is expected to re-schedule the whole unsubscribe on the
    /// deferred-task queue in that case.
    pub fn unsubscribe(&self, channel: &Arc<Channel>, sub: &Arc<Sub>) -> Option<bool> {
        let mut guard = channel.subscriptions.try_lock()?;
        guard.retain(|s| !Arc::ptr_eq(s, sub));
        let now_empty = guard.is_empty();
        drop(guard);
        sub.mark_unsubscribed();

        if !now_empty {
            return Some(false);
        }

        // re-check emptiness under Col.lock in case another subscriber raced in.
        let mut channels = self.channels.lock();
        let still_empty = channel
            .subscriptions
            .lock()
            .is_empty();
        if still_empty {
            channels.remove(&channel.id);
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Resets every lock reachable from this collection to unlocked. A
    /// forked child inherits its parent's memory image verbatim, so a lock
    /// word may read as held by a thread that no longer exists in this
    /// process; `force_unlock_fair` is safe here specifically because the caller
    /// guarantees no other thread in this (freshly forked) process is
    /// concurrently using these locks.
    ///
    /// # Safety
    /// Must only be called immediately after `fork()`, before any other
    /// thread in the child touches the registry.
    pub unsafe fn force_unlock_after_fork(&self) {
        if self.channels.is_locked() {
            self.channels.force_unlock_fair();
        }
        for channel in self.channels.lock().values() {
            if channel.subscriptions.is_locked() {
                channel.subscriptions.force_unlock_fair();
            }
            for sub in channel.subscriptions.lock().iter() {
                if sub.delivery_lock.is_locked() {
                    sub.delivery_lock.force_unlock_fair();
                }
            }
        }
    }

    /// Removes every channel from the collection, unsubscribing each of
    /// their subscriptions (so `on_unsubscribe` fires) in the process.
    /// Leaves the collection empty, unlike `unsubscribe` which only ever
    /// removes one channel at a time as its subscriber list drains.
    pub fn clear(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            for sub in channel.subscriptions.lock().drain(..) {
                sub.mark_unsubscribed();
                drop(sub);
            }
        }
    }

    /// Opportunistic compaction hint, triggered when the caller observes the
    /// map has shrunk well below its capacity. `HashMap` doesn't expose
    /// fragmentation or capacity-vs-len in a way worth chasing here;
    /// `shrink_to_fit` is the idiomatic equivalent and is cheap to call
    /// opportunistically.
    pub fn maybe_compact(&self) {
        let mut channels = self.channels.lock();
        if channels.len() * 2 <= channels.capacity() && channels.capacity() > 512 {
            channels.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop_sub() -> Arc<Sub> {
        Sub::new(Box::new(|_| {}), None, 0, 0)
    }

    #[test]
    fn test_channel_created_on_first_subscribe() {
        let col = Collection::new(CollectionKind::Pubsub);
        let (_, created) = col.subscribe(Value::str("news"), None, noop_sub());
        assert!(created);
        assert_eq!(col.len(), 1);
    }

    #[test]
    fn test_channel_removed_when_empty() {
        let col = Collection::new(CollectionKind::Pubsub);
        let sub = noop_sub();
        let (channel, _) = col.subscribe(Value::str("news"), None, sub.clone());
        let removed = col.unsubscribe(&channel, &sub).unwrap();
        assert!(removed);
        assert!(col.is_empty());
    }

    #[test]
    fn test_second_subscriber_keeps_channel_alive() {
        let col = Collection::new(CollectionKind::Pubsub);
        let sub1 = noop_sub();
        let sub2 = noop_sub();
        let (channel, created1) = col.subscribe(Value::str("news"), None, sub1.clone());
        let (_, created2) = col.subscribe(Value::str("news"), None, sub2.clone());
        assert!(created1);
        assert!(!created2);
        let removed = col.unsubscribe(&channel, &sub1).unwrap();
        assert!(!removed);
        assert_eq!(col.len(), 1);
    }

    #[test]
    fn test_on_unsubscribe_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let sub = Sub::new(
            Box::new(|_| {}),
            Some(Box::new(move |_, _| {
                count2.fetch_add(1, Ordering::SeqCst);
            })),
            0,
            0,
        );
        let col = Collection::new(CollectionKind::Pubsub);
        let (channel, _) = col.subscribe(Value::str("news"), None, sub.clone());
        col.unsubscribe(&channel, &sub).unwrap();
        drop(sub);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_empties_collection_and_fires_on_unsubscribe() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let sub = Sub::new(
            Box::new(|_| {}),
            Some(Box::new(move |_, _| {
                count2.fetch_add(1, Ordering::SeqCst);
            })),
            0,
            0,
        );
        let col = Collection::new(CollectionKind::Pubsub);
        col.subscribe(Value::str("news"), None, sub.clone());
        col.subscribe(Value::str("weather"), None, noop_sub());
        drop(sub);

        col.clear();
        assert!(col.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
