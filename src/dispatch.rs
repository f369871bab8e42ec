//! Local message dispatch and the deferred-task worker pool.
//!
//! Every subscriber callback runs on the deferred-task queue, never inline
//! on the thread that called `publish`: this prevents re-entrant callback
//! execution and unbounded stack growth when a publish triggers further
//! publishes.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::meta::Metadata;
use crate::registry::{Channel, Collection, Sub};
use crate::value::Value;

/// Whether a publish's channel/payload were carried as JSON and must be
/// decoded before fan-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireType {
    /// Channel and payload are used as-is.
    Raw,
    /// Channel and payload are JSON-encoded and must be decoded before fan-out.
    Json,
}

/// The internal message built by a publish and fanned out to matching
/// subscriptions.
pub struct MessageInner {
    /// The resolved channel name (post JSON-decode, if any).
    pub channel: Value,
    /// The resolved payload (post JSON-decode, if any).
    pub payload: Value,
    /// Non-zero for a filter-channel publish.
    pub filter: i32,
    /// Metadata records produced by registered hooks, in registration order.
    pub meta: Vec<Metadata>,
}

impl Drop for MessageInner {
    fn drop(&mut self) {
        for m in &self.meta {
            if let Some(on_finish) = &m.on_finish {
                on_finish(m);
            }
        }
    }
}

/// A per-delivery view of a message, with `udata1`/`udata2` filled in for
/// the subscription currently being invoked: a shallow copy of the shared
/// message is made per callback so that `udata` varies per subscriber.
pub struct Message {
    inner: Arc<MessageInner>,
    /// Opaque data from the subscription this delivery is for.
    pub udata1: usize,
    /// Opaque data from the subscription this delivery is for.
    pub udata2: usize,
    deferred: Cell<bool>,
}

impl Message {
    /// The channel this message was published to.
    #[must_use]
    pub fn channel(&self) -> &Value {
        &self.inner.channel
    }

    /// The message payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.inner.payload
    }

    /// The filter integer, or `0` for a pub/sub or pattern delivery.
    #[must_use]
    pub fn filter(&self) -> i32 {
        self.inner.filter
    }

    /// Looks up the first metadata record with the given `type_id`.
    #[must_use]
    pub fn metadata(&self, type_id: i64) -> Option<&Metadata> {
        self.inner.meta.iter().find(|m| m.type_id == type_id)
    }

    /// Requests that this message be redelivered to the current
    /// subscription after the callback returns.
    pub fn defer(&self) {
        self.deferred.set(true);
    }

    fn is_deferred(&self) -> bool {
        self.deferred.get()
    }
}

/// A unit of work run on the deferred-task queue.
type Task = Box<dyn FnOnce() + Send>;

/// The deferred-task queue plus the worker pool that drains it: a fixed
/// pool of cooperative workers drives a single shared deferred-task queue.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
}

struct QueueState {
    tasks: VecDeque<Task>,
    shutting_down: bool,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                shutting_down: false,
            }),
            not_empty: Condvar::new(),
        }
    }
}

impl TaskQueue {
    /// Creates an empty, running queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a task. Never blocks.
    pub fn push(&self, task: Task) {
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        state.tasks.push_back(task);
        self.not_empty.notify_one();
    }

    /// Blocks until a task is available or the queue is shut down.
    fn pop(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            if state.shutting_down {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Drains and runs every pending task on the calling thread, without
    /// shutting the queue down. Used to flush the queue on process exit and
    /// by tests that want deterministic synchronous delivery.
    pub fn drain_sync(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                state.tasks.pop_front()
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Resets the queue's lock to unlocked after `fork()`.
    ///
    /// # Safety
    /// Must only be called immediately after `fork()`, before any other
    /// thread in the child touches the queue.
    pub unsafe fn force_unlock_after_fork(&self) {
        if self.state.is_locked() {
            self.state.force_unlock_fair();
        }
    }

    /// Wakes every waiting worker and causes subsequent `pop` calls to
    /// return `None` once the queue is empty.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        drop(state);
        self.not_empty.notify_all();
    }
}

/// A small fixed pool of named OS threads draining a `TaskQueue`. No
/// real-time scheduling requirements here, just "drain tasks until told to
/// stop".
pub struct WorkerPool {
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `workers` threads, each looping `queue.pop()` until shutdown.
    #[must_use]
    pub fn spawn(queue: Arc<TaskQueue>, workers: usize) -> Self {
        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers.max(1) {
            let queue = queue.clone();
            let handle = std::thread::Builder::new()
                .name(format!("postoffice-w{idx}"))
                .spawn(move || {
                    while let Some(task) = queue.pop() {
                        task();
                    }
                })
                .expect("failed to spawn deferred-task worker thread");
            handles.push(handle);
        }
        Self {
            handles: Mutex::new(handles),
        }
    }

    /// Joins every worker thread. Call after `queue.shutdown()`.
    pub fn join(&self) {
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

static WORKERS_STARTED: AtomicBool = AtomicBool::new(false);

/// True once a worker pool has been started for the process-global queue
/// (informational; used by lifecycle glue to avoid double-starting).
pub fn mark_workers_started() -> bool {
    !WORKERS_STARTED.swap(true, Ordering::SeqCst)
}

/// Delivers `inner` to every subscription currently on `channel`, each as
/// its own deferred task.
pub fn publish_to_channel(channel: &Arc<Channel>, inner: &Arc<MessageInner>, queue: &TaskQueue) {
    let subs: Vec<Arc<Sub>> = channel.subscriptions.lock().clone();
    for sub in subs {
        let udata1 = sub.udata1;
        let udata2 = sub.udata2;
        let inner = inner.clone();
        queue.push(Box::new(move || {
            perform_delivery(sub, inner, udata1, udata2, None);
        }));
    }
}

/// Runs (or re-schedules) a single subscriber callback.
///
/// `queue` lets tests drive delivery against a specific queue instance
/// instead of the process-global one; `None` falls back to the global
/// queue, which is how production code (and the `publish_to_channel` path
/// above) always calls it once a single process-wide `PostOffice` exists.
pub fn perform_delivery(
    sub: Arc<Sub>,
    inner: Arc<MessageInner>,
    udata1: usize,
    udata2: usize,
    queue: Option<&Arc<TaskQueue>>,
) {
    let Some(guard) = sub.delivery_lock.try_lock() else {
        requeue(sub, inner, udata1, udata2, queue);
        return;
    };

    let msg = Message {
        inner: inner.clone(),
        udata1,
        udata2,
        deferred: Cell::new(false),
    };
    (sub.on_message)(&msg);
    let deferred = msg.is_deferred();
    drop(guard);
    drop(msg);

    if deferred {
        requeue(sub, inner, udata1, udata2, queue);
    }
    // otherwise `sub` and `inner` drop here: S ref and M ref both decrement.
}

fn requeue(
    sub: Arc<Sub>,
    inner: Arc<MessageInner>,
    udata1: usize,
    udata2: usize,
    queue: Option<&Arc<TaskQueue>>,
) {
    let task: Task = Box::new(move || {
        perform_delivery(sub, inner, udata1, udata2, None);
    });
    match queue {
        Some(q) => q.push(task),
        None => crate::postoffice::postoffice().queue.push(task),
    }
}

/// Builds and fans out a message for a local publish. Returns the
/// constructed message's channel/payload
/// (post JSON-decode, if any) so callers (e.g. the cluster transport) can
/// reuse them without redoing the decode.
#[allow(clippy::too_many_arguments)]
pub fn publish_local(
    filters: &Collection,
    pubsub: &Collection,
    patterns: &Collection,
    meta: &crate::meta::MetaRegistry,
    queue: &TaskQueue,
    filter: i32,
    channel: Value,
    payload: Value,
    wire_type: WireType,
) {
    let raw_channel = channel.clone();
    let raw_payload = payload.clone();

    let (channel, payload) = if wire_type == WireType::Json {
        let channel = Value::json_decode(channel.as_str().unwrap_or_default()).unwrap_or(channel);
        let payload = Value::json_decode(payload.as_str().unwrap_or_default()).unwrap_or(payload);
        (channel, payload)
    } else {
        (channel, payload)
    };

    let metas = if filter == 0 {
        meta.run(&raw_channel, &raw_payload)
    } else {
        Vec::new()
    };

    let inner = Arc::new(MessageInner {
        channel: channel.clone(),
        payload,
        filter,
        meta: metas,
    });

    if filter != 0 {
        if let Some(ch) = filters.get(&Value::Int(filter)) {
            publish_to_channel(&ch, &inner, queue);
        }
        return;
    }

    if let Some(ch) = pubsub.get(&channel) {
        publish_to_channel(&ch, &inner, queue);
    }
    for pattern_channel in patterns.snapshot() {
        if let Some(match_fn) = pattern_channel.match_fn {
            if match_fn.matches(&pattern_channel.id, &channel) {
                publish_to_channel(&pattern_channel, &inner, queue);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::MetaRegistry;
    use crate::registry::{CollectionKind, MatchFn as RegMatchFn};
    use std::sync::atomic::AtomicUsize;

    fn make_sub(on_message: Box<dyn Fn(&Message) + Send + Sync>) -> Arc<Sub> {
        Sub::new(on_message, None, 0, 0)
    }

    #[test]
    fn test_exact_match_fanout_delivers_once_each() {
        let pubsub = Collection::new(CollectionKind::Pubsub);
        let filters = Collection::new(CollectionKind::Filters);
        let patterns = Collection::new(CollectionKind::Patterns);
        let meta = MetaRegistry::new();
        let queue = TaskQueue::new();

        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        let ca = count_a.clone();
        let cb = count_b.clone();

        let sub_a = make_sub(Box::new(move |msg| {
            assert_eq!(msg.channel().as_str(), Some("news"));
            ca.fetch_add(1, Ordering::SeqCst);
        }));
        let sub_b = make_sub(Box::new(move |_msg| {
            cb.fetch_add(1, Ordering::SeqCst);
        }));

        pubsub.subscribe(Value::str("news"), None, sub_a);
        pubsub.subscribe(Value::str("news"), None, sub_b);

        publish_local(
            &filters,
            &pubsub,
            &patterns,
            &meta,
            &queue,
            0,
            Value::str("news"),
            Value::str("hello"),
            WireType::Raw,
        );
        queue.drain_sync();

        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pattern_subscription_matches_only_matching_channel() {
        let pubsub = Collection::new(CollectionKind::Pubsub);
        let filters = Collection::new(CollectionKind::Filters);
        let patterns = Collection::new(CollectionKind::Patterns);
        let meta = MetaRegistry::new();
        let queue = TaskQueue::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let sub = make_sub(Box::new(move |msg| {
            seen2.lock().push(msg.channel().as_str().unwrap().to_owned());
        }));
        patterns.subscribe(Value::str("user.*"), Some(RegMatchFn::Glob), sub);

        for channel in ["user.42", "system.log"] {
            publish_local(
                &filters,
                &pubsub,
                &patterns,
                &meta,
                &queue,
                0,
                Value::str(channel),
                Value::str("x"),
                WireType::Raw,
            );
        }
        queue.drain_sync();

        assert_eq!(*seen.lock(), vec!["user.42".to_owned()]);
    }

    #[test]
    fn test_filter_and_pubsub_are_disjoint() {
        let pubsub = Collection::new(CollectionKind::Pubsub);
        let filters = Collection::new(CollectionKind::Filters);
        let patterns = Collection::new(CollectionKind::Patterns);
        let meta = MetaRegistry::new();
        let queue = TaskQueue::new();

        let filter_hits = Arc::new(AtomicUsize::new(0));
        let pubsub_hits = Arc::new(AtomicUsize::new(0));
        let fh = filter_hits.clone();
        let ph = pubsub_hits.clone();

        let sub_filter = make_sub(Box::new(move |_| {
            fh.fetch_add(1, Ordering::SeqCst);
        }));
        let sub_pubsub = make_sub(Box::new(move |_| {
            ph.fetch_add(1, Ordering::SeqCst);
        }));

        filters.subscribe(Value::Int(7), None, sub_filter);
        pubsub.subscribe(Value::str("7"), None, sub_pubsub);

        publish_local(
            &filters, &pubsub, &patterns, &meta, &queue, 7, Value::str(""), Value::str(""),
            WireType::Raw,
        );
        queue.drain_sync();
        assert_eq!(filter_hits.load(Ordering::SeqCst), 1);
        assert_eq!(pubsub_hits.load(Ordering::SeqCst), 0);

        publish_local(
            &filters,
            &pubsub,
            &patterns,
            &meta,
            &queue,
            0,
            Value::str("7"),
            Value::str(""),
            WireType::Raw,
        );
        queue.drain_sync();
        assert_eq!(filter_hits.load(Ordering::SeqCst), 1);
        assert_eq!(pubsub_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_redelivery_runs_three_times() {
        let pubsub = Collection::new(CollectionKind::Pubsub);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = make_sub(Box::new(move |msg| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                msg.defer();
            }
        }));
        let (channel, _) = pubsub.subscribe(Value::str("x"), None, sub);
        let inner = Arc::new(MessageInner {
            channel: Value::str("x"),
            payload: Value::str("y"),
            filter: 0,
            meta: Vec::new(),
        });
        let queue = TaskQueue::new();
        publish_to_channel(&channel, &inner, &queue);
        queue.drain_sync();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
