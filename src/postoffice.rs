//! The top-level orchestrator: wires the subscription registry, local
//! dispatcher, metadata hooks, engine registry, and cluster transport
//! together behind a single process-global handle, and exposes the crate's
//! public surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::cluster::codec::{Frame, FrameType};
use crate::cluster::{RootTransport, WorkerTransport};
use crate::config::ClusterConfig;
use crate::dispatch::{publish_local, Message, TaskQueue, WireType, WorkerPool};
use crate::engine::{Engine, EngineRegistry, EngineTarget, Sentinel};
use crate::meta::{MetaHookFn, MetaRegistry, Metadata};
use crate::registry::{Collection, CollectionKind, MatchFn, Sub};
use crate::value::Value;
use crate::Result;

/// Arguments to `subscribe`/`subscribe_pubsub`.
pub struct SubscribeArgs {
    /// Non-zero selects a filter channel; must be zero when `channel` is set.
    pub filter: i32,
    /// Exact channel name, or the pattern text when `match_fn` is set.
    pub channel: Option<Value>,
    /// `Some` makes this a pattern subscription.
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

/// Arguments to `publish`.
pub struct PublishArgs {
    /// Non-zero publishes to a filter channel instead of `channel`.
    pub filter: i32,
    /// The target channel name (ignored when `filter != 0`).
    pub channel: Value,
    /// The message payload.
    pub message: Value,
    /// Whether `channel`/`message` are already JSON-encoded.
    pub wire_type: WireType,
    /// Which engine (or sentinel) routes this publish.
    pub engine: EngineTarget,
}

impl Default for PublishArgs {
    fn default() -> Self {
        Self {
            filter: 0,
            channel: Value::str(""),
            message: Value::str(""),
            wire_type: WireType::Raw,
            engine: EngineTarget::Default,
        }
    }
}

/// The process-wide pub/sub and cluster-messaging handle.
pub struct PostOffice {
    /// Filter-channel subscriptions, keyed by filter integer.
    pub filters: Collection,
    /// Exact-match channel subscriptions.
    pub pubsub: Collection,
    /// Pattern-channel subscriptions.
    pub patterns: Collection,
    /// Registered metadata hooks.
    pub meta: MetaRegistry,
    /// Attached custom pub/sub engines.
    pub engines: EngineRegistry,
    /// The deferred-task queue every subscriber callback runs on.
    pub queue: Arc<TaskQueue>,
    config: ClusterConfig,
    workers: Mutex<Option<WorkerPool>>,
    role: Mutex<ClusterRoleSlot>,
    is_root: AtomicBool,
}

#[derive(Default)]
struct ClusterRoleSlot {
    root: Option<Arc<RootTransport>>,
    worker: Option<Arc<WorkerTransport>>,
}

static POSTOFFICE: OnceCell<PostOffice> = OnceCell::new();

/// Returns the process-global post office, creating it with default
/// configuration on first access.
#[must_use]
pub fn postoffice() -> &'static PostOffice {
    POSTOFFICE.get_or_init(|| PostOffice::new(ClusterConfig::new()))
}

/// Initializes the process-global post office with explicit configuration.
/// Must be called, if at all, before the first call to `postoffice()`
/// (subsequent calls are no-ops, matching `OnceCell` semantics).
pub fn init(config: ClusterConfig) -> &'static PostOffice {
    POSTOFFICE.get_or_init(|| PostOffice::new(config))
}

impl PostOffice {
    fn new(config: ClusterConfig) -> Self {
        let queue = Arc::new(TaskQueue::new());
        Self {
            filters: Collection::new(CollectionKind::Filters),
            pubsub: Collection::new(CollectionKind::Pubsub),
            patterns: Collection::new(CollectionKind::Patterns),
            meta: MetaRegistry::new(),
            engines: EngineRegistry::new(),
            queue,
            config,
            workers: Mutex::new(None),
            role: Mutex::new(ClusterRoleSlot::default()),
            is_root: AtomicBool::new(true),
        }
    }

    // ---- lifecycle --------------------------------------------------------

    /// `PRE_START`: binds the root cluster socket and starts the worker
    /// pool draining the deferred-task queue.
    pub fn start_root(&self) -> Result<()> {
        self.ensure_workers();
        let root = RootTransport::bind(&self.config)?;
        self.role.lock().root = Some(root);
        self.is_root.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// `AFTER_FORK`: spawns the accept loop and the periodic ping-broadcast
    /// loop on background threads.
    pub fn spawn_root_accept_loop(&self) {
        if let Some(root) = self.role.lock().root.clone() {
            root.spawn_heartbeat();
            std::thread::spawn(move || root.accept_loop());
        }
    }

    /// `ON_START`: a worker connects to `root_pid`'s socket, replays its
    /// subscriptions, and starts reading frames and sending heartbeat pings
    /// on background threads.
    pub fn start_worker(&self, root_pid: u32) -> Result<()> {
        self.ensure_workers();
        self.is_root.store(false, Ordering::Relaxed);
        let worker = WorkerTransport::connect(&self.config, root_pid)?;
        worker.replay_subscriptions_and_announce(self);
        self.role.lock().worker = Some(worker.clone());
        worker.spawn_heartbeat();
        std::thread::spawn(move || worker.run());
        Ok(())
    }

    fn ensure_workers(&self) {
        let mut guard = self.workers.lock();
        if guard.is_none() {
            *guard = Some(WorkerPool::spawn(self.queue.clone(), self.config.get_workers()));
        }
    }

    /// `IN_CHILD`: resets every lock reachable from this post office. See
    /// `Collection::force_unlock_after_fork` for why this is safe here
    /// specifically (no other thread in a freshly forked child is using
    /// these locks yet).
    pub fn reinit_after_fork(&self) {
        unsafe {
            self.filters.force_unlock_after_fork();
            self.pubsub.force_unlock_after_fork();
            self.patterns.force_unlock_after_fork();
            self.meta.force_unlock_after_fork();
            self.engines.force_unlock_after_fork();
            self.queue.force_unlock_after_fork();
        }
    }

    /// `ON_FINISH`: closes cluster connections; the root additionally
    /// unlinks its socket file.
    pub fn stop_cluster(&self) {
        let mut role = self.role.lock();
        if let Some(root) = role.root.take() {
            root.shutdown();
        }
        role.worker = None;
    }

    /// `AT_EXIT`: unsubscribes every remaining subscription (so
    /// `on_unsubscribe` fires), removes every channel from all three
    /// collections so each reports zero channels afterward, detaches every
    /// engine, and flushes the deferred-task queue.
    pub fn teardown(&self) {
        for collection in [&self.filters, &self.pubsub, &self.patterns] {
            collection.clear();
        }
        for engine in self.engines.snapshot() {
            self.engines.detach(&engine);
        }
        self.queue.drain_sync();
        self.queue.shutdown();
        if let Some(pool) = self.workers.lock().take() {
            pool.join();
        }
    }

    /// True if this process is the cluster root (the default, until
    /// `start_worker` connects it to some other root).
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.is_root.load(Ordering::Relaxed)
    }

    // ---- subscription API ---------------------------------------------

    /// Subscribes to a filter, exact, or pattern channel. Returns `None`
    /// (after firing `on_unsubscribe`, if any) when `args` is malformed:
    /// exactly one of `filter != 0` or `channel` must be set.
    pub fn subscribe(&self, args: SubscribeArgs) -> Option<Arc<Sub>> {
        let SubscribeArgs {
            filter,
            channel,
            match_fn,
            on_message,
            on_unsubscribe,
            udata1,
            udata2,
        } = args;

        if (filter != 0) == channel.is_some() {
            if let Some(cb) = on_unsubscribe {
                cb(udata1, udata2);
            }
            return None;
        }

        let sub = Sub::new(on_message, on_unsubscribe, udata1, udata2);

        let (collection, key, is_pattern) = if filter != 0 {
            (&self.filters, Value::Int(filter), false)
        } else if match_fn.is_some() {
            (&self.patterns, channel.unwrap(), true)
        } else {
            (&self.pubsub, channel.unwrap(), false)
        };

        let (channel, created) = collection.subscribe(key, match_fn, sub.clone());
        if created && filter == 0 {
            self.engines.notify_subscribe(&channel.id, is_pattern);
        }
        Some(sub)
    }

    /// As `subscribe`, but forces `filter = 0`.
    pub fn subscribe_pubsub(&self, mut args: SubscribeArgs) -> Option<Arc<Sub>> {
        args.filter = 0;
        self.subscribe(args)
    }

    /// Removes `sub` from its channel. Takes `sub` by value so the
    /// caller's own handle is consumed here: once the channel's stored
    /// clone is dropped by `Collection::unsubscribe`, this function's local
    /// `sub` is the last `Arc<Sub>` remaining (barring an in-flight
    /// delivery), so `on_unsubscribe` fires deterministically when this
    /// call returns rather than whenever the caller happens to drop its
    /// handle. Idempotent at the API level is not guaranteed -- calling
    /// twice is harmless here (the second call finds nothing to remove)
    /// but is not a supported usage.
    pub fn unsubscribe(&self, sub: Arc<Sub>) {
        let Some(channel) = sub.channel() else {
            return;
        };
        let collection = self.collection_for(&channel);
        match collection.unsubscribe(&channel, &sub) {
            Some(removed) => {
                if removed {
                    let is_pattern = collection.kind == CollectionKind::Patterns;
                    if collection.kind != CollectionKind::Filters {
                        self.engines.notify_unsubscribe(&channel.id, is_pattern);
                    }
                    collection.maybe_compact();
                }
            }
            None => {
                // Ch.lock unavailable; re-schedule onto the deferred-task queue.
                self.queue.push(Box::new(move || {
                    postoffice().unsubscribe(sub);
                }));
            }
        }
    }

    fn collection_for(&self, channel: &crate::registry::Channel) -> &Collection {
        if channel.match_fn.is_some() {
            &self.patterns
        } else if matches!(channel.id, Value::Int(_)) {
            &self.filters
        } else {
            &self.pubsub
        }
    }

    /// Borrowed channel identifier for a live subscription.
    #[must_use]
    pub fn subscription_channel(&self, sub: &Sub) -> Option<Value> {
        sub.channel().map(|c| c.id.clone())
    }

    // ---- publish ----------------------------------------------------------

    /// Publishes a message, routing across local subscribers, attached
    /// engines, and the cluster transport as `args.engine` dictates.
    pub fn publish(&self, args: PublishArgs) {
        let PublishArgs {
            filter,
            channel,
            message,
            wire_type,
            engine,
        } = args;

        if filter != 0 {
            // filter-mode publishes never reach custom engines; sentinel
            // routing still applies for cross-process filter messaging.
            let sentinel = match engine {
                EngineTarget::Sentinel(s) => s,
                _ => self.engines.default_sentinel(),
            };
            self.route_sentinel(sentinel, filter, channel, message, wire_type);
            return;
        }

        if let EngineTarget::Custom(engine) = engine {
            engine.publish(&channel, &message);
            return;
        }

        let sentinel = match engine {
            EngineTarget::Sentinel(s) => s,
            _ => self.engines.default_sentinel(),
        };
        self.route_sentinel(sentinel, filter, channel, message, wire_type);
    }

    fn route_sentinel(
        &self,
        sentinel: Sentinel,
        filter: i32,
        channel: Value,
        message: Value,
        wire_type: WireType,
    ) {
        let dispatch_locally = || {
            publish_local(
                &self.filters,
                &self.pubsub,
                &self.patterns,
                &self.meta,
                &self.queue,
                filter,
                channel.clone(),
                message.clone(),
                wire_type,
            );
        };

        let frame_type = match wire_type {
            WireType::Json => FrameType::Json,
            WireType::Raw => FrameType::Forward,
        };
        let channel_bytes = channel.as_bytes().to_vec();
        let payload_bytes = message.as_bytes().to_vec();

        match sentinel {
            Sentinel::Process => dispatch_locally(),
            Sentinel::Cluster => {
                dispatch_locally();
                self.send_cluster(frame_type, filter, &channel_bytes, &payload_bytes);
            }
            Sentinel::Siblings => {
                if self.is_root() {
                    if let Some(root) = self.role.lock().root.clone() {
                        root.broadcast_all(&Frame::new(
                            frame_type,
                            filter,
                            channel_bytes,
                            payload_bytes,
                        ));
                    }
                } else {
                    self.send_cluster(frame_type, filter, &channel_bytes, &payload_bytes);
                }
            }
            Sentinel::Root => {
                if self.is_root() {
                    dispatch_locally();
                } else if let Some(worker) = self.role.lock().worker.clone() {
                    let root_frame_type = match wire_type {
                        WireType::Json => FrameType::RootJson,
                        WireType::Raw => FrameType::Root,
                    };
                    let _ = worker.send(&Frame::new(
                        root_frame_type,
                        filter,
                        channel_bytes,
                        payload_bytes,
                    ));
                }
            }
        }
    }

    fn send_cluster(&self, frame_type: FrameType, filter: i32, channel: &[u8], payload: &[u8]) {
        let role = self.role.lock();
        if let Some(root) = &role.root {
            root.broadcast_all(&Frame::new(
                frame_type,
                filter,
                channel.to_vec(),
                payload.to_vec(),
            ));
        } else if let Some(worker) = &role.worker {
            let _ = worker.send(&Frame::new(
                frame_type,
                filter,
                channel.to_vec(),
                payload.to_vec(),
            ));
        }
    }

    /// Root-only: broadcasts a `SHUTDOWN` frame to every connected worker.
    pub fn cluster_signal_children(&self) {
        if let Some(root) = self.role.lock().root.clone() {
            root.shutdown();
        }
    }

    // ---- engine registry ----------------------------------------------

    /// Attaches a custom engine, replaying every currently-live channel into
    /// its `subscribe` hook.
    pub fn pubsub_attach(&self, engine: Arc<dyn Engine>) {
        let live = self.live_channels();
        self.engines.attach(engine, live.iter().map(|(v, p)| (v, *p)));
    }

    /// Detaches a previously attached custom engine.
    pub fn pubsub_detach(&self, engine: &Arc<dyn Engine>) {
        self.engines.detach(engine);
    }

    /// Replays subscriptions to `engine` without re-inserting it into the
    /// registry (for an engine that reconnected upstream).
    pub fn pubsub_reattach(&self, engine: &Arc<dyn Engine>) {
        let live = self.live_channels();
        self.engines.reattach(engine, live.iter().map(|(v, p)| (v, *p)));
    }

    /// True if `engine` is currently attached.
    #[must_use]
    pub fn pubsub_is_attached(&self, engine: &Arc<dyn Engine>) -> bool {
        self.engines.is_attached(engine)
    }

    fn live_channels(&self) -> Vec<(Value, bool)> {
        let mut out: Vec<(Value, bool)> = self
            .pubsub
            .snapshot()
            .into_iter()
            .map(|c| (c.id.clone(), false))
            .collect();
        out.extend(self.patterns.snapshot().into_iter().map(|c| (c.id.clone(), true)));
        out
    }

    // ---- metadata hooks -----------------------------------------------

    /// Adds (`enable = true`) or removes (`enable = false`) a metadata
    /// hook. Returns the registration handle when adding; removal matches
    /// by hook pointer identity, the same `Arc::ptr_eq` idiom the engine
    /// registry uses.
    pub fn message_metadata_set(&self, hook: MetaHookFn, enable: bool) -> Option<usize> {
        if enable {
            Some(self.meta.set(hook))
        } else {
            self.meta.remove_by_ptr(&hook);
            None
        }
    }

    /// Looks up a metadata record on `msg` by hook type id.
    #[must_use]
    pub fn message_metadata<'a>(&self, msg: &'a Message, type_id: i64) -> Option<&'a Metadata> {
        msg.metadata(type_id)
    }
}

/// Requests redelivery of the currently-dispatching message to the
/// currently-dispatching subscription. Call only from inside an
/// `on_message` callback.
pub fn message_defer(msg: &Message) {
    msg.defer();
}

/// Re-exports for `use postoffice::prelude::*;`.
pub mod prelude {
    pub use crate::config::ClusterConfig;
    pub use crate::dispatch::{Message, WireType};
    pub use crate::engine::{Engine, EngineTarget, Sentinel};
    pub use crate::glob::match_glob;
    pub use crate::meta::Metadata;
    pub use crate::postoffice::{message_defer, postoffice, PostOffice, PublishArgs, SubscribeArgs};
    pub use crate::registry::{MatchFn, Sub};
    pub use crate::value::Value;
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fresh() -> PostOffice {
        PostOffice::new(ClusterConfig::new())
    }

    #[test]
    fn test_subscribe_precondition_violation_fires_on_unsubscribe() {
        let po = fresh();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let result = po.subscribe(SubscribeArgs {
            filter: 0,
            channel: None, // neither filter nor channel set: invalid
            match_fn: None,
            on_message: Box::new(|_| {}),
            on_unsubscribe: Some(Box::new(move |_, _| {
                f.fetch_add(1, Ordering::SeqCst);
            })),
            udata1: 0,
            udata2: 0,
        });
        assert!(result.is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_and_publish_local_delivers() {
        let po = fresh();
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        let sub = po
            .subscribe(SubscribeArgs {
                filter: 0,
                channel: Some(Value::str("news")),
                match_fn: None,
                on_message: Box::new(move |msg| {
                    r.lock().push(msg.payload().as_str().unwrap().to_owned());
                }),
                on_unsubscribe: None,
                udata1: 0,
                udata2: 0,
            })
            .unwrap();

        po.publish(PublishArgs {
            filter: 0,
            channel: Value::str("news"),
            message: Value::str("hello"),
            wire_type: WireType::Raw,
            engine: EngineTarget::Sentinel(Sentinel::Process),
        });
        po.queue.drain_sync();

        assert_eq!(*received.lock(), vec!["hello".to_owned()]);
        po.unsubscribe(sub);
        assert!(po.pubsub.is_empty());
    }

    #[test]
    fn test_subscription_channel_round_trips() {
        let po = fresh();
        let sub = po
            .subscribe(SubscribeArgs {
                filter: 0,
                channel: Some(Value::str("weather")),
                match_fn: None,
                on_message: Box::new(|_| {}),
                on_unsubscribe: None,
                udata1: 0,
                udata2: 0,
            })
            .unwrap();
        assert_eq!(po.subscription_channel(&sub), Some(Value::str("weather")));
    }

    #[test]
    fn test_unsubscribe_fires_on_unsubscribe_immediately() {
        let po = fresh();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let sub = po
            .subscribe(SubscribeArgs {
                filter: 0,
                channel: Some(Value::str("news")),
                match_fn: None,
                on_message: Box::new(|_| {}),
                on_unsubscribe: Some(Box::new(move |_, _| {
                    f.fetch_add(1, Ordering::SeqCst);
                })),
                udata1: 0,
                udata2: 0,
            })
            .unwrap();

        po.unsubscribe(sub);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
