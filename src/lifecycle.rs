//! Lifecycle glue: the five hooks the surrounding runtime is expected to
//! call at well-known points, plus the `ON_PARENT_CRASH` hook the cluster
//! transport invokes directly.
//!
//! These are plain functions rather than a trait because the runtime that
//! calls them is out of scope for this crate: whatever embeds this crate
//! wires these into its own reactor's startup/fork/exit sequence.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::postoffice::PostOffice;

/// Registers `SIGINT`/`SIGTERM` to set `flag`. The embedding runtime's main
/// loop polls `flag` and calls `at_exit`/`on_finish` once it's set, rather
/// than tearing down from inside a signal handler.
pub fn install_shutdown_signal(flag: &Arc<AtomicBool>) -> std::io::Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, flag.clone())?;
    Ok(())
}

/// `PRE_START`: root binds and listens on the cluster socket.
pub fn pre_start(po: &PostOffice) -> crate::Result<()> {
    po.start_root()
}

/// `AFTER_FORK`: root drains its accept backlog on a background thread;
/// workers do nothing here (they connect later, at `ON_START`).
pub fn after_fork(po: &PostOffice) {
    po.spawn_root_accept_loop();
}

/// `IN_CHILD`: a forked child's copies of every lock are stale (locked by
/// whatever thread happened to hold them at `fork()` time, which no longer
/// exists in this process). `PostOffice::reinit_after_fork` clears them,
/// either by resetting the lock word in place or replacing the lock field
/// with a fresh one where that's the simpler option.
pub fn in_child(po: &PostOffice) {
    po.reinit_after_fork();
}

/// `ON_START`: workers connect to the root's cluster socket and replay
/// their local subscriptions.
pub fn on_start(po: &PostOffice, root_pid: u32) -> crate::Result<()> {
    po.start_worker(root_pid)
}

/// `ON_FINISH`: close cluster connections; the root additionally unlinks
/// its socket file.
pub fn on_finish(po: &PostOffice) {
    po.stop_cluster();
}

/// `AT_EXIT`: walk all three collections unsubscribing every remaining
/// subscription so `on_unsubscribe` fires, detach all engines, and flush
/// the deferred-task queue.
pub fn at_exit(po: &PostOffice) {
    po.teardown();
}

/// Invoked by the worker-side transport when the connection to the parent
/// closes without a prior `SHUTDOWN` frame.
/// Logs and lets the caller (the transport) raise `SIGINT`; any
/// runtime-specific crash handling belongs to the embedder, not this
/// crate.
pub fn on_parent_crash() {
    log::error!("parent process crashed; initiating self-shutdown");
}
