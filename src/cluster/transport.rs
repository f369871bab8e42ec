//! Cluster transport: the root listens on a per-PID Unix socket, each
//! forked worker connects to it after fork, and frames are exchanged per
//! the state machine below.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cluster::codec::{Frame, FrameType, Parser};
use crate::config::ClusterConfig;
use crate::{Error, Result};

/// Path of the cluster's Unix-domain-socket for the current process: octal
/// PID under the configured temp directory, in `umask`-inherited
/// permissions.
#[must_use]
pub fn socket_path(config: &ClusterConfig, pid: u32) -> PathBuf {
    config
        .resolved_socket_dir()
        .join(format!("postoffice-sock-{pid:o}"))
}

/// A worker's connection state, observed by the root.
struct Peer {
    id: usize,
    stream: Mutex<UnixStream>,
    /// Channels this peer has told us it is subscribed to (`PUBSUB_SUB`);
    /// value is unused, this is a placeholder registration (presence alone
    /// is the signal).
    pubsub: Mutex<HashMap<Vec<u8>, ()>>,
    /// Pattern channels this peer is subscribed to, keyed by pattern text,
    /// value is the `MatchFn` tag it sent.
    patterns: Mutex<HashMap<Vec<u8>, u8>>,
}

/// The root side of the cluster transport: listens for worker connections
/// and fans frames out between them.
pub struct RootTransport {
    listener: UnixListener,
    socket_path: PathBuf,
    peers: Mutex<Vec<Arc<Peer>>>,
    next_peer_id: AtomicUsize,
    heartbeat_interval: Duration,
    stopped: AtomicBool,
}

impl RootTransport {
    /// Binds the root listening socket.
    pub fn bind(config: &ClusterConfig) -> Result<Arc<Self>> {
        let path = socket_path(config, std::process::id());
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path)?;
        log::info!("cluster root listening on {}", path.display());
        Ok(Arc::new(Self {
            listener,
            socket_path: path,
            peers: Mutex::new(Vec::new()),
            next_peer_id: AtomicUsize::new(0),
            heartbeat_interval: config.get_heartbeat_interval(),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Spawns a background thread that broadcasts a `Ping` frame to every
    /// connected peer on every heartbeat interval, so workers can tell this
    /// process is still alive independent of application traffic.
    pub fn spawn_heartbeat(self: &Arc<Self>) {
        let this = self.clone();
        std::thread::spawn(move || {
            while !this.stopped.load(Ordering::Relaxed) {
                std::thread::sleep(this.heartbeat_interval);
                if this.stopped.load(Ordering::Relaxed) {
                    break;
                }
                this.broadcast_all(&Frame::control(FrameType::Ping));
            }
        });
    }

    /// The path of this root's listening socket.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accepts connections forever on the calling thread, spawning a
    /// per-peer handler thread for each. Run on a background thread started
    /// right after `fork()`, draining the accept backlog.
    pub fn accept_loop(self: &Arc<Self>) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let this = self.clone();
                    std::thread::spawn(move || this.handle_peer(stream));
                }
                Err(e) => {
                    log::warn!("cluster accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_peer(self: &Arc<Self>, stream: UnixStream) {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(Peer {
            id,
            stream: Mutex::new(stream.try_clone().expect("dup peer socket")),
            pubsub: Mutex::new(HashMap::new()),
            patterns: Mutex::new(HashMap::new()),
        });
        self.peers.lock().push(peer.clone());

        let mut parser = Parser::new();
        let mut reader = stream;
        let mut buf = [0u8; 16384];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("cluster peer {id} read error: {e}");
                    break;
                }
            };
            let frames = match parser.feed(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => {
                    log::error!("cluster peer {id} protocol error: {e}");
                    break;
                }
            };
            for frame in frames {
                self.dispatch_from_peer(&peer, frame);
            }
        }

        self.peers.lock().retain(|p| p.id != id);
        log::debug!("cluster peer {id} disconnected");
    }

    fn dispatch_from_peer(self: &Arc<Self>, peer: &Arc<Peer>, frame: Frame) {
        match frame.frame_type {
            FrameType::Forward | FrameType::Json => {
                self.broadcast_except(&frame, peer.id);
                self.dispatch_locally(&frame);
            }
            FrameType::Root | FrameType::RootJson => {
                let wire_type = if frame.frame_type == FrameType::RootJson {
                    crate::dispatch::WireType::Json
                } else {
                    crate::dispatch::WireType::Raw
                };
                self.dispatch_locally_as(&frame, wire_type);
            }
            FrameType::PubsubSub => {
                peer.pubsub.lock().insert(frame.channel, ());
            }
            FrameType::PubsubUnsub => {
                peer.pubsub.lock().remove(&frame.channel);
            }
            FrameType::PatternSub => {
                let tag = frame.payload.first().copied().unwrap_or(0);
                peer.patterns.lock().insert(frame.channel, tag);
            }
            FrameType::PatternUnsub => {
                peer.patterns.lock().remove(&frame.channel);
            }
            FrameType::Shutdown | FrameType::Error | FrameType::Ping => {
                // no-op at the message layer; connection liveness is
                // tracked separately.
            }
        }
    }

    fn dispatch_locally(&self, frame: &Frame) {
        let wire_type = if frame.frame_type == FrameType::Json {
            crate::dispatch::WireType::Json
        } else {
            crate::dispatch::WireType::Raw
        };
        self.dispatch_locally_as(frame, wire_type);
    }

    fn dispatch_locally_as(&self, frame: &Frame, wire_type: crate::dispatch::WireType) {
        let po = crate::postoffice::postoffice();
        crate::dispatch::publish_local(
            &po.filters,
            &po.pubsub,
            &po.patterns,
            &po.meta,
            &po.queue,
            frame.filter,
            crate::value::Value::bytes(frame.channel.clone()),
            crate::value::Value::bytes(frame.payload.clone()),
            wire_type,
        );
    }

    /// Writes `frame` to every connected peer except `except_id`.
    fn broadcast_except(&self, frame: &Frame, except_id: usize) {
        let Ok(encoded) = frame.encode() else {
            log::error!("refusing to broadcast oversized frame");
            return;
        };
        for peer in self.peers.lock().iter() {
            if peer.id == except_id {
                continue;
            }
            if let Err(e) = peer.stream.lock().write_all(&encoded) {
                log::warn!("cluster peer {} write failed: {e}", peer.id);
            }
        }
    }

    /// Writes `frame` to every connected peer.
    pub fn broadcast_all(&self, frame: &Frame) {
        let Ok(encoded) = frame.encode() else {
            log::error!("refusing to broadcast oversized frame");
            return;
        };
        for peer in self.peers.lock().iter() {
            if let Err(e) = peer.stream.lock().write_all(&encoded) {
                log::warn!("cluster peer {} write failed: {e}", peer.id);
            }
        }
    }

    /// Unlinks the socket file. Called on orderly shutdown.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.broadcast_all(&Frame::control(FrameType::Shutdown));
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Per-process-wide flag so `ON_PARENT_CRASH` fires at most once.
static PARENT_CRASH_HANDLED: AtomicBool = AtomicBool::new(false);

/// The worker side of the cluster transport: one connection to the root.
pub struct WorkerTransport {
    stream: StdMutex<UnixStream>,
    last_was_shutdown: AtomicBool,
    heartbeat_interval: Duration,
    stopped: AtomicBool,
}

impl WorkerTransport {
    /// Connects to the root's listening socket.
    pub fn connect(config: &ClusterConfig, root_pid: u32) -> Result<Arc<Self>> {
        let path = socket_path(config, root_pid);
        let stream = UnixStream::connect(&path)?;
        log::info!("cluster worker connected to {}", path.display());
        Ok(Arc::new(Self {
            stream: StdMutex::new(stream),
            last_was_shutdown: AtomicBool::new(false),
            heartbeat_interval: config.get_heartbeat_interval(),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Sends a single frame to the root.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode()?;
        self.stream
            .lock()
            .expect("worker stream mutex poisoned")
            .write_all(&encoded)
            .map_err(Error::from)
    }

    /// Spawns a background thread that sends a `Ping` frame to the root on
    /// every heartbeat interval, stopping once the connection is torn down.
    pub fn spawn_heartbeat(self: &Arc<Self>) {
        let this = self.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(this.heartbeat_interval);
            if this.stopped.load(Ordering::Relaxed) {
                break;
            }
            if this.send(&Frame::control(FrameType::Ping)).is_err() {
                break;
            }
        });
    }

    /// Walks the local pubsub/patterns collections and replays
    /// `PUBSUB_SUB`/`PATTERN_SUB` so the root learns about subscriptions
    /// that existed before this connection did, then fires every attached
    /// engine's `on_startup`.
    pub fn replay_subscriptions_and_announce(&self, po: &crate::postoffice::PostOffice) {
        for channel in po.pubsub.snapshot() {
            let _ = self.send(&Frame::new(
                FrameType::PubsubSub,
                0,
                channel.id.as_bytes().to_vec(),
                Vec::new(),
            ));
        }
        for channel in po.patterns.snapshot() {
            let tag = channel
                .match_fn
                .map(crate::registry::MatchFn::tag)
                .unwrap_or(0);
            let _ = self.send(&Frame::new(
                FrameType::PatternSub,
                0,
                channel.id.as_bytes().to_vec(),
                vec![tag],
            ));
        }
        po.engines.fire_on_startup();
    }

    /// Reads frames from the root forever on the calling thread, dispatching
    /// `FORWARD`/`JSON` locally and treating `SHUTDOWN` as the start of an
    /// orderly stop. Any other frame type is illegal from root and ignored.
    ///
    /// On an unexpected disconnect (stream closed without a prior
    /// `SHUTDOWN` frame) this runs the parent-crash path: logs, and raises
    /// `SIGINT` on the current process so the surrounding runtime's normal
    /// shutdown path takes over.
    pub fn run(self: &Arc<Self>) {
        let mut reader = self
            .stream
            .lock()
            .expect("worker stream mutex poisoned")
            .try_clone()
            .expect("dup worker socket");
        let mut parser = Parser::new();
        let mut buf = [0u8; 16384];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("cluster worker read error: {e}");
                    break;
                }
            };
            let frames = match parser.feed(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => {
                    log::error!("cluster worker protocol error: {e}");
                    break;
                }
            };
            for frame in frames {
                self.dispatch_from_root(frame);
            }
        }
        self.on_disconnected();
    }

    fn dispatch_from_root(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::Forward | FrameType::Json => {
                self.last_was_shutdown.store(false, Ordering::Relaxed);
                let wire_type = if frame.frame_type == FrameType::Json {
                    crate::dispatch::WireType::Json
                } else {
                    crate::dispatch::WireType::Raw
                };
                let po = crate::postoffice::postoffice();
                crate::dispatch::publish_local(
                    &po.filters,
                    &po.pubsub,
                    &po.patterns,
                    &po.meta,
                    &po.queue,
                    frame.filter,
                    crate::value::Value::bytes(frame.channel),
                    crate::value::Value::bytes(frame.payload),
                    wire_type,
                );
            }
            FrameType::Shutdown => {
                self.last_was_shutdown.store(true, Ordering::Relaxed);
                log::info!("cluster worker received SHUTDOWN, stopping");
                raise_sigint();
            }
            other => {
                log::warn!("cluster worker ignoring illegal frame from root: {other:?}");
            }
        }
    }

    fn on_disconnected(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        if self.last_was_shutdown.load(Ordering::Relaxed) {
            return;
        }
        if PARENT_CRASH_HANDLED.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!("cluster connection to parent closed without SHUTDOWN; treating as parent crash");
        crate::lifecycle::on_parent_crash();
        raise_sigint();
    }
}

fn raise_sigint() {
    if let Err(e) = nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT) {
        log::error!("failed to self-signal SIGINT: {e}");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_socket_path_uses_octal_pid() {
        let config = ClusterConfig::new().socket_dir("/tmp");
        let path = socket_path(&config, 8);
        assert_eq!(path, PathBuf::from("/tmp/postoffice-sock-10"));
    }
}
