#![deny(missing_docs)]
//! Pub/sub and inter-process cluster messaging core for network I/O
//! frameworks: in-process channels (exact, pattern, filter), pluggable
//! external engines, and a Unix-domain-socket cluster transport connecting
//! a root process to its forked worker children.

use std::env;
use std::io::Write;

pub use log::LevelFilter;

/// Opaque payload / channel-identifier carrier.
pub mod value;

/// Glob-style pattern matcher.
pub mod glob;

/// Subscription registry: channels, subscriptions, collections.
pub mod registry;

/// Local message dispatch and the deferred-task worker pool.
pub mod dispatch;

/// Metadata hook registry.
pub mod meta;

/// Pluggable external engine registry.
pub mod engine;

/// Cluster framing codec and transport.
pub mod cluster;

/// Lifecycle glue.
pub mod lifecycle;

/// Crate configuration.
pub mod config;

/// The top-level orchestrator and public API surface.
pub mod postoffice;

pub use postoffice::{init, message_defer, postoffice, PostOffice, PublishArgs, SubscribeArgs};
pub use glob::match_glob;
pub use value::Value;

/// The crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate error type.
///
/// Mapping from the error taxonomy: `PreconditionViolation` is not a
/// variant here (handled inline in `PostOffice::subscribe` by firing
/// `on_unsubscribe` and returning `None`); `EngineError` is not modeled
/// (engines report through their own return value, which the core does not
/// interpret).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Resource exhaustion: allocation failure, socket listen/connect
    /// failure. Non-recoverable; the caller is expected to log and
    /// terminate the process (see [`critical`]).
    #[error("fatal: {0}")]
    Fatal(String),
    /// A frame's declared `channel_len`/`payload_len` exceeded the
    /// configured limit. Fatal on the owning connection: both peers are
    /// forked from the same binary, so this indicates corruption.
    #[error("frame {field} too large: {len} bytes (limit {limit})")]
    FrameTooLarge {
        /// Which header field exceeded its limit.
        field: &'static str,
        /// The declared length.
        len: usize,
        /// The configured limit.
        limit: usize,
    },
    /// A received frame's `type` field did not match any known
    /// `FrameType`. Treated the same as `FrameTooLarge`: only another
    /// instance of this binary speaks this protocol, so this is corruption.
    #[error("unknown cluster frame type: {0}")]
    UnknownFrameType(u32),
    /// A cluster peer (worker, from the root's point of view) was
    /// observed to disconnect. Surfaced only to internal transport
    /// logic/logs, never to `publish`/`subscribe` callers.
    #[error("cluster peer lost: pid {0}")]
    PeerLost(i32),
    /// Underlying I/O failure (socket bind/connect/read/write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Returns true if started in production mode (as a systemd unit).
#[must_use]
pub fn is_production() -> bool {
    env::var("INVOCATION_ID").map_or(false, |v| !v.is_empty())
}

/// Configures stdout logger with the given filter. If started in
/// production mode, timestamps are omitted from the output.
pub fn configure_logger(filter: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.target(env_logger::Target::Stdout);
    builder.filter_level(filter);
    if is_production() {
        builder.format(|buf, record| writeln!(buf, "{} {}", record.level(), record.args()));
    }
    builder.init();
}

/// Logs `msg` at `error!` and terminates the process immediately. Used for
/// conditions that are non-recoverable for a long-lived infrastructure
/// component, such as resource exhaustion or a protocol limit violation --
/// a direct log-then-exit, since this crate has no real-time scheduling of
/// its own to tear down first.
pub fn critical(msg: &str) -> ! {
    log::error!("{msg}");
    std::process::exit(1);
}

/// Re-exports for `use postoffice::prelude::*;`.
pub mod prelude {
    pub use crate::postoffice::prelude::*;
    pub use crate::{configure_logger, critical, is_production, Error, Result};
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_frame_too_large_display() {
        let err = Error::FrameTooLarge {
            field: "channel_len",
            len: 100,
            limit: 10,
        };
        assert_eq!(
            err.to_string(),
            "frame channel_len too large: 100 bytes (limit 10)"
        );
    }
}
