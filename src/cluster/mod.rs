//! Cluster framing and transport: a Unix-domain-socket channel connecting
//! a root process to its forked worker children.

/// Binary frame encoding/decoding.
pub mod codec;
/// Unix-domain-socket root/worker connections.
pub mod transport;

pub use codec::{Frame, FrameType, Parser};
pub use transport::{socket_path, RootTransport, WorkerTransport};
