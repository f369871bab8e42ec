//! Crate configuration: socket path, heartbeat interval and worker pool
//! size, exposed through a chained-setter builder rather than bare
//! constants.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the subscription dispatcher and cluster transport.
///
/// Construct with `ClusterConfig::new()`, then chain setters, each
/// consuming and returning `self`.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    socket_dir: Option<PathBuf>,
    heartbeat_interval: Duration,
    workers: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            socket_dir: None,
            heartbeat_interval: Duration::from_secs(5),
            workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
        }
    }
}

impl ClusterConfig {
    /// Builds a config with the defaults described on each setter below.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the directory the cluster socket is created in. Defaults
    /// to `$TMPDIR` (falling back to `/tmp`).
    #[must_use]
    pub fn socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    /// Overrides how often the cluster transport checks peer liveness.
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Size of the deferred-task worker pool. Defaults to
    /// `available_parallelism()` rather than a hardcoded constant.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// The configured heartbeat interval.
    #[must_use]
    pub fn get_heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// The configured deferred-task worker pool size.
    #[must_use]
    pub fn get_workers(&self) -> usize {
        self.workers
    }

    /// The directory the cluster socket is created in.
    #[must_use]
    pub fn resolved_socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(|| {
            std::env::var_os("TMPDIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_workers_is_at_least_one() {
        assert!(ClusterConfig::new().get_workers() >= 1);
    }

    #[test]
    fn test_builder_chains() {
        let cfg = ClusterConfig::new()
            .socket_dir("/var/run/pobus")
            .heartbeat_interval(Duration::from_secs(1))
            .workers(4);
        assert_eq!(cfg.resolved_socket_dir(), PathBuf::from("/var/run/pobus"));
        assert_eq!(cfg.get_heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(cfg.get_workers(), 4);
    }
}
