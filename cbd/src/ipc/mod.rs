//! Inter-process communication between the CLI and the daemon
//!
//! Newline-delimited JSON over a Unix domain socket. Every mutating
//! command routes through the daemon so the store keeps a single
//! writer; read-only commands may bypass it when the daemon is down.

use std::path::{Path, PathBuf};

pub mod client;
pub mod listener;
pub mod messages;

pub use client::DaemonClient;
pub use listener::{cleanup_socket, create_listener_at, run_listener};
pub use messages::{DaemonMessage, DaemonResponse, StatusReport};

/// Socket path inside the daemon runtime directory
pub fn socket_path(runtime_dir: impl AsRef<Path>) -> PathBuf {
    runtime_dir.as_ref().join("daemon.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_ends_with_daemon_sock() {
        let path = socket_path("/var/lib/callbackd");
        assert_eq!(path, PathBuf::from("/var/lib/callbackd/daemon.sock"));
    }
}
