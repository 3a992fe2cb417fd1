//! Daemon process management
//!
//! Handles daemonization, PID file management, and process control.
//! The PID file, version file, socket, and log all live under the
//! configured runtime directory so one daemon maps to one store.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use eyre::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;

/// Current version from git describe (set at compile time)
pub const VERSION: &str = env!("GIT_DESCRIBE");

/// Daemon process manager
#[derive(Debug)]
pub struct DaemonManager {
    /// Path to the PID file
    pid_file: PathBuf,
    /// Path to the version file
    version_file: PathBuf,
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonManager {
    /// Create a daemon manager against the default runtime directory
    pub fn new() -> Self {
        Self::from_config(&StorageConfig::default())
    }

    /// Create a daemon manager for the configured runtime directory
    pub fn from_config(storage: &StorageConfig) -> Self {
        let runtime_dir = PathBuf::from(&storage.runtime_dir);
        let mgr = Self {
            pid_file: runtime_dir.join("cbd.pid"),
            version_file: runtime_dir.join("cbd.version"),
        };
        debug!(?mgr.pid_file, ?mgr.version_file, "DaemonManager::from_config: created");
        mgr
    }

    /// Create a daemon manager with a custom PID file path (for testing)
    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        debug!(?pid_file, "DaemonManager::with_pid_file: called");
        let version_file = pid_file.with_extension("version");
        Self { pid_file, version_file }
    }

    /// Check if a daemon is running
    pub fn is_running(&self) -> bool {
        self.read_pid().is_some_and(is_process_running)
    }

    /// Get the running daemon's PID
    pub fn running_pid(&self) -> Option<u32> {
        self.read_pid().filter(|&pid| is_process_running(pid))
    }

    /// Read the PID from the PID file
    fn read_pid(&self) -> Option<u32> {
        if !self.pid_file.exists() {
            return None;
        }

        let mut file = fs::File::open(&self.pid_file).ok()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).ok()?;

        contents.trim().parse().ok()
    }

    /// Write the PID to the PID file
    fn write_pid(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }

        let mut file = fs::File::create(&self.pid_file).context("Failed to create PID file")?;
        write!(file, "{}", pid).context("Failed to write PID")?;

        debug!(pid, path = ?self.pid_file, "Wrote PID file");
        Ok(())
    }

    /// Remove the PID file
    fn remove_pid_file(&self) -> Result<()> {
        if self.pid_file.exists() {
            fs::remove_file(&self.pid_file).context("Failed to remove PID file")?;
            debug!(path = ?self.pid_file, "Removed PID file");
        }
        Ok(())
    }

    /// Write the version to the version file
    fn write_version(&self, version: &str) -> Result<()> {
        if let Some(parent) = self.version_file.parent() {
            fs::create_dir_all(parent).context("Failed to create version file directory")?;
        }

        let mut file = fs::File::create(&self.version_file).context("Failed to create version file")?;
        write!(file, "{}", version).context("Failed to write version")?;

        debug!(version, path = ?self.version_file, "Wrote version file");
        Ok(())
    }

    /// Read the version from the version file
    pub fn read_version(&self) -> Option<String> {
        if !self.version_file.exists() {
            return None;
        }

        let mut file = fs::File::open(&self.version_file).ok()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).ok()?;

        Some(contents.trim().to_string())
    }

    /// Remove the version file
    fn remove_version_file(&self) -> Result<()> {
        if self.version_file.exists() {
            fs::remove_file(&self.version_file).context("Failed to remove version file")?;
            debug!(path = ?self.version_file, "Removed version file");
        }
        Ok(())
    }

    /// Check if the running daemon version matches the current CLI version
    pub fn version_matches(&self) -> bool {
        match self.read_version() {
            Some(daemon_version) => {
                let matches = daemon_version == VERSION;
                debug!(daemon_version, cli_version = VERSION, matches, "version_matches: checked");
                matches
            }
            None => {
                debug!("version_matches: no version file, assuming mismatch");
                false
            }
        }
    }

    /// Start the daemon
    ///
    /// Spawns a detached child running the hidden `run-daemon` command
    /// and returns immediately. The config path, when given, is passed
    /// through so the daemon reads the same file the operator pointed
    /// at.
    pub fn start(&self, config_path: Option<&Path>) -> Result<u32> {
        debug!("DaemonManager::start: called");
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        info!("Starting daemon...");
        let exe = std::env::current_exe().context("Failed to get current executable")?;
        debug!(?exe, "DaemonManager::start: spawning daemon process");

        let mut command = Command::new(&exe);
        command.arg("run-daemon");
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }

        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        self.write_pid(pid)?;

        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// Stop the daemon with SIGTERM, escalating to SIGKILL
    pub fn stop(&self) -> Result<()> {
        debug!("DaemonManager::stop: called");
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        info!(pid, "Stopping daemon...");
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to send SIGTERM")?;

        // Wait for process to exit (with timeout)
        let mut attempts = 0;
        while is_process_running(pid) && attempts < 50 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            attempts += 1;
        }

        if is_process_running(pid) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }

        self.remove_pid_file()?;
        self.remove_version_file()?;
        info!(pid, "Daemon stopped");
        Ok(())
    }

    /// Register the current process as the daemon
    ///
    /// Called by the daemon process itself after spawning.
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        self.write_pid(pid)?;
        self.write_version(VERSION)?;
        info!(pid, version = VERSION, "Daemon registered");
        Ok(())
    }

    /// Remove the PID and version files on clean daemon exit
    ///
    /// An IPC-initiated shutdown never passes through [`stop`], so the
    /// daemon cleans up after itself.
    ///
    /// [`stop`]: DaemonManager::stop
    pub fn unregister_self(&self) -> Result<()> {
        self.remove_pid_file()?;
        self.remove_version_file()?;
        Ok(())
    }

    /// Get the PID file path
    pub fn pid_file(&self) -> &PathBuf {
        &self.pid_file
    }

    /// Get the daemon status
    pub fn status(&self) -> DaemonStatus {
        let pid = self.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file.clone(),
        }
    }
}

/// Check if a process with the given PID is running
///
/// Sending signal 0 checks if the process exists without affecting it.
fn is_process_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Daemon status information
#[derive(Debug)]
pub struct DaemonStatus {
    /// Whether the daemon is running
    pub running: bool,
    /// Process ID (if running)
    pub pid: Option<u32>,
    /// PID file path
    pub pid_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_daemon_manager_new() {
        let manager = DaemonManager::new();
        // Just verify it doesn't panic - pid_file may or may not exist
        let _ = manager.pid_file();
    }

    #[test]
    fn test_daemon_manager_from_config() {
        let storage = StorageConfig {
            runtime_dir: "/tmp/cbd-test".to_string(),
            ..Default::default()
        };
        let manager = DaemonManager::from_config(&storage);
        assert_eq!(manager.pid_file(), &PathBuf::from("/tmp/cbd-test/cbd.pid"));
        assert_eq!(manager.version_file, PathBuf::from("/tmp/cbd-test/cbd.version"));
    }

    #[test]
    fn test_is_not_running_when_no_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("nonexistent.pid");

        let manager = DaemonManager::with_pid_file(pid_file);
        assert!(!manager.is_running());
    }

    #[test]
    fn test_write_and_read_pid() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("test.pid");

        let manager = DaemonManager::with_pid_file(pid_file);

        manager.write_pid(12345).unwrap();
        assert_eq!(manager.read_pid(), Some(12345));

        manager.remove_pid_file().unwrap();
        assert_eq!(manager.read_pid(), None);
    }

    #[test]
    fn test_status() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("test.pid");

        let manager = DaemonManager::with_pid_file(pid_file.clone());
        let status = manager.status();

        assert!(!status.running);
        assert!(status.pid.is_none());
        assert_eq!(status.pid_file, pid_file);
    }

    #[test]
    fn test_write_and_read_version() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("test.pid");

        let manager = DaemonManager::with_pid_file(pid_file);

        // Initially no version file
        assert_eq!(manager.read_version(), None);

        manager.write_version("v1.2.3").unwrap();
        assert_eq!(manager.read_version(), Some("v1.2.3".to_string()));

        // Overwrite version
        manager.write_version("v2.0.0").unwrap();
        assert_eq!(manager.read_version(), Some("v2.0.0".to_string()));

        manager.remove_version_file().unwrap();
        assert_eq!(manager.read_version(), None);
    }

    #[test]
    fn test_version_matches_when_same() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("test.pid");

        let manager = DaemonManager::with_pid_file(pid_file);
        manager.write_version(VERSION).unwrap();

        assert!(manager.version_matches());
    }

    #[test]
    fn test_version_matches_when_different() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("test.pid");

        let manager = DaemonManager::with_pid_file(pid_file);
        manager.write_version("totally-different-version").unwrap();

        assert!(!manager.version_matches());
    }

    #[test]
    fn test_version_matches_when_no_file() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("test.pid");

        let manager = DaemonManager::with_pid_file(pid_file);
        assert!(!manager.version_matches());
    }

    #[test]
    fn test_unregister_self_removes_both_files() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("test.pid");

        let manager = DaemonManager::with_pid_file(pid_file.clone());
        manager.write_pid(4242).unwrap();
        manager.write_version("v1").unwrap();

        manager.unregister_self().unwrap();
        assert!(!pid_file.exists());
        assert_eq!(manager.read_version(), None);
    }

    #[test]
    fn test_version_file_path_derived_from_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("myapp.pid");

        let manager = DaemonManager::with_pid_file(pid_file.clone());

        // Version file should be alongside pid file with .version extension
        let expected_version_file = temp_dir.path().join("myapp.version");
        assert_eq!(manager.version_file, expected_version_file);
    }
}
