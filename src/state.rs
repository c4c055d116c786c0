//! Persistent state for crash recovery
//!
//! The running client records what it applied to the host so a later
//! `disconnect` can revert it even if the client died without cleaning up.

use crate::platform::LocalInterface;
use crate::vpn::NetworkRequest;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

const STATE_FILE: &str = "cstp-vpn.state.json";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to access state file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid state file: {0}")]
    ParseError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnState {
    /// Process owning the tunnel
    pub pid: u32,
    pub request: NetworkRequest,
    pub local: LocalInterface,
    /// Seconds since the Unix epoch
    pub started: u64,
}

impl VpnState {
    pub fn new(request: NetworkRequest, local: LocalInterface) -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            pid: std::process::id(),
            request,
            local,
            started,
        }
    }

    pub fn path() -> PathBuf {
        std::env::temp_dir().join(STATE_FILE)
    }

    pub fn save(&self) -> Result<(), StateError> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        debug!("State saved to {}", path.display());
        Ok(())
    }

    pub fn load() -> Result<Option<Self>, StateError> {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, StateError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete() -> Result<(), StateError> {
        Self::delete_at(&Self::path())
    }

    pub fn delete_at(path: &Path) -> Result<(), StateError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_active() -> bool {
        Self::path().exists()
    }

    /// Whether the process that wrote this state is still running
    #[cfg(unix)]
    pub fn owner_alive(&self) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(pid) = i32::try_from(self.pid) else {
            return false;
        };
        // EPERM still means the process exists
        matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(nix::errno::Errno::EPERM))
    }

    #[cfg(not(unix))]
    pub fn owner_alive(&self) -> bool {
        false
    }
}
