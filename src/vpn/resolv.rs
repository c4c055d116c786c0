//! /etc/resolv.conf management for VPN DNS servers

use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ResolvError {
    #[error("Failed to access resolver file: {0}")]
    IoError(#[from] io::Error),
}

const RESOLV_PATH: &str = "/etc/resolv.conf";
const BACKUP_FILE_NAME: &str = "resolv.conf.cstp-vpn.bak";

pub struct ResolvConf {
    path: PathBuf,
    backup_path: PathBuf,
}

impl ResolvConf {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(RESOLV_PATH),
            backup_path: std::env::temp_dir().join(BACKUP_FILE_NAME),
        }
    }

    pub fn with_paths(path: PathBuf, backup_path: PathBuf) -> Self {
        Self { path, backup_path }
    }

    /// Back up the current resolver file, then point it at `servers`.
    ///
    /// An existing backup is left alone: it holds the pre-VPN configuration
    /// from a session that never restored it.
    pub fn install(&self, servers: &[Ipv4Addr]) -> Result<(), ResolvError> {
        if servers.is_empty() {
            return Ok(());
        }

        if self.backup_path.exists() {
            debug!(
                "Keeping existing resolver backup at {}",
                self.backup_path.display()
            );
        } else {
            fs::copy(&self.path, &self.backup_path)?;
        }

        fs::write(&self.path, render(servers))?;
        info!("Resolver now uses {} VPN name server(s)", servers.len());
        Ok(())
    }

    /// Put the backed-up resolver file back. Returns false when there was
    /// nothing to restore.
    pub fn restore(&self) -> Result<bool, ResolvError> {
        if !self.backup_path.exists() {
            return Ok(false);
        }

        let original = fs::read(&self.backup_path)?;
        fs::write(&self.path, original)?;
        fs::remove_file(&self.backup_path)?;
        info!("Restored resolver configuration");
        Ok(true)
    }
}

impl Default for ResolvConf {
    fn default() -> Self {
        Self::new()
    }
}

fn render(servers: &[Ipv4Addr]) -> String {
    servers
        .iter()
        .map(|dns| format!("nameserver {}\n", dns))
        .collect()
}
