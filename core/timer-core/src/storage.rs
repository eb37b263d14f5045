//! Storage configuration and path management.
//!
//! All file paths used by the daemon and its clients are decided here so
//! tests can point everything at a temp directory via
//! [`StoragePaths::with_root`].

use std::path::{Path, PathBuf};

/// Overrides the data root (default `~/.ticket-timer`).
pub const HOME_ENV: &str = "TICKET_TIMER_HOME";

#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    /// Resolves the root from `TICKET_TIMER_HOME`, falling back to the home
    /// directory.
    pub fn from_env() -> Result<Self, String> {
        if let Some(root) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::with_root(PathBuf::from(root)));
        }
        let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
        Ok(Self::with_root(home.join(".ticket-timer")))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socket_file(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    pub fn database_file(&self) -> PathBuf {
        self.root.join("daemon").join("state.db")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.root.join("exports")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_root() {
        let paths = StoragePaths::with_root(PathBuf::from("/tmp/tt"));
        assert_eq!(paths.socket_file(), PathBuf::from("/tmp/tt/daemon.sock"));
        assert_eq!(paths.database_file(), PathBuf::from("/tmp/tt/daemon/state.db"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/tt/config.toml"));
        assert_eq!(paths.exports_dir(), PathBuf::from("/tmp/tt/exports"));
    }
}
