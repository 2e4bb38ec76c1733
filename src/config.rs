//! Centralized configuration for ProfileStore.
//!
//! - One place for tunables instead of scattered env lookups.
//! - StoreConfig::from_env() reads PROFILESTORE_* variables on top of defaults.
//! - Fluent `with_*` setters for programmatic overrides; StoreBuilder (store.rs)
//!   consumes the resulting config together with injectable collaborators.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::consts::{
    APP_DIR_NAME, DEFAULT_AUTO_BACKUP_KEEP, DEFAULT_LOCK_TIMEOUT, DEFAULT_SPACE_RESERVE_BYTES,
};
use crate::error::Result;
use crate::paths::resolve_base_directory;

/// Top-level configuration for a profile store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Explicit data directory. None = platform default (see paths.rs).
    /// Env: PROFILESTORE_DATA_DIR
    pub base_dir: Option<PathBuf>,

    /// Application directory name under the platform data root.
    pub app_dir_name: String,

    /// How long load/save/backup wait for a file lock.
    /// Env: PROFILESTORE_LOCK_TIMEOUT_MS (default 5000)
    pub lock_timeout: Duration,

    /// Take an auto backup before every save.
    /// Env: PROFILESTORE_AUTO_BACKUP = 0|1|true|false (default true)
    pub auto_backup: bool,

    /// How many auto backups to keep (FIFO). Values below 1 are raised to 1.
    /// Env: PROFILESTORE_AUTO_BACKUP_KEEP (default 10)
    pub auto_backup_keep: usize,

    /// Free space required on top of the serialized document size.
    /// Env: PROFILESTORE_SPACE_RESERVE_BYTES (default 65536)
    pub space_reserve_bytes: u64,

    /// Restrict directories to 0700 and the document to 0600 where supported.
    pub harden_permissions: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            app_dir_name: APP_DIR_NAME.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            auto_backup: true,
            auto_backup_keep: DEFAULT_AUTO_BACKUP_KEEP,
            space_reserve_bytes: DEFAULT_SPACE_RESERVE_BYTES,
            harden_permissions: true,
        }
    }
}

fn env_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl StoreConfig {
    /// Defaults overridden by environment variables. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("PROFILESTORE_DATA_DIR") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.base_dir = Some(PathBuf::from(s));
            }
        }

        if let Ok(v) = std::env::var("PROFILESTORE_LOCK_TIMEOUT_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.lock_timeout = Duration::from_millis(n);
            }
        }

        if let Ok(v) = std::env::var("PROFILESTORE_AUTO_BACKUP") {
            if let Some(on) = env_flag(&v) {
                cfg.auto_backup = on;
            }
        }

        if let Ok(v) = std::env::var("PROFILESTORE_AUTO_BACKUP_KEEP") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.auto_backup_keep = n.max(1);
            }
        }

        if let Ok(v) = std::env::var("PROFILESTORE_SPACE_RESERVE_BYTES") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.space_reserve_bytes = n;
            }
        }

        cfg
    }

    /// Config rooted at an explicit directory (tests, CLI --path).
    pub fn at(base_dir: impl Into<PathBuf>) -> Self {
        Self::default().with_base_dir(Some(base_dir.into()))
    }

    pub fn with_base_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.base_dir = dir;
        self
    }

    pub fn with_app_dir_name<S: Into<String>>(mut self, name: S) -> Self {
        self.app_dir_name = name.into();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_auto_backup(mut self, on: bool) -> Self {
        self.auto_backup = on;
        self
    }

    pub fn with_auto_backup_keep(mut self, keep: usize) -> Self {
        self.auto_backup_keep = keep.max(1);
        self
    }

    pub fn with_space_reserve_bytes(mut self, bytes: u64) -> Self {
        self.space_reserve_bytes = bytes;
        self
    }

    pub fn with_harden_permissions(mut self, on: bool) -> Self {
        self.harden_permissions = on;
        self
    }

    /// Resolved data directory (explicit or platform default).
    pub fn resolve_base_dir(&self) -> Result<PathBuf> {
        resolve_base_directory(self.base_dir.as_deref(), &self.app_dir_name)
    }
}

impl fmt::Display for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreConfig {{ \
             base_dir: {}, \
             app_dir_name: {}, \
             lock_timeout_ms: {}, \
             auto_backup: {}, \
             auto_backup_keep: {}, \
             space_reserve_bytes: {}, \
             harden_permissions: {} \
             }}",
            self.base_dir
                .as_deref()
                .map(Path::display)
                .map(|d| d.to_string())
                .unwrap_or_else(|| "default(platform)".to_string()),
            self.app_dir_name,
            self.lock_timeout.as_millis(),
            self.auto_backup,
            self.auto_backup_keep,
            self.space_reserve_bytes,
            self.harden_permissions,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.lock_timeout, Duration::from_secs(5));
        assert_eq!(cfg.auto_backup_keep, 10);
        assert!(cfg.auto_backup);
        assert_eq!(cfg.app_dir_name, "ProfileStore");
    }

    #[test]
    fn setters_clamp_keep_and_override_dir() {
        let cfg = StoreConfig::at("/tmp/p").with_auto_backup_keep(0);
        assert_eq!(cfg.auto_backup_keep, 1);
        assert_eq!(cfg.resolve_base_dir().unwrap(), PathBuf::from("/tmp/p"));
        assert!(cfg.to_string().contains("/tmp/p"));
    }

    #[test]
    fn env_flags_parse() {
        assert_eq!(env_flag(" ON "), Some(true));
        assert_eq!(env_flag("0"), Some(false));
        assert_eq!(env_flag("maybe"), None);
    }
}
