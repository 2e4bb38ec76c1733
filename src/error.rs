//! Таксономия ошибок хранилища профиля.
//!
//! Вызывающая сторона ветвится по виду ошибки (повторить попытку, предложить
//! восстановление из бэкапа, попросить освободить место), поэтому здесь
//! типизированный enum, а не anyhow. Каждая ошибка несёт операцию/путь и
//! исходную причину, где она есть.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backup::BackupEntry;
use crate::lock::LockMode;

pub type Result<T> = std::result::Result<T, StoreError>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Каталог не удалось создать/открыть. Фатально.
    #[error("filesystem error: {op} {}: {source}", path.display())]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Любая другая I/O ошибка; `source` сохраняется как есть
    /// (в т.ч. PermissionDenied при записи).
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("profile not initialized: {} is missing (run ensure_layout first)", path.display())]
    NotInitialized { path: PathBuf },

    /// Документ есть, но не парсится/не проходит валидацию.
    /// `backups` — актуальный список бэкапов для восстановления;
    /// `backups_error` — почему список получить не удалось (тогда он пуст).
    #[error(
        "profile {} is corrupt: {reason} ({})",
        path.display(),
        backups_note(backups, backups_error.as_deref())
    )]
    CorruptData {
        path: PathBuf,
        reason: String,
        backups: Vec<BackupEntry>,
        backups_error: Option<String>,
    },

    /// Документ не прошёл валидацию перед записью; на диск ничего не ушло.
    #[error("invalid profile document: {reason}")]
    InvalidDocument { reason: String },

    #[error("timed out after {waited:?} waiting for {mode} lock on {}", path.display())]
    LockTimeout {
        path: PathBuf,
        mode: LockMode,
        waited: Duration,
    },

    /// LockTimeout, поднятый на уровень операции store.
    #[error("concurrent access during {op}: {source}")]
    ConcurrentAccess {
        op: &'static str,
        #[source]
        source: Box<StoreError>,
    },

    #[error(
        "insufficient space in {}: need {required} bytes, {available} available",
        path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("backup {op} failed for {}: {source}", path.display())]
    BackupFailure {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    /// Метка manual-бэкапа не прошла проверку; ввод вызывающего, не сбой I/O.
    #[error("invalid backup name {name:?}: {reason}")]
    InvalidBackupName { name: String, reason: String },

    #[error("backup not found: {name}")]
    BackupNotFound { name: String },

    #[error("invalid backup {}: {}", path.display(), errors.join("; "))]
    InvalidBackup { path: PathBuf, errors: Vec<String> },

    #[error("serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot determine a default data directory: {reason}")]
    NoDataDirectory { reason: String },

    /// Искусственный сбой из FailPoint (тесты crash-safety).
    #[error("injected fault at {point:?}")]
    InjectedFault { point: crate::store::FailPoint },
}

fn backups_note(backups: &[BackupEntry], err: Option<&str>) -> String {
    match err {
        Some(e) => format!("backup list unavailable: {e}"),
        None => format!("{} backup(s) available", backups.len()),
    }
}

impl StoreError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn fs(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Filesystem {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn backup(
        op: &'static str,
        path: impl Into<PathBuf>,
        source: impl Into<BoxError>,
    ) -> Self {
        StoreError::BackupFailure {
            op,
            path: path.into(),
            source: source.into(),
        }
    }

    /// Переупаковать LockTimeout в ConcurrentAccess; остальное — без изменений.
    pub(crate) fn into_concurrent(self, op: &'static str) -> Self {
        match self {
            e @ StoreError::LockTimeout { .. } => StoreError::ConcurrentAccess {
                op,
                source: Box::new(e),
            },
            other => other,
        }
    }

    /// Повтор той же операции имеет смысл (конкурентный доступ).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout { .. } | StoreError::ConcurrentAccess { .. }
        )
    }

    /// Бэкапы, приложенные к CorruptData (пусто для остальных видов).
    pub fn recovery_backups(&self) -> &[BackupEntry] {
        match self {
            StoreError::CorruptData { backups, .. } => backups,
            _ => &[],
        }
    }

    /// Исходная io::Error, если ошибка пришла из файловой системы.
    pub fn io_source(&self) -> Option<&io::Error> {
        match self {
            StoreError::Io { source, .. } | StoreError::Filesystem { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_maps_to_concurrent_access() {
        let e = StoreError::LockTimeout {
            path: PathBuf::from("/tmp/x.lock"),
            mode: LockMode::Exclusive,
            waited: Duration::from_millis(10),
        };
        let mapped = e.into_concurrent("save");
        assert!(matches!(mapped, StoreError::ConcurrentAccess { op: "save", .. }));
        assert!(mapped.is_retryable());
    }

    #[test]
    fn other_errors_pass_through_into_concurrent() {
        let e = StoreError::NotInitialized {
            path: PathBuf::from("/nope"),
        };
        assert!(matches!(
            e.into_concurrent("load"),
            StoreError::NotInitialized { .. }
        ));
    }

    #[test]
    fn permission_denied_is_preserved() {
        let e = StoreError::io(
            "rename",
            "/x",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(
            e.io_source().map(|s| s.kind()),
            Some(io::ErrorKind::PermissionDenied)
        );
    }
}
