//! backup — двухуровневые бэкапы.
//!
//! - auto: перед каждым save снимок документа в `auto_<ts>.json.gz`,
//!   хранится не больше `keep` (по умолчанию 10) штук, строго FIFO по времени создания.
//! - manual: по запросу весь каталог данных (кроме backups/) в
//!   `manual_<ts>_<name>.zip` + `manifest.json` с SHA-256 каждого файла.
//!   Никогда не удаляются автоматически.
//!
//! Метаданные лежат в `backups/index.json` (см. index.rs); источник истины —
//! сами архивы на диске, индекс сверяется с ними при каждом чтении.
//! Все изменения индекса — под exclusive-локом `backups/.lock`.

mod auto;
pub mod index;
mod manual;
mod restore;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consts::{
    AUTO_EXT, AUTO_PREFIX, BACKUPS_LOCK_FILE, BACKUP_INDEX_FILE, BACKUP_TS_FORMAT, MANUAL_EXT,
    MANUAL_PREFIX,
};
use crate::error::{Result, StoreError};
use crate::layout::{sweep_stale_temp_files, DataLayout};
use crate::lock::{LockGuard, LockManager, LockMode};

pub use index::BackupIndex;
pub use manual::{BackupManifest, ManifestFile};
pub use restore::{RestoredArchive, VerifyReport};
pub(crate) use restore::restore_user_files;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupCategory {
    Auto,
    Manual,
}

impl fmt::Display for BackupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupCategory::Auto => f.pad("auto"),
            BackupCategory::Manual => f.pad("manual"),
        }
    }
}

impl FromStr for BackupCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackupCategory::Auto),
            "manual" => Ok(BackupCategory::Manual),
            other => Err(format!("unknown backup category '{other}' (expected auto|manual)")),
        }
    }
}

/// Метаданные одного бэкапа.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub category: BackupCategory,
    /// auto: метка времени; manual: имя, заданное пользователем.
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Имя файла архива внутри backups/.
    pub archive: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<BackupManifest>,
    /// Полный путь к архиву (вычисляется при загрузке индекса).
    #[serde(skip)]
    pub path: PathBuf,
}

// -------------------- archive naming --------------------

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(BACKUP_TS_FORMAT).to_string()
}

/// Имена архивов имеют микросекундную точность; created_at — тоже.
pub(crate) fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

pub(crate) fn auto_archive_name(ts: DateTime<Utc>) -> String {
    format!("{AUTO_PREFIX}{}{AUTO_EXT}", format_ts(ts))
}

pub(crate) fn manual_archive_name(ts: DateTime<Utc>, label: &str) -> String {
    format!("{MANUAL_PREFIX}{}_{label}{MANUAL_EXT}", format_ts(ts))
}

/// Разобрать имя архива: (категория, время создания, метка для manual).
pub(crate) fn parse_archive_name(
    file_name: &str,
) -> Option<(BackupCategory, DateTime<Utc>, Option<String>)> {
    // длина "%Y%m%d_%H%M%S_%6f"
    const TS_LEN: usize = 22;

    if let Some(rest) = file_name.strip_prefix(AUTO_PREFIX) {
        let ts = rest.strip_suffix(AUTO_EXT)?;
        return Some((BackupCategory::Auto, parse_ts(ts)?, None));
    }
    if let Some(rest) = file_name.strip_prefix(MANUAL_PREFIX) {
        let rest = rest.strip_suffix(MANUAL_EXT)?;
        if rest.len() < TS_LEN + 2 || !rest.is_char_boundary(TS_LEN) {
            return None;
        }
        let (ts, label) = rest.split_at(TS_LEN);
        let label = label.strip_prefix('_')?;
        if label.is_empty() {
            return None;
        }
        return Some((BackupCategory::Manual, parse_ts(ts)?, Some(label.to_string())));
    }
    None
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, BACKUP_TS_FORMAT)
        .ok()
        .map(|n| n.and_utc())
}

/// Имя manual-бэкапа: только [A-Za-z0-9_-], 1..=64 символа.
pub(crate) fn validate_label(name: &str) -> std::result::Result<String, String> {
    let name = name.trim();
    if name.is_empty() {
        return Err("backup name must not be empty".to_string());
    }
    if name.len() > 64 {
        return Err(format!("backup name is too long ({} > 64)", name.len()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!("backup name contains unsupported character '{c}'"));
    }
    Ok(name.to_string())
}

// -------------------- manager --------------------

/// Создание, листинг, проверка и чтение бэкапов.
#[derive(Debug, Clone)]
pub struct BackupManager {
    layout: DataLayout,
    locks: LockManager,
    keep: usize,
}

impl BackupManager {
    pub fn new(layout: DataLayout, locks: LockManager, keep: usize) -> Self {
        Self {
            layout,
            locks,
            keep: keep.max(1),
        }
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.layout.backups_dir()
    }

    pub fn retention(&self) -> usize {
        self.keep
    }

    fn lock_backups(&self, mode: LockMode) -> Result<LockGuard> {
        let dir = self.layout.backups_dir();
        if !dir.is_dir() {
            return Err(StoreError::NotInitialized { path: dir });
        }
        self.locks
            .acquire(&dir.join(BACKUPS_LOCK_FILE), mode, self.locks.default_timeout())
    }

    /// Список бэкапов, новые первыми; опционально только одной категории.
    ///
    /// Индекс сверяется с каталогом: исчезнувшие архивы выпадают, архивы,
    /// которых нет в индексе (крэш между записью архива и индекса), подхватываются.
    pub fn list_backups(&self, category: Option<BackupCategory>) -> Result<Vec<BackupEntry>> {
        let dir = self.layout.backups_dir();
        let _g = self.lock_backups(LockMode::Shared)?;
        let mut index = BackupIndex::load(&dir)?;
        index.reconcile(&dir)?;
        Ok(index.newest_first(category))
    }

    /// Найти бэкап по имени архива или по имени (для manual — самый свежий с таким именем).
    pub fn find(&self, name: &str) -> Result<BackupEntry> {
        let all = self.list_backups(None)?;
        if let Some(e) = all.iter().find(|e| e.archive == name) {
            return Ok(e.clone());
        }
        all.into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| StoreError::BackupNotFound {
                name: name.to_string(),
            })
    }

    /// Убрать tmp-файлы auto-архивов и индекса, оставшиеся после крэша.
    /// Manual-архивы пишутся без лока каталога, их tmp не трогаются.
    pub(crate) fn sweep_stale_temp_files(&self) -> Result<usize> {
        let dir = self.layout.backups_dir();
        let _g = self.lock_backups(LockMode::Exclusive)?;
        sweep_stale_temp_files(&dir, |t| t == BACKUP_INDEX_FILE || t.starts_with(AUTO_PREFIX))
            .map_err(|e| StoreError::io("sweep temp files", &dir, e))
    }

    pub(crate) fn archive_path(&self, archive: &str) -> PathBuf {
        self.layout.backups_dir().join(archive)
    }

    pub(crate) fn layout(&self) -> &DataLayout {
        &self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 5).unwrap()
            + chrono::Duration::microseconds(123_456)
    }

    #[test]
    fn archive_names_sort_by_time_and_parse_back() {
        let a = auto_archive_name(ts());
        assert_eq!(a, "auto_20261019_083005_123456.json.gz");
        let (cat, t, label) = parse_archive_name(&a).unwrap();
        assert_eq!(cat, BackupCategory::Auto);
        assert_eq!(t, ts());
        assert!(label.is_none());

        let later = auto_archive_name(ts() + chrono::Duration::microseconds(1));
        assert!(later > a);
    }

    #[test]
    fn manual_name_carries_label() {
        let m = manual_archive_name(ts(), "pre-update");
        assert_eq!(m, "manual_20261019_083005_123456_pre-update.zip");
        let (cat, t, label) = parse_archive_name(&m).unwrap();
        assert_eq!(cat, BackupCategory::Manual);
        assert_eq!(t, ts());
        assert_eq!(label.as_deref(), Some("pre-update"));
    }

    #[test]
    fn foreign_files_are_not_archives() {
        for n in [
            "index.json",
            ".lock",
            "auto_garbage.json.gz",
            "manual_20261019_083005_123456_.zip",
            "manual_20261019_083005_123456.zip",
            ".auto_20261019_083005_123456.json.gz.0123456789abcdef.tmp",
        ] {
            assert!(parse_archive_name(n).is_none(), "{n}");
        }
    }

    #[test]
    fn labels_are_validated() {
        assert_eq!(validate_label(" pre-update ").unwrap(), "pre-update");
        assert!(validate_label("").is_err());
        assert!(validate_label("../etc").is_err());
        assert!(validate_label("a b").is_err());
        assert!(validate_label(&"x".repeat(65)).is_err());
    }

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!("AUTO".parse::<BackupCategory>().unwrap(), BackupCategory::Auto);
        assert_eq!("manual".parse::<BackupCategory>().unwrap(), BackupCategory::Manual);
        assert!("weekly".parse::<BackupCategory>().is_err());
    }
}
