//! Общие константы раскладки каталога, имён файлов и бэкапов.

use std::time::Duration;

// -------- Layout --------
/// Имя каталога приложения внутри платформенного data-каталога.
pub const APP_DIR_NAME: &str = "ProfileStore";

pub const DATA_DIR: &str = "data";
pub const FILES_DIR: &str = "files";
pub const BACKUPS_DIR: &str = "backups";
pub const LOGS_DIR: &str = "logs";

/// Порядок важен только для детерминированного вывода (status/тесты).
pub const LAYOUT_SUBDIRS: [&str; 4] = [DATA_DIR, FILES_DIR, BACKUPS_DIR, LOGS_DIR];

// -------- Document --------
pub const DOCUMENT_FILE: &str = "user_profile.json";
pub const DOCUMENT_VERSION: &str = "1.0";

/// Коллекции, которые создаются пустыми в документе по умолчанию.
/// Если поле присутствует, оно обязано быть массивом.
pub const COLLECTION_FIELDS: [&str; 5] = [
    "education",
    "work_experience",
    "skills",
    "projects",
    "certifications",
];

// -------- Temp / lock files --------
pub const TMP_EXT: &str = "tmp";
pub const LOCK_EXT: &str = "lock";
pub const BACKUPS_LOCK_FILE: &str = ".lock";

// -------- Backups --------
pub const BACKUP_INDEX_FILE: &str = "index.json";
pub const BACKUP_INDEX_VERSION: u32 = 1;

pub const AUTO_PREFIX: &str = "auto_";
pub const AUTO_EXT: &str = ".json.gz";
pub const MANUAL_PREFIX: &str = "manual_";
pub const MANUAL_EXT: &str = ".zip";

/// Сортируемая метка времени в именах архивов (UTC, микросекунды).
pub const BACKUP_TS_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

/// Имя манифеста внутри manual-архива.
pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

pub const DEFAULT_AUTO_BACKUP_KEEP: usize = 10;

// -------- Locking / space --------
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const LOCK_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
pub const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(100);

pub const DEFAULT_SPACE_RESERVE_BYTES: u64 = 64 * 1024;

/// Размер буфера при потоковом чтении (checksum / архивирование).
pub const IO_CHUNK: usize = 64 * 1024;
