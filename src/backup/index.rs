//! backup/index — `backups/index.json`: метаданные бэкапов.
//!
//! Формат (serde_json, pretty):
//!   { "version": 1, "entries": [ BackupEntry, ... ] }
//!
//! Индекс — кэш метаданных; архивы в каталоге — источник истины.
//! Повреждённый/отсутствующий индекс пересобирается сканированием каталога.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::consts::{BACKUP_INDEX_FILE, BACKUP_INDEX_VERSION, MANIFEST_ENTRY};
use crate::error::{Result, StoreError};
use crate::util::write_file_atomic;

use super::manual::BackupManifest;
use super::{parse_archive_name, BackupCategory, BackupEntry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupIndex {
    pub version: u32,
    pub entries: Vec<BackupEntry>,
}

impl Default for BackupIndex {
    fn default() -> Self {
        Self {
            version: BACKUP_INDEX_VERSION,
            entries: Vec::new(),
        }
    }
}

impl BackupIndex {
    /// Прочитать индекс. Отсутствует — пустой; не парсится — пустой + warn
    /// (reconcile() восстановит записи по файлам).
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(BACKUP_INDEX_FILE);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(StoreError::io("read backup index", path, e)),
        };
        let mut idx: BackupIndex = match serde_json::from_slice(&bytes) {
            Ok(idx) => idx,
            Err(e) => {
                warn!("backup index: {} unreadable ({}), rebuilding from archives", path.display(), e);
                return Ok(Self::default());
            }
        };
        if idx.version != BACKUP_INDEX_VERSION {
            warn!(
                "backup index: unsupported version {} in {}, rebuilding",
                idx.version,
                path.display()
            );
            return Ok(Self::default());
        }
        for e in &mut idx.entries {
            e.path = dir.join(&e.archive);
        }
        Ok(idx)
    }

    /// Атомарно записать индекс (tmp + fsync + rename).
    pub fn store(&self, dir: &Path) -> Result<()> {
        let path = dir.join(BACKUP_INDEX_FILE);
        let mut json = serde_json::to_vec_pretty(self).map_err(|source| StoreError::Serialize {
            what: "backup index",
            source,
        })?;
        json.push(b'\n');
        write_file_atomic(&path, &json)
    }

    /// Сверить индекс с содержимым каталога. true — индекс изменился.
    pub fn reconcile(&mut self, dir: &Path) -> Result<bool> {
        let mut on_disk = Vec::new();
        for e in fs::read_dir(dir).map_err(|e| StoreError::io("read backups dir", dir, e))? {
            let e = e.map_err(|e| StoreError::io("read backups dir", dir, e))?;
            if let Some(name) = e.file_name().to_str() {
                if parse_archive_name(name).is_some() {
                    on_disk.push(name.to_string());
                }
            }
        }
        let present: HashSet<&str> = on_disk.iter().map(String::as_str).collect();

        let before = self.entries.len();
        self.entries.retain(|e| present.contains(e.archive.as_str()));
        let mut changed = self.entries.len() != before;
        if changed {
            debug!(
                "backup index: dropped {} entr(ies) without archive",
                before - self.entries.len()
            );
        }

        let known: HashSet<String> = self.entries.iter().map(|e| e.archive.clone()).collect();
        for name in on_disk.iter().filter(|n| !known.contains(*n)) {
            if let Some(entry) = entry_from_archive(dir, name) {
                debug!("backup index: adopted {}", name);
                self.entries.push(entry);
                changed = true;
            }
        }
        self.sort();
        Ok(changed)
    }

    /// Добавить запись (или заменить запись с тем же архивом).
    pub fn upsert(&mut self, entry: BackupEntry) {
        self.entries.retain(|e| e.archive != entry.archive);
        self.entries.push(entry);
        self.sort();
    }

    /// Последний (самый новый) auto-бэкап.
    pub fn latest_auto(&self) -> Option<&BackupEntry> {
        self.entries
            .iter()
            .filter(|e| e.category == BackupCategory::Auto)
            .max_by_key(|e| e.created_at)
    }

    /// FIFO-вытеснение auto-записей сверх `keep`. Возвращает удалённые из
    /// индекса записи (старые первыми); файлы удаляет вызывающий.
    pub fn prune_auto(&mut self, keep: usize) -> Vec<BackupEntry> {
        let evict = select_auto_evictions(&self.entries, keep);
        if evict.is_empty() {
            return Vec::new();
        }
        let names: HashSet<&str> = evict.iter().map(|e| e.archive.as_str()).collect();
        self.entries.retain(|e| !names.contains(e.archive.as_str()));
        evict
    }

    pub fn newest_first(&self, category: Option<BackupCategory>) -> Vec<BackupEntry> {
        let mut out: Vec<BackupEntry> = self
            .entries
            .iter()
            .filter(|e| category.map_or(true, |c| e.category == c))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.archive.cmp(&a.archive)));
        out
    }

    // Хранить по возрастанию времени создания (порядок FIFO).
    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.archive.cmp(&b.archive)));
    }
}

/// Какие auto-записи вытеснить, чтобы их осталось ровно `keep`:
/// сортировка по created_at по возрастанию, снимаем с головы. Manual не трогаются.
pub fn select_auto_evictions(entries: &[BackupEntry], keep: usize) -> Vec<BackupEntry> {
    let mut autos: Vec<&BackupEntry> = entries
        .iter()
        .filter(|e| e.category == BackupCategory::Auto)
        .collect();
    if autos.len() <= keep {
        return Vec::new();
    }
    autos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.archive.cmp(&b.archive)));
    let excess = autos.len() - keep;
    autos.into_iter().take(excess).cloned().collect()
}

/// Восстановить запись по файлу архива (для reconcile).
fn entry_from_archive(dir: &Path, archive: &str) -> Option<BackupEntry> {
    let (category, created_at, label) = parse_archive_name(archive)?;
    let path = dir.join(archive);
    let size_bytes = fs::metadata(&path).ok()?.len();
    let (name, manifest) = match category {
        BackupCategory::Auto => (archive_stem(archive), None),
        BackupCategory::Manual => {
            let manifest = match read_zip_manifest(&path) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("backup index: no manifest in {}: {}", path.display(), e);
                    None
                }
            };
            (label.unwrap_or_default(), manifest)
        }
    };
    Some(BackupEntry {
        category,
        name,
        created_at,
        archive: archive.to_string(),
        size_bytes,
        manifest,
        path,
    })
}

pub(crate) fn archive_stem(archive: &str) -> String {
    archive
        .strip_suffix(crate::consts::AUTO_EXT)
        .unwrap_or(archive)
        .to_string()
}

pub(crate) fn read_zip_manifest(path: &Path) -> std::result::Result<BackupManifest, String> {
    let f = File::open(path).map_err(|e| e.to_string())?;
    let mut zip = zip::ZipArchive::new(f).map_err(|e| e.to_string())?;
    let mut entry = zip.by_name(MANIFEST_ENTRY).map_err(|e| e.to_string())?;
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).map_err(|e| e.to_string())?;
    serde_json::from_slice(&buf).map_err(|e| e.to_string())
}

/// Распаковать auto-архив (gzip) целиком.
pub(crate) fn read_gz(path: &Path) -> io::Result<Vec<u8>> {
    let f = File::open(path)?;
    let mut dec = GzDecoder::new(f);
    let mut out = Vec::new();
    dec.read_to_end(&mut out)?;
    Ok(out)
}
