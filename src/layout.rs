//! layout — раскладка каталога данных и её идемпотентная инициализация.
//!
//! <base>/
//!   data/user_profile.json   — документ (+ .lock sidecar)
//!   files/                   — пользовательские файлы (резюме и т.п.)
//!   backups/                 — auto_*.json.gz, manual_*.zip, index.json, .lock
//!   logs/

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::consts::{BACKUPS_DIR, DATA_DIR, DOCUMENT_FILE, FILES_DIR, LAYOUT_SUBDIRS, LOGS_DIR};
use crate::document::ProfileDocument;
use crate::error::{Result, StoreError};
use crate::util::{
    restrict_dir_to_owner, restrict_file_to_owner, tmp_target_name, write_file_if_absent,
};

/// Вычисленные пути раскладки. Ничего не создаёт.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    base: PathBuf,
}

impl DataLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base.join(DATA_DIR)
    }

    pub fn files_dir(&self) -> PathBuf {
        self.base.join(FILES_DIR)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base.join(BACKUPS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join(LOGS_DIR)
    }

    pub fn document_path(&self) -> PathBuf {
        self.data_dir().join(DOCUMENT_FILE)
    }

    pub fn subdirs(&self) -> Vec<PathBuf> {
        LAYOUT_SUBDIRS.iter().map(|d| self.base.join(d)).collect()
    }

    /// Все подкаталоги на месте (предусловие load/save/backup).
    pub fn is_complete(&self) -> bool {
        self.base.is_dir() && self.subdirs().iter().all(|d| d.is_dir())
    }
}

/// Итог `ensure_layout`: что было сделано при этом вызове.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutReport {
    pub created_dirs: Vec<PathBuf>,
    pub created_document: bool,
    /// Заполняется `ProfileStore::initialize` (sweep идёт под локом документа).
    pub removed_temp_files: usize,
}

/// Создать base и подкаталоги (с родителями), при отсутствии документа —
/// записать документ по умолчанию. Безопасно вызывать на каждом старте.
///
/// Ошибка создания каталога фатальна (`StoreError::Filesystem`), без повторов.
/// Права 0700/0600 выставляются где платформа это умеет, иначе шаг пропускается.
pub fn ensure_layout(base_dir: &Path, harden: bool) -> Result<LayoutReport> {
    let layout = DataLayout::new(base_dir);
    let mut report = LayoutReport::default();

    let mut dirs = vec![layout.base_dir().to_path_buf()];
    dirs.extend(layout.subdirs());
    for dir in &dirs {
        if !dir.is_dir() {
            fs::create_dir_all(dir).map_err(|e| StoreError::fs("create directory", dir, e))?;
            report.created_dirs.push(dir.clone());
            debug!("layout: created {}", dir.display());
        }
        if harden {
            harden_best_effort(dir, restrict_dir_to_owner);
        }
    }

    // Без rename: параллельный старт не должен затереть документ,
    // который другой процесс уже успел сохранить.
    let doc_path = layout.document_path();
    if !doc_path.exists() {
        let doc = ProfileDocument::default();
        if write_file_if_absent(&doc_path, &doc.to_bytes()?)? {
            report.created_document = true;
            info!(
                "layout: wrote default document version={} to {}",
                doc.version,
                doc_path.display()
            );
        } else {
            debug!("layout: {} appeared concurrently, kept", doc_path.display());
        }
    }
    if harden {
        harden_best_effort(&doc_path, restrict_file_to_owner);
    }

    if !report.created_dirs.is_empty() || report.created_document {
        info!(
            "layout: ensured base={}, dirs_created={}, document_created={}",
            base_dir.display(),
            report.created_dirs.len(),
            report.created_document
        );
    }
    Ok(report)
}

fn harden_best_effort(path: &Path, f: fn(&Path) -> io::Result<()>) {
    if let Err(e) = f(path) {
        warn!("layout: cannot restrict permissions on {}: {}", path.display(), e);
    }
}

/// Удалить осиротевшие tmp-файлы в `dir` (крэш между записью tmp и rename),
/// чьё целевое имя принимает `is_target`. Сами целевые файлы не трогаются.
/// Вызывать под exclusive-локом соответствующего ресурса, иначе можно
/// удалить tmp живого писателя.
pub fn sweep_stale_temp_files(dir: &Path, is_target: impl Fn(&str) -> bool) -> io::Result<usize> {
    let mut removed = 0usize;
    for e in fs::read_dir(dir)? {
        let e = e?;
        let name = e.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(target) = tmp_target_name(name) else { continue };
        if !is_target(target) || !e.file_type()?.is_file() {
            continue;
        }
        match fs::remove_file(e.path()) {
            Ok(()) => {
                removed += 1;
                debug!("layout: removed stale temp {}", e.path().display());
            }
            Err(err) => warn!("layout: cannot remove stale temp {}: {}", e.path().display(), err),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::tmp_path_for;

    fn scratch(tag: &str) -> PathBuf {
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("ps-layout-{tag}-{}-{t}", std::process::id()))
    }

    #[test]
    fn layout_paths_hang_off_base() {
        let l = DataLayout::new("/base");
        assert_eq!(l.document_path(), PathBuf::from("/base/data/user_profile.json"));
        assert_eq!(l.subdirs().len(), 4);
        assert!(!l.is_complete());
    }

    #[test]
    fn existing_document_is_never_replaced() -> Result<()> {
        let base = scratch("keep");
        let data = base.join(DATA_DIR);
        fs::create_dir_all(&data).map_err(|e| StoreError::io("mkdir", &data, e))?;
        let doc_path = data.join(DOCUMENT_FILE);
        let saved = br#"{"version":"1.0","last_updated":"2025-11-29T10:00:00Z","summary":"real"}"#;
        fs::write(&doc_path, saved).map_err(|e| StoreError::io("write", &doc_path, e))?;

        let report = ensure_layout(&base, false)?;
        assert!(!report.created_document);
        assert_eq!(fs::read(&doc_path).ok().as_deref(), Some(&saved[..]));

        // Опоздавший "первый запуск" проигрывает гонку и ничего не трогает
        assert!(!write_file_if_absent(&doc_path, b"{}")?);
        assert_eq!(fs::read(&doc_path).ok().as_deref(), Some(&saved[..]));
        let leftovers = fs::read_dir(&data)
            .map_err(|e| StoreError::io("read_dir", &data, e))?
            .filter_map(|e| e.ok())
            .filter(|e| tmp_target_name(&e.file_name().to_string_lossy()).is_some())
            .count();
        assert_eq!(leftovers, 0);
        let _ = fs::remove_dir_all(&base);
        Ok(())
    }

    #[test]
    fn sweep_only_removes_matching_temps() -> io::Result<()> {
        let dir = scratch("sweep");
        fs::create_dir_all(&dir)?;
        let doc = dir.join(DOCUMENT_FILE);
        fs::write(&doc, b"{}")?;
        let stale = tmp_path_for(&doc);
        fs::write(&stale, b"partial")?;
        let foreign = tmp_path_for(&dir.join("other.json"));
        fs::write(&foreign, b"x")?;

        let n = sweep_stale_temp_files(&dir, |t| t == DOCUMENT_FILE)?;
        assert_eq!(n, 1);
        assert!(!stale.exists());
        assert!(foreign.exists());
        assert!(doc.exists());
        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }
}
