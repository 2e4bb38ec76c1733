//! backup/restore — проверка целостности архива и чтение его содержимого.
//!
//! verify:
//! - auto: gunzip + документ парсится и проходит валидацию;
//! - manual: для каждого файла манифеста совпадают размер и SHA-256,
//!   документ парсится; лишние записи в архиве — предупреждение.
//!
//! Запись восстановленного состояния на диск — в ProfileStore::restore_backup,
//! чтобы она шла обычным путём save (auto-бэкап, лок, атомарная замена).

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path};

use log::{debug, warn};
use serde::Serialize;
use zip::ZipArchive;

use crate::consts::{FILES_DIR, IO_CHUNK, MANIFEST_ENTRY};
use crate::document::ProfileDocument;
use crate::error::{Result, StoreError};
use crate::layout::DataLayout;
use crate::util::{sha256_reader, write_file_atomic};

use super::index::{read_gz, read_zip_manifest};
use super::manual::{document_entry_path, BackupManifest};
use super::{BackupCategory, BackupEntry, BackupManager};

/// Итог проверки архива.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub archive: String,
    pub category: Option<BackupCategory>,
    pub files_checked: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl VerifyReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Проверенное содержимое архива, готовое к записи.
#[derive(Debug, Clone)]
pub struct RestoredArchive {
    pub entry: BackupEntry,
    pub document: ProfileDocument,
    /// Файлы из `files/` (только manual): путь относительно каталога данных, байты.
    pub files: Vec<(String, Vec<u8>)>,
}

impl BackupManager {
    /// Найти бэкап по имени и проверить его.
    pub fn verify_backup(&self, name: &str) -> Result<VerifyReport> {
        let entry = self.find(name)?;
        Ok(self.verify_entry(&entry))
    }

    /// Проверить архив. Проблемы архива попадают в отчёт, а не в Err.
    pub fn verify_entry(&self, entry: &BackupEntry) -> VerifyReport {
        let mut report = VerifyReport {
            archive: entry.archive.clone(),
            category: Some(entry.category),
            ..Default::default()
        };
        let path = self.archive_path(&entry.archive);
        match entry.category {
            BackupCategory::Auto => verify_auto(&path, &mut report),
            BackupCategory::Manual => verify_manual(&path, &mut report),
        }
        debug!(
            "verify: {} files={}, errors={}, warnings={}",
            entry.archive,
            report.files_checked,
            report.errors.len(),
            report.warnings.len()
        );
        report
    }

    /// Проверить и прочитать архив целиком. Невалидный архив — `InvalidBackup`.
    pub fn read_archive(&self, entry: &BackupEntry) -> Result<RestoredArchive> {
        let path = self.archive_path(&entry.archive);
        let report = self.verify_entry(entry);
        if !report.is_valid() {
            return Err(StoreError::InvalidBackup {
                path,
                errors: report.errors,
            });
        }
        for w in &report.warnings {
            warn!("restore: {}: {}", entry.archive, w);
        }

        let invalid = |msg: String| StoreError::InvalidBackup {
            path: path.clone(),
            errors: vec![msg],
        };

        match entry.category {
            BackupCategory::Auto => {
                let bytes = read_gz(&path).map_err(|e| invalid(e.to_string()))?;
                let document = ProfileDocument::from_slice(&bytes).map_err(invalid)?;
                Ok(RestoredArchive {
                    entry: entry.clone(),
                    document,
                    files: Vec::new(),
                })
            }
            BackupCategory::Manual => {
                let f = File::open(&path).map_err(|e| StoreError::io("open archive", &path, e))?;
                let mut zip = ZipArchive::new(f).map_err(|e| invalid(e.to_string()))?;
                let doc_rel = document_entry_path();
                let mut document = None;
                let mut files = Vec::new();
                for i in 0..zip.len() {
                    let mut zf = zip.by_index(i).map_err(|e| invalid(e.to_string()))?;
                    if zf.is_dir() {
                        continue;
                    }
                    let name = zf.name().to_string();
                    let wanted = name == doc_rel || is_files_entry(&name);
                    if !wanted {
                        continue;
                    }
                    // Пути вида "../x" или абсолютные не восстанавливаются.
                    if zf.enclosed_name().is_none() {
                        return Err(invalid(format!("unsafe entry path '{name}'")));
                    }
                    // Размер из заголовка не доверенный: ёмкость ограничена.
                    let hint = zf.size().min(IO_CHUNK as u64) as usize;
                    let mut buf = Vec::with_capacity(hint);
                    zf.read_to_end(&mut buf)
                        .map_err(|e| invalid(format!("{name}: {e}")))?;
                    if name == doc_rel {
                        document = Some(ProfileDocument::from_slice(&buf).map_err(invalid)?);
                    } else {
                        files.push((name, buf));
                    }
                }
                let document = document
                    .ok_or_else(|| invalid(format!("archive has no {doc_rel}")))?;
                Ok(RestoredArchive {
                    entry: entry.clone(),
                    document,
                    files,
                })
            }
        }
    }
}

/// Записать файлы `files/...` из архива в каталог данных, каждый атомарно.
/// Файлы, которых нет в архиве, не удаляются. Возвращает число записанных файлов.
pub(crate) fn restore_user_files(layout: &DataLayout, files: &[(String, Vec<u8>)]) -> Result<usize> {
    let mut written = 0usize;
    for (rel, bytes) in files {
        if !is_files_entry(rel) {
            warn!("restore: skipping entry outside {FILES_DIR}/: {rel}");
            continue;
        }
        let target = rel
            .split('/')
            .fold(layout.base_dir().to_path_buf(), |p, c| p.join(c));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::fs("create directory", parent, e))?;
        }
        write_file_atomic(&target, bytes)?;
        written += 1;
    }
    Ok(written)
}

/// Запись лежит внутри `files/` и не выходит за его пределы.
pub(crate) fn is_files_entry(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(FILES_DIR).and_then(|r| r.strip_prefix('/')) else {
        return false;
    };
    !rest.is_empty()
        && Path::new(rest)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn verify_auto(path: &Path, report: &mut VerifyReport) {
    let bytes = match read_gz(path) {
        Ok(b) => b,
        Err(e) => {
            report.errors.push(format!("cannot decompress: {e}"));
            return;
        }
    };
    report.files_checked = 1;
    if let Err(e) = ProfileDocument::from_slice(&bytes) {
        report.errors.push(format!("document: {e}"));
    }
}

fn verify_manual(path: &Path, report: &mut VerifyReport) {
    let f = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            report.errors.push(format!("cannot open: {e}"));
            return;
        }
    };
    let mut zip = match ZipArchive::new(f) {
        Ok(z) => z,
        Err(e) => {
            report.errors.push(format!("not a zip archive: {e}"));
            return;
        }
    };

    let manifest: Option<BackupManifest> = match read_zip_manifest(path) {
        Ok(m) => Some(m),
        Err(e) => {
            report
                .warnings
                .push(format!("{MANIFEST_ENTRY} missing or unreadable ({e}); checksums not verified"));
            None
        }
    };

    let doc_rel = document_entry_path();
    match zip.by_name(&doc_rel) {
        Ok(mut zf) => {
            let mut buf = Vec::new();
            match zf.read_to_end(&mut buf) {
                Ok(_) => {
                    if let Err(e) = ProfileDocument::from_slice(&buf) {
                        report.errors.push(format!("{doc_rel}: {e}"));
                    }
                }
                Err(e) => report.errors.push(format!("{doc_rel}: {e}")),
            }
        }
        Err(_) => report.errors.push(format!("archive has no {doc_rel}")),
    }

    let Some(manifest) = manifest else {
        return;
    };

    let mut listed: HashSet<&str> = HashSet::new();
    for mf in &manifest.files {
        listed.insert(mf.path.as_str());
        let mut zf = match zip.by_name(&mf.path) {
            Ok(zf) => zf,
            Err(_) => {
                report.errors.push(format!("{}: listed in manifest but missing", mf.path));
                continue;
            }
        };
        match sha256_reader(&mut zf) {
            Ok((sum, size)) => {
                report.files_checked += 1;
                if size != mf.size_bytes {
                    report.errors.push(format!(
                        "{}: size mismatch (manifest {}, archive {})",
                        mf.path, mf.size_bytes, size
                    ));
                }
                if !sum.eq_ignore_ascii_case(&mf.checksum) {
                    report.errors.push(format!("{}: checksum mismatch", mf.path));
                }
            }
            Err(e) => report.errors.push(format!("{}: {}", mf.path, e)),
        }
    }

    let extra: Vec<String> = zip
        .file_names()
        .filter(|n| *n != MANIFEST_ENTRY && !n.ends_with('/') && !listed.contains(n))
        .map(str::to_string)
        .collect();
    for n in extra {
        report.warnings.push(format!("{n}: not listed in manifest"));
    }
}
