//! backup/manual — полный архив каталога данных по запросу.
//!
//! Содержимое zip:
//! - все файлы <base>/ кроме backups/, lock-файлов и tmp-файлов, пути через '/';
//! - manifest.json: { format, name, created_at, document_version, total_size_bytes,
//!   files: [{ path, size_bytes, checksum }] }, checksum = SHA-256 (hex).
//!
//! Документ берётся одним снимком под shared-локом; остальные файлы читаются
//! без лока документа, чтобы не блокировать save на время архивации.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::consts::{
    BACKUPS_DIR, DOCUMENT_FILE, IO_CHUNK, LOCK_EXT, MANIFEST_ENTRY, MANIFEST_FORMAT_VERSION,
    TMP_EXT,
};
use crate::document::ProfileDocument;
use crate::error::{Result, StoreError};
use crate::lock::LockMode;
use crate::metrics::record_manual_backup;
use crate::util::{replace_atomic, sha256_hex, tmp_path_for};

use super::index::BackupIndex;
use super::{
    manual_archive_name, truncate_to_micros, validate_label, BackupCategory, BackupEntry,
    BackupManager,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Путь относительно каталога данных, разделитель '/'.
    pub path: String,
    pub size_bytes: u64,
    /// SHA-256, hex.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format: u32,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Версия документа на момент бэкапа (None — документа нет или он не парсится).
    pub document_version: Option<String>,
    pub total_size_bytes: u64,
    pub files: Vec<ManifestFile>,
}

impl BackupManifest {
    pub fn file(&self, path: &str) -> Option<&ManifestFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Путь документа внутри архива.
pub(crate) fn document_entry_path() -> String {
    format!("{}/{}", crate::consts::DATA_DIR, DOCUMENT_FILE)
}

impl BackupManager {
    /// Полный архив каталога данных в `manual_<ts>_<name>.zip`.
    pub fn manual_backup(&self, name: &str) -> Result<BackupEntry> {
        let dir = self.backups_dir();
        let label = validate_label(name).map_err(|reason| StoreError::InvalidBackupName {
            name: name.to_string(),
            reason,
        })?;
        if !dir.is_dir() {
            return Err(StoreError::NotInitialized { path: dir });
        }

        let t0 = Instant::now();
        let created_at = truncate_to_micros(Utc::now());
        let archive = manual_archive_name(created_at, &label);
        let path = dir.join(&archive);

        info!("manual_backup: start name={}, out={}", label, path.display());

        let doc_bytes = self.snapshot_document()?;
        let document_version = doc_bytes
            .as_deref()
            .and_then(|b| ProfileDocument::from_slice(b).ok())
            .map(|d| d.version);

        let base = self.layout().base_dir().to_path_buf();
        let mut files = Vec::new();
        collect_files(&base, &base, &mut files)
            .map_err(|e| StoreError::backup("scan data directory", &base, e))?;
        let doc_rel = document_entry_path();
        files.retain(|(rel, _)| *rel != doc_rel);

        let tmp = tmp_path_for(&path);
        let manifest = match write_archive(
            &tmp,
            &label,
            created_at,
            document_version,
            doc_bytes.as_deref(),
            &files,
        ) {
            Ok(m) => m,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(StoreError::backup("write archive", &path, e));
            }
        };
        replace_atomic(&tmp, &path)?;

        let size_bytes = fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| StoreError::backup("stat archive", &path, e))?;
        let entry = BackupEntry {
            category: BackupCategory::Manual,
            name: label,
            created_at,
            archive,
            size_bytes,
            manifest: Some(manifest),
            path,
        };

        {
            let _blk = self.lock_backups(LockMode::Exclusive)?;
            let mut index = BackupIndex::load(&dir)?;
            index.reconcile(&dir)?;
            index.upsert(entry.clone());
            index.store(&dir)?;
        }

        record_manual_backup(size_bytes);
        info!(
            "manual_backup: done archive={}, files={}, bytes={}, elapsed={:?}",
            entry.archive,
            entry.manifest.as_ref().map_or(0, |m| m.files.len()),
            size_bytes,
            t0.elapsed()
        );
        Ok(entry)
    }

    /// Байты документа под shared-локом. None — документа нет.
    fn snapshot_document(&self) -> Result<Option<Vec<u8>>> {
        let doc_path = self.layout().document_path();
        if !doc_path.exists() {
            return Ok(None);
        }
        let _g = self.locks.lock_target(&doc_path, LockMode::Shared)?;
        match fs::read(&doc_path) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::backup("read document", doc_path, e)),
        }
    }
}

fn zip_err(e: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn write_archive(
    tmp: &Path,
    label: &str,
    created_at: DateTime<Utc>,
    document_version: Option<String>,
    doc_bytes: Option<&[u8]>,
    files: &[(String, PathBuf)],
) -> io::Result<BackupManifest> {
    let f = OpenOptions::new().write(true).create_new(true).open(tmp)?;
    let mut zip = ZipWriter::new(f);
    let opts = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut manifest_files = Vec::with_capacity(files.len() + 1);

    if let Some(bytes) = doc_bytes {
        let rel = document_entry_path();
        zip.start_file(rel.as_str(), opts).map_err(zip_err)?;
        zip.write_all(bytes)?;
        manifest_files.push(ManifestFile {
            path: rel,
            size_bytes: bytes.len() as u64,
            checksum: sha256_hex(bytes),
        });
    }

    let mut buf = vec![0u8; IO_CHUNK];
    for (rel, abs) in files {
        let mut src = match File::open(abs) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // удалён между сканированием и чтением
                warn!("manual_backup: {} vanished, skipped", abs.display());
                continue;
            }
            Err(e) => return Err(e),
        };
        zip.start_file(rel.as_str(), opts).map_err(zip_err)?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            zip.write_all(&buf[..n])?;
            size += n as u64;
        }
        debug!("manual_backup: + {} ({} bytes)", rel, size);
        manifest_files.push(ManifestFile {
            path: rel.clone(),
            size_bytes: size,
            checksum: format!("{:x}", hasher.finalize()),
        });
    }

    let manifest = BackupManifest {
        format: MANIFEST_FORMAT_VERSION,
        name: label.to_string(),
        created_at,
        document_version,
        total_size_bytes: manifest_files.iter().map(|f| f.size_bytes).sum(),
        files: manifest_files,
    };
    let json = serde_json::to_vec_pretty(&manifest)?;
    zip.start_file(MANIFEST_ENTRY, opts).map_err(zip_err)?;
    zip.write_all(&json)?;

    let f = zip.finish().map_err(zip_err)?;
    f.sync_all()?;
    Ok(manifest)
}

/// Рекурсивный обход каталога данных: (относительный путь через '/', абсолютный путь).
/// Пропускаются backups/ (только на верхнем уровне), симлинки, `*.lock` и tmp-файлы.
fn collect_files(base: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for e in entries {
        let path = e.path();
        let ft = e.file_type()?;
        let name = e.file_name();
        let name = name.to_string_lossy();

        if ft.is_symlink() {
            continue;
        }
        if ft.is_dir() {
            if dir == base && name == BACKUPS_DIR {
                continue;
            }
            collect_files(base, &path, out)?;
            continue;
        }
        if !ft.is_file() || is_transient(&name) {
            continue;
        }
        let rel = path
            .strip_prefix(base)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        out.push((rel, path));
    }
    Ok(())
}

fn is_transient(name: &str) -> bool {
    name.ends_with(&format!(".{LOCK_EXT}"))
        || (name.starts_with('.') && name.ends_with(&format!(".{TMP_EXT}")))
}
