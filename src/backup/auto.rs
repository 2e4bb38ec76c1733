//! backup/auto — лёгкий снимок документа перед save.
//!
//! Горячий путь save: только gzip одного файла + обновление индекса.
//! Ошибки отсюда на save-пути понижаются до warn (см. store.rs).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::lock::LockMode;
use crate::metrics::{record_auto_backup, record_auto_backup_failure, record_auto_backup_pruned};
use crate::util::{replace_atomic, tmp_path_for};

use super::index::{archive_stem, BackupIndex};
use super::{auto_archive_name, truncate_to_micros, BackupCategory, BackupEntry, BackupManager};

impl BackupManager {
    /// Снимок текущего документа в `auto_<ts>.json.gz` + FIFO-ротация.
    ///
    /// Ok(None) — документа ещё нет, снимать нечего.
    /// Любая ошибка возвращается как `StoreError::BackupFailure`.
    pub fn auto_backup(&self) -> Result<Option<BackupEntry>> {
        let t0 = Instant::now();
        match self.auto_backup_inner() {
            Ok(Some(entry)) => {
                record_auto_backup();
                debug!(
                    "auto_backup: {} ({} bytes) in {:?}",
                    entry.archive,
                    entry.size_bytes,
                    t0.elapsed()
                );
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                record_auto_backup_failure();
                Err(match e {
                    e @ StoreError::BackupFailure { .. } => e,
                    other => StoreError::backup("auto", self.backups_dir(), other),
                })
            }
        }
    }

    fn auto_backup_inner(&self) -> Result<Option<BackupEntry>> {
        let doc_path = self.layout().document_path();
        if !doc_path.exists() {
            return Ok(None);
        }
        let dir = self.backups_dir();
        let _blk = self.lock_backups(LockMode::Exclusive)?;

        // Читаем документ под shared-локом, чтобы не поймать середину чужого save.
        let bytes = {
            let _g = self.locks.lock_target(&doc_path, LockMode::Shared)?;
            match fs::read(&doc_path) {
                Ok(b) => b,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(StoreError::backup("read document", doc_path, e)),
            }
        };

        let mut index = BackupIndex::load(&dir)?;
        index.reconcile(&dir)?;

        // Время создания строго больше предыдущего auto: порядок FIFO не
        // зависит от разрешения часов и их скачков назад.
        let created_at = next_created_at(Utc::now(), index.latest_auto().map(|e| e.created_at));
        let (archive, created_at) = free_archive_name(&dir, created_at);
        let path = dir.join(&archive);

        write_gz_atomic(&path, &bytes)?;
        let size_bytes = fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| StoreError::backup("stat archive", &path, e))?;

        let entry = BackupEntry {
            category: BackupCategory::Auto,
            name: archive_stem(&archive),
            created_at,
            archive,
            size_bytes,
            manifest: None,
            path,
        };
        index.upsert(entry.clone());

        let evicted = index.prune_auto(self.keep);
        let mut pruned = 0usize;
        for old in evicted {
            match fs::remove_file(&old.path) {
                Ok(()) => pruned += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => pruned += 1,
                Err(e) => {
                    // Файл остался — оставляем и запись, следующий прогон повторит.
                    warn!("auto_backup: cannot remove {}: {}", old.path.display(), e);
                    index.upsert(old);
                }
            }
        }
        if pruned > 0 {
            record_auto_backup_pruned(pruned);
            info!("auto_backup: pruned {} old snapshot(s), keep={}", pruned, self.keep);
        }

        index.store(&dir)?;
        Ok(Some(entry))
    }
}

fn next_created_at(now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    // Имена архивов имеют микросекундную точность.
    let now = truncate_to_micros(now);
    match last {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    }
}

/// Подобрать свободное имя (на случай чужого архива с той же меткой).
fn free_archive_name(dir: &Path, mut ts: DateTime<Utc>) -> (String, DateTime<Utc>) {
    loop {
        let name = auto_archive_name(ts);
        if !dir.join(&name).exists() {
            return (name, ts);
        }
        ts += Duration::microseconds(1);
    }
}

fn write_gz_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path_for(path);
    let res = (|| -> io::Result<()> {
        let f = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        let mut enc = GzEncoder::new(f, Compression::fast());
        enc.write_all(bytes)?;
        let f = enc.finish()?;
        f.sync_all()?;
        Ok(())
    })();
    if let Err(e) = res {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::backup("write archive", path, e));
    }
    replace_atomic(&tmp, path)
}
