//! ProfileStore — загрузка/сохранение документа профиля поверх layout, локов и бэкапов.
//!
//! save():
//!   1) сериализация (last_updated = max(now, прежний), ключи отсортированы);
//!   2) проверка свободного места — до любого разрушающего шага;
//!   3) auto-бэкап (best-effort: ошибка -> warn, save продолжается);
//!   4) exclusive-лок документа;
//!   5) tmp в том же каталоге + fsync;
//!   6) атомарный rename поверх документа (+ fsync каталога);
//!   7) права 0600; снятие лока.
//!
//! Читатель никогда не видит частично записанный документ: до шага 6 на месте
//! старый файл целиком, после — новый целиком.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, info, warn};

use crate::backup::{restore_user_files, BackupCategory, BackupEntry, BackupManager, VerifyReport};
use crate::config::StoreConfig;
use crate::consts::DOCUMENT_FILE;
use crate::document::ProfileDocument;
use crate::error::{Result, StoreError};
use crate::layout::{ensure_layout, sweep_stale_temp_files, DataLayout, LayoutReport};
use crate::lock::{platform_strategy, LockManager, LockMode, LockStrategy};
use crate::metrics::{record_load, record_restore, record_save, record_save_failure};
use crate::util::{
    ensure_space, replace_atomic, restrict_file_to_owner, write_temp_durable, FsSpaceProbe,
    SpaceProbe,
};

/// Точки искусственного сбоя в save (имитация падения процесса в тестах).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// tmp записан и сброшен на диск, rename не выполнен.
    AfterTempWrite,
    /// rename выполнен, права и снятие лока — нет.
    AfterRename,
}

/// Сборщик ProfileStore: конфиг + подменяемые зависимости.
#[derive(Debug, Clone)]
pub struct StoreBuilder {
    cfg: StoreConfig,
    lock_strategy: Option<Arc<dyn LockStrategy>>,
    space_probe: Option<Arc<dyn SpaceProbe>>,
    fail_point: Option<FailPoint>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        // Старт от env; программные переопределения — поверх.
        Self::with_config(StoreConfig::from_env())
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(cfg: StoreConfig) -> Self {
        Self {
            cfg,
            lock_strategy: None,
            space_probe: None,
            fail_point: None,
        }
    }

    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cfg.base_dir = Some(dir.into());
        self
    }

    pub fn lock_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.cfg.lock_timeout = timeout;
        self
    }

    pub fn auto_backup(mut self, on: bool) -> Self {
        self.cfg.auto_backup = on;
        self
    }

    pub fn auto_backup_keep(mut self, keep: usize) -> Self {
        self.cfg.auto_backup_keep = keep.max(1);
        self
    }

    pub fn lock_strategy(mut self, strategy: Arc<dyn LockStrategy>) -> Self {
        self.lock_strategy = Some(strategy);
        self
    }

    pub fn space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space_probe = Some(probe);
        self
    }

    pub fn fail_point(mut self, point: FailPoint) -> Self {
        self.fail_point = Some(point);
        self
    }

    /// Резолвит base-каталог (один раз) и собирает store. На диск ничего не пишет.
    pub fn build(self) -> Result<ProfileStore> {
        let base = self.cfg.resolve_base_dir()?;
        let layout = DataLayout::new(base);
        let locks = LockManager::new(
            self.lock_strategy.unwrap_or_else(platform_strategy),
            self.cfg.lock_timeout,
        );
        let backups = BackupManager::new(layout.clone(), locks.clone(), self.cfg.auto_backup_keep);
        debug!(
            "store: base={}, locks={}, cfg={}",
            layout.base_dir().display(),
            locks.strategy_name(),
            self.cfg
        );
        Ok(ProfileStore {
            cfg: self.cfg,
            layout,
            locks,
            backups,
            space: self.space_probe.unwrap_or_else(|| Arc::new(FsSpaceProbe)),
            fail_point: self.fail_point,
        })
    }
}

/// Хранилище одного документа профиля.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    cfg: StoreConfig,
    layout: DataLayout,
    locks: LockManager,
    backups: BackupManager,
    space: Arc<dyn SpaceProbe>,
    fail_point: Option<FailPoint>,
}

impl ProfileStore {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    pub fn open(cfg: StoreConfig) -> Result<Self> {
        StoreBuilder::with_config(cfg).build()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    pub fn paths(&self) -> &DataLayout {
        &self.layout
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// ensure_layout + уборка осиротевших tmp-файлов. Идемпотентно.
    pub fn initialize(&self) -> Result<LayoutReport> {
        let mut report = ensure_layout(self.layout.base_dir(), self.cfg.harden_permissions)?;

        let doc_path = self.layout.document_path();
        let data_dir = self.layout.data_dir();
        {
            let _g = self.locks.lock_target(&doc_path, LockMode::Exclusive)?;
            report.removed_temp_files += sweep_stale_temp_files(&data_dir, |t| t == DOCUMENT_FILE)
                .map_err(|e| StoreError::io("sweep temp files", &data_dir, e))?;
        }

        report.removed_temp_files += self.backups.sweep_stale_temp_files()?;

        if report.removed_temp_files > 0 {
            info!(
                "store: removed {} stale temp file(s) under {}",
                report.removed_temp_files,
                self.layout.base_dir().display()
            );
        }
        Ok(report)
    }

    /// Документ на диске существует.
    pub fn exists(&self) -> bool {
        self.layout.document_path().is_file()
    }

    /// Прочитать и провалидировать документ под shared-локом.
    pub fn load(&self) -> Result<ProfileDocument> {
        let t0 = Instant::now();
        let path = self.layout.document_path();
        if !path.exists() {
            return Err(StoreError::NotInitialized { path });
        }

        let bytes = {
            let g = self
                .locks
                .lock_target(&path, LockMode::Shared)
                .map_err(|e| e.into_concurrent("load"))?;
            let read = fs::read(&path);
            g.release()?;
            match read {
                Ok(b) => b,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(StoreError::NotInitialized { path })
                }
                Err(e) => return Err(StoreError::io("read document", path, e)),
            }
        };

        let doc = match ProfileDocument::from_slice(&bytes) {
            Ok(d) => d,
            Err(reason) => {
                let (backups, backups_error) = match self.backups.list_backups(None) {
                    Ok(list) => (list, None),
                    Err(e) => {
                        warn!("load: cannot list backups for recovery: {}", e);
                        (Vec::new(), Some(e.to_string()))
                    }
                };
                warn!(
                    "load: {} is corrupt ({}), {} backup(s) listed",
                    path.display(),
                    reason,
                    backups.len()
                );
                return Err(StoreError::CorruptData {
                    path,
                    reason,
                    backups,
                    backups_error,
                });
            }
        };

        record_load();
        debug!("load: {} bytes in {:?}", bytes.len(), t0.elapsed());
        Ok(doc)
    }

    /// Атомарно сохранить документ. При успехе `doc.last_updated` обновляется
    /// до записанного значения; при ошибке документ вызывающего не меняется.
    pub fn save(&self, doc: &mut ProfileDocument) -> Result<()> {
        let t0 = Instant::now();
        match self.save_inner(doc) {
            Ok(bytes) => {
                record_save(bytes);
                info!("save: done bytes={}, elapsed={:?}", bytes, t0.elapsed());
                Ok(())
            }
            Err(e) => {
                record_save_failure();
                Err(e)
            }
        }
    }

    fn save_inner(&self, doc: &mut ProfileDocument) -> Result<usize> {
        let data_dir = self.layout.data_dir();
        if !data_dir.is_dir() {
            return Err(StoreError::NotInitialized { path: data_dir });
        }
        let path = self.layout.document_path();
        doc.validate()?;

        // last_updated не убывает, даже если часы ушли назад.
        let mut next = doc.clone();
        next.last_updated = Utc::now().max(doc.last_updated);
        let bytes = next.to_bytes()?;

        ensure_space(
            self.space.as_ref(),
            &data_dir,
            bytes.len() as u64 + self.cfg.space_reserve_bytes,
        )?;

        if self.cfg.auto_backup {
            if let Err(e) = self.backups.auto_backup() {
                warn!("save: auto backup failed, continuing: {}", e);
            }
        }

        let guard = self
            .locks
            .lock_target(&path, LockMode::Exclusive)
            .map_err(|e| e.into_concurrent("save"))?;

        let tmp = write_temp_durable(&path, &bytes)?;
        if self.fail_point == Some(FailPoint::AfterTempWrite) {
            return Err(StoreError::InjectedFault {
                point: FailPoint::AfterTempWrite,
            });
        }

        replace_atomic(&tmp, &path)?;
        if self.fail_point == Some(FailPoint::AfterRename) {
            return Err(StoreError::InjectedFault {
                point: FailPoint::AfterRename,
            });
        }

        if self.cfg.harden_permissions {
            if let Err(e) = restrict_file_to_owner(&path) {
                warn!("save: cannot restrict permissions on {}: {}", path.display(), e);
            }
        }
        guard.release()?;

        doc.last_updated = next.last_updated;
        Ok(bytes.len())
    }

    /// Удалить документ (перед этим — auto-бэкап). false — документа не было.
    pub fn delete(&self) -> Result<bool> {
        let path = self.layout.document_path();
        if !path.exists() {
            return Ok(false);
        }
        if self.cfg.auto_backup {
            if let Err(e) = self.backups.auto_backup() {
                warn!("delete: auto backup failed, continuing: {}", e);
            }
        }
        let _g = self
            .locks
            .lock_target(&path, LockMode::Exclusive)
            .map_err(|e| e.into_concurrent("delete"))?;
        match fs::remove_file(&path) {
            Ok(()) => {
                let _ = crate::util::fsync_parent_dir(&path);
                info!("delete: removed {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io("delete document", path, e)),
        }
    }

    pub fn auto_backup(&self) -> Result<Option<BackupEntry>> {
        self.backups.auto_backup()
    }

    pub fn manual_backup(&self, name: &str) -> Result<BackupEntry> {
        self.backups.manual_backup(name)
    }

    pub fn list_backups(&self, category: Option<BackupCategory>) -> Result<Vec<BackupEntry>> {
        self.backups.list_backups(category)
    }

    pub fn verify_backup(&self, name: &str) -> Result<VerifyReport> {
        self.backups.verify_backup(name)
    }

    /// Восстановить состояние из бэкапа: проверка архива, затем обычный save
    /// (текущее состояние попадает в auto-бэкап), затем файлы из `files/`
    /// для manual-архивов. Возвращает сохранённый документ.
    pub fn restore_backup(&self, name: &str) -> Result<ProfileDocument> {
        let entry = self.backups.find(name)?;
        let restored = self.backups.read_archive(&entry)?;

        let mut doc = restored.document;
        self.save(&mut doc)?;

        let restored_files = restore_user_files(&self.layout, &restored.files)?;

        record_restore();
        info!(
            "restore: {} ({}) -> document + {} file(s)",
            entry.archive, entry.category, restored_files
        );
        Ok(doc)
    }
}
