//! Advisory file locks with bounded wait.
//!
//! Cross-platform (fs2) advisory locks:
//! - Shared: несколько читателей одновременно, несовместим с Exclusive.
//! - Exclusive: единственный владелец, блокирует всех остальных.
//!
//! Лок берётся не на сам документ, а на sidecar-файл `<path>.lock`:
//! документ заменяется rename'ом, и лок на старом inode ничего бы не защищал.
//! Lock is released on Drop (и на ошибке, и на панике).
//!
//! Примитив выбирается один раз (`platform_strategy()`) и скрыт за трейтом
//! `LockStrategy`, так что вызывающий код не знает о платформе.
//! Семантика advisory: это договорённость между кооперирующимися процессами,
//! а не граница безопасности.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use log::{debug, warn};

use crate::consts::{LOCK_BACKOFF_INITIAL, LOCK_BACKOFF_MAX, LOCK_EXT};
use crate::error::{Result, StoreError};
use crate::metrics::{record_lock_timeout, record_lock_wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// Платформенный примитив блокировки.
///
/// `try_lock` никогда не ждёт: Ok(true) — лок взят, Ok(false) — занят другим
/// владельцем, Err — настоящая ошибка I/O.
pub trait LockStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn try_lock(&self, file: &File, mode: LockMode) -> io::Result<bool>;
    fn unlock(&self, file: &File) -> io::Result<()>;
}

// Вызовы через FileExt::… явно: у std::fs::File (Rust 1.89+) есть
// одноимённые inherent-методы с другой сигнатурой.
fn fs2_try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
    let res = match mode {
        LockMode::Shared => FileExt::try_lock_shared(file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
    };
    match res {
        Ok(()) => Ok(true),
        Err(e) if is_contended(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_contended(e: &io::Error) -> bool {
    let contended = fs2::lock_contended_error();
    match (e.raw_os_error(), contended.raw_os_error()) {
        (Some(a), Some(b)) => a == b,
        _ => e.kind() == contended.kind(),
    }
}

/// POSIX `flock(2)`: лок принадлежит open file description, поэтому два
/// независимых open() в одном процессе конфликтуют так же, как два процесса.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixFlock;

#[cfg(unix)]
impl LockStrategy for PosixFlock {
    fn name(&self) -> &'static str {
        "flock"
    }
    fn try_lock(&self, file: &File, mode: LockMode) -> io::Result<bool> {
        fs2_try_lock(file, mode)
    }
    fn unlock(&self, file: &File) -> io::Result<()> {
        FileExt::unlock(file)
    }
}

/// Windows `LockFileEx` на весь sidecar-файл (LOCKFILE_FAIL_IMMEDIATELY).
/// Байтовый диапазон на Windows обязательный (mandatory), поэтому сам документ
/// здесь никогда не лочится.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsLockFile;

#[cfg(windows)]
impl LockStrategy for WindowsLockFile {
    fn name(&self) -> &'static str {
        "LockFileEx"
    }
    fn try_lock(&self, file: &File, mode: LockMode) -> io::Result<bool> {
        fs2_try_lock(file, mode)
    }
    fn unlock(&self, file: &File) -> io::Result<()> {
        FileExt::unlock(file)
    }
}

/// Выбор стратегии по платформе (один раз при сборке store).
pub fn platform_strategy() -> Arc<dyn LockStrategy> {
    #[cfg(unix)]
    {
        Arc::new(PosixFlock)
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsLockFile)
    }
}

/// RAII-гард удерживаемого лока. Снимается в Drop.
pub struct LockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
    strategy: Arc<dyn LockStrategy>,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Явное освобождение с возвратом ошибки unlock (Drop её игнорирует).
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.strategy
            .unlock(&self.file)
            .map_err(|e| StoreError::io("unlock", self.path.clone(), e))
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Ошибки unlock в Drop игнорируются; закрытие дескриптора всё равно снимает лок.
        if let Err(e) = self.strategy.unlock(&self.file) {
            warn!("lock: unlock {} failed on drop: {}", self.path.display(), e);
        }
    }
}

/// Путь sidecar-файла лока для целевого файла: `<path>.lock`.
pub fn lock_file_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(LOCK_EXT);
    target.with_file_name(name)
}

/// Менеджер локов: стратегия + таймаут по умолчанию.
#[derive(Debug, Clone)]
pub struct LockManager {
    strategy: Arc<dyn LockStrategy>,
    default_timeout: Duration,
}

impl LockManager {
    pub fn new(strategy: Arc<dyn LockStrategy>, default_timeout: Duration) -> Self {
        Self {
            strategy,
            default_timeout,
        }
    }

    pub fn with_platform_default(default_timeout: Duration) -> Self {
        Self::new(platform_strategy(), default_timeout)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Лок на целевой файл (через `<target>.lock`) с таймаутом по умолчанию.
    pub fn lock_target(&self, target: &Path, mode: LockMode) -> Result<LockGuard> {
        self.acquire(&lock_file_path(target), mode, self.default_timeout)
    }

    /// Взять лок на файл `lock_path` (создаётся при необходимости).
    ///
    /// Повторяет попытки с экспоненциальным backoff до `timeout`; по истечении —
    /// `StoreError::LockTimeout`, при этом лок не удерживается. `timeout` = 0
    /// означает ровно одну попытку.
    pub fn acquire(&self, lock_path: &Path, mode: LockMode, timeout: Duration) -> Result<LockGuard> {
        let file = open_lock_file(lock_path)?;
        let start = Instant::now();
        let mut backoff = LOCK_BACKOFF_INITIAL;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let got = self
                .strategy
                .try_lock(&file, mode)
                .map_err(|e| StoreError::io("lock", lock_path, e))?;
            if got {
                if attempts > 1 {
                    debug!(
                        "lock: {} {} acquired after {} attempt(s), waited={:?}",
                        mode,
                        lock_path.display(),
                        attempts,
                        start.elapsed()
                    );
                }
                return Ok(LockGuard {
                    file,
                    path: lock_path.to_path_buf(),
                    mode,
                    strategy: Arc::clone(&self.strategy),
                    released: false,
                });
            }

            record_lock_wait();
            let waited = start.elapsed();
            if waited >= timeout {
                record_lock_timeout();
                return Err(StoreError::LockTimeout {
                    path: lock_path.to_path_buf(),
                    mode,
                    waited,
                });
            }
            thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(LOCK_BACKOFF_MAX);
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| StoreError::io("open lock file", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    fn unique_lock_path(prefix: &str) -> PathBuf {
        let t = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "pstest-lock-{prefix}-{}-{t}-{id}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("target.lock")
    }

    fn mgr() -> LockManager {
        LockManager::with_platform_default(Duration::from_millis(200))
    }

    #[test]
    fn shared_locks_coexist() {
        let p = unique_lock_path("shared");
        let m = mgr();
        let a = m.acquire(&p, LockMode::Shared, Duration::ZERO).unwrap();
        let b = m.acquire(&p, LockMode::Shared, Duration::ZERO).unwrap();
        assert_eq!(a.mode(), LockMode::Shared);
        assert_eq!(b.mode(), LockMode::Shared);
    }

    #[test]
    fn exclusive_blocks_shared_until_timeout() {
        let p = unique_lock_path("excl");
        let m = mgr();
        let _w = m.acquire(&p, LockMode::Exclusive, Duration::ZERO).unwrap();

        let t0 = Instant::now();
        let err = m
            .acquire(&p, LockMode::Shared, Duration::from_millis(60))
            .unwrap_err();
        assert!(t0.elapsed() >= Duration::from_millis(60));
        match err {
            StoreError::LockTimeout { mode, .. } => assert_eq!(mode, LockMode::Shared),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn drop_releases_lock() {
        let p = unique_lock_path("drop");
        let m = mgr();
        {
            let _w = m.acquire(&p, LockMode::Exclusive, Duration::ZERO).unwrap();
        }
        let again = m.acquire(&p, LockMode::Exclusive, Duration::ZERO);
        assert!(again.is_ok());
    }

    #[test]
    fn explicit_release_then_reacquire() {
        let p = unique_lock_path("release");
        let m = mgr();
        let g = m.acquire(&p, LockMode::Exclusive, Duration::ZERO).unwrap();
        g.release().unwrap();
        assert!(m.acquire(&p, LockMode::Exclusive, Duration::ZERO).is_ok());
    }

    #[test]
    fn waiter_gets_lock_after_holder_releases() {
        let p = unique_lock_path("handoff");
        let m = mgr();
        let holder = m.acquire(&p, LockMode::Exclusive, Duration::ZERO).unwrap();

        let p2 = p.clone();
        let m2 = m.clone();
        let waiter = thread::spawn(move || {
            m2.acquire(&p2, LockMode::Exclusive, Duration::from_secs(2))
                .map(|g| g.mode())
        });

        thread::sleep(Duration::from_millis(50));
        drop(holder);
        let mode = waiter.join().unwrap().unwrap();
        assert_eq!(mode, LockMode::Exclusive);
    }

    #[test]
    fn lock_file_path_appends_suffix() {
        let p = lock_file_path(Path::new("/a/b/user_profile.json"));
        assert_eq!(p, PathBuf::from("/a/b/user_profile.json.lock"));
    }
}
