//! Lightweight global metrics for the profile store.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - load / save
//! - auto / manual backups, restore
//! - locking (ожидания и таймауты)

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Store -----
static LOADS_TOTAL: AtomicU64 = AtomicU64::new(0);
static SAVES_TOTAL: AtomicU64 = AtomicU64::new(0);
static SAVE_FAILURES: AtomicU64 = AtomicU64::new(0);
static BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);

// ----- Backups -----
static AUTO_BACKUPS_CREATED: AtomicU64 = AtomicU64::new(0);
static AUTO_BACKUPS_PRUNED: AtomicU64 = AtomicU64::new(0);
static AUTO_BACKUP_FAILURES: AtomicU64 = AtomicU64::new(0);
static MANUAL_BACKUPS_CREATED: AtomicU64 = AtomicU64::new(0);
static MANUAL_BACKUP_BYTES: AtomicU64 = AtomicU64::new(0);
static RESTORES_TOTAL: AtomicU64 = AtomicU64::new(0);

// ----- Locks -----
static LOCK_WAITS: AtomicU64 = AtomicU64::new(0);
static LOCK_TIMEOUTS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    // Store
    pub loads_total: u64,
    pub saves_total: u64,
    pub save_failures: u64,
    pub bytes_written: u64,

    // Backups
    pub auto_backups_created: u64,
    pub auto_backups_pruned: u64,
    pub auto_backup_failures: u64,
    pub manual_backups_created: u64,
    pub manual_backup_bytes: u64,
    pub restores_total: u64,

    // Locks
    pub lock_waits: u64,
    pub lock_timeouts: u64,
}

impl MetricsSnapshot {
    pub fn save_failure_ratio(&self) -> f64 {
        let total = self.saves_total + self.save_failures;
        if total == 0 {
            0.0
        } else {
            self.save_failures as f64 / total as f64
        }
    }
}

// ----- Recorders (Store) -----
pub fn record_load() {
    LOADS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn record_save(bytes: usize) {
    SAVES_TOTAL.fetch_add(1, Ordering::Relaxed);
    BYTES_WRITTEN.fetch_add(bytes as u64, Ordering::Relaxed);
}

pub fn record_save_failure() {
    SAVE_FAILURES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Backups) -----
pub fn record_auto_backup() {
    AUTO_BACKUPS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_auto_backup_pruned(n: usize) {
    AUTO_BACKUPS_PRUNED.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_auto_backup_failure() {
    AUTO_BACKUP_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_manual_backup(bytes: u64) {
    MANUAL_BACKUPS_CREATED.fetch_add(1, Ordering::Relaxed);
    MANUAL_BACKUP_BYTES.fetch_add(bytes, Ordering::Relaxed);
}

pub fn record_restore() {
    RESTORES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Locks) -----
pub fn record_lock_wait() {
    LOCK_WAITS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_lock_timeout() {
    LOCK_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        loads_total: LOADS_TOTAL.load(Ordering::Relaxed),
        saves_total: SAVES_TOTAL.load(Ordering::Relaxed),
        save_failures: SAVE_FAILURES.load(Ordering::Relaxed),
        bytes_written: BYTES_WRITTEN.load(Ordering::Relaxed),

        auto_backups_created: AUTO_BACKUPS_CREATED.load(Ordering::Relaxed),
        auto_backups_pruned: AUTO_BACKUPS_PRUNED.load(Ordering::Relaxed),
        auto_backup_failures: AUTO_BACKUP_FAILURES.load(Ordering::Relaxed),
        manual_backups_created: MANUAL_BACKUPS_CREATED.load(Ordering::Relaxed),
        manual_backup_bytes: MANUAL_BACKUP_BYTES.load(Ordering::Relaxed),
        restores_total: RESTORES_TOTAL.load(Ordering::Relaxed),

        lock_waits: LOCK_WAITS.load(Ordering::Relaxed),
        lock_timeouts: LOCK_TIMEOUTS.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    LOADS_TOTAL.store(0, Ordering::Relaxed);
    SAVES_TOTAL.store(0, Ordering::Relaxed);
    SAVE_FAILURES.store(0, Ordering::Relaxed);
    BYTES_WRITTEN.store(0, Ordering::Relaxed);

    AUTO_BACKUPS_CREATED.store(0, Ordering::Relaxed);
    AUTO_BACKUPS_PRUNED.store(0, Ordering::Relaxed);
    AUTO_BACKUP_FAILURES.store(0, Ordering::Relaxed);
    MANUAL_BACKUPS_CREATED.store(0, Ordering::Relaxed);
    MANUAL_BACKUP_BYTES.store(0, Ordering::Relaxed);
    RESTORES_TOTAL.store(0, Ordering::Relaxed);

    LOCK_WAITS.store(0, Ordering::Relaxed);
    LOCK_TIMEOUTS.store(0, Ordering::Relaxed);
}
