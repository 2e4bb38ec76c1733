// tests/store_roundtrip.rs
//
// Покрываем:
// 1) load(save(d)) == d (кроме last_updated, который обновляется в d при save).
// 2) load до инициализации -> NotInitialized.
// 3) Повреждённый документ -> CorruptData со списком всех бэкапов на диске.
// 4) last_updated не убывает между сохранениями; ключи пишутся отсортированными.
// 5) Невалидный документ не пишется: InvalidDocument, файл и бэкапы не меняются.
// 6) Список бэкапов недоступен (лок каталога занят) -> CorruptData говорит об этом.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use profilestore::consts::BACKUPS_LOCK_FILE;
use profilestore::{LockManager, LockMode, ProfileDocument, ProfileStore, StoreConfig, StoreError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("pstest-store-{prefix}-{pid}-{t}-{id}"))
}

fn open_initialized(root: &Path) -> Result<ProfileStore> {
    let store = ProfileStore::open(StoreConfig::at(root))?;
    store.initialize()?;
    Ok(store)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    company: String,
    title: String,
    years: u32,
}

fn archives_on_disk(dir: &Path) -> Result<usize> {
    let mut n = 0;
    for e in fs::read_dir(dir)? {
        let name = e?.file_name().to_string_lossy().into_owned();
        if (name.starts_with("auto_") && name.ends_with(".json.gz"))
            || (name.starts_with("manual_") && name.ends_with(".zip"))
        {
            n += 1;
        }
    }
    Ok(n)
}

#[test]
fn save_then_load_roundtrip() -> Result<()> {
    let root = unique_root("rt");
    let store = open_initialized(&root)?;

    let mut doc = store.load()?;
    let before = doc.last_updated;
    doc.set_field(
        "personal_info",
        json!({ "name": "Alex Doe", "email": "alex@example.com" }),
    )?;
    doc.set_field(
        "work_experience",
        vec![Job {
            company: "Acme".into(),
            title: "Engineer".into(),
            years: 3,
        }],
    )?;
    doc.set_field("skills", vec!["Rust", "PostgreSQL"])?;
    store.save(&mut doc)?;
    assert!(doc.last_updated >= before);

    let loaded = store.load()?;
    assert_eq!(loaded, doc);
    let jobs: Vec<Job> = loaded.field("work_experience")?.unwrap_or_default();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].company, "Acme");

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn load_without_layout_is_not_initialized() -> Result<()> {
    let root = unique_root("noinit");
    let store = ProfileStore::open(StoreConfig::at(&root))?;
    match store.load() {
        Err(StoreError::NotInitialized { path }) => {
            assert_eq!(path, store.paths().document_path());
        }
        other => panic!("expected NotInitialized, got {other:?}"),
    }
    assert!(!store.exists());
    Ok(())
}

#[test]
fn corrupt_document_reports_all_backups() -> Result<()> {
    let root = unique_root("corrupt");
    let store = open_initialized(&root)?;

    let mut doc = store.load()?;
    for i in 0..3 {
        doc.set_field("summary", format!("rev {i}"))?;
        store.save(&mut doc)?;
    }
    store.manual_backup("before-crash")?;

    fs::write(store.paths().document_path(), b"{ \"version\": \"1.0\", trunc")?;

    let on_disk = archives_on_disk(&store.paths().backups_dir())?;
    assert_eq!(on_disk, 4, "3 auto + 1 manual");

    match store.load() {
        Err(e @ StoreError::CorruptData { .. }) => {
            assert_eq!(e.recovery_backups().len(), on_disk);
            assert!(!e.is_retryable());
        }
        other => panic!("expected CorruptData, got {other:?}"),
    }

    // Схема тоже проверяется: коллекция не массив
    fs::write(
        store.paths().document_path(),
        br#"{"version":"1.0","last_updated":"2026-01-01T00:00:00Z","skills":"rust"}"#,
    )?;
    assert!(matches!(store.load(), Err(StoreError::CorruptData { .. })));

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn invalid_document_is_never_written() -> Result<()> {
    let root = unique_root("invalid");
    let store = open_initialized(&root)?;
    let doc_path = store.paths().document_path();
    let before = fs::read(&doc_path)?;

    // Пустая версия
    let mut empty = ProfileDocument::new("");
    assert!(matches!(
        store.save(&mut empty),
        Err(StoreError::InvalidDocument { .. })
    ));

    // version — публичное поле, его можно испортить и после загрузки
    let mut blank = store.load()?;
    blank.version = "   ".into();
    assert!(matches!(
        store.save(&mut blank),
        Err(StoreError::InvalidDocument { .. })
    ));

    // Коллекция не массив: отсекается уже в set_field
    let mut doc = store.load()?;
    assert!(matches!(
        doc.set_field("skills", "Rust"),
        Err(StoreError::InvalidDocument { .. })
    ));
    assert_eq!(doc.get("skills"), Some(&json!([])));

    // Ничего не записано, auto-бэкап не делался, load по-прежнему работает
    assert_eq!(fs::read(&doc_path)?, before);
    assert!(store.list_backups(None)?.is_empty());
    assert_eq!(store.load()?.version, "1.0");

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn corrupt_document_flags_unavailable_backup_list() -> Result<()> {
    let root = unique_root("corrupt-nolist");
    let store = ProfileStore::open(
        StoreConfig::at(&root).with_lock_timeout(StdDuration::from_millis(150)),
    )?;
    store.initialize()?;
    let mut doc = store.load()?;
    store.save(&mut doc)?;
    fs::write(store.paths().document_path(), b"{ broken")?;

    // Каталог бэкапов занят другим процессом
    let other = LockManager::with_platform_default(StdDuration::from_secs(1));
    let guard = other.acquire(
        &store.paths().backups_dir().join(BACKUPS_LOCK_FILE),
        LockMode::Exclusive,
        StdDuration::from_secs(1),
    )?;

    match store.load() {
        Err(e @ StoreError::CorruptData { .. }) => {
            let StoreError::CorruptData { backups_error, .. } = &e else {
                unreachable!()
            };
            assert!(backups_error.is_some());
            assert!(e.recovery_backups().is_empty());
            assert!(e.to_string().contains("backup list unavailable"), "{e}");
        }
        other => panic!("expected CorruptData, got {other:?}"),
    }

    // Лок отпущен: список снова полный
    guard.release()?;
    match store.load() {
        Err(e @ StoreError::CorruptData { .. }) => {
            assert_eq!(e.recovery_backups().len(), 1);
            assert!(e.to_string().contains("1 backup(s) available"), "{e}");
        }
        other => panic!("expected CorruptData, got {other:?}"),
    }

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn last_updated_never_decreases() -> Result<()> {
    let root = unique_root("mono");
    let store = open_initialized(&root)?;

    let mut doc = store.load()?;
    let future = Utc::now() + Duration::hours(1);
    doc.last_updated = future;
    store.save(&mut doc)?;
    assert!(doc.last_updated >= future);

    let first = doc.last_updated;
    store.save(&mut doc)?;
    assert!(doc.last_updated >= first);
    assert_eq!(store.load()?.last_updated, doc.last_updated);

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn serialization_is_sorted_and_stable() -> Result<()> {
    let root = unique_root("sorted");
    let store = open_initialized(&root)?;

    let mut doc = ProfileDocument::default();
    doc.set_field("zeta", 1)?;
    doc.set_field("alpha", 2)?;
    store.save(&mut doc)?;

    let text = fs::read_to_string(store.paths().document_path())?;
    let pos = |k: &str| text.find(&format!("\"{k}\"")).unwrap();
    assert!(pos("alpha") < pos("last_updated"));
    assert!(pos("last_updated") < pos("version"));
    assert!(pos("version") < pos("zeta"));
    assert!(text.ends_with('\n'));

    // Те же данные -> те же байты
    assert_eq!(doc.to_bytes()?, text.as_bytes());

    // Время без смещения от старых инструментов читается как UTC
    fs::write(
        store.paths().document_path(),
        br#"{"version":"1.0","last_updated":"2025-06-01T10:20:30.123456"}"#,
    )?;
    let legacy = store.load()?;
    assert_eq!(legacy.last_updated.to_rfc3339(), "2025-06-01T10:20:30.123456+00:00");

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn delete_takes_auto_backup_first() -> Result<()> {
    let root = unique_root("delete");
    let store = open_initialized(&root)?;
    assert!(store.exists());

    assert!(store.delete()?);
    assert!(!store.exists());
    assert_eq!(store.list_backups(None)?.len(), 1);
    assert!(!store.delete()?);
    assert!(matches!(store.load(), Err(StoreError::NotInitialized { .. })));

    let _ = fs::remove_dir_all(&root);
    Ok(())
}
