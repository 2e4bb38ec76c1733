// tests/manual_backup.rs
//
// Покрываем:
// 1) manual_backup("pre-update"): контрольные суммы манифеста совпадают
//    с SHA-256 каждого распакованного файла; backups/ и lock-файлы не попадают.
// 2) verify_backup: целый архив валиден, подделанный — нет.
// 3) restore_backup: документ и files/ возвращаются, текущее состояние
//    предварительно уходит в auto-бэкап.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use profilestore::{BackupCategory, BackupManifest, ProfileStore, StoreConfig, StoreError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("pstest-manual-{prefix}-{pid}-{t}-{id}"))
}

fn populated_store(prefix: &str) -> Result<(PathBuf, ProfileStore)> {
    let root = unique_root(prefix);
    let store = ProfileStore::open(StoreConfig::at(&root))?;
    store.initialize()?;

    let mut doc = store.load()?;
    doc.set_field("summary", "before update")?;
    doc.set_field("skills", vec!["Rust"])?;
    store.save(&mut doc)?;

    let files = store.paths().files_dir();
    fs::write(files.join("resume.txt"), b"Alex Doe\nEngineer\n")?;
    fs::create_dir_all(files.join("certs"))?;
    let blob: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(files.join("certs").join("aws.bin"), &blob)?;
    fs::write(store.paths().logs_dir().join("app.log"), b"started\n")?;
    Ok((root, store))
}

fn extract_all(path: &std::path::Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut zip = ZipArchive::new(File::open(path)?)?;
    let mut out = BTreeMap::new();
    for i in 0..zip.len() {
        let mut f = zip.by_index(i)?;
        if f.is_dir() {
            continue;
        }
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        out.insert(f.name().to_string(), buf);
    }
    Ok(out)
}

#[test]
fn manifest_checksums_match_extracted_files() -> Result<()> {
    let (root, store) = populated_store("checksums")?;

    let entry = store.manual_backup("pre-update")?;
    assert_eq!(entry.category, BackupCategory::Manual);
    assert_eq!(entry.name, "pre-update");
    assert!(entry.archive.starts_with("manual_") && entry.archive.ends_with("_pre-update.zip"));

    let files = extract_all(&entry.path)?;
    let manifest: BackupManifest = serde_json::from_slice(&files["manifest.json"])?;
    assert_eq!(manifest.document_version.as_deref(), Some("1.0"));
    assert_eq!(Some(&manifest), entry.manifest.as_ref());

    let mut listed: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    listed.sort_unstable();
    assert_eq!(
        listed,
        vec![
            "data/user_profile.json",
            "files/certs/aws.bin",
            "files/resume.txt",
            "logs/app.log",
        ]
    );

    for mf in &manifest.files {
        let bytes = &files[&mf.path];
        let sum = format!("{:x}", Sha256::digest(bytes));
        assert_eq!(sum, mf.checksum, "{}", mf.path);
        assert_eq!(bytes.len() as u64, mf.size_bytes, "{}", mf.path);
    }
    assert_eq!(
        manifest.total_size_bytes,
        manifest.files.iter().map(|f| f.size_bytes).sum::<u64>()
    );

    // Документ в архиве совпадает с документом на диске
    assert_eq!(
        files["data/user_profile.json"],
        fs::read(store.paths().document_path())?
    );
    assert!(files.keys().all(|k| !k.starts_with("backups/") && !k.ends_with(".lock")));

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn verify_detects_tampering() -> Result<()> {
    let (root, store) = populated_store("verify")?;

    let good = store.manual_backup("good")?;
    let report = store.verify_backup("good")?;
    assert!(report.is_valid(), "{:?}", report.errors);
    assert!(report.warnings.is_empty());
    assert_eq!(report.files_checked, 4);

    // Тот же архив, но с изменённым resume.txt
    let mut files = extract_all(&good.path)?;
    files.insert("files/resume.txt".into(), b"Someone Else\n".to_vec());
    files.insert("extra.txt".into(), b"?".to_vec());
    let forged = good.archive.replace("_good.zip", "_forged.zip");
    let mut zw = ZipWriter::new(File::create(store.paths().backups_dir().join(&forged))?);
    for (name, bytes) in &files {
        zw.start_file(name.as_str(), SimpleFileOptions::default())?;
        zw.write_all(bytes)?;
    }
    zw.finish()?;

    let report = store.verify_backup("forged")?;
    assert!(!report.is_valid());
    assert!(report.errors.iter().any(|e| e.contains("files/resume.txt")));
    assert!(report.warnings.iter().any(|w| w.contains("extra.txt")));

    // Невалидный архив не восстанавливается
    assert!(matches!(
        store.restore_backup("forged"),
        Err(StoreError::InvalidBackup { .. })
    ));
    assert!(matches!(
        store.verify_backup("nope"),
        Err(StoreError::BackupNotFound { .. })
    ));

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn restore_brings_back_document_and_files() -> Result<()> {
    let (root, store) = populated_store("restore")?;
    store.manual_backup("pre-update")?;

    // Портим состояние
    let mut doc = store.load()?;
    doc.set_field("summary", "after update")?;
    store.save(&mut doc)?;
    let resume = store.paths().files_dir().join("resume.txt");
    fs::remove_file(&resume)?;
    let autos_before = store.list_backups(Some(BackupCategory::Auto))?.len();

    let restored = store.restore_backup("pre-update")?;
    assert_eq!(
        restored.get("summary").and_then(|v| v.as_str()),
        Some("before update")
    );
    assert_eq!(store.load()?, restored);
    assert_eq!(fs::read(&resume)?, b"Alex Doe\nEngineer\n");

    // Состояние "after update" сохранено в auto-бэкап перед восстановлением
    let autos = store.list_backups(Some(BackupCategory::Auto))?;
    assert_eq!(autos.len(), autos_before + 1);

    // Восстановление из auto-бэкапа тоже работает
    let back = store.restore_backup(&autos[0].archive)?;
    assert_eq!(
        back.get("summary").and_then(|v| v.as_str()),
        Some("after update")
    );

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn bad_backup_names_are_rejected() -> Result<()> {
    let root = unique_root("names");
    let store = ProfileStore::open(StoreConfig::at(&root))?;
    store.initialize()?;

    for bad in ["", "../escape", "with space", "semi;colon"] {
        assert!(
            matches!(
                store.manual_backup(bad),
                Err(StoreError::InvalidBackupName { .. })
            ),
            "{bad:?}"
        );
    }
    assert!(store.list_backups(Some(BackupCategory::Manual))?.is_empty());

    let _ = fs::remove_dir_all(&root);
    Ok(())
}
