//! util — общие файловые хелперы (атомарная запись, fsync, права, место, sha256).
//!
//! Атомарная запись: tmp-файл в ТОМ ЖЕ каталоге -> write + fsync -> rename -> fsync каталога.
//! На POSIX rename атомарен. На Windows `std::fs::rename` использует
//! MoveFileExW(MOVEFILE_REPLACE_EXISTING): на NTFS это практически атомарно,
//! но на сетевых/FAT томах возможно узкое неатомарное окно. Это известная
//! платформенная оговорка, а не гарантия.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::consts::{IO_CHUNK, TMP_EXT};
use crate::error::{Result, StoreError};

// -------------------- temp files --------------------

/// Имя tmp-файла для `target`: `.<name>.<rand16hex>.tmp` рядом с ним.
pub fn tmp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nonce: u64 = rand::random();
    target.with_file_name(format!(".{name}.{nonce:016x}.{TMP_EXT}"))
}

/// Имя целевого файла, если `file_name` — tmp-файл из `tmp_path_for`.
pub fn tmp_target_name(file_name: &str) -> Option<&str> {
    let rest = file_name.strip_prefix('.')?;
    let rest = rest.strip_suffix(&format!(".{TMP_EXT}"))?;
    let (target, hex) = rest.rsplit_once('.')?;
    if target.is_empty() || hex.len() != 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(target)
}

/// Является ли `file_name` tmp-файлом, порождённым `tmp_path_for(<dir>/<target_name>)`.
pub fn is_tmp_for(file_name: &str, target_name: &str) -> bool {
    tmp_target_name(file_name) == Some(target_name)
}

/// Записать bytes во временный файл рядом с `target` и сбросить на диск.
/// Возвращает путь tmp. При ошибке tmp удаляется (best-effort).
pub fn write_temp_durable(target: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let tmp = tmp_path_for(target);
    let res = (|| -> io::Result<()> {
        let mut f = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        f.write_all(bytes)?;
        f.flush()?;
        f.sync_all()?;
        Ok(())
    })();
    if let Err(e) = res {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io("write temp", tmp, e));
    }
    Ok(tmp)
}

/// Атомарно заменить `target` файлом `tmp` (+ fsync каталога, best-effort).
/// При ошибке rename tmp удаляется, target не тронут.
pub fn replace_atomic(tmp: &Path, target: &Path) -> Result<()> {
    if let Err(e) = fs::rename(tmp, target) {
        let _ = fs::remove_file(tmp);
        return Err(StoreError::io("atomic rename", target, e));
    }
    // Зафиксировать rename в каталоге (Unix). На Windows — no-op.
    let _ = fsync_parent_dir(target);
    Ok(())
}

/// tmp + fsync + rename одним вызовом (индекс бэкапов, восстановление файлов).
pub fn write_file_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = write_temp_durable(target, bytes)?;
    replace_atomic(&tmp, target)
}

/// Опубликовать `target`, только если его ещё нет: tmp + fsync, затем hard link
/// на целевое имя. Существующий файл (например, уже сохранённый другим
/// процессом документ) не перезаписывается. Ok(false) — target уже был.
pub fn write_file_if_absent(target: &Path, bytes: &[u8]) -> Result<bool> {
    let tmp = write_temp_durable(target, bytes)?;
    let linked = fs::hard_link(&tmp, target);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => {
            let _ = fsync_parent_dir(target);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::io("publish new file", target, e)),
    }
}

// Best-effort fsync parent directory after rename (Unix only).
#[cfg(unix)]
pub fn fsync_parent_dir(p: &Path) -> io::Result<()> {
    if let Some(parent) = p.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
pub fn fsync_parent_dir(_p: &Path) -> io::Result<()> {
    Ok(())
}

// -------------------- permissions --------------------

/// Каталог только для владельца (0700). На платформах без POSIX-прав — no-op.
#[cfg(unix)]
pub fn restrict_dir_to_owner(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}
#[cfg(not(unix))]
pub fn restrict_dir_to_owner(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Файл только для владельца (0600). На платформах без POSIX-прав — no-op.
#[cfg(unix)]
pub fn restrict_file_to_owner(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}
#[cfg(not(unix))]
pub fn restrict_file_to_owner(_path: &Path) -> io::Result<()> {
    Ok(())
}

// -------------------- free space --------------------

/// Источник сведений о свободном месте (подменяется в тестах).
pub trait SpaceProbe: Send + Sync + fmt::Debug {
    fn available_bytes(&self, dir: &Path) -> io::Result<u64>;
}

/// Реальная ФС через fs2 (statvfs / GetDiskFreeSpaceExW).
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_bytes(&self, dir: &Path) -> io::Result<u64> {
        fs2::available_space(dir)
    }
}

/// Фиксированное значение свободного места (например, 0 для "диск полон").
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace(pub u64);

impl SpaceProbe for FixedSpace {
    fn available_bytes(&self, _dir: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

/// Проверить, что в `dir` есть хотя бы `required` байт.
pub fn ensure_space(probe: &dyn SpaceProbe, dir: &Path, required: u64) -> Result<()> {
    let available = probe
        .available_bytes(dir)
        .map_err(|e| StoreError::io("query free space", dir, e))?;
    if available < required {
        return Err(StoreError::InsufficientSpace {
            path: dir.to_path_buf(),
            required,
            available,
        });
    }
    Ok(())
}

// -------------------- checksums --------------------

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 файла потоково. Возвращает (hex, размер).
pub fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    let mut f = File::open(path)?;
    sha256_reader(&mut f)
}

pub fn sha256_reader<R: Read>(r: &mut R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; IO_CHUNK];
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}
