use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;

use crate::backup::{BackupCategory, BackupEntry};
use crate::config::StoreConfig;
use crate::store::ProfileStore;

#[derive(Parser, Debug)]
#[command(
    name = "profilestore",
    version,
    about = "Local profile store: layout, atomic saves and backups",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Create the data directory layout and a default document (idempotent)
    Init {
        /// Data directory (default: platform location or PROFILESTORE_DATA_DIR)
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Print the stored document
    Show {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Create a manual backup of the whole data directory
    Backup {
        #[arg(long)]
        path: Option<PathBuf>,
        /// Backup name: letters, digits, '-' and '_'
        #[arg(long)]
        name: String,
    },
    /// List backups, newest first
    Backups {
        #[arg(long)]
        path: Option<PathBuf>,
        /// auto | manual
        #[arg(long)]
        category: Option<BackupCategory>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Verify a backup archive (checksums, document schema)
    Verify {
        #[arg(long)]
        path: Option<PathBuf>,
        /// Archive file name or backup name
        #[arg(long)]
        name: String,
    },
    /// Restore document (and files/ for manual backups) from a backup
    Restore {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        name: String,
    },
    /// Show data directory status
    Status {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn open_store(path: Option<PathBuf>) -> Result<ProfileStore> {
    let mut cfg = StoreConfig::from_env();
    if path.is_some() {
        cfg = cfg.with_base_dir(path);
    }
    ProfileStore::open(cfg).context("open profile store")
}

fn entry_json(e: &BackupEntry) -> serde_json::Value {
    json!({
        "category": e.category,
        "name": e.name,
        "created_at": e.created_at,
        "archive": e.archive,
        "size_bytes": e.size_bytes,
        "files": e.manifest.as_ref().map(|m| m.files.len()),
        "document_version": e.manifest.as_ref().and_then(|m| m.document_version.clone()),
    })
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Init { path } => {
            let store = open_store(path)?;
            let report = store.initialize()?;
            let base = store.paths().base_dir().display();
            if report.created_dirs.is_empty() && !report.created_document {
                println!("Already initialized at {}", base);
            } else {
                println!(
                    "Initialized at {} (dirs created: {}, document created: {})",
                    base,
                    report.created_dirs.len(),
                    report.created_document
                );
            }
            if report.removed_temp_files > 0 {
                println!("Removed {} stale temp file(s)", report.removed_temp_files);
            }
        }
        Cmd::Show { path } => {
            let store = open_store(path)?;
            let doc = match store.load() {
                Ok(d) => d,
                Err(e) => {
                    for b in e.recovery_backups() {
                        eprintln!("  backup available: {} ({})", b.archive, b.category);
                    }
                    return Err(e).context("load profile");
                }
            };
            println!("{}", serde_json::to_string_pretty(&doc.to_value())?);
        }
        Cmd::Backup { path, name } => {
            let store = open_store(path)?;
            let e = store.manual_backup(&name).context("manual backup")?;
            println!(
                "Created {} ({} bytes, {} file(s))",
                e.path.display(),
                e.size_bytes,
                e.manifest.as_ref().map_or(0, |m| m.files.len())
            );
        }
        Cmd::Backups {
            path,
            category,
            json,
        } => {
            let store = open_store(path)?;
            let list = store.list_backups(category)?;
            if json {
                let arr: Vec<_> = list.iter().map(entry_json).collect();
                println!("{}", serde_json::to_string_pretty(&arr)?);
            } else if list.is_empty() {
                println!("No backups");
            } else {
                for e in &list {
                    println!(
                        "{:<6}  {}  {:>10} B  {}",
                        e.category,
                        e.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                        e.size_bytes,
                        e.archive
                    );
                }
            }
        }
        Cmd::Verify { path, name } => {
            let store = open_store(path)?;
            let report = store.verify_backup(&name)?;
            for w in &report.warnings {
                println!("warning: {}", w);
            }
            for e in &report.errors {
                println!("error: {}", e);
            }
            if !report.is_valid() {
                bail!(
                    "backup {} is invalid ({} error(s))",
                    report.archive,
                    report.errors.len()
                );
            }
            println!(
                "OK: {} ({} file(s) checked)",
                report.archive, report.files_checked
            );
        }
        Cmd::Restore { path, name } => {
            let store = open_store(path)?;
            let doc = store
                .restore_backup(&name)
                .with_context(|| format!("restore from '{}'", name))?;
            println!(
                "Restored document version={} last_updated={}",
                doc.version, doc.last_updated
            );
        }
        Cmd::Status { path, json } => {
            let store = open_store(path)?;
            let layout = store.paths();
            let doc_path = layout.document_path();
            let doc_size = std::fs::metadata(&doc_path).map(|m| m.len()).ok();
            let doc = if doc_size.is_some() { store.load().ok() } else { None };
            let (autos, manuals) = if layout.is_complete() {
                let all = store.list_backups(None)?;
                let autos = all.iter().filter(|e| e.category == BackupCategory::Auto).count();
                (autos, all.len() - autos)
            } else {
                (0, 0)
            };

            if json {
                let v = json!({
                    "base_dir": layout.base_dir(),
                    "initialized": layout.is_complete(),
                    "document": {
                        "path": doc_path,
                        "size_bytes": doc_size,
                        "valid": doc.is_some(),
                        "version": doc.as_ref().map(|d| d.version.clone()),
                        "last_updated": doc.as_ref().map(|d| d.last_updated),
                    },
                    "backups": {
                        "auto": autos,
                        "manual": manuals,
                        "auto_keep": store.config().auto_backup_keep,
                    },
                    "lock_timeout_ms": store.config().lock_timeout.as_millis() as u64,
                });
                println!("{}", serde_json::to_string_pretty(&v)?);
            } else {
                println!("Profile store at {}", layout.base_dir().display());
                println!("  initialized  = {}", layout.is_complete());
                match (&doc_size, &doc) {
                    (None, _) => println!("  document     = (missing)"),
                    (Some(n), Some(d)) => {
                        println!("  document     = {} bytes", n);
                        println!("  version      = {}", d.version);
                        println!("  last_updated = {}", d.last_updated);
                    }
                    (Some(n), None) => println!("  document     = {} bytes (INVALID)", n),
                }
                println!(
                    "  backups      = {} auto (keep {}), {} manual",
                    autos,
                    store.config().auto_backup_keep,
                    manuals
                );
            }
        }
    }
    Ok(())
}
