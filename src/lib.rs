// Базовые модули
pub mod consts;
pub mod error;
pub mod config;
pub mod metrics;

// Пути, раскладка каталога, локи
pub mod paths;  // PathResolver
pub mod layout; // DirectoryInitializer
pub mod lock;   // LockManager (fs2, shared/exclusive)

// Документ и хранилище
pub mod document;
pub mod backup; // src/backup/{mod,index,auto,manual,restore}.rs
pub mod store;

// Утилиты (атомарная запись, fsync, права, свободное место, sha256)
pub mod util;   // src/util/mod.rs

// Админский CLI (используется бинарём profilestore)
pub mod cli;

// Удобные реэкспорты
pub use backup::{BackupCategory, BackupEntry, BackupManager, BackupManifest, VerifyReport};
pub use config::StoreConfig;
pub use document::ProfileDocument;
pub use error::{Result, StoreError};
pub use layout::{ensure_layout, DataLayout, LayoutReport};
pub use lock::{LockGuard, LockManager, LockMode, LockStrategy};
pub use paths::resolve_base_directory;
pub use store::{FailPoint, ProfileStore, StoreBuilder};
