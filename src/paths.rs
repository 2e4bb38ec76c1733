//! paths — платформенный каталог данных по умолчанию.
//!
//! Чистая таблица: (Platform, PlatformEnv) -> базовый каталог. Окружение
//! процесса читается один раз (`PlatformEnv::from_process`) и дальше
//! передаётся явно; глобального изменяемого состояния нет.
//!
//! | Platform | base                                                   |
//! |----------|--------------------------------------------------------|
//! | Windows  | %APPDATA% или <home>\AppData\Roaming                   |
//! | macOS    | <home>/Library/Application Support                     |
//! | Linux/*  | $XDG_DATA_HOME или <home>/.local/share                 |

use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other
        }
    }
}

/// Снимок переменных окружения, которые участвуют в резолве.
/// Пустые значения считаются отсутствующими.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformEnv {
    pub home: Option<PathBuf>,
    pub appdata: Option<PathBuf>,
    pub xdg_data_home: Option<PathBuf>,
}

impl PlatformEnv {
    pub fn from_process() -> Self {
        let var = |k: &str| {
            std::env::var_os(k)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        Self {
            home: var("HOME").or_else(|| var("USERPROFILE")),
            appdata: var("APPDATA"),
            xdg_data_home: var("XDG_DATA_HOME"),
        }
    }
}

/// Каталог данных по умолчанию для платформы (без имени приложения).
/// None — если не хватает домашнего каталога.
pub fn platform_data_root(platform: Platform, env: &PlatformEnv) -> Option<PathBuf> {
    match platform {
        Platform::Windows => env
            .appdata
            .clone()
            .or_else(|| env.home.as_ref().map(|h| h.join("AppData").join("Roaming"))),
        Platform::MacOs => env
            .home
            .as_ref()
            .map(|h| h.join("Library").join("Application Support")),
        Platform::Linux | Platform::Other => env
            .xdg_data_home
            // XDG требует абсолютный путь; относительный игнорируем
            .clone()
            .filter(|p| p.is_absolute())
            .or_else(|| env.home.as_ref().map(|h| h.join(".local").join("share"))),
    }
}

/// Чистая функция: override (если задан) возвращается без изменений,
/// иначе — `<platform_data_root>/<app_dir_name>`.
pub fn resolve_base_directory_with(
    override_dir: Option<&Path>,
    platform: Platform,
    env: &PlatformEnv,
    app_dir_name: &str,
) -> Result<PathBuf> {
    if let Some(p) = override_dir {
        return Ok(p.to_path_buf());
    }
    platform_data_root(platform, env)
        .map(|root| root.join(app_dir_name))
        .ok_or_else(|| StoreError::NoDataDirectory {
            reason: format!("no home directory in environment for {platform:?}"),
        })
}

/// Резолв для текущего процесса.
pub fn resolve_base_directory(override_dir: Option<&Path>, app_dir_name: &str) -> Result<PathBuf> {
    resolve_base_directory_with(
        override_dir,
        Platform::current(),
        &PlatformEnv::from_process(),
        app_dir_name,
    )
}
