use std::fs::{self, OpenOptions};

use env_logger::{Builder, Env, Target};
use log::error;

use profilestore::config::StoreConfig;
use profilestore::consts::LOGS_DIR;

const LOG_FILE: &str = "profilestore.log";

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт — info.
    // Пример: RUST_LOG=debug ./profilestore status
    let mut b = Builder::from_env(Env::default().default_filter_or("info"));
    b.format_timestamp_millis();

    // PROFILESTORE_LOG_FILE=1 — дописывать в <base>/logs/profilestore.log вместо stderr.
    let to_file = std::env::var("PROFILESTORE_LOG_FILE")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);
    if to_file {
        if let Ok(base) = StoreConfig::from_env().resolve_base_dir() {
            let dir = base.join(LOGS_DIR);
            let file = fs::create_dir_all(&dir)
                .and_then(|_| OpenOptions::new().create(true).append(true).open(dir.join(LOG_FILE)));
            match file {
                Ok(f) => {
                    b.target(Target::Pipe(Box::new(f)));
                }
                Err(e) => eprintln!("warning: cannot open log file in {}: {}", dir.display(), e),
            }
        }
    }
    b.init();
}

fn main() {
    init_logger();

    if let Err(e) = profilestore::cli::run() {
        // Логируем ошибку и выходим с кодом 1.
        error!("{:#}", e);
        std::process::exit(1);
    }
}
