mod config;
pub mod store;

pub use config::{AlarmDefaults, Config, LogConfig, PlatformConfig, StorageConfig};
pub use store::{AlarmStore, JsonFileStore, MemoryStore, StoreLock, StoreSnapshot};

use std::path::PathBuf;

/// Returns `~/.config/wakeytalky[-dev]/` based on WAKEYTALKY_ENV.
///
/// Set WAKEYTALKY_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, std::io::Error> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("WAKEYTALKY_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("wakeytalky-dev")
    } else {
        base_dir.join("wakeytalky")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
