use once_cell::sync::Lazy;
pub use std::env::*;
use std::path::PathBuf;

pub static PCD_SOCKET_DIR: Lazy<PathBuf> =
    Lazy::new(|| var_path("PCD_SOCKET_DIR").unwrap_or_else(|| PathBuf::from("/var/tmp")));
pub static PCD_TEMP_PATH: Lazy<PathBuf> =
    Lazy::new(|| var_path("PCD_TEMP_PATH").unwrap_or_else(|| PathBuf::from("/var/tmp")));
pub static PCD_EXCEPTION_FIFO: Lazy<PathBuf> =
    Lazy::new(|| var_path("PCD_EXCEPTION_FIFO").unwrap_or_else(|| PCD_TEMP_PATH.join("pcd_except")));

pub static PCD_SERVER_NAME: Lazy<String> =
    Lazy::new(|| var("PCD_SERVER_NAME").unwrap_or_else(|_| "pcd-server".to_string()));
pub static PCD_OWNER_ID: Lazy<u32> = Lazy::new(|| {
    var("PCD_OWNER_ID")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3085)
});

pub static PCD_LOG: Lazy<log::LevelFilter> =
    Lazy::new(|| var_log_level("PCD_LOG").unwrap_or(log::LevelFilter::Info));
pub static PCD_IPC_JSON: Lazy<bool> = Lazy::new(|| var_true("PCD_IPC_JSON"));

/// Naming convention for ephemeral per-request client endpoints.
pub const CLIENT_NAME_PREFIX: &str = "pcd-client-";

fn var_path(name: &str) -> Option<PathBuf> {
    var(name).map(PathBuf::from).ok()
}

fn var_log_level(name: &str) -> Option<log::LevelFilter> {
    var(name).ok().and_then(|level| level.parse().ok())
}

fn var_true(name: &str) -> bool {
    var(name)
        .map(|val| val.to_lowercase())
        .map(|val| val == "true" || val == "1")
        .unwrap_or(false)
}
