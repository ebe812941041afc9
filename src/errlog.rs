//! Persistent error log.
//!
//! Error diagnostics are appended to a capped log file, typically on nvram.
//! When the cap is exceeded the oldest quartile is discarded and the rest
//! rewritten; rotation happens opportunistically on write. The file is
//! opened and closed per append so a crash never leaves it dangling.

use once_cell::sync::OnceCell;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Size cap for the error log file.
pub const MAX_FILE_SIZE: u64 = 16 * 1024;

const KEEP_SIZE: u64 = (MAX_FILE_SIZE / 4) * 3;

static LOG_PATH: OnceCell<PathBuf> = OnceCell::new();

/// Configure the error log destination. Without it, appends are no-ops.
pub fn init(path: &Path) {
    if LOG_PATH.set(path.to_path_buf()).is_err() {
        warn!("error log already configured, ignoring {}", path.display());
    }
}

pub fn is_configured() -> bool {
    LOG_PATH.get().is_some()
}

/// Append a timestamped line to the error log.
pub fn append(message: &str) {
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    append_to(path, message);
}

fn append_to(path: &Path, message: &str) {
    if let Err(e) = rotate_if_needed(path) {
        eprintln!("pcd: error log rotation failed: {e}");
    }
    let timestamp = chrono::Local::now().format("%a %b %e %H:%M:%S %Y");
    let line = format!("{timestamp} {message}\n");
    let result = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = result {
        eprintln!("pcd: cannot append to error log {}: {e}", path.display());
    }
}

/// Keep the newest three quartiles when the file exceeds its cap.
fn rotate_if_needed(path: &Path) -> std::io::Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if len < MAX_FILE_SIZE {
        return Ok(());
    }
    let contents = match std::fs::read(path) {
        Ok(c) => c,
        Err(_) => {
            // Unreadable (corrupt flash): start over.
            let _ = std::fs::remove_file(path);
            return Ok(());
        }
    };
    let cut = contents.len().saturating_sub(KEEP_SIZE as usize);
    std::fs::write(path, &contents[cut..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_creates_and_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.log");
        append_to(&path, "rule net_dhcp failed");
        append_to(&path, "rule net_dns timeout");
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("rule net_dhcp failed"));
        assert!(lines[1].ends_with("rule net_dns timeout"));
    }

    #[test]
    fn test_rotation_keeps_newest_three_quartiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.log");
        // Grow the file past the cap with recognizable content.
        let filler = "x".repeat(128);
        let mut blob = String::new();
        let mut i = 0;
        while (blob.len() as u64) < MAX_FILE_SIZE {
            blob.push_str(&format!("line-{i} {filler}\n"));
            i += 1;
        }
        std::fs::write(&path, &blob).unwrap();

        append_to(&path, "after rotation");
        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len <= KEEP_SIZE + 256, "file not rotated, len {len}");
        let contents = std::fs::read_to_string(&path).unwrap();
        // The oldest quartile is gone, the newest entries survive.
        assert!(!contents.contains("line-0 "));
        assert!(contents.contains("after rotation"));
    }
}
