//! Crash-report intake.
//!
//! Supervised processes (via their sidecar) write fixed-size, magic-prefixed
//! exception records into a named pipe. The supervisor drains the pipe each
//! process pass and summarizes valid records to the error log. Beyond the
//! prefix the record is platform-specific and treated as opaque bytes.

use crate::Result;
use miette::IntoDiagnostic;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Magic constant prefixing every exception record.
pub const CRASH_RECORD_MAGIC: u32 = 0xe8c9a1d3;

/// Total size of one exception record on the pipe.
pub const CRASH_RECORD_SIZE: usize = 512;

/// Bytes reserved for the crashing process's name inside the record.
pub const CRASH_NAME_LEN: usize = 32;

/// Reader side of the crash-report FIFO.
pub struct CrashMonitor {
    path: PathBuf,
    file: Option<File>,
    buf: Vec<u8>,
}

/// The known prefix of an exception record. Everything past these fields is
/// opaque platform data (register dumps and the like).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashRecord {
    pub process_name: String,
    pub pid: i32,
    pub signal: i32,
    pub fault_address: u64,
}

impl CrashMonitor {
    /// Create the FIFO if needed and open it for non-blocking reads.
    pub fn open(path: &Path) -> Result<Self> {
        match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IWGRP | Mode::S_IWOTH) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(e).into_diagnostic(),
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .into_diagnostic()?;
        debug!("crash monitor listening on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            buf: Vec::new(),
        })
    }

    /// Drain every complete record currently in the pipe.
    pub fn drain(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let mut chunk = [0u8; CRASH_RECORD_SIZE];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("crash fifo read failed: {e}");
                    break;
                }
            }
        }
        while self.buf.len() >= CRASH_RECORD_SIZE {
            let record: Vec<u8> = self.buf.drain(..CRASH_RECORD_SIZE).collect();
            match parse_record(&record) {
                Some(report) => {
                    error!(
                        "exception: signal {} in process {} ({}) at address {:#x}",
                        report.signal, report.process_name, report.pid, report.fault_address
                    );
                }
                None => {
                    warn!("discarding crash record with bad magic");
                    // Resynchronization point: drop the rest of the buffer.
                    self.buf.clear();
                }
            }
        }
    }

    /// Close the FIFO; used during orderly shutdown.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("crash monitor on {} closed", self.path.display());
        }
    }
}

fn parse_record(record: &[u8]) -> Option<CrashRecord> {
    let magic = u32::from_le_bytes(record[0..4].try_into().ok()?);
    if magic != CRASH_RECORD_MAGIC {
        return None;
    }
    let name_bytes = &record[4..4 + CRASH_NAME_LEN];
    let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(CRASH_NAME_LEN);
    let process_name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();
    let fixed = 4 + CRASH_NAME_LEN;
    let pid = i32::from_le_bytes(record[fixed..fixed + 4].try_into().ok()?);
    let signal = i32::from_le_bytes(record[fixed + 4..fixed + 8].try_into().ok()?);
    let fault_address = u64::from_le_bytes(record[fixed + 8..fixed + 16].try_into().ok()?);
    Some(CrashRecord {
        process_name,
        pid,
        signal,
        fault_address,
    })
}

/// Encode the known prefix of an exception record; the sidecar that writes
/// real reports fills the opaque tail with platform register state.
pub fn encode_record(record: &CrashRecord) -> Vec<u8> {
    let mut buf = vec![0u8; CRASH_RECORD_SIZE];
    buf[0..4].copy_from_slice(&CRASH_RECORD_MAGIC.to_le_bytes());
    let name = record.process_name.as_bytes();
    let n = name.len().min(CRASH_NAME_LEN - 1);
    buf[4..4 + n].copy_from_slice(&name[..n]);
    let fixed = 4 + CRASH_NAME_LEN;
    buf[fixed..fixed + 4].copy_from_slice(&record.pid.to_le_bytes());
    buf[fixed + 4..fixed + 8].copy_from_slice(&record.signal.to_le_bytes());
    buf[fixed + 8..fixed + 16].copy_from_slice(&record.fault_address.to_le_bytes());
    buf
}
