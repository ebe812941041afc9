//! The shared endpoint registry.
//!
//! A bounded table of `{name, socket path, owner id, pid}` records shared by
//! every process on the host. It lives in a TOML file inside the socket
//! directory and every mutation happens under an advisory file lock, so the
//! table behaves like the cross-process shared segment it models. The
//! registry is passed explicitly to whoever needs it; there is no hidden
//! singleton.

use crate::Result;
use crate::error::IpcError;
use miette::IntoDiagnostic;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Maximum number of live endpoints on one host.
pub const REGISTRY_CAPACITY: usize = 32;

const REGISTRY_FILE: &str = "pcd-registry.toml";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RegistrySlot {
    pub name: String,
    pub path: PathBuf,
    pub owner: Option<u32>,
    pub pid: u32,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct RegistryTable {
    /// Slot index (as a string key, TOML requirement) to record.
    slots: BTreeMap<String, RegistrySlot>,
}

#[derive(Debug, Clone)]
pub struct SharedRegistry {
    dir: PathBuf,
    path: PathBuf,
}

impl SharedRegistry {
    /// Attach to (or create) the registry in the given socket directory.
    pub fn open(dir: &Path) -> Result<Self> {
        xx::file::mkdirp(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            path: dir.join(REGISTRY_FILE),
        })
    }

    /// Directory endpoints bind their sockets in.
    pub fn socket_dir(&self) -> &Path {
        &self.dir
    }

    /// Claim a free slot for an endpoint. Fails when all slots are taken.
    pub fn claim(&self, name: &str, sock_path: &Path, pid: u32) -> Result<i32> {
        let _lock = xx::fslock::get(&self.path, false)?;
        let mut table = self.read_table();
        let slot = (0..REGISTRY_CAPACITY)
            .find(|i| !table.slots.contains_key(&i.to_string()))
            .ok_or(IpcError::RegistryFull {
                capacity: REGISTRY_CAPACITY,
            })?;
        table.slots.insert(
            slot.to_string(),
            RegistrySlot {
                name: name.to_string(),
                path: sock_path.to_path_buf(),
                owner: None,
                pid,
            },
        );
        self.write_table(&table)?;
        trace!("registry: slot {slot} claimed by '{name}' (pid {pid})");
        Ok(slot as i32)
    }

    /// Release a slot. Only the claiming pid may release it.
    pub fn release(&self, slot: i32, pid: u32) -> Result<PathBuf> {
        let _lock = xx::fslock::get(&self.path, false)?;
        let mut table = self.read_table();
        let key = slot.to_string();
        let record = table
            .slots
            .get(&key)
            .ok_or(IpcError::SlotVacant { slot })?;
        if record.pid != pid {
            return Err(IpcError::NotSlotOwner {
                slot,
                owner: record.pid,
                pid,
            }
            .into());
        }
        let record = table.slots.remove(&key).expect("checked above");
        self.write_table(&table)?;
        trace!("registry: slot {slot} released by pid {pid}");
        Ok(record.path)
    }

    /// Publish a numeric owner id on a slot.
    pub fn set_owner(&self, slot: i32, owner: u32) -> Result<()> {
        let _lock = xx::fslock::get(&self.path, false)?;
        let mut table = self.read_table();
        let record = table
            .slots
            .get_mut(&slot.to_string())
            .ok_or(IpcError::SlotVacant { slot })?;
        record.owner = Some(owner);
        self.write_table(&table)
    }

    /// Find the slot claiming the given owner id.
    pub fn lookup_owner(&self, owner: u32) -> Option<(i32, RegistrySlot)> {
        self.read_table()
            .slots
            .iter()
            .find(|(_, record)| record.owner == Some(owner))
            .and_then(|(key, record)| Some((key.parse().ok()?, record.clone())))
    }

    pub fn owner_present(&self, owner: u32) -> bool {
        self.lookup_owner(owner).is_some()
    }

    pub fn slot_path(&self, slot: i32) -> Option<PathBuf> {
        self.read_table()
            .slots
            .get(&slot.to_string())
            .map(|record| record.path.clone())
    }

    /// Release every slot owned by a dead process and unlink its sockets.
    pub fn cleanup_proc(&self, pid: u32) -> Result<()> {
        let _lock = xx::fslock::get(&self.path, false)?;
        let mut table = self.read_table();
        let stale = table
            .slots
            .iter()
            .filter(|(_, record)| record.pid == pid)
            .map(|(key, record)| (key.clone(), record.path.clone()))
            .collect::<Vec<_>>();
        if stale.is_empty() {
            return Ok(());
        }
        for (key, path) in &stale {
            table.slots.remove(key);
            let _ = fs::remove_file(path);
            debug!("registry: cleaned slot {key} of dead pid {pid}");
        }
        self.write_table(&table)
    }

    /// Number of live slots; used by diagnostics and tests.
    pub fn live_slots(&self) -> usize {
        self.read_table().slots.len()
    }

    fn read_table(&self) -> RegistryTable {
        if !self.path.exists() {
            return RegistryTable::default();
        }
        let raw = fs::read_to_string(&self.path).unwrap_or_else(|e| {
            warn!("error reading registry {:?}: {e}", self.path);
            String::new()
        });
        toml::from_str(&raw).unwrap_or_else(|e| {
            warn!("error parsing registry {:?}: {e}", self.path);
            RegistryTable::default()
        })
    }

    fn write_table(&self, table: &RegistryTable) -> Result<()> {
        let raw = toml::to_string(table).into_diagnostic()?;
        xx::file::write(&self.path, raw)?;
        Ok(())
    }
}
