use crate::Result;
use crate::error::IpcError;
use crate::ipc::{IncomingMsg, IpcTimeout, MAX_MSG_SIZE, decode_frame, encode_frame};
use crate::ipc::registry::SharedRegistry;
use miette::IntoDiagnostic;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A named datagram endpoint registered in the shared registry.
///
/// Sends and receives on one endpoint are serialized by an internal mutex so
/// multiple threads in one process can share it. Message ids come from a
/// per-endpoint monotonic counter.
pub struct Endpoint {
    name: String,
    slot: i32,
    path: PathBuf,
    sock: UnixDatagram,
    io_lock: Mutex<()>,
    next_msg_id: AtomicU32,
}

impl Endpoint {
    /// Bind a datagram socket at `<socket-dir>/<name>.ctl` and claim a
    /// registry slot for it.
    ///
    /// If the path is occupied by a stale socket from a dead process, it is
    /// unlinked and rebound. If a live process answers on the socket, a
    /// second instance is running and the start fails.
    pub fn start(registry: &SharedRegistry, name: &str) -> Result<Self> {
        let path = registry.socket_dir().join(format!("{name}.ctl"));
        let sock = match UnixDatagram::bind(&path) {
            Ok(sock) => sock,
            Err(_) => {
                // Maybe the socket already exists; a successful connect
                // means another instance is alive behind it.
                if UnixDatagram::unbound()
                    .and_then(|probe| probe.connect(&path))
                    .is_ok()
                {
                    return Err(IpcError::SecondInstance {
                        name: name.to_string(),
                    }
                    .into());
                }
                fs::remove_file(&path).into_diagnostic()?;
                UnixDatagram::bind(&path).into_diagnostic()?
            }
        };
        let slot = match registry.claim(name, &path, std::process::id()) {
            Ok(slot) => slot,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };
        debug!("endpoint '{name}' bound at {} (slot {slot})", path.display());
        Ok(Self {
            name: name.to_string(),
            slot,
            path,
            sock,
            io_lock: Mutex::new(()),
            next_msg_id: AtomicU32::new(1),
        })
    }

    pub fn slot(&self) -> i32 {
        self.slot
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next_msg_id(&self) -> u32 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a payload to the endpoint holding `dest_slot`.
    ///
    /// The payload buffer is consumed: once the kernel has copied the
    /// datagram the bytes are gone, mirroring the ownership transfer of the
    /// underlying send.
    pub fn send_to_slot(
        &self,
        registry: &SharedRegistry,
        dest_slot: i32,
        payload: Vec<u8>,
    ) -> Result<()> {
        let dest = registry
            .slot_path(dest_slot)
            .ok_or(IpcError::SlotVacant { slot: dest_slot })?;
        let frame = encode_frame(self.slot, &payload)?;
        drop(payload);
        let _io = self.lock_io();
        self.sock.send_to(&frame, &dest).into_diagnostic()?;
        Ok(())
    }

    /// Send a payload to the endpoint claiming `owner`.
    pub fn send_to_owner(
        &self,
        registry: &SharedRegistry,
        owner: u32,
        payload: Vec<u8>,
    ) -> Result<()> {
        let (slot, _) = registry
            .lookup_owner(owner)
            .ok_or(IpcError::OwnerNotFound { owner })?;
        self.send_to_slot(registry, slot, payload)
    }

    /// Reply to an incoming message's sender.
    pub fn reply(
        &self,
        registry: &SharedRegistry,
        incoming_src_slot: i32,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.send_to_slot(registry, incoming_src_slot, payload)
    }

    /// Wait for an incoming message. `Ok(None)` means no message arrived
    /// within the timeout; transport and framing failures are errors.
    pub fn wait_msg(&self, timeout: IpcTimeout) -> Result<Option<IncomingMsg>> {
        let _io = self.lock_io();
        let mut buf = [0u8; MAX_MSG_SIZE];
        let received = match timeout {
            IpcTimeout::Immediate => {
                self.sock.set_nonblocking(true).into_diagnostic()?;
                let r = self.sock.recv(&mut buf);
                self.sock.set_nonblocking(false).into_diagnostic()?;
                r
            }
            IpcTimeout::Millis(ms) => {
                let dur = Duration::from_millis(ms.max(1));
                self.sock.set_read_timeout(Some(dur)).into_diagnostic()?;
                let r = self.sock.recv(&mut buf);
                self.sock.set_read_timeout(None).into_diagnostic()?;
                r
            }
            IpcTimeout::Forever => {
                self.sock.set_read_timeout(None).into_diagnostic()?;
                self.sock.recv(&mut buf)
            }
        };
        match received {
            Ok(n) => Ok(Some(decode_frame(&buf[..n])?)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e).into_diagnostic(),
        }
    }

    /// Close the endpoint: release the registry slot and unlink the socket.
    /// Only the process that started the endpoint may stop it.
    pub fn stop(&self, registry: &SharedRegistry) -> Result<()> {
        let path = registry.release(self.slot, std::process::id())?;
        let _ = fs::remove_file(&path);
        debug!("endpoint '{}' stopped (slot {})", self.name, self.slot);
        Ok(())
    }

    fn lock_io(&self) -> std::sync::MutexGuard<'_, ()> {
        self.io_lock.lock().unwrap_or_else(|poisoned| {
            warn!("endpoint io mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcTimeout;

    #[test]
    fn test_send_and_receive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SharedRegistry::open(dir.path()).unwrap();
        let a = Endpoint::start(&registry, "peer-a").unwrap();
        let b = Endpoint::start(&registry, "peer-b").unwrap();

        a.send_to_slot(&registry, b.slot(), b"ping".to_vec()).unwrap();
        let msg = b.wait_msg(IpcTimeout::Millis(2000)).unwrap().unwrap();
        assert_eq!(msg.payload, b"ping");
        assert_eq!(msg.src_slot, a.slot());

        // Reply to the recorded source slot.
        b.reply(&registry, msg.src_slot, b"pong".to_vec()).unwrap();
        let msg = a.wait_msg(IpcTimeout::Millis(2000)).unwrap().unwrap();
        assert_eq!(msg.payload, b"pong");
        assert_eq!(msg.src_slot, b.slot());
    }

    #[test]
    fn test_immediate_wait_returns_none_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SharedRegistry::open(dir.path()).unwrap();
        let a = Endpoint::start(&registry, "lonely").unwrap();
        assert!(a.wait_msg(IpcTimeout::Immediate).unwrap().is_none());
    }

    #[test]
    fn test_owner_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SharedRegistry::open(dir.path()).unwrap();
        let server = Endpoint::start(&registry, "srv").unwrap();
        registry.set_owner(server.slot(), 77).unwrap();
        let client = Endpoint::start(&registry, "cli").unwrap();

        client.send_to_owner(&registry, 77, b"hi".to_vec()).unwrap();
        let msg = server.wait_msg(IpcTimeout::Millis(2000)).unwrap().unwrap();
        assert_eq!(msg.payload, b"hi");

        let err = client.send_to_owner(&registry, 78, b"hi".to_vec()).unwrap_err();
        assert!(err.to_string().contains("owner id 78"));
    }

    #[test]
    fn test_stale_socket_is_rebound() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SharedRegistry::open(dir.path()).unwrap();
        // Leave a stale socket file behind with no listener.
        let stale = Endpoint::start(&registry, "ghost").unwrap();
        let slot = stale.slot();
        drop(stale);
        registry.release(slot, std::process::id()).unwrap();
        // The socket file still exists, but nothing answers; rebind works.
        let reborn = Endpoint::start(&registry, "ghost").unwrap();
        assert_eq!(reborn.name(), "ghost");
    }

    #[test]
    fn test_msg_id_counter_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SharedRegistry::open(dir.path()).unwrap();
        let a = Endpoint::start(&registry, "ids").unwrap();
        let first = a.next_msg_id();
        assert_eq!(a.next_msg_id(), first + 1);
        assert_eq!(a.next_msg_id(), first + 2);
    }
}
