use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use saftbus_transport::{IpcStream, SlotId, UnixDomainSocket, MAX_SLOTS};
use tracing::{debug, info};

use crate::error::Result;

/// The server's set of slot listeners, `<base>00` .. `<base>NN`.
///
/// A slot is either listening or occupied. Accepting on a slot parks its
/// listener so further connects are refused until [`SlotListeners::rebind`].
pub struct SlotListeners {
    base: PathBuf,
    mode: u32,
    listeners: Vec<Option<UnixDomainSocket>>,
    /// Paths of parked sockets, removed when the set is dropped.
    parked: Vec<Option<PathBuf>>,
}

impl SlotListeners {
    /// Bind `count` slots (at most [`MAX_SLOTS`]).
    pub fn bind_all(base: impl AsRef<Path>, count: usize, mode: u32) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let count = count.min(MAX_SLOTS);
        let mut listeners = Vec::with_capacity(count);
        for slot in SlotId::range(count) {
            listeners.push(Some(UnixDomainSocket::bind_slot(&base, slot, mode)?));
        }
        info!(base = %base.display(), slots = count, "listening");
        Ok(Self {
            base,
            mode,
            listeners,
            parked: vec![None; count],
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Whether `slot` currently has a connected client.
    pub fn is_occupied(&self, slot: SlotId) -> bool {
        matches!(self.listeners.get(slot.index()), Some(None))
    }

    /// One flag per slot, true while occupied.
    pub fn occupancy(&self) -> Vec<bool> {
        self.listeners.iter().map(Option::is_none).collect()
    }

    /// Listening descriptor of `slot`, if the slot is free.
    pub fn listener_fd(&self, slot: SlotId) -> Option<RawFd> {
        self.listeners
            .get(slot.index())
            .and_then(Option::as_ref)
            .map(AsRawFd::as_raw_fd)
    }

    /// Accept the pending client on `slot` and park the slot's listener.
    ///
    /// Returns `Ok(None)` if the slot is not listening.
    pub fn accept(&mut self, slot: SlotId) -> Result<Option<IpcStream>> {
        let Some(entry) = self.listeners.get_mut(slot.index()) else {
            return Ok(None);
        };
        let Some(listener) = entry.as_ref() else {
            return Ok(None);
        };
        let stream = listener.accept()?;
        if let Some(listener) = entry.take() {
            self.parked[slot.index()] = Some(listener.park());
        }
        debug!(%slot, "slot occupied");
        Ok(Some(stream))
    }

    /// Listen on `slot` again after its client went away.
    pub fn rebind(&mut self, slot: SlotId) -> Result<()> {
        let index = slot.index();
        if index >= self.listeners.len() || self.listeners[index].is_some() {
            return Ok(());
        }
        let listener = UnixDomainSocket::bind_slot(&self.base, slot, self.mode)?;
        self.listeners[index] = Some(listener);
        self.parked[index] = None;
        debug!(%slot, "slot free");
        Ok(())
    }
}

impl Drop for SlotListeners {
    fn drop(&mut self) {
        for path in self.parked.iter().flatten() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use saftbus_transport::{slot_path, TransportError};

    use super::*;

    fn scratch_base(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "saftbus-listen-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("saftbus_")
    }

    #[test]
    fn accept_parks_and_rebind_restores() {
        let base = scratch_base("park");
        let mut slots = SlotListeners::bind_all(&base, 2, 0o600).unwrap();
        let slot0 = SlotId::new(0).unwrap();
        let path0 = slot_path(&base, slot0);

        let _client = UnixDomainSocket::connect(&path0).unwrap();
        let _server_side = slots.accept(slot0).unwrap().unwrap();
        assert!(slots.is_occupied(slot0));
        assert_eq!(slots.occupancy(), vec![true, false]);
        assert!(slots.listener_fd(slot0).is_none());

        match UnixDomainSocket::connect(&path0) {
            Err(TransportError::Connect { source, .. }) => {
                assert_eq!(source.kind(), ErrorKind::ConnectionRefused)
            }
            other => panic!("expected refused connect, got {other:?}"),
        }

        slots.rebind(slot0).unwrap();
        assert!(!slots.is_occupied(slot0));
        assert!(UnixDomainSocket::connect(&path0).is_ok());
    }

    #[test]
    fn drop_removes_socket_files() {
        let base = scratch_base("drop");
        let slot0 = SlotId::new(0).unwrap();
        {
            let mut slots = SlotListeners::bind_all(&base, 1, 0o600).unwrap();
            let _client = UnixDomainSocket::connect(slot_path(&base, slot0)).unwrap();
            let _ = slots.accept(slot0).unwrap();
        }
        assert!(!slot_path(&base, slot0).exists());
    }
}
