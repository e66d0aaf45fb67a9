use std::io::ErrorKind;
use std::path::Path;

use saftbus_frame::{FrameConfig, FrameReader};
use saftbus_transport::{slot_path, IpcStream, SlotId, TransportError, UnixDomainSocket, MAX_SLOTS};
use tracing::{debug, info};

use crate::error::{Result, SaftbusError};
use crate::handshake::{recv_hello, HandshakeConfig};

/// A freshly connected client socket and the slot it landed on.
#[derive(Debug)]
pub struct SlotConnection {
    pub stream: IpcStream,
    pub slot: SlotId,
}

/// Connect to the first free slot under `base`.
///
/// Slots are tried in ascending order. A refused connect means the slot is
/// busy; a missing socket file means there are no further slots, which is
/// reported as [`TransportError::AllSlotsBusy`].
pub fn connect_slot(base: impl AsRef<Path>, config: &HandshakeConfig) -> Result<SlotConnection> {
    let base = base.as_ref();
    let mut tried = 0;
    for slot in SlotId::range(MAX_SLOTS) {
        tried += 1;
        let path = slot_path(base, slot);
        let stream = match UnixDomainSocket::connect(&path) {
            Ok(stream) => stream,
            Err(TransportError::Connect { source, .. })
                if source.kind() == ErrorKind::ConnectionRefused =>
            {
                debug!(%slot, "slot busy");
                continue;
            }
            Err(TransportError::Connect { source, .. }) if source.kind() == ErrorKind::NotFound => {
                break;
            }
            Err(err) => return Err(err.into()),
        };

        let frame_config = FrameConfig {
            read_timeout: Some(config.timeout),
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config_ipc(stream, frame_config)?;
        let hello = match recv_hello(&mut reader, config) {
            Ok(hello) => hello,
            Err(SaftbusError::Disconnected(reason)) => {
                // Another client won the race for this slot.
                debug!(%slot, %reason, "slot taken before hello");
                continue;
            }
            Err(err) => return Err(err),
        };
        if hello.slot as usize != slot.index() {
            return Err(SaftbusError::HandshakeFailed(format!(
                "connected to slot {slot} but server announced {}",
                hello.slot
            )));
        }

        let stream = reader.into_inner();
        stream.set_read_timeout(None)?;
        info!(%slot, version = %hello.version, "connected to saftbus");
        return Ok(SlotConnection { stream, slot });
    }

    Err(TransportError::AllSlotsBusy {
        base: base.display().to_string(),
        slots: tried,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use saftbus_frame::FrameWriter;

    use super::*;
    use crate::handshake::send_hello;

    fn scratch_base(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "saftbus-conn-{tag}-{}-{}",
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
    fn no_server_means_all_busy() {
        let base = scratch_base("none");
        let err = connect_slot(&base, &HandshakeConfig::default()).unwrap_err();
        assert!(err.is_resource_exhausted());
    }

    #[test]
    fn skips_parked_slot() {
        let base = scratch_base("skip");
        let slot0 = UnixDomainSocket::bind_slot(&base, SlotId::new(0).unwrap(), 0o600).unwrap();
        // Leaves the file behind without a listener: connects are refused.
        let _ = slot0.park();
        let slot1 = UnixDomainSocket::bind_slot(&base, SlotId::new(1).unwrap(), 0o600).unwrap();

        let server = thread::spawn(move || {
            let stream = slot1.accept().unwrap();
            let mut writer = FrameWriter::new(stream);
            send_hello(&mut writer, 1, &HandshakeConfig::default()).unwrap();
            writer
        });

        let conn = connect_slot(&base, &HandshakeConfig::default()).unwrap();
        assert_eq!(conn.slot.index(), 1);
        let _writer = server.join().unwrap();
    }

    #[test]
    fn closed_before_hello_tries_next_slot() {
        let base = scratch_base("race");
        let slot0 = UnixDomainSocket::bind_slot(&base, SlotId::new(0).unwrap(), 0o600).unwrap();

        let server = thread::spawn(move || {
            // Accept and hang up without a hello, then stop listening.
            drop(slot0.accept().unwrap());
            drop(slot0);
        });

        let err = connect_slot(&base, &HandshakeConfig::default()).unwrap_err();
        assert!(err.is_resource_exhausted());
        server.join().unwrap();
    }

    #[test]
    fn mismatched_hello_slot_fails() {
        let base = scratch_base("mismatch");
        let slot0 = UnixDomainSocket::bind_slot(&base, SlotId::new(0).unwrap(), 0o600).unwrap();

        let server = thread::spawn(move || {
            let stream = slot0.accept().unwrap();
            let mut writer = FrameWriter::new(stream);
            send_hello(&mut writer, 5, &HandshakeConfig::default()).unwrap();
            writer
        });

        let err = connect_slot(&base, &HandshakeConfig::default()).unwrap_err();
        assert!(matches!(err, SaftbusError::HandshakeFailed(_)));
        let _writer = server.join().unwrap();
    }
}
