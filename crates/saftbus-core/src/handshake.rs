use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use saftbus_frame::{FrameError, FrameReader, FrameWriter, MessageType};
use saftbus_serial::{Decode, Deserializer, Encode, Serializer};

use crate::call::{decode_payload, encode_payload};
use crate::error::{Result, SaftbusError};

/// Protocol version announced in HELLO.
pub const PROTOCOL_VERSION: &str = "1.0";

const MAX_VERSION_LEN: usize = 16;

/// First frame the server sends on every accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Slot the connection occupies.
    pub slot: u32,
    pub version: String,
}

impl Encode for Hello {
    fn encode(&self, ser: &mut Serializer) {
        ser.put(&self.slot).put(&self.version);
    }
}

impl Decode for Hello {
    fn decode(de: &mut Deserializer) -> std::result::Result<Self, saftbus_serial::SerialError> {
        Ok(Self {
            slot: de.get()?,
            version: de.get()?,
        })
    }
}

/// Configuration for the HELLO exchange.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Timeout for each blocking handshake operation.
    pub timeout: Duration,
    /// Local protocol version.
    pub protocol_version: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Server side: announce the slot a fresh connection landed on.
pub fn send_hello<W: Write>(
    writer: &mut FrameWriter<W>,
    slot: u32,
    config: &HandshakeConfig,
) -> Result<()> {
    validate_version(&config.protocol_version)?;
    let hello = Hello {
        slot,
        version: config.protocol_version.clone(),
    };
    writer.send(MessageType::Hello, &encode_payload(&hello))?;
    Ok(())
}

/// Client side: wait for HELLO and check version compatibility.
///
/// A connection closed before HELLO arrives yields
/// [`SaftbusError::Disconnected`]; the caller treats the slot as taken.
pub fn recv_hello<R: Read>(reader: &mut FrameReader<R>, config: &HandshakeConfig) -> Result<Hello> {
    let deadline = Instant::now() + config.timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(SaftbusError::Timeout(config.timeout));
        }

        match reader.read_frame() {
            Ok(frame) => {
                if frame.kind != MessageType::Hello {
                    return Err(SaftbusError::HandshakeFailed(format!(
                        "expected {} frame, got {}",
                        MessageType::Hello,
                        frame.kind
                    )));
                }
                let hello: Hello = decode_payload(frame.payload)?;
                validate_version(&hello.version)?;
                if !is_version_compatible(&config.protocol_version, &hello.version)? {
                    return Err(SaftbusError::HandshakeFailed(format!(
                        "incompatible version '{}' (local '{}')",
                        hello.version, config.protocol_version
                    )));
                }
                return Ok(hello);
            }
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(SaftbusError::Disconnected(
                    "connection closed before hello".to_string(),
                ));
            }
            Err(FrameError::Io(err)) if err.kind() == ErrorKind::ConnectionReset => {
                return Err(SaftbusError::Disconnected(
                    "connection reset before hello".to_string(),
                ));
            }
            Err(err) => return Err(SaftbusError::Frame(err)),
        }
    }
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(SaftbusError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    let _ = parse_version(version)?;
    Ok(())
}

/// Same major version, and the server is not newer in minor.
fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;

    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |why: &str| {
        SaftbusError::HandshakeFailed(format!("invalid version '{version}': {why}"))
    };
    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| invalid("expected '<major>.<minor>'"))?;
    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use saftbus_transport::IpcStream;

    use super::*;

    #[test]
    fn hello_roundtrip_over_socketpair() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = FrameWriter::new(left);
        send_hello(&mut writer, 7, &HandshakeConfig::default()).unwrap();

        let mut reader = FrameReader::new(right);
        let hello = recv_hello(&mut reader, &HandshakeConfig::default()).unwrap();
        assert_eq!(hello.slot, 7);
        assert_eq!(hello.version, PROTOCOL_VERSION);
    }

    #[test]
    fn close_before_hello_is_disconnect() {
        let (left, right) = IpcStream::pair().unwrap();
        drop(left);
        let mut reader = FrameReader::new(right);
        let result = recv_hello(&mut reader, &HandshakeConfig::default());
        assert!(matches!(result, Err(SaftbusError::Disconnected(_))));
    }

    #[test]
    fn other_frame_instead_of_hello() {
        let mut wire = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut wire);
            writer.send(MessageType::Signal, b"").unwrap();
        }
        let mut reader = FrameReader::new(Cursor::new(wire));
        let result = recv_hello(&mut reader, &HandshakeConfig::default());
        assert!(matches!(result, Err(SaftbusError::HandshakeFailed(_))));
    }

    #[test]
    fn version_mismatch() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = FrameWriter::new(left);
        let server_cfg = HandshakeConfig {
            protocol_version: "2.0".to_string(),
            ..HandshakeConfig::default()
        };
        send_hello(&mut writer, 0, &server_cfg).unwrap();

        let mut reader = FrameReader::new(right);
        let result = recv_hello(&mut reader, &HandshakeConfig::default());
        assert!(matches!(result, Err(SaftbusError::HandshakeFailed(_))));
    }

    #[test]
    fn malformed_version_rejected_on_send() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let cfg = HandshakeConfig {
            protocol_version: "one".to_string(),
            ..HandshakeConfig::default()
        };
        assert!(matches!(
            send_hello(&mut writer, 0, &cfg),
            Err(SaftbusError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn handshake_timeout() {
        let mut reader = FrameReader::new(AlwaysTimedOutReader);
        let cfg = HandshakeConfig {
            timeout: Duration::from_millis(25),
            ..HandshakeConfig::default()
        };

        let result = recv_hello(&mut reader, &cfg);
        assert!(matches!(result, Err(SaftbusError::Timeout(_))));
    }

    struct AlwaysTimedOutReader;

    impl Read for AlwaysTimedOutReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::TimedOut))
        }
    }
}
