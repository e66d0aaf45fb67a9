use std::io::{ErrorKind, Read};
use std::os::fd::OwnedFd;

use bytes::BytesMut;
use saftbus_transport::IpcStream;

use crate::codec::{decode_header, Frame, FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Reads complete frames from any `Read` stream.
///
/// Each call reads exactly one header and exactly one payload. Nothing past
/// the frame is consumed, so poll readiness on the underlying descriptor
/// keeps meaning "another frame is waiting".
pub struct FrameReader<T> {
    inner: T,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached at a
    /// frame boundary and `Err(FrameError::Truncated { .. })` when EOF cuts a
    /// frame short.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut header = [0u8; HEADER_SIZE];
        let got = self.read_full(&mut header)?;
        if got == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        if got < HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: HEADER_SIZE,
                received: got,
            });
        }

        let (kind, payload_len) = decode_header(&header, self.config.max_payload_size)?;

        let mut payload = BytesMut::zeroed(payload_len);
        let got = self.read_full(&mut payload)?;
        if got < payload_len {
            return Err(FrameError::Truncated {
                expected: HEADER_SIZE + payload_len,
                received: HEADER_SIZE + got,
            });
        }

        Ok(Frame {
            kind,
            payload: payload.freeze(),
        })
    }

    /// Fill `buf` unless EOF comes first; returns the number of bytes read.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(filled)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Take the next descriptor that arrived alongside the frames read so far.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.inner.take_received_fd()
    }
}

pub(crate) fn transport_to_frame_error(err: saftbus_transport::TransportError) -> FrameError {
    match err {
        saftbus_transport::TransportError::Io(io)
        | saftbus_transport::TransportError::Accept(io) => FrameError::Io(io),
        saftbus_transport::TransportError::Bind { source, .. }
        | saftbus_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::encode_frame;
    use crate::message::MessageType;

    #[test]
    fn read_single_frame() {
        let mut wire = BytesMut::new();
        encode_frame(MessageType::MethodCall, b"hello", &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.kind, MessageType::MethodCall);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn reader_does_not_consume_past_frame() {
        let mut wire = BytesMut::new();
        encode_frame(MessageType::Signal, b"one", &mut wire).unwrap();
        encode_frame(MessageType::Signal, b"two", &mut wire).unwrap();
        let first_len = HEADER_SIZE + 3;

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        reader.read_frame().unwrap();
        assert_eq!(reader.get_ref().position() as usize, first_len);

        let f2 = reader.read_frame().unwrap();
        assert_eq!(f2.payload.as_ref(), b"two");
    }

    #[test]
    fn read_frame_with_large_payload() {
        let payload = vec![0xAB; 64 * 1024];
        let mut wire = BytesMut::new();
        encode_frame(MessageType::MethodReply, &payload, &mut wire).unwrap();

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.kind, MessageType::MethodReply);
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn partial_read_handling() {
        let mut wire = BytesMut::new();
        encode_frame(MessageType::GetState, b"slow", &mut wire).unwrap();

        let byte_reader = ByteByByteReader {
            bytes: wire.to_vec(),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.kind, MessageType::GetState);
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_header() {
        let mut reader = FrameReader::new(Cursor::new(vec![0u8, 0, 0]));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::Truncated {
                expected: HEADER_SIZE,
                received: 3
            }
        ));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn connection_closed_mid_payload() {
        let mut partial = BytesMut::new();
        partial.put_u32_le(MessageType::MethodCall.code());
        partial.put_u32_le(16);
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::Truncated {
                expected: 24,
                received: 17
            }
        ));
    }

    #[test]
    fn unknown_type_in_stream() {
        let bytes = vec![0x63, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::UnknownMessageType(99)));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn oversized_frame_in_stream() {
        let mut wire = BytesMut::new();
        wire.put_u32_le(MessageType::MethodCall.code());
        wire.put_u32_le(1024);

        let cfg = FrameConfig {
            max_payload_size: 16,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(wire.to_vec()), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            if buf.is_empty() {
                return Ok(0);
            }

            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn roundtrip_over_socketpair() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer.send(MessageType::MethodCall, b"ping").unwrap();
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.kind, MessageType::MethodCall);
        assert_eq!(frame.payload.as_ref(), b"ping");
    }

    #[test]
    fn descriptor_arrives_with_its_frame() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);
        let (pipe_read, pipe_write) = saftbus_transport::pipe().unwrap();

        use std::os::fd::AsFd;
        writer
            .send_with_fd(MessageType::SignalFd, b"register", pipe_write.as_fd())
            .unwrap();
        writer.send(MessageType::Status, b"").unwrap();

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.kind, MessageType::SignalFd);
        let received = reader.take_fd().expect("descriptor should arrive");

        let mut sink = std::fs::File::from(received);
        let mut source = std::fs::File::from(pipe_read);
        use std::io::Write;
        sink.write_all(b"x").unwrap();
        let mut byte = [0u8; 1];
        source.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"x");

        let next = reader.read_frame().unwrap();
        assert_eq!(next.kind, MessageType::Status);
        assert!(reader.take_fd().is_none());
    }

    #[test]
    fn concurrent_reader_writer_threads() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let reader = FrameReader::new(right);
        let reader = Arc::new(Mutex::new(reader));

        let reader_thread = {
            let reader = Arc::clone(&reader);
            std::thread::spawn(move || {
                for expected in 0..64u32 {
                    let frame = reader.lock().unwrap().read_frame().unwrap();
                    assert_eq!(frame.kind.code(), expected % 3);
                    assert_eq!(frame.payload.as_ref(), format!("msg-{expected}").as_bytes());
                }
            })
        };

        for i in 0..64u32 {
            let payload = format!("msg-{i}");
            let kind = MessageType::try_from(i % 3).unwrap();
            writer.send(kind, payload.as_bytes()).unwrap();
        }

        reader_thread.join().unwrap();
    }

    #[test]
    fn read_would_block_propagates_io_error() {
        let mut wire = BytesMut::new();
        encode_frame(MessageType::Signal, b"ok", &mut wire).unwrap();

        let reader = ScriptedReader::new(ErrorKind::WouldBlock, wire.to_vec());
        let mut framed = FrameReader::new(reader);
        let err = framed.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock));
    }

    #[test]
    fn interrupted_read_retries() {
        let mut wire = BytesMut::new();
        encode_frame(MessageType::Signal, b"ok", &mut wire).unwrap();

        let reader = ScriptedReader::new(ErrorKind::Interrupted, wire.to_vec());
        let mut framed = FrameReader::new(reader);
        let frame = framed.read_frame().unwrap();

        assert_eq!(frame.kind, MessageType::Signal);
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    /// Fails the first read with `first_error`, then serves `bytes`.
    struct ScriptedReader {
        first_error: Option<ErrorKind>,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl ScriptedReader {
        fn new(first_error: ErrorKind, bytes: Vec<u8>) -> Self {
            Self {
                first_error: Some(first_error),
                bytes,
                pos: 0,
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if let Some(kind) = self.first_error.take() {
                return Err(std::io::Error::from(kind));
            }
            let remaining = self.bytes.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn applies_read_timeout_for_ipc_stream() {
        let (stream, _peer) = IpcStream::pair().unwrap();
        let cfg = FrameConfig {
            read_timeout: Some(std::time::Duration::from_millis(10)),
            ..FrameConfig::default()
        };

        let mut reader = FrameReader::with_config_ipc(stream, cfg).unwrap();
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
        ));
    }
}
