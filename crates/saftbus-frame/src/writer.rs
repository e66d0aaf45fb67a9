use std::io::{ErrorKind, Write};
use std::os::fd::BorrowedFd;

use bytes::BytesMut;
use saftbus_transport::IpcStream;

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::message::MessageType;
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete frame (blocking).
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame.kind, frame.payload.as_ref())
    }

    /// Encode and send a payload as one frame of type `kind`.
    ///
    /// A non-blocking stream that cannot take more bytes surfaces as
    /// `FrameError::Io` of kind `WouldBlock`. The frame may then be partly
    /// written, so the stream is no longer usable for framing.
    pub fn send(&mut self, kind: MessageType, payload: &[u8]) -> Result<()> {
        self.encode(kind, payload)?;
        self.write_from(0)?;
        self.flush()
    }

    fn encode(&mut self, kind: MessageType, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        self.buf.clear();
        encode_frame(kind, payload, &mut self.buf)
    }

    fn write_from(&mut self, mut offset: usize) -> Result<()> {
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(())
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame encoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<IpcStream> {
    /// Create a frame writer for `IpcStream` and apply write timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Send one frame with `fd` attached to its first bytes.
    pub fn send_with_fd(&mut self, kind: MessageType, payload: &[u8], fd: BorrowedFd<'_>) -> Result<()> {
        self.encode(kind, payload)?;
        let sent = loop {
            match self.inner.send_with_fds(&self.buf, &[fd]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        };
        self.write_from(sent)?;
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::reader::FrameReader;

    fn decode_all(wire: Vec<u8>) -> Vec<Frame> {
        let mut reader = FrameReader::new(Cursor::new(wire));
        let mut frames = Vec::new();
        loop {
            match reader.read_frame() {
                Ok(frame) => frames.push(frame),
                Err(FrameError::ConnectionClosed) => return frames,
                Err(err) => panic!("unexpected frame error: {err}"),
            }
        }
    }

    #[test]
    fn write_single_frame() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));

        writer.send(MessageType::MethodCall, b"hello").unwrap();

        let frames = decode_all(writer.into_inner().into_inner());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, MessageType::MethodCall);
        assert_eq!(frames[0].payload.as_ref(), b"hello");
    }

    #[test]
    fn write_multiple_frames() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));

        writer.send(MessageType::MethodCall, b"one").unwrap();
        writer.send(MessageType::Signal, b"two").unwrap();
        writer
            .write_frame(&Frame::new(MessageType::Quit, "three"))
            .unwrap();

        let frames = decode_all(writer.into_inner().into_inner());
        let kinds: Vec<_> = frames.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageType::MethodCall, MessageType::Signal, MessageType::Quit]
        );
        assert_eq!(frames[2].payload.as_ref(), b"three");
    }

    #[test]
    fn payload_too_large_rejected() {
        let cfg = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer.send(MessageType::MethodCall, b"oversized").unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(writer.get_ref().get_ref().is_empty());
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = FrameWriter::new(sink);

        writer.send(MessageType::Status, b"x").unwrap();

        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn retries_interrupted_writes() {
        let mut writer = FrameWriter::new(FailOnceWriter {
            write_error: Some(ErrorKind::Interrupted),
            flush_error: Some(ErrorKind::Interrupted),
            data: Vec::new(),
        });
        writer.send(MessageType::Signal, b"retry").unwrap();
        assert!(!writer.into_inner().data.is_empty());
    }

    #[test]
    fn would_block_is_returned_not_retried() {
        let mut writer = FrameWriter::new(FailOnceWriter {
            write_error: Some(ErrorKind::WouldBlock),
            flush_error: None,
            data: Vec::new(),
        });
        let err = writer.send(MessageType::Signal, b"full").unwrap_err();
        assert!(matches!(err, FrameError::Io(ref e) if e.kind() == ErrorKind::WouldBlock));
        assert!(writer.get_ref().data.is_empty());

        let mut writer = FrameWriter::new(FailOnceWriter {
            write_error: None,
            flush_error: Some(ErrorKind::WouldBlock),
            data: Vec::new(),
        });
        let err = writer.send(MessageType::Signal, b"full").unwrap_err();
        assert!(matches!(err, FrameError::Io(ref e) if e.kind() == ErrorKind::WouldBlock));
    }

    #[test]
    fn full_nonblocking_pipe_reports_would_block() {
        let (_read, write) = saftbus_transport::pipe().unwrap();
        saftbus_transport::set_nonblocking(std::os::fd::AsFd::as_fd(&write)).unwrap();
        let mut writer = FrameWriter::new(std::fs::File::from(write));

        let payload = vec![0u8; 4096];
        let err = loop {
            if let Err(err) = writer.send(MessageType::Signal, &payload) {
                break err;
            }
        };
        assert!(matches!(err, FrameError::Io(ref e) if e.kind() == ErrorKind::WouldBlock));
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.send(MessageType::Signal, b"x").unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn broken_pipe_surfaces_as_io_error() {
        let (left, right) = IpcStream::pair().unwrap();
        drop(right);
        let mut writer = FrameWriter::new(left);
        let err = writer.send(MessageType::Signal, b"x").unwrap_err();
        assert!(matches!(err, FrameError::Io(ref e) if e.kind() == ErrorKind::BrokenPipe));
    }

    #[test]
    fn applies_write_timeout_for_ipc_stream() {
        let (stream, _peer) = IpcStream::pair().unwrap();
        let cfg = FrameConfig {
            write_timeout: Some(std::time::Duration::from_millis(10)),
            ..FrameConfig::default()
        };

        let writer = FrameWriter::with_config_ipc(stream, cfg);
        assert!(writer.is_ok());
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
        data: Vec<u8>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailOnceWriter {
        write_error: Option<ErrorKind>,
        flush_error: Option<ErrorKind>,
        data: Vec<u8>,
    }

    impl Write for FailOnceWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Some(kind) = self.write_error.take() {
                return Err(std::io::Error::from(kind));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            if let Some(kind) = self.flush_error.take() {
                return Err(std::io::Error::from(kind));
            }
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
