//! Framed pipe transport between parent and child.
//!
//! Each child sends exactly one frame, one direction, over an anonymous
//! pipe:
//!
//! ```text
//! <TYPE>\n        TYPE is RESULT or ERROR
//! <SIZE>\n        decimal byte length of the payload
//! <PAYLOAD>       exactly SIZE raw bytes
//! ```
//!
//! Short reads are expected and re-driven. EOF before a complete frame is
//! a transport error.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::error::{DispatchError, Result};

/// Upper bound on a single frame payload (64 MiB). A corrupted size line
/// must not drive an arbitrarily large allocation.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Buffer size for pipe I/O (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// A pipe end that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(self.fd.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Frame discriminator on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// The child's work function returned a value.
    Result,
    /// The child's work function failed; the payload is printable text.
    Error,
}

impl FrameKind {
    fn wire_name(self) -> &'static str {
        match self {
            Self::Result => "RESULT",
            Self::Error => "ERROR",
        }
    }

    fn parse(line: &str) -> Option<Self> {
        match line {
            "RESULT" => Some(Self::Result),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Child-side frame writer.
pub struct FrameWriter {
    writer: BufWriter<PipeFd>,
}

impl FrameWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(BUFFER_SIZE, fd),
        }
    }

    /// Write one complete frame and flush.
    pub fn write_frame(&mut self, kind: FrameKind, payload: &[u8]) -> io::Result<()> {
        self.writer.write_all(kind.wire_name().as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.write_all(payload.len().to_string().as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.write_all(payload)?;
        self.writer.flush()
    }
}

/// Parent-side frame reader.
pub struct FrameReader {
    reader: BufReader<PipeFd>,
}

impl FrameReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE, fd),
        }
    }

    /// Raw descriptor of the underlying read end, for readiness polling.
    pub fn raw_fd(&self) -> RawFd {
        self.reader.get_ref().as_raw_fd()
    }

    /// Read one complete frame: type line, size line, then the payload.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let kind_line = self.read_line()?;
        let kind = FrameKind::parse(&kind_line)
            .ok_or_else(|| DispatchError::BadFrame(format!("unknown frame type {kind_line:?}")))?;

        let size_line = self.read_line()?;
        let size: usize = size_line
            .parse()
            .map_err(|_| DispatchError::BadFrame(format!("invalid frame size {size_line:?}")))?;
        if size > MAX_FRAME_LEN {
            return Err(DispatchError::BadFrame(format!(
                "frame of {size} bytes exceeds the {MAX_FRAME_LEN} byte cap"
            )));
        }

        let mut payload = vec![0u8; size];
        // read_exact re-drives short reads until the payload is complete.
        match self.reader.read_exact(&mut payload) {
            Ok(()) => Ok(Frame { kind, payload }),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DispatchError::TruncatedFrame),
            Err(e) => Err(e.into()),
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(DispatchError::TruncatedFrame),
            Ok(_) => {
                if line.ends_with('\n') {
                    line.pop();
                }
                Ok(line)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_pipe() -> (FrameReader, FrameWriter) {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("Failed to create pipe");
        (
            FrameReader::new(PipeFd::new(read_fd)),
            FrameWriter::new(PipeFd::new(write_fd)),
        )
    }

    #[test]
    fn test_frame_roundtrip() {
        let (mut reader, mut writer) = create_pipe();

        writer
            .write_frame(FrameKind::Result, b"{\"ok\":true}")
            .unwrap();
        drop(writer);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.kind, FrameKind::Result);
        assert_eq!(frame.payload, b"{\"ok\":true}");
    }

    #[test]
    fn test_error_frame_with_empty_payload() {
        let (mut reader, mut writer) = create_pipe();

        writer.write_frame(FrameKind::Error, b"").unwrap();
        drop(writer);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.kind, FrameKind::Error);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_eof_before_payload_is_truncated() {
        let (mut reader, writer) = create_pipe();

        let mut raw = writer.writer.into_inner().unwrap();
        raw.write_all(b"RESULT\n10\nabc").unwrap();
        drop(raw);

        let err = reader.read_frame().unwrap_err();
        assert_eq!(err.to_string(), "could not read child data");
    }

    #[test]
    fn test_eof_before_header_is_truncated() {
        let (mut reader, writer) = create_pipe();
        drop(writer);

        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, DispatchError::TruncatedFrame));
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        let (mut reader, writer) = create_pipe();

        let mut raw = writer.writer.into_inner().unwrap();
        raw.write_all(b"BOGUS\n2\nhi").unwrap();
        drop(raw);

        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, DispatchError::BadFrame(_)));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let (mut reader, writer) = create_pipe();

        let mut raw = writer.writer.into_inner().unwrap();
        raw.write_all(b"RESULT\n999999999999\n").unwrap();
        drop(raw);

        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, DispatchError::BadFrame(_)));
    }
}
