//! Package framing (u32 little-endian length prefix).

use std::io::{ErrorKind, Read, Write};

use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The advertised (or outgoing) length falls outside what this peer
    /// accepts. A package body is never empty, so zero is invalid too.
    #[error("frame length {length} outside 1..={max_frame_bytes}")]
    LengthOutOfRange { length: u64, max_frame_bytes: usize },
    /// The peer closed the stream mid-frame.
    #[error("frame cut short after {got} of {needed} bytes")]
    CutShort { got: usize, needed: usize },
}

/// Outcome of one attempt to fill a buffer from the stream.
enum Fill {
    Complete,
    /// Stream ended before the first byte.
    Empty,
    /// Stream ended with the buffer partially filled.
    Partial(usize),
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Reads one framed package body, without the length prefix.
    /// `Ok(None)` when the peer closed the stream at a frame boundary.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut prefix = [0u8; FRAME_HEADER_LEN];
        match self.fill(&mut prefix)? {
            Fill::Complete => {}
            Fill::Empty => return Ok(None),
            Fill::Partial(got) => {
                return Err(FrameError::CutShort {
                    got,
                    needed: FRAME_HEADER_LEN,
                });
            }
        }

        let length = u32::from_le_bytes(prefix) as usize;
        if length == 0 || length > self.max_frame_bytes {
            return Err(FrameError::LengthOutOfRange {
                length: length as u64,
                max_frame_bytes: self.max_frame_bytes,
            });
        }

        let mut body = vec![0u8; length];
        match self.fill(&mut body)? {
            Fill::Complete => Ok(Some(body)),
            Fill::Empty => Err(FrameError::CutShort {
                got: 0,
                needed: length,
            }),
            Fill::Partial(got) => Err(FrameError::CutShort {
                got,
                needed: length,
            }),
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<Fill, FrameError> {
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(Fill::Empty),
                Ok(0) => return Ok(Fill::Partial(filled)),
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Fill::Complete)
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, body: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(body, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }
}

pub fn encode_frame(body: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let limit = max_frame_bytes.min(u32::MAX as usize);
    if body.is_empty() || body.len() > limit {
        return Err(FrameError::LengthOutOfRange {
            length: body.len() as u64,
            max_frame_bytes,
        });
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}
