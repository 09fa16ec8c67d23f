//! Streaming export of stored frames.
//!
//! An `ExportStream` serialises a fixed list of frame files into one byte
//! sequence:
//!
//! ```text
//! stream      ::= frame_count frame*
//! frame_count ::= u32 LE
//! frame       ::= filename 0x00 size content
//! size        ::= u64 LE
//! ```
//!
//! Bytes are produced on demand. At most one frame file is open at a time and
//! nothing beyond the caller's buffer is held in memory, so an export of any
//! size runs in constant space. Header fields are emitted whole: a single read
//! never ends in the middle of the frame count or a frame sub-header.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use crate::error::{Error, Result};

const FRAME_COUNT_LEN: usize = 4;
const FRAME_SIZE_LEN: usize = 8;

/// Which frames of a session to export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportSelection {
    /// Every frame from this ordinal to the end of the session.
    FromOffset(usize),
    /// Exactly these ordinals, in this order.
    Frames(Vec<usize>),
}

/// Export request as it arrives from the HTTP layer, before resolution
/// against the session index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportRequest {
    FromOffset(usize),
    /// Offsets in microseconds relative to the session's first frame; each
    /// one selects its nearest frame.
    AtOffsets(Vec<i64>),
}

/// Result of `ExportStream::read`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Chunk {
    Bytes(Vec<u8>),
    EndOfStream,
}

/// Result of `ExportStream::read_into`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Bytes(usize),
    EndOfStream,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamState {
    Open,
    /// Every byte was delivered; the next read reports end of stream.
    Drained,
    /// End of stream was reported.
    Exhausted,
    Closed,
}

#[derive(Debug)]
struct OpenFrame {
    file: File,
    header: Vec<u8>,
    header_sent: bool,
    remaining: u64,
}

#[derive(Debug)]
pub struct ExportStream {
    files: Vec<PathBuf>,
    next_file: usize,
    count_sent: bool,
    current: Option<OpenFrame>,
    state: StreamState,
    /// Header bytes produced for an `io::Read` caller whose buffer was too
    /// small to take them whole.
    staged: Vec<u8>,
}

impl ExportStream {
    /// Opens a stream over `files`. No file is touched until the first read.
    pub fn open(files: Vec<PathBuf>) -> Result<Self> {
        if u32::try_from(files.len()).is_err() {
            return Err(Error::BadRequest(format!(
                "export selection of {} frames exceeds the wire limit",
                files.len()
            )));
        }
        for path in &files {
            frame_name(path)?;
        }
        Ok(Self {
            files,
            next_file: 0,
            count_sent: false,
            current: None,
            state: StreamState::Open,
            staged: Vec::new(),
        })
    }

    /// Total number of frames announced in the stream header.
    pub fn frame_count(&self) -> usize {
        self.files.len()
    }

    /// True once end of stream has been reported or the stream was closed.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, StreamState::Exhausted | StreamState::Closed)
    }

    /// Reads up to `max_bytes` bytes.
    pub fn read(&mut self, max_bytes: usize) -> Result<Chunk> {
        let mut buf = vec![0u8; max_bytes];
        match self.read_into(&mut buf)? {
            ReadOutcome::Bytes(n) => {
                buf.truncate(n);
                Ok(Chunk::Bytes(buf))
            }
            ReadOutcome::EndOfStream => Ok(Chunk::EndOfStream),
        }
    }

    /// Fills `buf` with the next bytes of the export.
    ///
    /// Reports `EndOfStream` exactly once, on the first call after the last
    /// byte was delivered. A buffer that cannot hold the next header field is
    /// `BufferTooSmall` if nothing else fit in the same call. A file error is
    /// only returned from a call that produced no bytes; the stream position
    /// is unchanged by it, so a later call retries the same frame.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        match self.state {
            StreamState::Closed => return Err(Error::StreamClosed),
            StreamState::Exhausted => return Err(Error::StreamExhausted),
            StreamState::Drained => {
                self.state = StreamState::Exhausted;
                return Ok(ReadOutcome::EndOfStream);
            }
            StreamState::Open => {}
        }

        let mut written = 0usize;
        if !self.count_sent {
            if buf.len() < FRAME_COUNT_LEN {
                return Err(Error::BufferTooSmall {
                    needed: FRAME_COUNT_LEN,
                });
            }
            // checked in open()
            let count = self.files.len() as u32;
            buf[..FRAME_COUNT_LEN].copy_from_slice(&count.to_le_bytes());
            written = FRAME_COUNT_LEN;
            self.count_sent = true;
        }

        while written < buf.len() {
            if self.current.is_none() {
                if self.next_file == self.files.len() {
                    self.state = StreamState::Drained;
                    break;
                }
                match self.open_next() {
                    Ok(frame) => self.current = Some(frame),
                    // hand out what was produced; the next call retries this frame
                    Err(_) if written > 0 => break,
                    Err(err) => return Err(err),
                }
            }
            let Some(frame) = self.current.as_mut() else {
                break;
            };

            if !frame.header_sent {
                let needed = frame.header.len();
                if buf.len() - written < needed {
                    if written == 0 {
                        return Err(Error::BufferTooSmall { needed });
                    }
                    break;
                }
                buf[written..written + needed].copy_from_slice(&frame.header);
                written += needed;
                frame.header_sent = true;
            }

            if frame.remaining > 0 {
                let room = (buf.len() - written) as u64;
                let want = frame.remaining.min(room) as usize;
                if want == 0 {
                    break;
                }
                let n = match frame.file.read(&mut buf[written..written + want]) {
                    Ok(0) if written > 0 => break,
                    Ok(0) => {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "frame file shorter than its announced size",
                        )))
                    }
                    Ok(n) => n,
                    Err(_) if written > 0 => break,
                    Err(err) => return Err(err.into()),
                };
                written += n;
                frame.remaining -= n as u64;
            }

            if frame.remaining == 0 {
                self.current = None;
            }
        }

        if written == 0 && self.state == StreamState::Drained {
            self.state = StreamState::Exhausted;
            return Ok(ReadOutcome::EndOfStream);
        }
        Ok(ReadOutcome::Bytes(written))
    }

    /// Releases the open frame file, if any. Safe to call more than once.
    pub fn close(&mut self) {
        self.current = None;
        self.staged.clear();
        self.state = StreamState::Closed;
    }

    fn open_next(&mut self) -> Result<OpenFrame> {
        let path = &self.files[self.next_file];
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let name = frame_name(path)?;

        let mut header = Vec::with_capacity(name.len() + 1 + FRAME_SIZE_LEN);
        header.extend_from_slice(name.as_bytes());
        header.push(0);
        header.extend_from_slice(&size.to_le_bytes());

        log::debug!("export: streaming {} ({} bytes)", name, size);
        self.next_file += 1;
        Ok(OpenFrame {
            file,
            header,
            header_sent: false,
            remaining: size,
        })
    }
}

impl Read for ExportStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.staged.is_empty() {
            match self.read_into(buf) {
                Err(Error::BufferTooSmall { needed }) => {
                    let mut staged = vec![0u8; needed];
                    match self.read_into(&mut staged) {
                        Ok(ReadOutcome::Bytes(n)) => {
                            staged.truncate(n);
                            self.staged = staged;
                        }
                        outcome => return io_outcome(outcome),
                    }
                }
                outcome => return io_outcome(outcome),
            }
        }
        let n = self.staged.len().min(buf.len());
        buf[..n].copy_from_slice(&self.staged[..n]);
        self.staged.drain(..n);
        Ok(n)
    }
}

fn io_outcome(outcome: Result<ReadOutcome>) -> io::Result<usize> {
    match outcome {
        Ok(ReadOutcome::Bytes(n)) => Ok(n),
        Ok(ReadOutcome::EndOfStream) | Err(Error::StreamExhausted) => Ok(0),
        Err(Error::Io(err)) => Err(err),
        Err(other) => Err(io::Error::other(other)),
    }
}

fn frame_name(path: &std::path::Path) -> Result<&str> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::BadRequest(format!("frame path {} has no name", path.display())))?;
    if !name.is_ascii() || name.as_bytes().contains(&0) {
        return Err(Error::BadRequest(format!(
            "frame name {name:?} is not representable on the wire"
        )));
    }
    Ok(name)
}

/// One frame decoded from an export byte stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportedFrame {
    pub name: String,
    pub content: Vec<u8>,
}

/// Decodes a complete export. Trailing bytes after the last frame are an error.
pub fn decode_export(bytes: &[u8]) -> Result<Vec<ExportedFrame>> {
    let malformed = |what: &str| Error::BadRequest(format!("malformed export: {what}"));
    let mut cursor = 0usize;
    let count_bytes = take(bytes, &mut cursor, FRAME_COUNT_LEN).ok_or_else(|| malformed("frame count"))?;
    let count = u32::from_le_bytes([count_bytes[0], count_bytes[1], count_bytes[2], count_bytes[3]]);

    let mut frames = Vec::new();
    for _ in 0..count {
        let rest = &bytes[cursor..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| malformed("unterminated file name"))?;
        let name = std::str::from_utf8(&rest[..nul])
            .map_err(|_| malformed("file name encoding"))?
            .to_string();
        cursor += nul + 1;
        let size_bytes = take(bytes, &mut cursor, FRAME_SIZE_LEN).ok_or_else(|| malformed("frame size"))?;
        let mut size = [0u8; FRAME_SIZE_LEN];
        size.copy_from_slice(size_bytes);
        let size = usize::try_from(u64::from_le_bytes(size)).map_err(|_| malformed("frame size"))?;
        let content = take(bytes, &mut cursor, size)
            .ok_or_else(|| malformed("truncated content"))?
            .to_vec();
        frames.push(ExportedFrame { name, content });
    }
    if cursor != bytes.len() {
        return Err(malformed("trailing bytes"));
    }
    Ok(frames)
}

fn take<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Option<&'a [u8]> {
    let end = cursor.checked_add(len)?;
    let out = bytes.get(*cursor..end)?;
    *cursor = end;
    Some(out)
}
