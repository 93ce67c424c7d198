//! Write-Ahead Logging (WAL) Module
//!
//! This module implements a **durable**, **append-only** write-ahead log
//! of opaque byte records with segment-level random access. The log
//! neither parses nor validates payloads; framing is the only structure
//! it imposes.
//!
//! # On-disk layout
//!
//! ```text
//! [LEN_BE][PAYLOAD_BYTES]
//! [LEN_BE][PAYLOAD_BYTES]
//! ...
//! ```
//!
//! Each frame is a 4-byte **big-endian** unsigned length followed by
//! exactly that many payload bytes. No file header, no trailer, no
//! checksum, no padding. End-of-file at a frame boundary terminates a
//! sequential read cleanly; any other truncation surfaces
//! [`WalError::Truncated`].
//!
//! The format carries no torn-write detection: the log is to be treated
//! as lossy past the last intact frame boundary, and integrity checking
//! beyond that point is a downstream concern.
//!
//! # Concurrency model
//!
//! - [`WalWriter`] serializes all appends to one file under a single
//!   mutex; every append is flushed to durable storage before its
//!   [`FileSegment`] is issued.
//! - [`WalRandomReader`] guards its seek-then-read pair with a mutex so
//!   concurrent segment reads do not interleave.
//! - [`WalReader`] is single-pass and owns its file handle outright.
//!
//! # Guarantees
//!
//! - **Durability:** a returned [`FileSegment`] names bytes that have
//!   reached durable storage.
//! - **Round-trip:** reading a segment back yields a buffer bit-identical
//!   to the one written; sequential replay yields all payloads in write
//!   order.
//! - **Containment:** no record spans two files; a file contains a
//!   partial record only if the writer died mid-append, in which case
//!   readers stop at the last intact boundary.

#[cfg(test)]
mod tests;

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Mutex,
};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::encoding::{Decode, Encode, EncodingError};
use crate::storage::{self, AppendStream, StorageConfig};

/// Size of the frame length prefix in bytes.
const LEN_PREFIX_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Write attempted after the writer was closed.
    #[error("log already closed")]
    Closed,

    /// Record exceeds the representable frame size.
    #[error("record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// The file ended in the middle of a frame.
    #[error("torn frame at offset {offset}: file ends mid-record")]
    Truncated {
        /// Offset of the frame whose tail is missing.
        offset: u64,
    },

    /// A segment's recorded length disagrees with the on-disk prefix.
    #[error("segment length mismatch at offset {offset} (expected {expected}, found {found})")]
    SegmentMismatch {
        /// Offset of the frame.
        offset: u64,
        /// Length recorded in the segment.
        expected: u32,
        /// Length found in the frame prefix.
        found: u32,
    },

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// FileSegment
// ------------------------------------------------------------------------------------------------

/// Locates exactly one record in exactly one log file.
///
/// Immutable once issued by [`WalWriter::write`]. `offset` is the
/// absolute byte position of the frame's length prefix; `length` is the
/// payload length in bytes (the prefix itself is excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSegment {
    /// Path of the log file containing the record.
    pub path: PathBuf,

    /// Absolute byte offset of the frame within the file.
    pub offset: u64,

    /// Payload length in bytes.
    pub length: u32,
}

impl FileSegment {
    /// Create a segment descriptor.
    pub fn new(path: impl Into<PathBuf>, offset: u64, length: u32) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
        }
    }
}

/// Wire encoding used when a segment keys a downstream block store:
/// UTF-8 path string, 64-bit signed offset, 32-bit signed length.
impl Encode for FileSegment {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let path = self.path.to_str().ok_or_else(|| {
            EncodingError::Custom(format!(
                "segment path is not valid UTF-8: {}",
                self.path.display()
            ))
        })?;
        path.encode_to(buf)?;
        let offset = i64::try_from(self.offset).map_err(|_| {
            EncodingError::LengthOverflow(format!("segment offset {} exceeds i64", self.offset))
        })?;
        offset.encode_to(buf)?;
        let length = i32::try_from(self.length).map_err(|_| {
            EncodingError::LengthOverflow(format!("segment length {} exceeds i32", self.length))
        })?;
        length.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for FileSegment {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (path, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (file_offset, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (length, n) = i32::decode_from(&buf[offset..])?;
        offset += n;

        let file_offset = u64::try_from(file_offset).map_err(|_| {
            EncodingError::Custom(format!("negative segment offset {file_offset}"))
        })?;
        let length = u32::try_from(length)
            .map_err(|_| EncodingError::Custom(format!("negative segment length {length}")))?;

        Ok((
            Self {
                path: PathBuf::from(path),
                offset: file_offset,
                length,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// WalWriter
// ------------------------------------------------------------------------------------------------

/// Appends length-prefixed records to one log file.
///
/// Every append captures the current position, writes the frame, flushes
/// to durable storage, and returns a [`FileSegment`] naming the record.
/// All steps run under the writer mutex, so concurrent writers observe
/// whole frames only.
#[derive(Debug)]
pub struct WalWriter {
    /// `None` once the writer has been closed.
    stream: Mutex<Option<AppendStream>>,

    /// Path of the log file, for segment construction and diagnostics.
    path: PathBuf,
}

impl WalWriter {
    /// Open (or create) a log file for appending.
    ///
    /// With [`StorageConfig::append_support`] set and an existing file,
    /// new segments continue after the existing frames; otherwise the
    /// file starts empty.
    pub fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self, WalError> {
        let path = path.as_ref();
        let stream = storage::open_append(path, config)?;

        info!(path = %path.display(), position = stream.position(), "WAL writer opened");

        Ok(Self {
            stream: Mutex::new(Some(stream)),
            path: path.to_path_buf(),
        })
    }

    /// Append one record and return the segment naming it.
    ///
    /// The frame is `[u32 len BE][payload]`; the stream is flushed to
    /// durable storage before the segment is issued.
    pub fn write(&self, data: &[u8]) -> Result<FileSegment, WalError> {
        let length =
            u32::try_from(data.len()).map_err(|_| WalError::RecordTooLarge(data.len()))?;

        let mut guard = self.lock_stream()?;
        let stream = guard.as_mut().ok_or(WalError::Closed)?;

        let offset = stream.position();
        stream.write_all(&length.to_be_bytes())?;
        stream.write_all(data)?;
        stream.durable_flush()?;

        trace!(offset, len = length, "WAL record appended");

        Ok(FileSegment::new(self.path.clone(), offset, length))
    }

    /// Absolute byte position of the next append.
    ///
    /// Fails with [`WalError::Closed`] once the writer is closed.
    pub fn position(&self) -> Result<u64, WalError> {
        let guard = self.lock_stream()?;
        let stream = guard.as_ref().ok_or(WalError::Closed)?;
        Ok(stream.position())
    }

    /// Close the writer, flushing and releasing the underlying stream.
    ///
    /// Idempotent: closing an already-closed writer is a no-op. Later
    /// writes fail with [`WalError::Closed`].
    pub fn close(&self) -> Result<(), WalError> {
        let mut guard = self.lock_stream()?;
        if let Some(mut stream) = guard.take() {
            stream.durable_flush()?;
            info!(path = %self.path.display(), "WAL writer closed");
        }
        Ok(())
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_stream(&self) -> Result<std::sync::MutexGuard<'_, Option<AppendStream>>, WalError> {
        self.stream
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        // Best-effort flush; errors are only reportable as logs here.
        match self.stream.lock() {
            Ok(mut guard) => {
                if let Some(mut stream) = guard.take() {
                    if let Err(e) = stream.durable_flush() {
                        warn!(path = %self.path.display(), error = %e, "WAL flush failed on drop");
                    }
                }
            }
            Err(poisoned) => {
                if let Some(mut stream) = poisoned.into_inner().take() {
                    if let Err(e) = stream.durable_flush() {
                        warn!(
                            path = %self.path.display(),
                            error = %e,
                            "WAL flush failed on drop (poisoned lock)"
                        );
                    }
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WalReader (sequential)
// ------------------------------------------------------------------------------------------------

/// Lazy, finite, single-pass iterator over a log file's payloads.
///
/// Yields each record's payload bytes in write order. End-of-file at a
/// frame boundary terminates the sequence cleanly; a torn tail yields
/// [`WalError::Truncated`] and any other I/O failure is fatal for the
/// iteration. After yielding an error the iterator fuses.
pub struct WalReader {
    file: File,
    path: PathBuf,

    /// Byte offset of the next frame.
    offset: u64,

    /// Set after an error so the iterator terminates.
    done: bool,
}

impl WalReader {
    /// Open a log file for sequential replay.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref();
        let file = storage::open_read(path)?;
        debug!(path = %path.display(), "WAL replay started");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            offset: 0,
            done: false,
        })
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        let mut len_bytes = [0u8; LEN_PREFIX_SIZE];
        match read_fully(&mut self.file, &mut len_bytes)? {
            0 => {
                trace!(offset = self.offset, "WAL replay reached end of file");
                return Ok(None);
            }
            n if n < LEN_PREFIX_SIZE => {
                warn!(offset = self.offset, "WAL truncated frame (partial length prefix)");
                return Err(WalError::Truncated {
                    offset: self.offset,
                });
            }
            _ => {}
        }

        let length = u32::from_be_bytes(len_bytes) as usize;
        trace!(offset = self.offset, len = length, "WAL reading record");

        let mut payload = vec![0u8; length];
        let read = read_fully(&mut self.file, &mut payload)?;
        if read < length {
            warn!(
                offset = self.offset,
                len = length,
                read,
                "WAL truncated frame (partial payload)"
            );
            return Err(WalError::Truncated {
                offset: self.offset,
            });
        }

        self.offset += (LEN_PREFIX_SIZE + length) as u64;
        Ok(Some(payload))
    }
}

impl std::fmt::Debug for WalReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalReader")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl Iterator for WalReader {
    type Item = Result<Vec<u8>, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(payload)) => Some(Ok(payload)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// WalRandomReader
// ------------------------------------------------------------------------------------------------

/// Reads single records by their [`FileSegment`] descriptors.
///
/// The seek-then-read pair runs under a mutex so concurrent segment
/// reads through one reader do not interleave.
#[derive(Debug)]
pub struct WalRandomReader {
    file: Mutex<File>,
    path: PathBuf,
}

impl WalRandomReader {
    /// Open a log file for positional reads.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref();
        let file = storage::open_read(path)?;
        debug!(path = %path.display(), "WAL random reader opened");
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Read the record named by `segment`.
    ///
    /// The on-disk length prefix must agree with `segment.length`;
    /// a disagreement surfaces [`WalError::SegmentMismatch`].
    pub fn read(&self, segment: &FileSegment) -> Result<Vec<u8>, WalError> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        file.seek(SeekFrom::Start(segment.offset))?;

        let mut len_bytes = [0u8; LEN_PREFIX_SIZE];
        if read_fully(&mut *file, &mut len_bytes)? < LEN_PREFIX_SIZE {
            return Err(WalError::Truncated {
                offset: segment.offset,
            });
        }

        let found = u32::from_be_bytes(len_bytes);
        if found != segment.length {
            return Err(WalError::SegmentMismatch {
                offset: segment.offset,
                expected: segment.length,
                found,
            });
        }

        let mut payload = vec![0u8; segment.length as usize];
        if read_fully(&mut *file, &mut payload)? < segment.length as usize {
            return Err(WalError::Truncated {
                offset: segment.offset,
            });
        }

        trace!(offset = segment.offset, len = segment.length, "WAL segment read");
        Ok(payload)
    }
}

// ------------------------------------------------------------------------------------------------
// Read helpers
// ------------------------------------------------------------------------------------------------

/// Fill `buf` from `reader`, retrying short reads.
///
/// Returns the number of bytes actually read; a value below `buf.len()`
/// means end-of-file was reached first. Distinguishing "zero bytes then
/// EOF" from "some bytes then EOF" is what lets the sequential reader
/// tell a clean frame boundary from a torn frame.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
