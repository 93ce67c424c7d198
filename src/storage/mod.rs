//! Durable file I/O primitives shared by the WAL writer and readers.
//!
//! Three concerns live here:
//!
//! 1. **Namespace serialization** — resolving a path to an open file
//!    handle (existence check + open) is serialized across the process by
//!    a single mutex, because clustered file-system clients are not safe
//!    for concurrent namespace operations.
//! 2. **Append-or-create semantics** — [`open_append`] honours
//!    [`StorageConfig::append_support`]: when the flag is set and the
//!    file exists, the stream resumes at the current file length;
//!    otherwise a fresh file is created.
//! 3. **Flush-to-durable-storage** — [`AppendStream::durable_flush`]
//!    invokes the platform sync primitive. The capability is probed at
//!    open time; a file system that reports the operation unsupported
//!    latches the stream into no-op flushes.


use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, trace, warn};

/// Serializes path → handle resolution across the whole process.
///
/// Held only across the existence check and open call, never across
/// reads or writes.
static NAMESPACE_LOCK: Mutex<()> = Mutex::new(());

/// Configuration for durable file I/O.
///
/// `append_support` defaults to `false`: reopening an existing log file
/// truncates it unless the flag is raised.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// When true, [`open_append`] on an existing file resumes appending
    /// at its current end instead of creating a new file.
    pub append_support: bool,
}

/// An append-only byte stream with position tracking and durable flush.
#[derive(Debug)]
pub struct AppendStream {
    file: File,
    path: PathBuf,

    /// Absolute byte position of the next write.
    position: u64,

    /// Whether the underlying file system supports flush-to-durable-storage.
    /// Probed at open time and latched off on the first `Unsupported`.
    sync_supported: bool,
}

impl AppendStream {
    /// Write all of `data` at the current position.
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Absolute byte position of the next write.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush written bytes to durable storage.
    ///
    /// No-op when the file system does not expose a durable-flush
    /// primitive.
    pub fn durable_flush(&mut self) -> io::Result<()> {
        if !self.sync_supported {
            return Ok(());
        }
        match self.file.sync_data() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::Unsupported => {
                warn!(path = %self.path.display(), "durable flush unsupported; disabling");
                self.sync_supported = false;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Open `path` for appending.
///
/// If [`StorageConfig::append_support`] is set and the file exists, the
/// stream opens in append mode positioned at the current file length;
/// otherwise a new (empty) file is created. Namespace resolution runs
/// under the process-wide mutex.
pub fn open_append(path: impl AsRef<Path>, config: &StorageConfig) -> io::Result<AppendStream> {
    let path = path.as_ref();

    let (file, position) = {
        let _namespace = lock_namespace();
        if config.append_support && path.exists() {
            let file = OpenOptions::new().append(true).open(path)?;
            let position = file.metadata()?.len();
            debug!(path = %path.display(), position, "append stream resumed");
            (file, position)
        } else {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            debug!(path = %path.display(), "append stream created");
            (file, 0)
        }
    };

    let mut stream = AppendStream {
        file,
        path: path.to_path_buf(),
        position,
        sync_supported: true,
    };

    // Probe the durable-flush capability once, up front, so that write
    // paths never pay for a failed syscall per record.
    stream.durable_flush()?;

    Ok(stream)
}

/// Open `path` for reading, under the process-wide namespace mutex.
pub fn open_read(path: impl AsRef<Path>) -> io::Result<File> {
    let path = path.as_ref();
    let _namespace = lock_namespace();
    let file = File::open(path)?;
    trace!(path = %path.display(), "read stream opened");
    Ok(file)
}

/// Acquire the namespace mutex, recovering from poisoning.
///
/// The guarded section performs no invariant-bearing mutation, so a
/// panic inside it cannot leave the namespace in a bad state.
fn lock_namespace() -> std::sync::MutexGuard<'static, ()> {
    match NAMESPACE_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
