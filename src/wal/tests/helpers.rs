use tracing_subscriber::EnvFilter;

use crate::storage::StorageConfig;
use crate::wal::{FileSegment, WalError, WalReader, WalWriter};

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Write each buffer in order, returning the issued segments.
pub fn write_all(writer: &WalWriter, buffers: &[&[u8]]) -> Result<Vec<FileSegment>, WalError> {
    buffers.iter().map(|buf| writer.write(buf)).collect()
}

/// Collect every payload from a sequential replay.
pub fn collect_payloads(path: &std::path::Path) -> Result<Vec<Vec<u8>>, WalError> {
    WalReader::open(path)?.collect()
}

/// Open a writer with default (non-append) storage config.
pub fn open_writer(path: &std::path::Path) -> WalWriter {
    init_tracing();
    WalWriter::open(path, &StorageConfig::default()).unwrap()
}
