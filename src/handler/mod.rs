//! Reference block consumer: persist pushed blocks through the WAL.
//!
//! [`WalBlockHandler`] is the canonical [`BlockGeneratorListener`]
//! implementation: it encodes each pushed block, appends the bytes to a
//! [`WalWriter`], and forwards `(BlockId, FileSegment)` to a
//! [`SegmentSink`] — typically a downstream block store keeping segment
//! descriptors for random-access reads.
//!
//! The inverse operations live here too: [`decode_block`] and
//! [`read_block`] recover blocks from payload bytes or segments, and
//! [`replay_blocks`] walks a whole log file in write order.

#[cfg(test)]
mod tests;

use std::path::Path;

use thiserror::Error;
use tracing::{debug, error};

use crate::block::{Block, BlockError, BlockGeneratorListener, BlockId, ListenerError};
use crate::encoding::{self, EncodingError};
use crate::wal::{FileSegment, WalError, WalRandomReader, WalReader, WalWriter};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by block persistence and recovery.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Error from the underlying log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Block payload could not be encoded or decoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

// ------------------------------------------------------------------------------------------------
// SegmentSink
// ------------------------------------------------------------------------------------------------

/// Downstream recipient of persisted-block descriptors.
pub trait SegmentSink: Send + Sync {
    /// Observe that `block_id` was persisted at `segment`.
    fn on_block_stored(&self, block_id: BlockId, segment: FileSegment)
    -> Result<(), ListenerError>;
}

/// Adapter turning a closure into a [`SegmentSink`].
pub struct FnSegmentSink<F>(F);

impl<F> FnSegmentSink<F>
where
    F: Fn(BlockId, FileSegment) -> Result<(), ListenerError> + Send + Sync,
{
    /// Wrap `f` as a sink.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> SegmentSink for FnSegmentSink<F>
where
    F: Fn(BlockId, FileSegment) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_block_stored(
        &self,
        block_id: BlockId,
        segment: FileSegment,
    ) -> Result<(), ListenerError> {
        (self.0)(block_id, segment)
    }
}

// ------------------------------------------------------------------------------------------------
// WalBlockHandler
// ------------------------------------------------------------------------------------------------

/// Listener that persists each pushed block to a WAL and forwards the
/// resulting segment downstream.
pub struct WalBlockHandler<S: SegmentSink> {
    writer: WalWriter,
    sink: S,
}

impl<S: SegmentSink> WalBlockHandler<S> {
    /// Create a handler writing through `writer` and reporting segments
    /// to `sink`.
    pub fn new(writer: WalWriter, sink: S) -> Self {
        Self { writer, sink }
    }

    /// Close the underlying writer. Idempotent.
    pub fn close(&self) -> Result<(), WalError> {
        self.writer.close()
    }
}

impl<S: SegmentSink> BlockGeneratorListener for WalBlockHandler<S> {
    fn on_push_block(&self, block: Block) -> Result<(), ListenerError> {
        let block_id = block.id;
        let record_count = block.records.len();

        let bytes = encoding::encode_to_vec(&block)?;
        let segment = self.writer.write(&bytes)?;

        debug!(
            block_id = %block_id,
            records = record_count,
            offset = segment.offset,
            len = segment.length,
            "block persisted"
        );

        self.sink.on_block_stored(block_id, segment)?;
        Ok(())
    }

    fn on_error(&self, message: &str, e: &BlockError) {
        error!(error = %e, message, "block generator reported an error");
    }
}

// ------------------------------------------------------------------------------------------------
// Recovery helpers
// ------------------------------------------------------------------------------------------------

/// Decode a block from the payload bytes a handler persisted.
pub fn decode_block(bytes: &[u8]) -> Result<Block, EncodingError> {
    let (block, _) = encoding::decode_from_slice::<Block>(bytes)?;
    Ok(block)
}

/// Read and decode the block named by `segment`.
pub fn read_block(
    reader: &WalRandomReader,
    segment: &FileSegment,
) -> Result<Block, HandlerError> {
    let bytes = reader.read(segment)?;
    Ok(decode_block(&bytes)?)
}

/// Iterate all blocks in a log file, in write order.
pub fn replay_blocks(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Block, HandlerError>>, HandlerError> {
    let reader = WalReader::open(path)?;
    Ok(reader.map(|frame| {
        let bytes = frame?;
        Ok(decode_block(&bytes)?)
    }))
}
