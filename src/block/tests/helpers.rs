use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use crate::block::{
    Block, BlockError, BlockGenerator, BlockGeneratorConfig, BlockGeneratorListener, ListenerError,
    ManualClock, Record,
};

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Listener capturing every pushed block and reported error.
#[derive(Default)]
pub struct CollectingListener {
    pub blocks: Mutex<Vec<Block>>,
    pub errors: Mutex<Vec<String>>,
}

impl CollectingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of blocks received so far.
    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    /// Total records across all received blocks.
    pub fn record_count(&self) -> usize {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.records.len())
            .sum()
    }

    /// Sum of all integer-bodied records received.
    pub fn record_sum(&self) -> i64 {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.records.iter())
            .map(body_to_int)
            .sum()
    }
}

impl BlockGeneratorListener for CollectingListener {
    fn on_push_block(&self, block: Block) -> Result<(), ListenerError> {
        self.blocks.lock().unwrap().push(block);
        Ok(())
    }

    fn on_error(&self, message: &str, error: &BlockError) {
        self.errors.lock().unwrap().push(format!("{message}: {error}"));
    }
}

/// Record carrying an integer as its body.
pub fn int_record(value: i64) -> Record {
    Record::from_body(value.to_le_bytes().to_vec())
}

/// Inverse of [`int_record`].
pub fn body_to_int(record: &Record) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&record.body);
    i64::from_le_bytes(bytes)
}

/// Default manual-clock epoch used by the tests.
pub const START_MS: i64 = 10_000;

/// Interval used by [`test_generator`].
pub const INTERVAL_MS: i64 = 200;

/// A generator on a manual clock with a collecting listener.
pub fn test_generator() -> (Arc<BlockGenerator>, Arc<CollectingListener>, Arc<ManualClock>) {
    init_tracing();
    let listener = CollectingListener::new();
    let clock = Arc::new(ManualClock::new(START_MS));
    let generator = BlockGenerator::new(
        BlockGeneratorConfig {
            receiver_id: 7,
            block_interval: Duration::from_millis(INTERVAL_MS as u64),
            block_queue_size: 10,
        },
        listener.clone(),
        clock.clone(),
    );
    (generator, listener, clock)
}

/// Poll until `condition` holds or `timeout` elapses.
pub fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Advance the clock one interval at a time until the listener has seen
/// `target` blocks.
///
/// The timer computes its next boundary from the clock value it reads,
/// so an advance landing between a cut and that read can leave the timer
/// waiting one interval ahead; stepping again closes the gap. Empty
/// intervals never produce blocks, so the extra cuts are inert.
pub fn advance_until_blocks(
    clock: &ManualClock,
    listener: &CollectingListener,
    target: usize,
) -> bool {
    for _ in 0..40 {
        clock.advance(INTERVAL_MS);
        if wait_for(
            || listener.block_count() >= target,
            Duration::from_millis(250),
        ) {
            return true;
        }
    }
    false
}
