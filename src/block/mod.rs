//! # Block Generation Module
//!
//! Accepts records from arbitrarily many producer threads, seals the
//! current buffer into a [`Block`] at every interval boundary ("cut"),
//! and hands sealed blocks to a downstream listener on a dedicated
//! pusher thread through a bounded queue.
//!
//! ## Design Invariants
//!
//! - The current buffer, current block id, and pending-callback map are
//!   mutated only under the single generator mutex; cut buffers are
//!   handed off by move.
//! - Record order within a block equals append order; block ids are
//!   strictly monotonic in their timestamp; blocks reach the listener in
//!   cut order.
//! - The block queue is bounded: a cut against a full queue blocks until
//!   the pusher drains an entry. This is the backpressure path and is
//!   intentional.
//! - A callback registered via [`BlockGenerator::append_with_callback`]
//!   fires exactly once, after the listener has returned for the block it
//!   was registered against, in registration order.
//!
//! ## Threads
//!
//! One recurring cut-timer thread (boundary-aligned, drift-free), one
//! pusher thread, plus any number of producer threads calling
//! `append*`. Failures on the cut or push path are reported through
//! [`BlockGeneratorListener::on_error`] and the affected thread exits;
//! the generator does not self-restart.
//!
//! ## Shutdown
//!
//! [`BlockGenerator::stop`] stops the timer (letting an in-flight cut
//! complete), performs one final cut so the tail of the buffer is not
//! lost, then signals the pusher, which drains the queue completely
//! before exiting.

#[cfg(test)]
mod tests;

mod clock;
mod encoding_impls;

pub use clock::{Clock, ManualClock, SystemClock};

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// How long the pusher blocks on the queue before re-checking the
/// stopped flag.
const PUSH_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Error type listeners may return from a push.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by [`BlockGenerator`] operations.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Operation attempted after the generator stopped.
    #[error("block generator is stopped")]
    Stopped,

    /// The block queue was disconnected unexpectedly.
    #[error("block queue disconnected")]
    QueueDisconnected,

    /// The listener rejected a pushed block.
    #[error("listener failed to push block: {0}")]
    Push(ListenerError),

    /// Internal invariant violation (poisoned lock, thread panic, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Data model
// ------------------------------------------------------------------------------------------------

/// A single ingested record: an opaque body plus verbatim headers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    /// Payload bytes. Never parsed by this crate.
    pub body: Vec<u8>,

    /// Source headers, preserved verbatim.
    pub headers: HashMap<String, String>,
}

impl Record {
    /// Create a record with headers.
    pub fn new(body: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self { body, headers }
    }

    /// Create a header-less record.
    pub fn from_body(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: HashMap::new(),
        }
    }
}

/// Identifies one block: the receiver that produced it and the start of
/// its interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    /// The receiver this block belongs to.
    pub receiver_id: u32,

    /// Interval start in milliseconds.
    pub time_ms: i64,
}

impl BlockId {
    /// Create a block id.
    pub fn new(receiver_id: u32, time_ms: i64) -> Self {
        Self {
            receiver_id,
            time_ms,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block-{}-{}", self.receiver_id, self.time_ms)
    }
}

/// A sealed, time-bounded, ordered group of records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Unique id of this block.
    pub id: BlockId,

    /// Records in append order.
    pub records: Vec<Record>,
}

/// A deferred action tied to a block, invoked exactly once after the
/// listener has returned for that block. The argument is captured in the
/// closure.
pub type PendingCallback = Box<dyn FnOnce() + Send + 'static>;

// ------------------------------------------------------------------------------------------------
// Listener
// ------------------------------------------------------------------------------------------------

/// Capability set the generator needs from its downstream consumer.
///
/// A typical implementer serializes the block's records, persists the
/// bytes via [`crate::wal::WalWriter`], and forwards the resulting
/// segment to a downstream block store — see
/// [`crate::handler::WalBlockHandler`]. Errors must be reported, not
/// swallowed: a `Err` from [`on_push_block`](Self::on_push_block) stops
/// the pusher thread.
pub trait BlockGeneratorListener: Send + Sync {
    /// Consume one sealed block.
    fn on_push_block(&self, block: Block) -> Result<(), ListenerError>;

    /// Observe a failure on the cut or push path.
    fn on_error(&self, message: &str, error: &BlockError);
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`BlockGenerator`].
#[derive(Debug, Clone)]
pub struct BlockGeneratorConfig {
    /// Identifier stamped into every [`BlockId`] this generator issues.
    pub receiver_id: u32,

    /// Length of one block interval.
    pub block_interval: Duration,

    /// Capacity of the sealed-block queue; a cut blocks once this many
    /// blocks are waiting for the pusher.
    pub block_queue_size: usize,
}

impl Default for BlockGeneratorConfig {
    fn default() -> Self {
        Self {
            receiver_id: 0,
            block_interval: Duration::from_millis(200),
            block_queue_size: 10,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// BlockGenerator
// ------------------------------------------------------------------------------------------------

/// State guarded by the generator mutex.
struct GeneratorState {
    /// Records appended since the last cut, in append order.
    current_buffer: Vec<Record>,

    /// Id the next sealed block will carry.
    current_block_id: BlockId,

    /// Callbacks registered against not-yet-pushed blocks.
    pending_callbacks: HashMap<BlockId, Vec<PendingCallback>>,
}

/// Multi-producer, time-windowed record batcher.
///
/// See the [module-level documentation](self) for the threading and
/// shutdown model.
pub struct BlockGenerator {
    config: BlockGeneratorConfig,
    listener: Arc<dyn BlockGeneratorListener>,
    clock: Arc<dyn Clock>,

    state: Mutex<GeneratorState>,

    blocks_tx: Sender<Block>,
    blocks_rx: Receiver<Block>,

    started: AtomicBool,
    /// Raised first during stop; the timer thread exits on it.
    timer_stop: AtomicBool,
    /// Raised after the final cut; rejects appends and ends the pusher.
    stopped: AtomicBool,

    timer_handle: Mutex<Option<JoinHandle<()>>>,
    pusher_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BlockGenerator {
    /// Create a generator. Threads are not launched until
    /// [`start`](Self::start).
    pub fn new(
        config: BlockGeneratorConfig,
        listener: Arc<dyn BlockGeneratorListener>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (blocks_tx, blocks_rx) = bounded(config.block_queue_size);
        let interval_ms = config.block_interval.as_millis() as i64;
        let first_id = BlockId::new(config.receiver_id, clock.now_millis() - interval_ms);

        Arc::new(Self {
            config,
            listener,
            clock,
            state: Mutex::new(GeneratorState {
                current_buffer: Vec::new(),
                current_block_id: first_id,
                pending_callbacks: HashMap::new(),
            }),
            blocks_tx,
            blocks_rx,
            started: AtomicBool::new(false),
            timer_stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            timer_handle: Mutex::new(None),
            pusher_handle: Mutex::new(None),
        })
    }

    /// Launch the recurring cut timer and the pusher thread.
    pub fn start(self: &Arc<Self>) -> Result<(), BlockError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BlockError::Internal("generator already started".into()));
        }

        let timer = {
            let generator = Arc::clone(self);
            thread::Builder::new()
                .name("block-cut-timer".into())
                .spawn(move || generator.run_timer())
                .map_err(|e| BlockError::Internal(format!("failed to spawn cut timer: {e}")))?
        };
        *self.lock_handle(&self.timer_handle)? = Some(timer);

        let pusher = {
            let generator = Arc::clone(self);
            thread::Builder::new()
                .name("block-pusher".into())
                .spawn(move || generator.run_pusher())
                .map_err(|e| BlockError::Internal(format!("failed to spawn pusher: {e}")))?
        };
        *self.lock_handle(&self.pusher_handle)? = Some(pusher);

        info!(
            receiver_id = self.config.receiver_id,
            interval_ms = self.config.block_interval.as_millis() as u64,
            queue_size = self.config.block_queue_size,
            "block generator started"
        );
        Ok(())
    }

    /// Append one record to the current buffer.
    ///
    /// Producers only ever contend on the short critical section of the
    /// generator mutex; the blocking backpressure path lives on the cut
    /// thread.
    pub fn append(&self, record: Record) -> Result<(), BlockError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BlockError::Stopped);
        }
        let mut state = self.lock_state()?;
        state.current_buffer.push(record);
        Ok(())
    }

    /// Append one record and register a callback against the block it
    /// lands in.
    ///
    /// The callback is tied to whatever block id is current at the moment
    /// of the call and fires after the listener has returned for that
    /// block. A callback whose interval is empty at cut time is dropped
    /// with a warning: its block is never pushed.
    pub fn append_with_callback(
        &self,
        record: Record,
        callback: PendingCallback,
    ) -> Result<(), BlockError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BlockError::Stopped);
        }
        let mut state = self.lock_state()?;
        state.current_buffer.push(record);
        let block_id = state.current_block_id;
        state
            .pending_callbacks
            .entry(block_id)
            .or_default()
            .push(callback);
        Ok(())
    }

    /// Stop the generator: halt the timer, flush the tail buffer with a
    /// final cut, and join the pusher after it drains the queue.
    ///
    /// Idempotent. Records appended concurrently with `stop` may be
    /// rejected with [`BlockError::Stopped`].
    pub fn stop(&self) -> Result<(), BlockError> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        // 1. Stop the timer. An in-flight cut completes before the join
        //    returns, so no cut can run concurrently with the final one.
        self.timer_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.lock_handle(&self.timer_handle)?.take() {
            handle
                .join()
                .map_err(|_| BlockError::Internal("cut timer panicked".into()))?;
        }

        // 2. Final cut: records appended since the last boundary would
        //    otherwise be silently dropped.
        let now = self.clock.now_millis();
        if let Err(e) = self.cut(now) {
            self.listener.on_error("final cut failed", &e);
        }

        // 3. Stop the pusher; it drains the queue completely first.
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.lock_handle(&self.pusher_handle)?.take() {
            handle
                .join()
                .map_err(|_| BlockError::Internal("pusher panicked".into()))?;
        }

        info!(receiver_id = self.config.receiver_id, "block generator stopped");
        Ok(())
    }

    /// Whether the generator has fully stopped accepting records.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------------------------------------
    // Cut path
    // --------------------------------------------------------------------------------------------

    /// Seal the current buffer into a block and enqueue it.
    ///
    /// The buffer swap happens under the mutex; the (possibly blocking)
    /// queue put happens outside it so producers are never blocked behind
    /// backpressure, only behind the swap itself.
    fn cut(&self, at_ms: i64) -> Result<(), BlockError> {
        let interval_ms = self.config.block_interval.as_millis() as i64;

        let sealed = {
            let mut state = self.lock_state()?;
            let buffer = std::mem::take(&mut state.current_buffer);
            let block_id = state.current_block_id;
            state.current_block_id = BlockId::new(self.config.receiver_id, at_ms - interval_ms);

            if buffer.is_empty() {
                // Nothing to push means the callback contract ("after the
                // listener returns") can never be met for this interval.
                if let Some(dropped) = state.pending_callbacks.remove(&block_id) {
                    warn!(
                        block_id = %block_id,
                        count = dropped.len(),
                        "dropping callbacks registered on an empty block interval"
                    );
                }
                None
            } else {
                Some(Block {
                    id: block_id,
                    records: buffer,
                })
            }
        };

        if let Some(block) = sealed {
            debug!(block_id = %block.id, records = block.records.len(), "block cut");
            self.blocks_tx
                .send(block)
                .map_err(|_| BlockError::QueueDisconnected)?;
        }
        Ok(())
    }

    /// Recurring timer body: cut at every interval boundary.
    ///
    /// Sleeps until the *next* boundary (`(now/interval + 1) * interval`)
    /// rather than for a fixed interval, so scheduler hiccups do not
    /// accumulate drift.
    fn run_timer(&self) {
        let interval_ms = self.config.block_interval.as_millis() as i64;
        loop {
            let now = self.clock.now_millis();
            let boundary = (now / interval_ms + 1) * interval_ms;
            self.clock.wait_until(boundary, &self.timer_stop);
            if self.timer_stop.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = self.cut(boundary) {
                self.listener.on_error("block cut failed", &e);
                break;
            }
        }
        trace!("cut timer exited");
    }

    // --------------------------------------------------------------------------------------------
    // Push path
    // --------------------------------------------------------------------------------------------

    /// Pusher body: deliver sealed blocks to the listener, then drain the
    /// queue completely once stopped.
    fn run_pusher(&self) {
        while !self.stopped.load(Ordering::Acquire) {
            match self.blocks_rx.recv_timeout(PUSH_POLL_INTERVAL) {
                Ok(block) => {
                    if let Err(e) = self.push_block(block) {
                        self.listener.on_error("block push failed", &e);
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        while let Ok(block) = self.blocks_rx.try_recv() {
            if let Err(e) = self.push_block(block) {
                self.listener.on_error("block push failed", &e);
                return;
            }
        }
        trace!("block pusher exited");
    }

    /// Deliver one block, then fire its pending callbacks in order.
    fn push_block(&self, block: Block) -> Result<(), BlockError> {
        let block_id = block.id;
        let record_count = block.records.len();

        self.listener.on_push_block(block).map_err(BlockError::Push)?;

        let callbacks = {
            let mut state = self.lock_state()?;
            state
                .pending_callbacks
                .remove(&block_id)
                .unwrap_or_default()
        };

        debug!(
            block_id = %block_id,
            records = record_count,
            callbacks = callbacks.len(),
            "block pushed"
        );

        // Invoked outside the lock: callbacks are allowed to append.
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, GeneratorState>, BlockError> {
        self.state
            .lock()
            .map_err(|_| BlockError::Internal("Mutex poisoned".into()))
    }

    fn lock_handle<'a>(
        &self,
        handle: &'a Mutex<Option<JoinHandle<()>>>,
    ) -> Result<std::sync::MutexGuard<'a, Option<JoinHandle<()>>>, BlockError> {
        handle
            .lock()
            .map_err(|_| BlockError::Internal("Mutex poisoned".into()))
    }
}

impl fmt::Debug for BlockGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGenerator")
            .field("receiver_id", &self.config.receiver_id)
            .field("interval", &self.config.block_interval)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
