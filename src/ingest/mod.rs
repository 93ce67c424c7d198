//! # Polling Ingestion Module
//!
//! Runs a set of worker threads that repeatedly pull one event batch per
//! iteration from a pool of remote source connections, hand the events to
//! an upstream [`RecordStore`], and drive at-least-once delivery with
//! ack/nack accounting:
//!
//! ```text
//! IDLE ──borrow─→ POLLING ──batch ok──→ STORING ──ack─→ DONE
//!                    │                     │
//!                    ├─error-batch────────────────────→ DONE (no ack, no nack)
//!                    └─failure───→ NACKING ──ok/fail──→ DONE
//! ```
//!
//! `DONE` always returns the connection: every borrow is wrapped in a
//! [`PooledConnection`] guard that sends the connection back to the FIFO
//! on drop, on every exit path of an iteration.
//!
//! ## Poll outcomes
//!
//! Each iteration reduces to a single [`PollOutcome`] and the worker
//! performs a straight match on it:
//!
//! - `Stored` — events handed to the store and acked.
//! - `ErrorBatch` — the source reported an error batch; logged, no ack,
//!   no nack.
//! - `Interrupted` — the transport was closed under the call; a clean
//!   shutdown signal when the ingestor is stopping, otherwise treated
//!   like a failure (nack if a batch was received).
//! - `Failed` — any recoverable failure (RPC, store, ack); logged and
//!   nacked iff a batch was received. A nack failure is terminal for the
//!   iteration only.
//! - `Fatal` — unclassified failure; logged, worker exits.
//!
//! Per-iteration isolation: a failure in one worker iteration never
//! affects other workers.

#[cfg(test)]
mod tests;

use std::{
    collections::HashMap,
    fmt,
    ops::Deref,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::block::{BlockGenerator, Record};

/// How long a worker blocks on the connection FIFO before re-checking
/// the stopped flag.
const CONN_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Failures surfaced by a remote event source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The transport was closed under an in-flight call. When the
    /// ingestor is stopping this is the expected unblocking signal.
    #[error("source transport closed")]
    Closed,

    /// The RPC failed (timeout, connection reset, protocol error).
    #[error("rpc failed: {0}")]
    Rpc(String),

    /// Unrecoverable source failure; the worker gives up.
    #[error("fatal source failure: {0}")]
    Fatal(String),
}

/// Error type the upstream store may return.
pub type StoreError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by [`PollingIngestor`] operations.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Connecting to a source endpoint failed.
    #[error("connect to {endpoint} failed: {message}")]
    Connect {
        /// The endpoint that could not be reached.
        endpoint: String,
        /// Human-readable cause.
        message: String,
    },

    /// A source RPC failed.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// The upstream store rejected a batch of records.
    #[error("store rejected records: {0}")]
    Store(StoreError),

    /// The ingestor was started twice.
    #[error("ingestor already started")]
    AlreadyStarted,

    /// Internal invariant violation (poisoned lock, thread panic, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Source boundary
// ------------------------------------------------------------------------------------------------

/// One event as delivered by a remote source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Payload bytes.
    pub body: Vec<u8>,

    /// Source headers.
    pub headers: HashMap<String, String>,
}

/// Body and headers are preserved verbatim.
impl From<Event> for Record {
    fn from(event: Event) -> Self {
        Record::new(event.body, event.headers)
    }
}

/// One response from `get_event_batch`.
#[derive(Debug, Clone)]
pub enum EventBatch {
    /// A batch of events identified by an opaque sequence number to be
    /// acked or nacked.
    Events {
        /// Token identifying this batch on the source side.
        sequence_number: String,
        /// The delivered events.
        events: Vec<Event>,
    },

    /// The source could not produce a batch.
    Error {
        /// Source-reported reason.
        message: String,
    },
}

/// The RPC surface the ingestor consumes from one remote source.
///
/// `ack` signals "events durably stored, discard from the source
/// buffer"; it is idempotent on the source side. `nack` returns the
/// batch to the source buffer for redelivery. Timeouts are the
/// implementer's responsibility and surface as [`SourceError::Rpc`].
pub trait EventSource: Send + Sync {
    /// Pull the next batch, at most `max_batch_size` events.
    fn get_event_batch(&self, max_batch_size: i32) -> Result<EventBatch, SourceError>;

    /// Confirm a batch as durably stored.
    fn ack(&self, sequence_number: &str) -> Result<(), SourceError>;

    /// Return a batch to the source for redelivery.
    fn nack(&self, sequence_number: &str) -> Result<(), SourceError>;

    /// Close the transport, unblocking in-flight calls with
    /// [`SourceError::Closed`].
    fn close(&self);
}

/// Handle to one remote source.
#[derive(Clone)]
pub struct Connection {
    /// Address this connection was opened against.
    pub endpoint: String,

    /// The live transport.
    pub source: Arc<dyn EventSource>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Opens connections to source endpoints.
///
/// Whatever I/O resources connections share (client runtimes, socket
/// factories) live inside the connector value handed to the ingestor at
/// construction — there is no process-wide state.
pub trait SourceConnector: Send + Sync {
    /// Open one connection to `endpoint`.
    fn connect(&self, endpoint: &str) -> Result<Connection, IngestError>;
}

/// The upstream store callback fed by worker iterations.
///
/// Implemented by [`BlockGenerator`]: each record is appended in batch
/// order.
pub trait RecordStore: Send + Sync {
    /// Persist one batch worth of records, in order.
    fn store(&self, records: Vec<Record>) -> Result<(), StoreError>;
}

impl RecordStore for BlockGenerator {
    fn store(&self, records: Vec<Record>) -> Result<(), StoreError> {
        for record in records {
            self.append(record).map_err(StoreError::from)?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Connection pool guard
// ------------------------------------------------------------------------------------------------

/// Scoped borrow of a pooled [`Connection`].
///
/// Returning on drop is what guarantees pool conservation on every exit
/// path of a worker iteration.
struct PooledConnection {
    connection: Connection,
    pool: Sender<Connection>,
}

impl PooledConnection {
    fn new(connection: Connection, pool: Sender<Connection>) -> Self {
        Self { connection, pool }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // The pool is sized to the connection count, so this send cannot
        // block; it only fails during teardown when the pool is gone.
        if self.pool.send(self.connection.clone()).is_err() {
            trace!(endpoint = %self.connection.endpoint, "pool gone; dropping connection");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Poll outcome
// ------------------------------------------------------------------------------------------------

/// The result of one worker iteration's poll step.
#[derive(Debug)]
pub enum PollOutcome {
    /// Events handed to the store and acked.
    Stored {
        /// Sequence number that was acked.
        sequence_number: String,
        /// Number of events stored.
        count: usize,
    },

    /// The source returned an error batch.
    ErrorBatch {
        /// Source-reported reason.
        message: String,
    },

    /// The transport was closed under the call.
    Interrupted {
        /// The batch's sequence number, if one had been received.
        sequence_number: Option<String>,
    },

    /// A recoverable failure.
    Failed {
        /// The batch's sequence number, if one had been received.
        sequence_number: Option<String>,
        /// What went wrong.
        cause: IngestError,
    },

    /// An unrecoverable failure; the worker exits.
    Fatal {
        /// What went wrong.
        cause: IngestError,
    },
}

// ------------------------------------------------------------------------------------------------
// PollingIngestor
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`PollingIngestor`].
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Source endpoints; one connection is opened per entry and the pool
    /// is sized to match.
    pub endpoints: Vec<String>,

    /// Number of worker threads.
    pub parallelism: usize,

    /// Upper bound passed to `get_event_batch`.
    pub max_batch_size: i32,
}

/// Shared state between the ingestor handle and its workers.
struct IngestorInner {
    config: IngestorConfig,
    store: Arc<dyn RecordStore>,

    pool_tx: Sender<Connection>,
    pool_rx: Receiver<Connection>,

    /// Transports to close at stop, including borrowed ones.
    sources: Mutex<Vec<Arc<dyn EventSource>>>,

    stopped: AtomicBool,
}

/// Drives `parallelism` worker threads pulling event batches from a pool
/// of source connections into a [`RecordStore`].
///
/// See the [module-level documentation](self) for the iteration state
/// machine and failure semantics.
pub struct PollingIngestor {
    inner: Arc<IngestorInner>,
    connector: Arc<dyn SourceConnector>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl PollingIngestor {
    /// Create an ingestor. Connections are opened and workers launched
    /// by [`start`](Self::start).
    pub fn new(
        config: IngestorConfig,
        connector: Arc<dyn SourceConnector>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let (pool_tx, pool_rx) = bounded(config.endpoints.len().max(1));
        Self {
            inner: Arc::new(IngestorInner {
                config,
                store,
                pool_tx,
                pool_rx,
                sources: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
            connector,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Open one connection per endpoint, then launch the workers.
    ///
    /// If any endpoint fails to connect, the already-opened transports
    /// are closed and the error is returned.
    pub fn start(&self) -> Result<(), IngestError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(IngestError::AlreadyStarted);
        }

        for endpoint in &self.inner.config.endpoints {
            let connection = match self.connector.connect(endpoint) {
                Ok(connection) => connection,
                Err(e) => {
                    self.close_sources();
                    return Err(e);
                }
            };
            debug!(endpoint = %endpoint, "source connected");
            self.lock_sources()?.push(Arc::clone(&connection.source));
            self.inner
                .pool_tx
                .send(connection)
                .map_err(|_| IngestError::Internal("connection pool disconnected".into()))?;
        }

        let mut workers = self
            .workers
            .lock()
            .map_err(|_| IngestError::Internal("Mutex poisoned".into()))?;
        for worker_id in 0..self.inner.config.parallelism {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name(format!("ingest-worker-{worker_id}"))
                .spawn(move || inner.run_worker(worker_id))
                .map_err(|e| IngestError::Internal(format!("failed to spawn worker: {e}")))?;
            workers.push(handle);
        }

        info!(
            endpoints = self.inner.config.endpoints.len(),
            parallelism = self.inner.config.parallelism,
            max_batch_size = self.inner.config.max_batch_size,
            "polling ingestor started"
        );
        Ok(())
    }

    /// Stop all workers: raise the flag, close every transport to
    /// unblock in-flight RPCs, and join the worker threads.
    ///
    /// Idempotent.
    pub fn stop(&self) -> Result<(), IngestError> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.close_sources();

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self
                .workers
                .lock()
                .map_err(|_| IngestError::Internal("Mutex poisoned".into()))?;
            guard.drain(..).collect()
        };
        for handle in workers {
            handle
                .join()
                .map_err(|_| IngestError::Internal("ingest worker panicked".into()))?;
        }

        info!("polling ingestor stopped");
        Ok(())
    }

    /// Number of connections currently idle in the pool.
    pub fn idle_connections(&self) -> usize {
        self.inner.pool_rx.len()
    }

    fn close_sources(&self) {
        if let Ok(mut sources) = self.inner.sources.lock() {
            for source in sources.drain(..) {
                source.close();
            }
        }
    }

    fn lock_sources(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Vec<Arc<dyn EventSource>>>, IngestError> {
        self.inner
            .sources
            .lock()
            .map_err(|_| IngestError::Internal("Mutex poisoned".into()))
    }
}

impl IngestorInner {
    /// Worker body: borrow, poll, match the outcome, return the borrow.
    fn run_worker(&self, worker_id: usize) {
        info!(worker_id, "ingest worker started");

        while !self.stopped.load(Ordering::Acquire) {
            let connection = match self.pool_rx.recv_timeout(CONN_POLL_INTERVAL) {
                Ok(connection) => PooledConnection::new(connection, self.pool_tx.clone()),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            match self.poll_once(&connection) {
                PollOutcome::Stored {
                    sequence_number,
                    count,
                } => {
                    trace!(worker_id, sequence = %sequence_number, count, "batch stored and acked");
                }
                PollOutcome::ErrorBatch { message } => {
                    warn!(worker_id, endpoint = %connection.endpoint, message = %message,
                        "source returned error batch");
                }
                PollOutcome::Interrupted { sequence_number } => {
                    if self.stopped.load(Ordering::Acquire) {
                        // Clean termination; the connection guard still
                        // returns the borrow on the way out.
                        break;
                    }
                    warn!(worker_id, endpoint = %connection.endpoint,
                        "transport closed while running");
                    self.send_nack(&connection, sequence_number);
                }
                PollOutcome::Failed {
                    sequence_number,
                    cause,
                } => {
                    warn!(worker_id, endpoint = %connection.endpoint, error = %cause,
                        "poll iteration failed");
                    self.send_nack(&connection, sequence_number);
                }
                PollOutcome::Fatal { cause } => {
                    error!(worker_id, endpoint = %connection.endpoint, error = %cause,
                        "fatal failure; worker exiting");
                    return;
                }
            }
        }

        info!(worker_id, "ingest worker stopped");
    }

    /// One iteration of the batch state machine, reduced to an outcome.
    fn poll_once(&self, connection: &Connection) -> PollOutcome {
        let batch = match connection
            .source
            .get_event_batch(self.config.max_batch_size)
        {
            Ok(batch) => batch,
            Err(SourceError::Closed) => {
                return PollOutcome::Interrupted {
                    sequence_number: None,
                };
            }
            Err(e @ SourceError::Fatal(_)) => {
                return PollOutcome::Fatal { cause: e.into() };
            }
            Err(e) => {
                return PollOutcome::Failed {
                    sequence_number: None,
                    cause: e.into(),
                };
            }
        };

        let (sequence_number, events) = match batch {
            EventBatch::Error { message } => return PollOutcome::ErrorBatch { message },
            EventBatch::Events {
                sequence_number,
                events,
            } => (sequence_number, events),
        };

        let count = events.len();
        let records: Vec<Record> = events.into_iter().map(Record::from).collect();

        if let Err(e) = self.store.store(records) {
            return PollOutcome::Failed {
                sequence_number: Some(sequence_number),
                cause: IngestError::Store(e),
            };
        }

        match connection.source.ack(&sequence_number) {
            Ok(()) => PollOutcome::Stored {
                sequence_number,
                count,
            },
            Err(SourceError::Closed) => PollOutcome::Interrupted {
                sequence_number: Some(sequence_number),
            },
            Err(e @ SourceError::Fatal(_)) => PollOutcome::Fatal { cause: e.into() },
            Err(e) => PollOutcome::Failed {
                sequence_number: Some(sequence_number),
                cause: e.into(),
            },
        }
    }

    /// Nack a batch if one had been received. A nack failure is logged
    /// and not retried.
    fn send_nack(&self, connection: &Connection, sequence_number: Option<String>) {
        let Some(sequence_number) = sequence_number else {
            return;
        };
        if let Err(e) = connection.source.nack(&sequence_number) {
            error!(
                endpoint = %connection.endpoint,
                sequence = %sequence_number,
                error = %e,
                "nack failed; source is likely unreachable"
            );
        }
    }
}

impl fmt::Debug for PollingIngestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingIngestor")
            .field("endpoints", &self.inner.config.endpoints)
            .field("parallelism", &self.inner.config.parallelism)
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
