use std::collections::{HashMap, VecDeque};
use std::sync::{
    Arc, Condvar, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use crate::block::Record;
use crate::ingest::{
    Connection, Event, EventBatch, EventSource, IngestError, RecordStore, SourceConnector,
    SourceError, StoreError,
};

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
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

/// An event with a distinctive body and one header.
pub fn event(tag: &str) -> Event {
    let mut headers = HashMap::new();
    headers.insert("tag".to_string(), tag.to_string());
    Event {
        body: tag.as_bytes().to_vec(),
        headers,
    }
}

/// A batch of tagged events under one sequence number.
pub fn batch(seq: &str, tags: &[&str]) -> EventBatch {
    EventBatch::Events {
        sequence_number: seq.to_string(),
        events: tags.iter().map(|t| event(t)).collect(),
    }
}

// ------------------------------------------------------------------------------------------------
// FakeSource
// ------------------------------------------------------------------------------------------------

/// Scripted event source.
///
/// Serves responses from a fixed script; once the script is exhausted,
/// `get_event_batch` blocks until [`EventSource::close`] and then fails
/// with [`SourceError::Closed`], mimicking a transport unblocked by
/// shutdown.
pub struct FakeSource {
    script: Mutex<VecDeque<Result<EventBatch, SourceError>>>,
    pub acks: Mutex<Vec<String>>,
    pub nacks: Mutex<Vec<String>>,
    fail_acks: AtomicBool,
    fail_nacks: AtomicBool,
    closed: Mutex<bool>,
    closed_cv: Condvar,
}

impl FakeSource {
    pub fn new(script: Vec<Result<EventBatch, SourceError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            acks: Mutex::new(Vec::new()),
            nacks: Mutex::new(Vec::new()),
            fail_acks: AtomicBool::new(false),
            fail_nacks: AtomicBool::new(false),
            closed: Mutex::new(false),
            closed_cv: Condvar::new(),
        })
    }

    /// Make every `ack` fail with an RPC error.
    pub fn fail_acks(self: Arc<Self>) -> Arc<Self> {
        self.fail_acks.store(true, Ordering::SeqCst);
        self
    }

    /// Make every `nack` fail with an RPC error.
    pub fn fail_nacks(self: Arc<Self>) -> Arc<Self> {
        self.fail_nacks.store(true, Ordering::SeqCst);
        self
    }

    pub fn ack_log(&self) -> Vec<String> {
        self.acks.lock().unwrap().clone()
    }

    pub fn nack_log(&self) -> Vec<String> {
        self.nacks.lock().unwrap().clone()
    }
}

impl EventSource for FakeSource {
    fn get_event_batch(&self, _max_batch_size: i32) -> Result<EventBatch, SourceError> {
        if let Some(response) = self.script.lock().unwrap().pop_front() {
            return response;
        }
        // Script exhausted: park until the transport is closed.
        let mut closed = self.closed.lock().unwrap();
        while !*closed {
            closed = self.closed_cv.wait(closed).unwrap();
        }
        Err(SourceError::Closed)
    }

    fn ack(&self, sequence_number: &str) -> Result<(), SourceError> {
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(SourceError::Rpc("ack refused".into()));
        }
        self.acks.lock().unwrap().push(sequence_number.to_string());
        Ok(())
    }

    fn nack(&self, sequence_number: &str) -> Result<(), SourceError> {
        self.nacks.lock().unwrap().push(sequence_number.to_string());
        if self.fail_nacks.load(Ordering::SeqCst) {
            return Err(SourceError::Rpc("nack refused".into()));
        }
        Ok(())
    }

    fn close(&self) {
        let mut closed = self.closed.lock().unwrap();
        *closed = true;
        self.closed_cv.notify_all();
    }
}

// ------------------------------------------------------------------------------------------------
// FakeConnector
// ------------------------------------------------------------------------------------------------

/// Connector handing out pre-built fake sources by endpoint.
pub struct FakeConnector {
    sources: Mutex<HashMap<String, Arc<FakeSource>>>,
}

impl FakeConnector {
    pub fn single(endpoint: &str, source: Arc<FakeSource>) -> Arc<Self> {
        let mut sources = HashMap::new();
        sources.insert(endpoint.to_string(), source);
        Arc::new(Self {
            sources: Mutex::new(sources),
        })
    }
}

impl SourceConnector for FakeConnector {
    fn connect(&self, endpoint: &str) -> Result<Connection, IngestError> {
        let sources = self.sources.lock().unwrap();
        let source = sources
            .get(endpoint)
            .ok_or_else(|| IngestError::Connect {
                endpoint: endpoint.to_string(),
                message: "unknown endpoint".into(),
            })?;
        Ok(Connection {
            endpoint: endpoint.to_string(),
            source: Arc::clone(source) as Arc<dyn EventSource>,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Stores
// ------------------------------------------------------------------------------------------------

/// Store collecting every record it receives.
#[derive(Default)]
pub struct VecStore {
    pub records: Mutex<Vec<Record>>,
}

impl VecStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.body.clone())
            .collect()
    }
}

impl RecordStore for VecStore {
    fn store(&self, records: Vec<Record>) -> Result<(), StoreError> {
        self.records.lock().unwrap().extend(records);
        Ok(())
    }
}

/// Store rejecting every batch.
pub struct FailingStore;

impl RecordStore for FailingStore {
    fn store(&self, _records: Vec<Record>) -> Result<(), StoreError> {
        Err("store exploded".into())
    }
}
