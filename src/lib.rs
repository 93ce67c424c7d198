//! # riverlog
//!
//! The durable ingestion core of a streaming data receiver: records from
//! many concurrent producers are aggregated into time-bounded **blocks**,
//! each block's bytes are persisted to an append-only **write-ahead log**,
//! and the resulting blocks are exposed for downstream consumption with
//! segment-level random-access reads.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   pull / ack / nack   ┌─────────────────────────────┐
//! │ remote event  │◄─────────────────────►│       PollingIngestor       │
//! │   sources     │                       │  (N workers, conn pool)     │
//! └───────────────┘                       └──────────────┬──────────────┘
//!                                                        │ append
//!                      producers ──────────────┐         │
//!                                              ▼         ▼
//!                                        ┌──────────────────────┐
//!                                        │    BlockGenerator    │
//!                                        │ buffer ── cut ──────▶│── bounded queue
//!                                        └──────────┬───────────┘
//!                                                   │ pusher thread
//!                                                   ▼
//!                                        ┌──────────────────────┐   ┌────────────┐
//!                                        │   WalBlockHandler    │──▶│  WAL file  │
//!                                        │ (listener, persists) │   │ (segments) │
//!                                        └──────────────────────┘   └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`storage`] | Durable file I/O — append/read streams, namespace serialization, flush-to-durable-storage |
//! | [`wal`] | Length-prefixed append-only log — writer, sequential reader, positional random reader |
//! | [`encoding`] | Deterministic binary encoding for block payloads and wire types |
//! | [`block`] | Multi-producer time-windowed batching with bounded backpressure |
//! | [`ingest`] | Polling workers with connection pooling and ack/nack coordination |
//! | [`handler`] | Reference block consumer persisting blocks through the WAL |
//!
//! ## Key Properties
//!
//! - **Durability** — every WAL record is flushed to durable storage
//!   before its [`wal::FileSegment`] is issued.
//! - **Round-trip fidelity** — a segment read back via
//!   [`wal::WalRandomReader`] is bit-identical to the buffer written.
//! - **Ordering** — record order within a block equals append order;
//!   blocks reach the consumer in cut order.
//! - **Backpressure** — a bounded block queue throttles the cut path when
//!   the consumer lags.
//! - **At-least-once delivery** — every polled batch is either acked
//!   after the store callback returns, or nacked for redelivery.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use riverlog::block::{BlockGenerator, BlockGeneratorConfig, Record, SystemClock};
//! use riverlog::handler::{FnSegmentSink, WalBlockHandler};
//! use riverlog::storage::StorageConfig;
//! use riverlog::wal::WalWriter;
//!
//! let writer = WalWriter::open("/data/receiver-0.wal", &StorageConfig::default()).unwrap();
//! let handler = WalBlockHandler::new(
//!     writer,
//!     FnSegmentSink::new(|block_id, segment| {
//!         println!("stored {block_id} at {segment:?}");
//!         Ok(())
//!     }),
//! );
//!
//! let generator = BlockGenerator::new(
//!     BlockGeneratorConfig::default(),
//!     Arc::new(handler),
//!     Arc::new(SystemClock),
//! );
//! generator.start().unwrap();
//!
//! generator.append(Record::from_body(b"hello".to_vec())).unwrap();
//!
//! generator.stop().unwrap();
//! ```

#![allow(dead_code)]

pub mod block;
pub mod encoding;
pub mod handler;
pub mod ingest;
pub mod storage;
pub mod wal;
