//! Lodestore Core: embedded log-structured key-value engine
//!
//! Committed batches are appended to checksummed segment files and an
//! in-memory key directory points every live key at its newest value.
//!
//! # Architecture
//!
//! - **Write path**: one exclusive [`WriteTxn`] at a time; `commit` appends a
//!   single frame and syncs it before the new values become visible
//! - **Read path**: key directory lookup plus one positioned read
//! - **Scan**: lazy, chunked iteration over live pairs in segment order
//! - **Compaction**: copies live pairs forward and deletes old segments
//!
//! The engine knows nothing about records or serialization. Typed stores
//! live in `lodestore-entities`.

pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod platform_durability;
pub mod segment;
pub mod txn;

pub use compaction::CompactionResult;
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineStats, Scan, ValuePointer};
pub use error::{EngineError, EngineResult};
pub use format::Operation;
pub use txn::{CommitInfo, WriteTxn};
