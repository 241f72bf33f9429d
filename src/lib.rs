//! # kvs
//!
//! A durable key-value store: an in-memory map fronted by a write-ahead
//! transaction log that is replayed on startup.
//!
//! ## Core Concepts
//!
//! - **Store**: concurrent in-memory map, the authoritative view at runtime
//! - **Events**: sequenced PUT/DELETE records, assigned numbers by the logger
//! - **Transaction loggers**: file or SQLite sinks fed by a bounded queue and
//!   a single persistence worker
//! - **Replay**: ordered event stream that rebuilds the store after a restart
//!
//! ## Example
//!
//! ```ignore
//! use kvs::{open_logger, KeyValueService, LoggerConfig};
//!
//! let logger = open_logger(&LoggerConfig::file("transaction.log"))?;
//! let (service, summary) = KeyValueService::start(logger)?;
//!
//! service.put("color", "blue")?;
//! assert_eq!(service.get("color")?, "blue");
//!
//! // Persist everything queued before exiting
//! let store = service.shutdown()?;
//! ```

pub mod config;
pub mod error;
pub mod logger;
pub mod service;
pub mod store;
pub mod types;

// Re-exports
pub use config::{open_logger, LogBackend, LoggerConfig};
pub use error::{KvsError, Result};
pub use logger::{
    ErrorStream, FailurePolicy, FileTransactionLogger, LoggerOptions, Replay, ReplaySummary,
    SequenceValidator, SqliteTransactionLogger, TransactionLogger, DEFAULT_QUEUE_CAPACITY,
};
pub use service::{KeyValueService, ServiceState};
pub use store::Store;
pub use types::*;
