//! Transaction loggers.
//!
//! A transaction logger records every mutation applied to the [`Store`] so
//! that the store can be rebuilt after a restart. Two backends share one
//! contract:
//! - [`FileTransactionLogger`]: tab-separated lines in an append-only file
//! - [`SqliteTransactionLogger`]: rows in a `transactions` table
//!
//! Writes are submitted to a bounded intake queue and persisted by a single
//! background worker, which assigns sequence numbers. Persistence failures
//! are delivered on an [`ErrorStream`]. Replay produces a [`Replay`]: an
//! ordered event stream plus its own error stream.
//!
//! # Example
//!
//! ```ignore
//! let logger = FileTransactionLogger::open("transaction.log")?;
//! let store = Store::new();
//!
//! let summary = logger.read_events()?.apply_to(&store)?;
//! logger.run()?;
//!
//! store.put("color", "blue");
//! logger.write_put("color", "blue")?;
//!
//! logger.shutdown()?;
//! ```

mod file;
pub mod format;
mod pipeline;
mod sqlite;

pub use file::FileTransactionLogger;
pub use sqlite::SqliteTransactionLogger;

use crate::error::{KvsError, Result};
use crate::store::Store;
use crate::types::{Event, EventType, LoggerState, Sequence};
use crossbeam_channel::{never, select, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Default number of events that may wait for the persistence worker.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Default number of undelivered persistence errors kept for the orchestrator.
pub const DEFAULT_ERROR_CAPACITY: usize = 16;

/// What the persistence worker does after a failed write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Report the failure and stop; queued events are discarded and
    /// further writes fail with [`KvsError::LoggerClosed`].
    Stop,
    /// Report the failure and keep draining the queue.
    Continue,
}

/// Tuning shared by both backends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerOptions {
    /// Capacity of the intake queue; producers block when it is full.
    pub queue_capacity: usize,

    /// Capacity of the error stream; overflowing errors are only logged.
    pub error_capacity: usize,

    /// Failure policy; `None` uses the backend default
    /// (file: [`FailurePolicy::Stop`], sqlite: [`FailurePolicy::Continue`]).
    pub failure_policy: Option<FailurePolicy>,

    /// fsync the log file after every record (file backend only).
    pub sync_each_write: bool,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            error_capacity: DEFAULT_ERROR_CAPACITY,
            failure_policy: None,
            sync_each_write: false,
        }
    }
}

/// Durable, append-only record of store mutations.
pub trait TransactionLogger: Send + Sync {
    /// Queue a PUT event. Blocks only while the intake queue is full.
    fn write_put(&self, key: &str, value: &str) -> Result<()>;

    /// Queue a DELETE event. Blocks only while the intake queue is full.
    fn write_delete(&self, key: &str) -> Result<()>;

    /// Stream of persistence failures reported by the worker.
    fn errors(&self) -> ErrorStream;

    /// Read the whole log from the beginning.
    ///
    /// Only allowed before [`run`](Self::run).
    fn read_events(&self) -> Result<Replay>;

    /// Start the persistence worker. Fails if it was already started.
    fn run(&self) -> Result<()>;

    /// Close the intake queue, persist everything queued and release the sink.
    fn shutdown(&self) -> Result<()>;

    fn state(&self) -> LoggerState;

    /// Short backend name used in logs and errors.
    fn backend(&self) -> &'static str;
}

impl<T: TransactionLogger + ?Sized> TransactionLogger for Box<T> {
    fn write_put(&self, key: &str, value: &str) -> Result<()> {
        (**self).write_put(key, value)
    }

    fn write_delete(&self, key: &str) -> Result<()> {
        (**self).write_delete(key)
    }

    fn errors(&self) -> ErrorStream {
        (**self).errors()
    }

    fn read_events(&self) -> Result<Replay> {
        (**self).read_events()
    }

    fn run(&self) -> Result<()> {
        (**self).run()
    }

    fn shutdown(&self) -> Result<()> {
        (**self).shutdown()
    }

    fn state(&self) -> LoggerState {
        (**self).state()
    }

    fn backend(&self) -> &'static str {
        (**self).backend()
    }
}

/// Handle for observing persistence failures.
#[derive(Clone, Debug)]
pub struct ErrorStream {
    receiver: Receiver<KvsError>,
}

impl ErrorStream {
    pub(crate) fn new(receiver: Receiver<KvsError>) -> Self {
        Self { receiver }
    }

    /// Receive the next error (blocking).
    pub fn recv(&self) -> Option<KvsError> {
        self.receiver.recv().ok()
    }

    /// Try to receive an error (non-blocking).
    pub fn try_recv(&self) -> Option<KvsError> {
        match self.receiver.try_recv() {
            Ok(err) => Some(err),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<KvsError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(err) => Some(err),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take every error currently waiting without blocking.
    pub fn drain(&self) -> Vec<KvsError> {
        self.receiver.try_iter().collect()
    }
}

/// Checks that replayed sequence numbers strictly increase without gaps.
#[derive(Debug, Default)]
pub struct SequenceValidator {
    last: Option<Sequence>,
    highest: Sequence,
}

impl SequenceValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the next sequence read from the log.
    ///
    /// A decrease or a skipped number is returned as an error, but the
    /// sequence is still recorded so that checking continues from it.
    pub fn observe(&mut self, found: Sequence) -> Result<()> {
        let check = match self.last {
            Some(previous) if found <= previous => {
                Err(KvsError::SequenceOutOfOrder { previous, found })
            }
            // found > previous here, so previous + 1 cannot overflow
            Some(previous) if found.0 != previous.0 + 1 => Err(KvsError::SequenceGap {
                expected: Sequence(previous.0 + 1),
                found,
            }),
            _ => Ok(()),
        };

        self.last = Some(found);
        self.highest = self.highest.max(found);
        check
    }

    /// The most recently observed sequence.
    pub fn last(&self) -> Option<Sequence> {
        self.last
    }

    /// The largest sequence observed so far.
    pub fn highest(&self) -> Sequence {
        self.highest
    }
}

/// Counts from applying a replay to a store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub applied: u64,
    pub puts: u64,
    pub deletes: u64,
    pub last_sequence: Option<Sequence>,
}

impl ReplaySummary {
    fn record(&mut self, event: &Event) {
        self.applied += 1;
        match event.event_type {
            EventType::Put => self.puts += 1,
            EventType::Delete => self.deletes += 1,
        }
        self.last_sequence = Some(event.sequence);
    }
}

/// A one-shot, forward-only read of a transaction log.
///
/// Events arrive in stored order on [`events`](Self::events); problems found
/// while reading arrive on [`errors`](Self::errors). Both channels close when
/// the log is exhausted or reading fails.
pub struct Replay {
    events: Receiver<Event>,
    errors: Receiver<KvsError>,
    reader: Option<JoinHandle<()>>,
}

impl Replay {
    /// Run `read` on its own thread, feeding the returned channels.
    pub(crate) fn spawn<F>(name: &str, read: F) -> Result<Self>
    where
        F: FnOnce(Sender<Event>, Sender<KvsError>) + Send + 'static,
    {
        // Unbuffered, so the reader advances one record at a time
        let (event_tx, events) = crossbeam_channel::bounded(0);
        let (error_tx, errors) = unbounded();

        let reader = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || read(event_tx, error_tx))?;

        Ok(Self {
            events,
            errors,
            reader: Some(reader),
        })
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    pub fn errors(&self) -> &Receiver<KvsError> {
        &self.errors
    }

    /// Read the whole stream, keeping every event and every error.
    pub fn collect(self) -> (Vec<Event>, Vec<KvsError>) {
        // The error channel is unbounded, so the reader never waits on it
        let events: Vec<Event> = self.events.iter().collect();
        let mut errors: Vec<KvsError> = self.errors.iter().collect();
        if let Some(reader) = self.reader {
            if reader.join().is_err() {
                errors.push(KvsError::WorkerPanicked);
            }
        }
        (events, errors)
    }

    /// Apply every event to `store` in order.
    ///
    /// The first error seen on the error stream aborts the replay and is
    /// returned; events applied before it remain in the store.
    pub fn apply_to(self, store: &Store) -> Result<ReplaySummary> {
        let Replay {
            events,
            errors,
            reader,
        } = self;

        let mut summary = ReplaySummary::default();
        let closed_events = never::<Event>();
        let closed_errors = never::<KvsError>();
        let mut events_open = true;
        let mut errors_open = true;

        while events_open || errors_open {
            let event_rx = if events_open { &events } else { &closed_events };
            let error_rx = if errors_open { &errors } else { &closed_errors };

            select! {
                recv(error_rx) -> msg => match msg {
                    Ok(err) => return Err(err),
                    Err(_) => errors_open = false,
                },
                recv(event_rx) -> msg => match msg {
                    Ok(event) => {
                        debug!(sequence = event.sequence.0, kind = %event.event_type, "replaying event");
                        store.apply(&event);
                        summary.record(&event);
                    }
                    Err(_) => events_open = false,
                },
            }
        }

        if let Some(reader) = reader {
            reader.join().map_err(|_| KvsError::WorkerPanicked)?;
        }

        info!(
            applied = summary.applied,
            puts = summary.puts,
            deletes = summary.deletes,
            "replay complete"
        );
        Ok(summary)
    }
}
