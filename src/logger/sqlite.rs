//! Relational transaction logger backed by SQLite.
//!
//! Events are rows in a `transactions` table. The database assigns the
//! sequence through an autoincrement primary key.

use super::pipeline::{EventSink, Pipeline};
use super::{ErrorStream, FailurePolicy, LoggerOptions, Replay, SequenceValidator, TransactionLogger};
use crate::error::{KvsError, Result};
use crate::types::{Event, EventType, LoggerState, PendingEvent, Sequence};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const BACKEND: &str = "sqlite";

const TABLE_EXISTS: &str = "SELECT EXISTS (
    SELECT 1 FROM sqlite_master
    WHERE type = 'table' AND name = 'transactions'
)";

const CREATE_TABLE: &str = "CREATE TABLE transactions (
    sequence   INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type INTEGER NOT NULL,
    key        TEXT NOT NULL,
    value      TEXT NOT NULL
)";

const INSERT_EVENT: &str = "INSERT INTO transactions (event_type, key, value) VALUES (?1, ?2, ?3)";

const SELECT_EVENTS: &str =
    "SELECT sequence, event_type, key, value FROM transactions ORDER BY sequence";

/// Transaction logger storing one row per event.
pub struct SqliteTransactionLogger {
    pipeline: Pipeline,
    /// Used by replay before `run`, then only by the worker.
    conn: Arc<Mutex<Connection>>,
    target: String,
}

impl SqliteTransactionLogger {
    /// Open or create the database at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(path, LoggerOptions::default())
    }

    /// Open or create the database at `path`.
    pub fn with_options(path: impl AsRef<Path>, options: LoggerOptions) -> Result<Self> {
        let target = path.as_ref().display().to_string();
        let conn = Connection::open(path.as_ref()).map_err(|e| KvsError::LogOpen {
            target: target.clone(),
            reason: e.to_string(),
        })?;
        Self::from_connection(conn, target, options)
    }

    /// A private in-memory database, lost when the logger is dropped.
    pub fn open_in_memory() -> Result<Self> {
        Self::in_memory_with_options(LoggerOptions::default())
    }

    pub fn in_memory_with_options(options: LoggerOptions) -> Result<Self> {
        let target = ":memory:".to_string();
        let conn = Connection::open_in_memory().map_err(|e| KvsError::LogOpen {
            target: target.clone(),
            reason: e.to_string(),
        })?;
        Self::from_connection(conn, target, options)
    }

    fn from_connection(conn: Connection, target: String, options: LoggerOptions) -> Result<Self> {
        let open_err = |e: rusqlite::Error| KvsError::LogOpen {
            target: target.clone(),
            reason: e.to_string(),
        };

        // Fail fast if the database is unusable
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(open_err)?;

        let exists: bool = conn
            .query_row(TABLE_EXISTS, [], |row| row.get(0))
            .map_err(open_err)?;
        if !exists {
            conn.execute(CREATE_TABLE, []).map_err(open_err)?;
            info!(database = %target, "created transactions table");
        }

        info!(database = %target, "opened transaction database");

        Ok(Self {
            pipeline: Pipeline::new(BACKEND, &options, FailurePolicy::Continue),
            conn: Arc::new(Mutex::new(conn)),
            target,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.pipeline.failure_policy()
    }
}

impl TransactionLogger for SqliteTransactionLogger {
    fn write_put(&self, key: &str, value: &str) -> Result<()> {
        self.pipeline
            .submit(PendingEvent::new(EventType::Put, key, value)?)
    }

    fn write_delete(&self, key: &str) -> Result<()> {
        self.pipeline
            .submit(PendingEvent::new(EventType::Delete, key, "")?)
    }

    fn errors(&self) -> ErrorStream {
        self.pipeline.errors()
    }

    fn read_events(&self) -> Result<Replay> {
        self.pipeline.ensure_idle()?;

        let conn = Arc::clone(&self.conn);
        Replay::spawn("kvs-sqlite-replay", move |events, errors| {
            let conn = conn.lock();
            replay_rows(&conn, &events, &errors);
        })
    }

    fn run(&self) -> Result<()> {
        self.pipeline.start(SqliteSink {
            conn: Arc::clone(&self.conn),
        })
    }

    fn shutdown(&self) -> Result<()> {
        self.pipeline.shutdown()
    }

    fn state(&self) -> LoggerState {
        self.pipeline.state()
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}

struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
}

impl EventSink for SqliteSink {
    fn append(&mut self, event: &PendingEvent) -> Result<Sequence> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(INSERT_EVENT)?;
        stmt.execute(params![
            i64::from(event.event_type.code()),
            event.key,
            event.value
        ])?;

        sequence_from_rowid(conn.last_insert_rowid())
    }

    fn close(&mut self) -> Result<()> {
        // Autocommit has already made every insert durable
        Ok(())
    }
}

fn sequence_from_rowid(rowid: i64) -> Result<Sequence> {
    u64::try_from(rowid)
        .map(Sequence)
        .map_err(|_| KvsError::PersistenceWrite {
            backend: BACKEND,
            reason: format!("database assigned negative sequence {}", rowid),
        })
}

/// Stream every row of the transactions table as events.
///
/// Query and decode failures are reported and end the stream.
fn replay_rows(conn: &Connection, events: &Sender<Event>, errors: &Sender<KvsError>) {
    let mut stmt = match conn.prepare(SELECT_EVENTS) {
        Ok(stmt) => stmt,
        Err(e) => {
            let _ = errors.send(e.into());
            return;
        }
    };
    let mut rows = match stmt.query([]) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = errors.send(e.into());
            return;
        }
    };

    let mut validator = SequenceValidator::new();
    let mut row_no = 0u64;

    loop {
        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) => {
                let _ = errors.send(e.into());
                return;
            }
        };
        row_no += 1;

        let event = match event_from_row(row, row_no) {
            Ok(event) => event,
            Err(e) => {
                let _ = errors.send(e);
                return;
            }
        };

        if let Err(warning) = validator.observe(event.sequence) {
            warn!(row = row_no, error = %warning, "transaction table sequence check failed");
            if errors.send(warning).is_err() {
                return;
            }
        }

        if events.send(event).is_err() {
            return;
        }
    }
}

fn event_from_row(row: &Row<'_>, row_no: u64) -> Result<Event> {
    let sequence: i64 = row.get(0)?;
    let code: i64 = row.get(1)?;
    let key: String = row.get(2)?;
    let value: String = row.get(3)?;

    let malformed = |reason: String| KvsError::ReplayParse {
        line: row_no,
        reason,
    };

    let sequence =
        u64::try_from(sequence).map_err(|_| malformed(format!("negative sequence {}", sequence)))?;
    let event_type = u8::try_from(code)
        .ok()
        .and_then(|c| EventType::try_from(c).ok())
        .ok_or_else(|| malformed(format!("unknown event type {}", code)))?;
    if key.is_empty() {
        return Err(malformed("empty key".into()));
    }

    Ok(Event {
        sequence: Sequence(sequence),
        event_type,
        key,
        value,
    })
}
