//! File-backed transaction logger.

use super::format::{decode_line, encode_line_parts, peek_sequence};
use super::pipeline::{EventSink, Pipeline};
use super::{ErrorStream, FailurePolicy, LoggerOptions, Replay, SequenceValidator, TransactionLogger};
use crate::error::{KvsError, Result};
use crate::types::{Event, EventType, LoggerState, PendingEvent, Sequence};
use crossbeam_channel::Sender;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const BACKEND: &str = "file";

/// Transaction logger writing one tab-separated line per event.
///
/// The log file is locked exclusively for the lifetime of the logger.
pub struct FileTransactionLogger {
    pipeline: Pipeline,
    path: PathBuf,
    /// Locked handle; the worker writes through a clone of it.
    file: File,
    sync_each_write: bool,
}

impl FileTransactionLogger {
    /// Open or create the log at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(path, LoggerOptions::default())
    }

    /// Open or create the log at `path`.
    pub fn with_options(path: impl AsRef<Path>, options: LoggerOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| KvsError::LogOpen {
                target: path.display().to_string(),
                reason: e.to_string(),
            })?;

        FileExt::try_lock_exclusive(&file).map_err(|_| KvsError::Locked)?;

        info!(path = %path.display(), "opened transaction log");

        Ok(Self {
            pipeline: Pipeline::new(BACKEND, &options, FailurePolicy::Stop),
            path,
            file,
            sync_each_write: options.sync_each_write,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.pipeline.failure_policy()
    }
}

impl TransactionLogger for FileTransactionLogger {
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

        let reader = BufReader::new(File::open(&self.path)?);
        Replay::spawn("kvs-file-replay", move |events, errors| {
            replay_lines(reader, &events, &errors)
        })
    }

    fn run(&self) -> Result<()> {
        self.pipeline.ensure_idle()?;

        // The counter always continues from what is on disk, replayed or not
        let last = last_sequence_on_disk(&self.path)?;
        let sink = FileSink {
            writer: self.file.try_clone()?,
            last,
            sync_each_write: self.sync_each_write,
        };
        info!(path = %self.path.display(), last_sequence = last.0, "starting file writer");

        self.pipeline.start(sink)
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

struct FileSink {
    writer: File,
    last: Sequence,
    sync_each_write: bool,
}

impl EventSink for FileSink {
    fn append(&mut self, event: &PendingEvent) -> Result<Sequence> {
        let sequence = self.last.checked_next().ok_or_else(|| {
            KvsError::InvalidEvent(format!("sequence space exhausted after {}", self.last))
        })?;
        let line = encode_line_parts(sequence, event.event_type, &event.key, &event.value);

        // Unbuffered: each record reaches the file before the next is taken
        self.writer.write_all(line.as_bytes())?;
        if self.sync_each_write {
            self.writer.sync_data()?;
        }

        self.last = sequence;
        Ok(sequence)
    }

    fn close(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.sync_all()?;
        Ok(())
    }
}

/// Stream every line of `reader` as events.
///
/// Sequence problems are reported and reading continues; a malformed or
/// truncated line is reported and ends the stream.
fn replay_lines<R: BufRead>(mut reader: R, events: &Sender<Event>, errors: &Sender<KvsError>) {
    let mut validator = SequenceValidator::new();
    let mut buf = Vec::new();
    let mut line_no = 0u64;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                let _ = errors.send(KvsError::Io(e));
                break;
            }
        }
        line_no += 1;

        if buf.pop() != Some(b'\n') {
            let _ = errors.send(KvsError::ReplayParse {
                line: line_no,
                reason: "truncated record: missing line terminator".into(),
            });
            break;
        }

        let event = match std::str::from_utf8(&buf)
            .map_err(|e| format!("invalid UTF-8: {}", e))
            .and_then(decode_line)
        {
            Ok(event) => event,
            Err(reason) => {
                let _ = errors.send(KvsError::ReplayParse {
                    line: line_no,
                    reason,
                });
                break;
            }
        };

        if let Err(warning) = validator.observe(event.sequence) {
            warn!(line = line_no, error = %warning, "transaction log sequence check failed");
            if errors.send(warning).is_err() {
                break;
            }
        }

        if events.send(event).is_err() {
            // Consumer went away
            break;
        }
    }
}

/// Highest sequence number found in the log, skipping unreadable lines.
fn last_sequence_on_disk(path: &Path) -> Result<Sequence> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    let mut highest = 0u64;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if let Some(seq) = std::str::from_utf8(&buf).ok().and_then(peek_sequence) {
            highest = highest.max(seq);
        }
    }

    Ok(Sequence(highest))
}
