//! Logger configuration supplied by the orchestrator.

use crate::error::Result;
use crate::logger::{
    FileTransactionLogger, LoggerOptions, SqliteTransactionLogger, TransactionLogger,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the transaction log lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogBackend {
    /// Tab-separated text file.
    File { path: PathBuf },
    /// SQLite database file.
    Sqlite { path: PathBuf },
    /// SQLite database held in memory; nothing survives the process.
    SqliteInMemory,
}

impl Default for LogBackend {
    fn default() -> Self {
        LogBackend::File {
            path: PathBuf::from("transaction.log"),
        }
    }
}

/// Transaction logger configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default)]
    pub backend: LogBackend,

    #[serde(flatten)]
    pub options: LoggerOptions,
}

impl LoggerConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: LogBackend::File { path: path.into() },
            options: LoggerOptions::default(),
        }
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: LogBackend::Sqlite { path: path.into() },
            options: LoggerOptions::default(),
        }
    }
}

/// Construct the logger described by `config`.
///
/// Fails when the sink cannot be opened; the logger is returned idle.
pub fn open_logger(config: &LoggerConfig) -> Result<Box<dyn TransactionLogger>> {
    let options = config.options.clone();
    let logger: Box<dyn TransactionLogger> = match &config.backend {
        LogBackend::File { path } => Box::new(FileTransactionLogger::with_options(path, options)?),
        LogBackend::Sqlite { path } => {
            Box::new(SqliteTransactionLogger::with_options(path, options)?)
        }
        LogBackend::SqliteInMemory => {
            Box::new(SqliteTransactionLogger::in_memory_with_options(options)?)
        }
    };
    Ok(logger)
}
