//! Startup replay and request orchestration.
//!
//! `KeyValueService` owns a [`Store`] and a [`TransactionLogger`]. It
//! rebuilds the store from the log before accepting traffic, then applies
//! every mutation to the store and submits the matching event to the log.

use crate::error::{KvsError, Result};
use crate::logger::{ErrorStream, ReplaySummary, TransactionLogger};
use crate::store::Store;
use crate::types::{validate_key, LoggerState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info};

/// Lifecycle of the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Replaying,
    Live,
}

pub struct KeyValueService<L: TransactionLogger> {
    store: Store,
    logger: L,
    errors: ErrorStream,
    /// Held across the store update and the log submit so that the
    /// store and the log see mutations in the same order.
    writes: Mutex<()>,
    state: ServiceState,
    persistence_failures: AtomicU64,
}

impl<L: TransactionLogger> KeyValueService<L> {
    /// Wrap a store and an idle logger; call [`initialize`](Self::initialize) next.
    pub fn new(store: Store, logger: L) -> Self {
        let errors = logger.errors();
        Self {
            store,
            logger,
            errors,
            writes: Mutex::new(()),
            state: ServiceState::Uninitialized,
            persistence_failures: AtomicU64::new(0),
        }
    }

    /// Build a service over an empty store and bring it live.
    pub fn start(logger: L) -> Result<(Self, ReplaySummary)> {
        let mut service = Self::new(Store::new(), logger);
        let summary = service.initialize()?;
        Ok((service, summary))
    }

    /// Replay the log into the store, then start the persistence worker.
    ///
    /// Any error seen during replay is fatal and leaves the service
    /// uninitialized; events applied before the error stay in the store.
    pub fn initialize(&mut self) -> Result<ReplaySummary> {
        if self.state != ServiceState::Uninitialized {
            return Err(KvsError::AlreadyRunning);
        }

        self.state = ServiceState::Replaying;
        info!(backend = self.logger.backend(), "replaying transaction log");

        let summary = match self
            .logger
            .read_events()
            .and_then(|replay| replay.apply_to(&self.store))
            .and_then(|summary| self.logger.run().map(|()| summary))
        {
            Ok(summary) => summary,
            Err(e) => {
                error!(backend = self.logger.backend(), error = %e, "startup replay failed");
                self.state = ServiceState::Uninitialized;
                return Err(e);
            }
        };

        self.state = ServiceState::Live;
        info!(
            backend = self.logger.backend(),
            applied = summary.applied,
            keys = self.store.len(),
            "service live"
        );
        Ok(summary)
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Store `value` under `key` and log the change.
    ///
    /// The store is updated before the event is queued, so a logging
    /// failure leaves the new value visible but not durable.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_live()?;
        validate_key(key)?;

        let _order = self.writes.lock();
        self.store.put(key, value);
        self.logger.write_put(key, value)
    }

    pub fn get(&self, key: &str) -> Result<String> {
        self.ensure_live()?;
        self.store.get(key)
    }

    /// Remove `key` and log the change. Removing an absent key succeeds.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.ensure_live()?;
        validate_key(key)?;

        let _order = self.writes.lock();
        self.store.delete(key);
        self.logger.write_delete(key)
    }

    /// Check that writes are still being persisted.
    ///
    /// Drains pending persistence errors without blocking and fails on
    /// the first one, or when the logger has stopped.
    pub fn health_check(&self) -> Result<()> {
        let mut first = None;
        for err in self.errors.drain() {
            self.persistence_failures.fetch_add(1, Ordering::Relaxed);
            error!(backend = self.logger.backend(), error = %err, "persistence failure");
            if first.is_none() {
                first = Some(err);
            }
        }
        if let Some(err) = first {
            return Err(err);
        }

        match self.logger.state() {
            LoggerState::Running => Ok(()),
            LoggerState::Idle => Err(KvsError::NotRunning),
            LoggerState::Stopped => Err(KvsError::LoggerClosed),
        }
    }

    /// Persistence errors observed by [`health_check`](Self::health_check) so far.
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn logger(&self) -> &L {
        &self.logger
    }

    /// Persist everything queued, stop the logger and hand back the store.
    pub fn shutdown(self) -> Result<Store> {
        self.logger.shutdown()?;
        info!(backend = self.logger.backend(), "service stopped");
        Ok(self.store)
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state {
            ServiceState::Live => Ok(()),
            ServiceState::Uninitialized | ServiceState::Replaying => Err(KvsError::NotRunning),
        }
    }
}
