//! In-memory key-value mapping.
//!
//! The store is the authoritative view of the data while the process runs.
//! It never touches I/O; durability comes from the transaction log that is
//! replayed into it on startup.

use crate::error::{KvsError, Result};
use crate::types::{Event, EventType};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Concurrent string-to-string map with reader/writer locking.
///
/// Readers proceed in parallel; a writer excludes everyone else for the
/// duration of its mutation.
#[derive(Debug, Default)]
pub struct Store {
    entries: RwLock<HashMap<String, String>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `key`.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().insert(key.into(), value.into());
    }

    /// Get the value for `key`.
    pub fn get(&self, key: &str) -> Result<String> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| KvsError::NoSuchKey(key.to_string()))
    }

    /// Remove `key`. Removing an absent key is not an error.
    pub fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Apply a logged event.
    pub fn apply(&self, event: &Event) {
        match event.event_type {
            EventType::Put => self.put(event.key.as_str(), event.value.as_str()),
            EventType::Delete => self.delete(&event.key),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries.read().clone()
    }
}
