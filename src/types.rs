//! Core types shared by the store and the transaction loggers.

use crate::error::{KvsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an event in a transaction log.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    /// The following sequence, or `None` once the counter is exhausted.
    pub fn checked_next(self) -> Option<Self> {
        self.0.checked_add(1).map(Sequence)
    }
}

/// The mutation recorded by an event.
///
/// The numeric codes are part of the on-disk and relational formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    Delete = 1,
    Put = 2,
}

impl EventType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for EventType {
    type Error = u8;

    fn try_from(code: u8) -> std::result::Result<Self, u8> {
        match code {
            1 => Ok(EventType::Delete),
            2 => Ok(EventType::Put),
            other => Err(other),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Delete => write!(f, "DELETE"),
            EventType::Put => write!(f, "PUT"),
        }
    }
}

/// One entry in the transaction log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the logger when the event is persisted.
    pub sequence: Sequence,
    pub event_type: EventType,
    /// The key affected by this transaction.
    pub key: String,
    /// The value of a PUT; empty for a DELETE.
    pub value: String,
}

impl Event {
    pub fn put(sequence: Sequence, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            sequence,
            event_type: EventType::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(sequence: Sequence, key: impl Into<String>) -> Self {
        Self {
            sequence,
            event_type: EventType::Delete,
            key: key.into(),
            value: String::new(),
        }
    }
}

/// A mutation waiting in the intake queue; it has no sequence yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEvent {
    pub event_type: EventType,
    pub key: String,
    pub value: String,
}

impl PendingEvent {
    /// Build a pending event, rejecting empty keys.
    pub fn new(event_type: EventType, key: &str, value: &str) -> Result<Self> {
        validate_key(key)?;
        Ok(Self {
            event_type,
            key: key.to_string(),
            value: match event_type {
                EventType::Put => value.to_string(),
                EventType::Delete => String::new(),
            },
        })
    }

    pub fn into_event(self, sequence: Sequence) -> Event {
        Event {
            sequence,
            event_type: self.event_type,
            key: self.key,
            value: self.value,
        }
    }
}

/// Keys must be non-empty for both event kinds.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(KvsError::InvalidEvent("key must not be empty".into()));
    }
    Ok(())
}

/// Lifecycle of a transaction logger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoggerState {
    /// Constructed; replay is allowed, writes are not.
    Idle,
    /// The persistence worker is accepting events.
    Running,
    /// Shut down, or the worker stopped after a write failure.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_exhaustion() {
        assert_eq!(Sequence(41).checked_next(), Some(Sequence(42)));
        assert_eq!(Sequence(u64::MAX).checked_next(), None);
    }

    #[test]
    fn test_event_type_codes() {
        assert_eq!(EventType::Delete.code(), 1);
        assert_eq!(EventType::Put.code(), 2);
        assert_eq!(EventType::try_from(2), Ok(EventType::Put));
        assert_eq!(EventType::try_from(0), Err(0));
        assert_eq!(EventType::try_from(3), Err(3));
    }

    #[test]
    fn test_pending_delete_drops_value() {
        let pending = PendingEvent::new(EventType::Delete, "k", "ignored").unwrap();
        assert!(pending.value.is_empty());

        let event = pending.into_event(Sequence(4));
        assert_eq!(event, Event::delete(Sequence(4), "k"));
    }

    #[test]
    fn test_empty_key_rejected() {
        let result = PendingEvent::new(EventType::Put, "", "v");
        assert!(matches!(result, Err(KvsError::InvalidEvent(_))));
    }
}
