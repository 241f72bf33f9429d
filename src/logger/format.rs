//! Line format for the file-backed transaction log.
//!
//! One record per line: `sequence \t event_type \t key \t value \n`.
//! Backslash, tab, newline and carriage return inside keys and values are
//! escaped so a record always occupies exactly one line.

use crate::types::{Event, EventType, Sequence};

/// Encode an event as a complete, newline-terminated line.
pub fn encode_line(event: &Event) -> String {
    encode_line_parts(event.sequence, event.event_type, &event.key, &event.value)
}

/// Encode the fields of an event without building an [`Event`].
pub fn encode_line_parts(
    sequence: Sequence,
    event_type: EventType,
    key: &str,
    value: &str,
) -> String {
    let mut line = String::with_capacity(key.len() + value.len() + 24);
    line.push_str(&sequence.0.to_string());
    line.push('\t');
    line.push_str(&event_type.code().to_string());
    line.push('\t');
    escape_into(key, &mut line);
    line.push('\t');
    escape_into(value, &mut line);
    line.push('\n');
    line
}

/// Decode one line (without its terminator) into an event.
///
/// Returns a human-readable reason on failure.
pub fn decode_line(line: &str) -> Result<Event, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 4 {
        return Err(format!("expected 4 fields, found {}", fields.len()));
    }

    let sequence = fields[0]
        .parse::<u64>()
        .map_err(|e| format!("bad sequence {:?}: {}", fields[0], e))?;

    let code = fields[1]
        .parse::<u8>()
        .map_err(|e| format!("bad event type {:?}: {}", fields[1], e))?;
    let event_type =
        EventType::try_from(code).map_err(|c| format!("unknown event type {}", c))?;

    let key = unescape(fields[2])?;
    if key.is_empty() {
        return Err("empty key".into());
    }
    let value = unescape(fields[3])?;

    Ok(Event {
        sequence: Sequence(sequence),
        event_type,
        key,
        value,
    })
}

/// Sequence number of a line, if its first field parses.
pub fn peek_sequence(line: &str) -> Option<u64> {
    line.split('\t').next()?.parse().ok()
}

fn escape_into(raw: &str, out: &mut String) {
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
}

fn unescape(field: &str) -> Result<String, String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => return Err(format!("invalid escape \\{}", other)),
            None => return Err("dangling escape at end of field".into()),
        }
    }
    Ok(out)
}
