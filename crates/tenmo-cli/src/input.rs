//! Newline-delimited JSON event input.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tenmo::{Event, EventId};

/// Parse one event per non-blank line.
///
/// Objects without an `event_id` get a fresh time-ordered one, so ids still
/// sort in input order.
pub fn parse_events(text: &str) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lineno = index + 1;

        let mut value: Value =
            serde_json::from_str(line).with_context(|| format!("line {lineno}: invalid JSON"))?;
        let Some(object) = value.as_object_mut() else {
            bail!("line {lineno}: expected a JSON object");
        };
        if !object.contains_key("event_id") {
            object.insert(
                "event_id".to_string(),
                Value::String(EventId::generate().to_string()),
            );
        }

        let event = serde_json::from_value(value)
            .with_context(|| format!("line {lineno}: not a valid event"))?;
        events.push(event);
    }
    Ok(events)
}
