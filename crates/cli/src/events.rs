//! Newline-delimited JSON event sink shared by every command.

use std::io::Write;

use serde::Serialize;

/// Writes one JSON object per line to an output stream, tagging each with
/// an event name so a GUI (or a script) can dispatch on it without parsing
/// free-form text.
pub(crate) struct Emitter<'a, Out: Write> {
    out: &'a mut Out,
}

impl<'a, Out: Write> Emitter<'a, Out> {
    pub(crate) fn new(out: &'a mut Out) -> Self {
        Self { out }
    }

    /// Serializes `payload` under `{"event": name, ...payload}` and writes
    /// it as a single line. Serialization failures are logged, not
    /// propagated — losing one diagnostic line should never abort a
    /// command that otherwise succeeded.
    pub(crate) fn emit(&mut self, name: &str, payload: &impl Serialize) {
        let mut value = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("event".to_string(), serde_json::Value::String(name.to_string()));
        }
        match serde_json::to_string(&value) {
            Ok(line) => {
                if writeln!(self.out, "{line}").is_err() {
                    tracing::warn!("failed to write event to stdout");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
        }
    }
}
