//! Decoding of the agent CLI's streamed output.
//!
//! The agent emits one JSON object per line on stdout (stream-json format).
//! Messages are kept as raw [`serde_json::Value`]s — the server stores and
//! forwards them without interpreting their schema. The only typed probe is
//! for the `{type:"system", subtype:"init"}` record, which carries the
//! session id used for conversational continuity.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Decode a stream of newline-delimited JSON values.
///
/// Lines that fail to parse are skipped with a warning rather than aborting
/// the decode — a partially-written or diagnostic line must not discard the
/// rest of an otherwise valid execution.
pub fn decode_json_lines(raw: &str) -> Vec<Value> {
    let mut values = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => values.push(value),
            Err(e) => {
                warn!(error = %e, "skipping unparseable agent output line");
            }
        }
    }
    values
}

/// Minimal view of a system-level stream record.
#[derive(Debug, Deserialize)]
struct SystemProbe {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

/// Extract the session id from the first `{type:"system", subtype:"init"}`
/// record in the stream, if any.
pub fn extract_session_id(messages: &[Value]) -> Option<String> {
    for message in messages {
        let Ok(probe) = serde_json::from_value::<SystemProbe>(message.clone()) else {
            continue;
        };
        if probe.kind == "system"
            && probe.subtype.as_deref() == Some("init")
            && let Some(session_id) = probe.session_id
        {
            return Some(session_id);
        }
    }
    None
}
