//! Node event-stream message parsing.
//!
//! Current Gradio queues send `{"msg": "<kind>", ...}` with the body
//! inline. Older node builds send `{"type": "<kind>", "data": {...}}`.
//! Both are folded into one tagged [`NodeEvent`]; the body is kept as raw
//! JSON for the normalization strategies in [`crate::normalize`].

use serde_json::Value;

/// Kind of a node event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Queue position / ETA estimate.
    Queued,
    /// The node started working on the task.
    Started,
    /// A progress tick.
    Progress,
    /// Intermediate output (live preview, partial gallery).
    Generating,
    /// The task finished successfully.
    Completed,
    /// The task finished with an error.
    Failed,
    Heartbeat,
    /// The node is about to close the stream.
    Closed,
    /// A kind we do not recognise. Carried for logging only.
    Unknown(String),
}

impl EventKind {
    fn from_name(name: &str) -> Self {
        match name {
            "estimation" | "send_hash" | "send_data" | "status" => EventKind::Queued,
            "process_starts" | "execution_start" | "executing" => EventKind::Started,
            "progress" => EventKind::Progress,
            "process_generating" | "executed" => EventKind::Generating,
            "process_completed" | "execution_success" => EventKind::Completed,
            "execution_error" | "unexpected_error" => EventKind::Failed,
            "heartbeat" => EventKind::Heartbeat,
            "close_stream" => EventKind::Closed,
            other => EventKind::Unknown(other.to_string()),
        }
    }
}

/// One parsed event.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvent {
    pub kind: EventKind,
    /// Event body: the whole message for `msg` framing, `data` for `type`
    /// framing.
    pub body: Value,
}

impl NodeEvent {
    /// Best human-readable error text carried by a failure event.
    pub fn error_message(&self) -> Option<String> {
        let candidates = [
            self.body.pointer("/output/error"),
            self.body.get("error"),
            self.body.get("exception_message"),
            self.body.get("message"),
        ];
        candidates
            .into_iter()
            .flatten()
            .find_map(|v| v.as_str().filter(|s| !s.is_empty()).map(str::to_string))
    }
}

/// Parse one `data:` payload.
///
/// Returns `None` for non-JSON payloads and messages without a kind;
/// callers treat those as protocol noise.
pub fn parse_event(text: &str) -> Option<NodeEvent> {
    let value: Value = serde_json::from_str(text).ok()?;

    if let Some(name) = value.get("msg").and_then(Value::as_str) {
        let mut kind = EventKind::from_name(name);
        if kind == EventKind::Completed
            && value.get("success").and_then(Value::as_bool) == Some(false)
        {
            kind = EventKind::Failed;
        }
        return Some(NodeEvent { kind, body: value });
    }

    let name = value.get("type").and_then(Value::as_str)?;
    let kind = EventKind::from_name(name);
    let body = value.get("data").cloned().unwrap_or(Value::Null);
    Some(NodeEvent { kind, body })
}
