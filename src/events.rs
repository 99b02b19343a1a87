//! Event protocol between the sandbox agent, the orchestrator, and the caller.
//!
//! Events travel as line-delimited frames:
//!
//! ```text
//! event: text_delta
//! data: {"seq":3,"text":"hello"}
//!
//! ```
//!
//! Every event relayed to a caller carries a monotonically increasing `seq`
//! so the consumer can detect gaps and reordering.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Event type names in the caller contract.
pub mod kind {
    pub const SESSION_START: &str = "session_start";
    pub const TEXT_DELTA: &str = "text_delta";
    pub const THINKING: &str = "thinking";
    pub const TOOL_PROGRESS: &str = "tool_progress";
    pub const TOOL_RESULT: &str = "tool_result";
    pub const SUBAGENT_START: &str = "subagent_start";
    pub const SUBAGENT_STOP: &str = "subagent_stop";
    pub const PROGRESS: &str = "progress";
    pub const TITLE: &str = "title";
    pub const PING: &str = "ping";
    pub const ERROR: &str = "error";
    pub const CONTAINER_RECOVERED: &str = "container_recovered";
    pub const RESULT: &str = "result";
    pub const DONE: &str = "done";
}

/// One event on the caller-facing stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonically increasing sequence number within one stream.
    pub seq: u64,
    /// Event type tag.
    pub event: String,
    /// Event payload.
    pub data: Value,
}

impl Event {
    pub fn new(seq: u64, event: &str, data: Value) -> Self {
        Self {
            seq,
            event: event.to_string(),
            data,
        }
    }

    /// Render the event as a wire frame.
    pub fn to_frame(&self) -> String {
        let mut data = self.data.clone();
        if let Value::Object(ref mut map) = data {
            map.insert("seq".to_string(), json!(self.seq));
        }
        format!("event: {}\ndata: {}\n\n", self.event, data)
    }
}

/// Hands out sequence numbers for one stream.
#[derive(Debug, Default)]
pub struct SequenceCounter(u64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

/// Build an `error` event.
pub fn error_event(seq: u64, error_type: &str, message: &str, recoverable: bool) -> Event {
    Event::new(
        seq,
        kind::ERROR,
        json!({
            "error_type": error_type,
            "message": message,
            "recoverable": recoverable,
        }),
    )
}

/// Build the `container_recovered` event. When emitted it is always the last
/// event on the stream.
pub fn container_recovered_event(seq: u64) -> Event {
    Event::new(
        seq,
        kind::CONTAINER_RECOVERED,
        json!({
            "message": "Container recovered",
            "recovered": true,
            "retry_recommended": true,
        }),
    )
}

/// Build the terminal `done` event.
pub fn done_event(seq: u64, status: &str, duration_ms: u64) -> Event {
    Event::new(
        seq,
        kind::DONE,
        json!({
            "status": status,
            "duration_ms": duration_ms,
        }),
    )
}

/// A frame received from the sandbox agent before re-sequencing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub event: String,
    pub data: Value,
}

/// Incremental parser for the agent's frame stream.
///
/// Frames are separated by a blank line. Bytes are buffered until a full
/// frame is available, so chunk boundaries may fall anywhere.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every complete frame it closed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let frame_str = self.buf[..pos].to_string();
            self.buf.drain(..pos + 2);
            if let Some(frame) = parse_frame(&frame_str) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_frame(frame_str: &str) -> Option<RawFrame> {
    let mut event = "message".to_string();
    let mut data_str = "";

    for line in frame_str.trim().lines() {
        if let Some(rest) = line.strip_prefix("event: ") {
            event = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data_str = rest;
        }
    }

    if data_str.is_empty() {
        return None;
    }

    let data = serde_json::from_str(data_str).unwrap_or_else(|_| json!({ "raw": data_str }));
    Some(RawFrame { event, data })
}
