use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::message::{Message, ToolCall};
use crate::tool::ToolCategory;

// NOTE: Event model goals
//
// 1. Ordering: events mirror file-byte order within a session; lifecycle
//    events bracket the parsed stream (session_start first, session_end last).
// 2. Self-description: every event carries the envelope (timestamp,
//    session_id, agent_id) so sinks never need the originating file.
// 3. Acyclicity: tool_call_completed embeds value snapshots of the request
//    and response messages, never back-pointers into session state.

/// A typed record emitted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// RFC3339 UTC, sub-second precision preserved from the wire.
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    /// Set for sidechain traffic, null on the main thread.
    pub agent_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// True for error events and for tool traffic that reported a failure.
    pub fn is_error_like(&self) -> bool {
        match &self.payload {
            EventPayload::Error { .. } => true,
            EventPayload::ToolResult { is_error, .. } => *is_error,
            EventPayload::ToolCallCompleted { is_error, .. } => *is_error,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    Message {
        message: Message,
    },
    ToolUse {
        tool_name: String,
        tool_category: ToolCategory,
        tool_input: Value,
        tool_use_id: String,
        message: Message,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
        message: Message,
    },
    ToolCallCompleted {
        tool_name: String,
        is_error: bool,
        duration_seconds: f64,
        /// Full pairing record; carried in memory, not on the wire.
        #[serde(skip)]
        tool_call: Option<Box<ToolCall>>,
    },
    Error {
        error_message: String,
        raw_entry: Value,
    },
    SessionStart {
        project_slug: String,
        file_path: PathBuf,
        cwd: Option<String>,
    },
    SessionIdle {
        idle_since: DateTime<Utc>,
    },
    SessionResume {
        idle_duration_seconds: f64,
    },
    SessionEnd {
        reason: EndReason,
        idle_duration_seconds: f64,
        message_count: u64,
        tool_count: u64,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Message { .. } => EventKind::Message,
            EventPayload::ToolUse { .. } => EventKind::ToolUse,
            EventPayload::ToolResult { .. } => EventKind::ToolResult,
            EventPayload::ToolCallCompleted { .. } => EventKind::ToolCallCompleted,
            EventPayload::Error { .. } => EventKind::Error,
            EventPayload::SessionStart { .. } => EventKind::SessionStart,
            EventPayload::SessionIdle { .. } => EventKind::SessionIdle,
            EventPayload::SessionResume { .. } => EventKind::SessionResume,
            EventPayload::SessionEnd { .. } => EventKind::SessionEnd,
        }
    }
}

/// Registration tag for handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    ToolUse,
    ToolResult,
    ToolCallCompleted,
    Error,
    SessionStart,
    SessionIdle,
    SessionResume,
    SessionEnd,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Message,
        EventKind::ToolUse,
        EventKind::ToolResult,
        EventKind::ToolCallCompleted,
        EventKind::Error,
        EventKind::SessionStart,
        EventKind::SessionIdle,
        EventKind::SessionResume,
        EventKind::SessionEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::ToolUse => "tool_use",
            EventKind::ToolResult => "tool_result",
            EventKind::ToolCallCompleted => "tool_call_completed",
            EventKind::Error => "error",
            EventKind::SessionStart => "session_start",
            EventKind::SessionIdle => "session_idle",
            EventKind::SessionResume => "session_resume",
            EventKind::SessionEnd => "session_end",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    IdleTimeout,
    FileGone,
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::IdleTimeout => "idle_timeout",
            EndReason::FileGone => "file_gone",
            EndReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
