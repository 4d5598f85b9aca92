use chrono::{DateTime, Utc};
use serde_json::Value;

use livetrace_types::{
    ContentBlock, EventPayload, Message, RawContentBlock, Role, SessionEvent, ToolCategory,
    ToolResultBlock, ToolUseBlock, TranscriptEntry,
};

use crate::tailer::TailedLine;

pub const DEFAULT_MAX_INPUT_LENGTH: usize = 1024;

/// Translates one JSONL entry into zero or more events.
///
/// The parser is stateless across entries; tool pairing lives in the live
/// session tracker.
#[derive(Debug, Clone)]
pub struct EntryParser {
    truncate_inputs: bool,
    max_input_length: usize,
}

impl Default for EntryParser {
    fn default() -> Self {
        EntryParser {
            truncate_inputs: true,
            max_input_length: DEFAULT_MAX_INPUT_LENGTH,
        }
    }
}

impl EntryParser {
    pub fn new(truncate_inputs: bool, max_input_length: usize) -> Self {
        EntryParser {
            truncate_inputs,
            max_input_length,
        }
    }

    /// Parse one tailed line, mapping malformed JSON to an `error` event.
    pub fn parse_line(&self, line: &TailedLine, default_agent_id: Option<&str>) -> Vec<SessionEvent> {
        match line {
            TailedLine::Entry(value) => self.parse_entry(value, default_agent_id),
            TailedLine::Malformed { raw, error } => vec![error_event(
                format!("malformed JSON line: {}", error),
                Value::String(raw.clone()),
                None,
            )],
        }
    }

    /// Parse one decoded JSON entry.
    ///
    /// `default_agent_id` backfills sidechain entries that omit `agentId`,
    /// trusting the first non-null value seen earlier in the same file.
    pub fn parse_entry(&self, raw: &Value, default_agent_id: Option<&str>) -> Vec<SessionEvent> {
        let session_hint = raw
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let entry: TranscriptEntry = match serde_json::from_value(raw.clone()) {
            Ok(entry) => entry,
            Err(err) => {
                return vec![error_event(
                    format!("schema violation: {}", err),
                    raw.clone(),
                    session_hint,
                )];
            }
        };

        let record = match entry.record() {
            Some(record) => record,
            None => {
                return vec![error_event(
                    "unknown entry type".to_string(),
                    raw.clone(),
                    session_hint,
                )];
            }
        };

        let timestamp = match DateTime::parse_from_rfc3339(&record.timestamp) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(err) => {
                return vec![error_event(
                    format!("invalid timestamp {:?}: {}", record.timestamp, err),
                    raw.clone(),
                    session_hint,
                )];
            }
        };

        let role = match record.message.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return vec![error_event(
                    format!("invalid role {:?}", other),
                    raw.clone(),
                    session_hint,
                )];
            }
        };

        let agent_id = record
            .agent_id
            .clone()
            .or_else(|| default_agent_id.map(|s| s.to_string()));
        if record.is_sidechain && agent_id.is_none() {
            return vec![error_event(
                "sidechain entry missing agentId".to_string(),
                raw.clone(),
                session_hint,
            )];
        }
        let agent_id = if record.is_sidechain { agent_id } else { None };

        let mut content = Vec::new();
        for block in &record.message.content {
            match block {
                RawContentBlock::Text { text } => content.push(ContentBlock::Text(text.clone())),
                RawContentBlock::ToolUse { id, name, input } => {
                    content.push(ContentBlock::ToolUse(ToolUseBlock {
                        id: id.clone(),
                        name: name.clone(),
                        input: self.prepare_input(input),
                    }));
                }
                RawContentBlock::ToolResult {
                    tool_use_id,
                    content: result_content,
                    is_error,
                } => {
                    content.push(ContentBlock::ToolResult(ToolResultBlock {
                        tool_use_id: tool_use_id.clone(),
                        content: RawContentBlock::coerce_result_content(result_content.as_ref()),
                        is_error: *is_error,
                    }));
                }
                // Forward compatible: unknown blocks are dropped, the rest
                // of the entry still parses.
                RawContentBlock::Unknown => {}
            }
        }

        let message = Message {
            uuid: record.uuid.clone(),
            parent_uuid: record.parent_uuid.clone(),
            timestamp,
            role,
            content,
            session_id: record.session_id.clone(),
            agent_id: agent_id.clone(),
            is_sidechain: record.is_sidechain,
            model: record.message.model.clone(),
            cwd: record.cwd.clone(),
            git_branch: record.git_branch.clone(),
            usage: record.message.usage.clone(),
        };

        let mut events = Vec::new();
        events.push(SessionEvent {
            timestamp,
            session_id: record.session_id.clone(),
            agent_id: agent_id.clone(),
            payload: EventPayload::Message {
                message: message.clone(),
            },
        });

        for tool_use in message.tool_uses() {
            events.push(SessionEvent {
                timestamp,
                session_id: record.session_id.clone(),
                agent_id: agent_id.clone(),
                payload: EventPayload::ToolUse {
                    tool_name: tool_use.name.clone(),
                    tool_category: ToolCategory::of(&tool_use.name),
                    tool_input: tool_use.input.clone(),
                    tool_use_id: tool_use.id.clone(),
                    message: message.clone(),
                },
            });
        }

        for tool_result in message.tool_results() {
            events.push(SessionEvent {
                timestamp,
                session_id: record.session_id.clone(),
                agent_id: agent_id.clone(),
                payload: EventPayload::ToolResult {
                    tool_use_id: tool_result.tool_use_id.clone(),
                    content: tool_result.content.clone(),
                    is_error: tool_result.is_error,
                    message: message.clone(),
                },
            });
        }

        events
    }

    fn prepare_input(&self, input: &Value) -> Value {
        if !self.truncate_inputs {
            return input.clone();
        }
        let serialized_len = serde_json::to_string(input).map(|s| s.len()).unwrap_or(0);
        if serialized_len <= self.max_input_length {
            return input.clone();
        }
        truncate_strings(input, self.max_input_length)
    }
}

/// Replace oversized string values with a head prefix and a marker naming
/// the original byte length. The original is not retained.
fn truncate_strings(value: &Value, max: usize) -> Value {
    match value {
        Value::String(s) if s.len() > max => {
            let mut end = max;
            while end > 0 && !s.is_char_boundary(end) {
                end -= 1;
            }
            Value::String(format!("{}…[truncated {} bytes]", &s[..end], s.len()))
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| (key.clone(), truncate_strings(inner, max)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|inner| truncate_strings(inner, max)).collect())
        }
        other => other.clone(),
    }
}

fn error_event(error_message: String, raw_entry: Value, session_id: Option<String>) -> SessionEvent {
    SessionEvent {
        timestamp: Utc::now(),
        session_id: session_id.unwrap_or_default(),
        agent_id: None,
        payload: EventPayload::Error {
            error_message,
            raw_entry,
        },
    }
}
