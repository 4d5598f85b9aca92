use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entry::UsageInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text(String),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

/// Immutable view of one transcript entry after parsing.
///
/// Serializes to the flattened downstream shape (text plus tool_uses plus
/// tool_results); the in-memory value keeps the ordered block list so
/// consumers can reconstruct interleaving.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "MessageWire", into = "MessageWire")]
pub struct Message {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub session_id: String,
    pub agent_id: Option<String>,
    pub is_sidechain: bool,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub usage: Option<UsageInfo>,
}

impl Message {
    /// Concatenation of the text blocks, in order.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_uses(&self) -> Vec<&ToolUseBlock> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    pub fn tool_results(&self) -> Vec<&ToolResultBlock> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult(r) => Some(r),
                _ => None,
            })
            .collect()
    }
}

/// Wire mirror of `Message` matching the event serialization contract.
#[derive(Serialize, Deserialize)]
struct MessageWire {
    uuid: String,
    parent_uuid: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    role: Role,
    model: Option<String>,
    text: String,
    tool_uses: Vec<ToolUseBlock>,
    tool_results: Vec<ToolResultBlock>,
    cwd: Option<String>,
    git_branch: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    is_sidechain: bool,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

impl From<Message> for MessageWire {
    fn from(message: Message) -> Self {
        let text = message.text_content();
        let tool_uses = message.tool_uses().into_iter().cloned().collect();
        let tool_results = message.tool_results().into_iter().cloned().collect();
        MessageWire {
            uuid: message.uuid,
            parent_uuid: message.parent_uuid,
            timestamp: Some(message.timestamp),
            role: message.role,
            model: message.model,
            text,
            tool_uses,
            tool_results,
            cwd: message.cwd,
            git_branch: message.git_branch,
            session_id: Some(message.session_id),
            agent_id: message.agent_id,
            is_sidechain: message.is_sidechain,
            usage: message.usage,
        }
    }
}

impl From<MessageWire> for Message {
    fn from(wire: MessageWire) -> Self {
        let mut content = Vec::new();
        if !wire.text.is_empty() {
            content.push(ContentBlock::Text(wire.text));
        }
        content.extend(wire.tool_uses.into_iter().map(ContentBlock::ToolUse));
        content.extend(wire.tool_results.into_iter().map(ContentBlock::ToolResult));
        Message {
            uuid: wire.uuid,
            parent_uuid: wire.parent_uuid,
            timestamp: wire.timestamp.unwrap_or_else(|| DateTime::UNIX_EPOCH),
            role: wire.role,
            content,
            session_id: wire.session_id.unwrap_or_default(),
            agent_id: wire.agent_id,
            is_sidechain: wire.is_sidechain,
            model: wire.model,
            cwd: wire.cwd,
            git_branch: wire.git_branch,
            usage: wire.usage,
        }
    }
}

/// A paired tool invocation. The request and response messages are value
/// snapshots taken at pairing time, keeping the structure acyclic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_use: ToolUseBlock,
    pub tool_result: Option<ToolResultBlock>,
    pub request_message: Message,
    pub response_message: Option<Message>,
    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    /// A call is closed once its result has arrived.
    pub fn is_closed(&self) -> bool {
        self.tool_result.is_some()
    }

    /// Elapsed time between request and response, if closed. Never negative.
    pub fn duration_seconds(&self) -> Option<f64> {
        let response = self.response_message.as_ref()?;
        let millis = (response.timestamp - self.timestamp).num_milliseconds();
        Some((millis.max(0) as f64) / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message {
            uuid: "u1".to_string(),
            parent_uuid: None,
            timestamp: "2025-01-05T20:19:25.839Z".parse().unwrap(),
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text("running".to_string()),
                ContentBlock::ToolUse(ToolUseBlock {
                    id: "t1".to_string(),
                    name: "Bash".to_string(),
                    input: serde_json::json!({"command": "ls"}),
                }),
            ],
            session_id: "s".to_string(),
            agent_id: None,
            is_sidechain: false,
            model: Some("m".to_string()),
            cwd: None,
            git_branch: None,
            usage: None,
        }
    }

    #[test]
    fn text_content_joins_text_blocks() {
        let mut message = sample_message();
        message
            .content
            .push(ContentBlock::Text("done".to_string()));
        assert_eq!(message.text_content(), "running\ndone");
    }

    #[test]
    fn serializes_to_flat_shape() {
        let json = serde_json::to_value(sample_message()).unwrap();
        assert_eq!(json["text"], "running");
        assert_eq!(json["tool_uses"][0]["name"], "Bash");
        assert_eq!(json["role"], "assistant");
    }

    #[test]
    fn wire_round_trip_keeps_tool_uses() {
        let json = serde_json::to_string(&sample_message()).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_uses().len(), 1);
        assert_eq!(back.tool_uses()[0].id, "t1");
        assert_eq!(back.session_id, "s");
    }

    #[test]
    fn duration_is_non_negative() {
        let request = sample_message();
        let mut response = sample_message();
        response.timestamp = request.timestamp - chrono::Duration::seconds(5);
        let call = ToolCall {
            tool_use: ToolUseBlock {
                id: "t1".to_string(),
                name: "Bash".to_string(),
                input: serde_json::json!({}),
            },
            tool_result: Some(ToolResultBlock {
                tool_use_id: "t1".to_string(),
                content: String::new(),
                is_error: false,
            }),
            timestamp: request.timestamp,
            request_message: request,
            response_message: Some(response),
        };
        assert_eq!(call.duration_seconds(), Some(0.0));
        assert!(call.is_closed());
    }
}
