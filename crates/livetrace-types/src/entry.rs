use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of a session transcript, discriminated by the top-level `type`
/// field. Record kinds the pipeline does not consume deserialize as
/// `Unknown` so newer host versions cannot break the tailer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum TranscriptEntry {
    User(EntryRecord),
    Assistant(EntryRecord),
    #[serde(other)]
    Unknown,
}

impl TranscriptEntry {
    pub fn record(&self) -> Option<&EntryRecord> {
        match self {
            TranscriptEntry::User(r) | TranscriptEntry::Assistant(r) => Some(r),
            TranscriptEntry::Unknown => None,
        }
    }
}

/// Common envelope shared by user and assistant entries. Unknown fields on
/// the wire are ignored.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryRecord {
    pub uuid: String,
    #[serde(default)]
    pub parent_uuid: Option<String>,
    pub timestamp: String,
    pub session_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub is_sidechain: bool,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub message: EntryMessage,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntryMessage {
    pub role: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: Vec<RawContentBlock>,
    #[serde(default)]
    pub usage: Option<UsageInfo>,
}

/// `message.content` is either a bare string or a list of tagged blocks.
fn deserialize_content<'de, D>(deserializer: D) -> Result<Vec<RawContentBlock>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrBlocks {
        String(String),
        Blocks(Vec<RawContentBlock>),
    }

    match StringOrBlocks::deserialize(deserializer)? {
        StringOrBlocks::String(s) => Ok(vec![RawContentBlock::Text { text: s }]),
        StringOrBlocks::Blocks(blocks) => Ok(blocks),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum RawContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<Value>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

impl RawContentBlock {
    /// Coerce a tool_result `content` value to plain text. A list of parts
    /// has its `text` fields concatenated in order.
    pub fn coerce_result_content(content: Option<&Value>) -> String {
        match content {
            None => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl UsageInfo {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }

    pub fn accumulate(&mut self, other: &UsageInfo) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}
