pub mod entry;
pub mod event;
pub mod message;
pub mod session;
pub mod tool;

pub use entry::{EntryMessage, EntryRecord, RawContentBlock, TranscriptEntry, UsageInfo};
pub use event::{EndReason, EventKind, EventPayload, SessionEvent};
pub use message::{ContentBlock, Message, Role, ToolCall, ToolResultBlock, ToolUseBlock};
pub use session::{AgentThread, ProjectSnapshot, SessionCounters, SessionSnapshot};
pub use tool::ToolCategory;
