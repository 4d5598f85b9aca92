use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::UsageInfo;
use crate::message::{Message, ToolCall};

/// Immutable snapshot of one live session, in the shape the batch query
/// library consumes (project, session, threads, messages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub project_slug: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_idle: bool,
    pub main_thread: Vec<Message>,
    pub agents: Vec<AgentThread>,
    pub tool_calls: Vec<ToolCall>,
    pub pending_tool_calls: usize,
    pub counters: SessionCounters,
}

/// One sidechain conversation inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentThread {
    pub agent_id: String,
    pub messages: Vec<Message>,
    pub message_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCounters {
    pub message_count: u64,
    pub tool_use_count: u64,
    pub tool_result_count: u64,
    pub error_count: u64,
    pub token_usage: UsageInfo,
}

/// Sessions grouped under their project slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub project_slug: String,
    pub sessions: Vec<SessionSnapshot>,
}

impl SessionSnapshot {
    /// Total messages across the main thread and every agent thread.
    pub fn total_messages(&self) -> u64 {
        self.counters.message_count
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentThread> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }
}
