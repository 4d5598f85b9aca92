use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use livetrace_types::{
    AgentThread, EventPayload, Message, ProjectSnapshot, SessionCounters, SessionEvent,
    SessionSnapshot, ToolCall, ToolResultBlock, ToolUseBlock,
};

/// Results without a matching pending call are kept around for late pairing
/// diagnostics, bounded so a pathological session cannot grow unbounded.
const ORPHAN_RESULT_CAP: usize = 1024;

/// Which messages the live tracker keeps in memory. Applied after emission,
/// never delaying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// All messages retained.
    Full,
    /// Main and per-agent lists truncated to the most recent N after each
    /// append. Pending tool calls survive truncation so late results still
    /// pair.
    Sliding(usize),
    /// Only counters and pending tool calls are kept.
    None,
}

#[derive(Debug, Clone)]
struct PendingCall {
    tool_use: ToolUseBlock,
    request_message: Message,
}

/// What the tracker decided about one event.
#[derive(Debug)]
pub struct HandleOutcome {
    /// False when the event must be replaced by `follow_ups` (a duplicate
    /// tool_use_id is delivered as an error, not as a tool_use).
    pub deliver_original: bool,
    /// Events to emit after (or instead of) the original.
    pub follow_ups: Vec<SessionEvent>,
}

impl HandleOutcome {
    fn deliver() -> Self {
        HandleOutcome {
            deliver_original: true,
            follow_ups: Vec::new(),
        }
    }

    fn deliver_with(follow_ups: Vec<SessionEvent>) -> Self {
        HandleOutcome {
            deliver_original: true,
            follow_ups,
        }
    }

    fn replace_with(follow_ups: Vec<SessionEvent>) -> Self {
        HandleOutcome {
            deliver_original: false,
            follow_ups,
        }
    }
}

/// Mutable per-session accumulator.
///
/// Fed every parsed event for its session; produces `tool_call_completed`
/// events on pairing and collision errors on duplicate tool_use ids.
#[derive(Debug)]
pub struct LiveSession {
    session_id: String,
    project_slug: String,
    retention: RetentionPolicy,
    main_messages: Vec<Message>,
    agent_messages: BTreeMap<String, Vec<Message>>,
    agent_message_counts: BTreeMap<String, u64>,
    pending_tool_calls: HashMap<String, PendingCall>,
    closed_tool_calls: Vec<ToolCall>,
    closed_ids: HashSet<String>,
    orphan_results: VecDeque<ToolResultBlock>,
    start_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    is_idle: bool,
    counters: SessionCounters,
}

impl LiveSession {
    pub fn new(
        session_id: impl Into<String>,
        project_slug: impl Into<String>,
        retention: RetentionPolicy,
        start_time: DateTime<Utc>,
    ) -> Self {
        LiveSession {
            session_id: session_id.into(),
            project_slug: project_slug.into(),
            retention,
            main_messages: Vec::new(),
            agent_messages: BTreeMap::new(),
            agent_message_counts: BTreeMap::new(),
            pending_tool_calls: HashMap::new(),
            closed_tool_calls: Vec::new(),
            closed_ids: HashSet::new(),
            orphan_results: VecDeque::new(),
            start_time,
            last_activity: start_time,
            is_idle: false,
            counters: SessionCounters::default(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn project_slug(&self) -> &str {
        &self.project_slug
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    pub fn set_idle(&mut self, idle: bool) {
        self.is_idle = idle;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    pub fn pending_tool_count(&self) -> usize {
        self.pending_tool_calls.len()
    }

    /// Results that arrived without a matching pending call.
    pub fn orphan_result_count(&self) -> usize {
        self.orphan_results.len()
    }

    /// Apply one parsed event. The outcome carries follow-up events
    /// (pairing completions, collision errors) and whether the original
    /// event should still be delivered.
    pub fn handle_event(&mut self, event: &SessionEvent) -> HandleOutcome {
        match &event.payload {
            EventPayload::Message { message } => {
                self.last_activity = event.timestamp;
                self.counters.message_count += 1;
                if let Some(usage) = &message.usage {
                    self.counters.token_usage.accumulate(usage);
                }
                self.append_message(message.clone());
                HandleOutcome::deliver()
            }
            EventPayload::ToolUse {
                tool_use_id,
                tool_name,
                tool_input,
                message,
                ..
            } => {
                self.last_activity = event.timestamp;
                if self.pending_tool_calls.contains_key(tool_use_id)
                    || self.closed_ids.contains(tool_use_id)
                {
                    // No state mutation: the first use keeps its pending
                    // slot and will still pair.
                    self.counters.error_count += 1;
                    return HandleOutcome::replace_with(vec![collision_event(
                        event,
                        tool_use_id,
                        tool_name,
                    )]);
                }
                self.counters.tool_use_count += 1;
                self.pending_tool_calls.insert(
                    tool_use_id.clone(),
                    PendingCall {
                        tool_use: ToolUseBlock {
                            id: tool_use_id.clone(),
                            name: tool_name.clone(),
                            input: tool_input.clone(),
                        },
                        request_message: message.clone(),
                    },
                );
                HandleOutcome::deliver()
            }
            EventPayload::ToolResult {
                tool_use_id,
                content,
                is_error,
                message,
            } => {
                self.last_activity = event.timestamp;
                self.counters.tool_result_count += 1;
                let result = ToolResultBlock {
                    tool_use_id: tool_use_id.clone(),
                    content: content.clone(),
                    is_error: *is_error,
                };
                match self.pending_tool_calls.remove(tool_use_id) {
                    Some(pending) => {
                        let call = ToolCall {
                            timestamp: pending.request_message.timestamp,
                            tool_use: pending.tool_use,
                            tool_result: Some(result),
                            request_message: pending.request_message,
                            response_message: Some(message.clone()),
                        };
                        self.closed_ids.insert(tool_use_id.clone());
                        let completed = completed_event(event, &call, *is_error);
                        self.closed_tool_calls.push(call);
                        HandleOutcome::deliver_with(vec![completed])
                    }
                    None => {
                        self.orphan_results.push_back(result);
                        if self.orphan_results.len() > ORPHAN_RESULT_CAP {
                            self.orphan_results.pop_front();
                        }
                        HandleOutcome::deliver()
                    }
                }
            }
            EventPayload::Error { .. } => {
                self.counters.error_count += 1;
                HandleOutcome::deliver()
            }
            _ => HandleOutcome::deliver(),
        }
    }

    fn append_message(&mut self, message: Message) {
        match self.retention {
            RetentionPolicy::None => {
                if let Some(agent_id) = &message.agent_id {
                    *self.agent_message_counts.entry(agent_id.clone()).or_default() += 1;
                }
                return;
            }
            RetentionPolicy::Full | RetentionPolicy::Sliding(_) => {}
        }

        let list = match &message.agent_id {
            Some(agent_id) => {
                *self.agent_message_counts.entry(agent_id.clone()).or_default() += 1;
                self.agent_messages.entry(agent_id.clone()).or_default()
            }
            None => &mut self.main_messages,
        };
        list.push(message);

        if let RetentionPolicy::Sliding(max) = self.retention
            && list.len() > max
        {
            let excess = list.len() - max;
            list.drain(..excess);
        }
    }

    /// Deep-copy the accumulated state into the immutable downstream shape.
    pub fn to_session(&self) -> SessionSnapshot {
        let agents = self
            .agent_messages
            .iter()
            .map(|(agent_id, messages)| AgentThread {
                agent_id: agent_id.clone(),
                messages: messages.clone(),
                message_count: self
                    .agent_message_counts
                    .get(agent_id)
                    .copied()
                    .unwrap_or(messages.len() as u64),
            })
            .collect();

        SessionSnapshot {
            session_id: self.session_id.clone(),
            project_slug: self.project_slug.clone(),
            start_time: self.start_time,
            last_activity: self.last_activity,
            is_idle: self.is_idle,
            main_thread: self.main_messages.clone(),
            agents,
            tool_calls: self.closed_tool_calls.clone(),
            pending_tool_calls: self.pending_tool_calls.len(),
            counters: self.counters.clone(),
        }
    }
}

fn collision_event(event: &SessionEvent, tool_use_id: &str, tool_name: &str) -> SessionEvent {
    SessionEvent {
        timestamp: event.timestamp,
        session_id: event.session_id.clone(),
        agent_id: event.agent_id.clone(),
        payload: EventPayload::Error {
            error_message: format!(
                "tool_use_id collision: {:?} was already used in this session",
                tool_use_id
            ),
            raw_entry: serde_json::json!({
                "tool_use_id": tool_use_id,
                "tool_name": tool_name,
            }),
        },
    }
}

fn completed_event(event: &SessionEvent, call: &ToolCall, is_error: bool) -> SessionEvent {
    SessionEvent {
        timestamp: event.timestamp,
        session_id: event.session_id.clone(),
        agent_id: event.agent_id.clone(),
        payload: EventPayload::ToolCallCompleted {
            tool_name: call.tool_use.name.clone(),
            is_error,
            duration_seconds: call.duration_seconds().unwrap_or(0.0),
            tool_call: Some(Box::new(call.clone())),
        },
    }
}

/// Shared map of live sessions.
///
/// The map lock is only taken for insert/remove and lookups; per-session
/// mutation goes through each session's own mutex.
#[derive(Clone, Default)]
pub struct LiveSessionMap {
    inner: Arc<RwLock<HashMap<String, Arc<Mutex<LiveSession>>>>>,
}

impl LiveSessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Mutex<LiveSession>>> {
        self.inner.read().ok()?.get(session_id).cloned()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn project_of(&self, session_id: &str) -> Option<String> {
        let session = self.get_session(session_id)?;
        let session = session.lock().ok()?;
        Some(session.project_slug().to_string())
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let session = self.get_session(session_id)?;
        let session = session.lock().ok()?;
        Some(session.to_session())
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<_> = {
            match self.inner.read() {
                Ok(map) => map.values().cloned().collect(),
                Err(_) => return Vec::new(),
            }
        };
        handles
            .iter()
            .filter_map(|handle| handle.lock().ok().map(|s| s.to_session()))
            .collect()
    }

    /// Snapshots grouped by project slug.
    pub fn to_projects(&self) -> Vec<ProjectSnapshot> {
        let mut grouped: BTreeMap<String, Vec<SessionSnapshot>> = BTreeMap::new();
        for snapshot in self.snapshots() {
            grouped
                .entry(snapshot.project_slug.clone())
                .or_default()
                .push(snapshot);
        }
        grouped
            .into_iter()
            .map(|(project_slug, sessions)| ProjectSnapshot {
                project_slug,
                sessions,
            })
            .collect()
    }

    pub(crate) fn insert(&self, session: LiveSession) -> Arc<Mutex<LiveSession>> {
        let id = session.session_id().to_string();
        let handle = Arc::new(Mutex::new(session));
        if let Ok(mut map) = self.inner.write() {
            map.insert(id, Arc::clone(&handle));
        }
        handle
    }

    pub(crate) fn remove(&self, session_id: &str) -> Option<Arc<Mutex<LiveSession>>> {
        self.inner.write().ok()?.remove(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livetrace_core::EntryParser;
    use livetrace_types::EventKind;

    fn events_for(raw: serde_json::Value) -> Vec<SessionEvent> {
        EntryParser::default().parse_entry(&raw, None)
    }

    fn tool_use_entry(ts: &str, id: &str) -> serde_json::Value {
        serde_json::json!({
            "uuid": format!("req-{}", id),
            "timestamp": ts,
            "type": "assistant",
            "sessionId": "s",
            "message": {
                "role": "assistant",
                "content": [{"type": "tool_use", "id": id, "name": "Bash", "input": {"command": "ls"}}]
            }
        })
    }

    fn tool_result_entry(ts: &str, id: &str, is_error: bool) -> serde_json::Value {
        serde_json::json!({
            "uuid": format!("res-{}", id),
            "timestamp": ts,
            "type": "user",
            "sessionId": "s",
            "message": {
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": id, "content": "file.txt", "is_error": is_error}]
            }
        })
    }

    fn feed(session: &mut LiveSession, raw: serde_json::Value) -> Vec<SessionEvent> {
        let mut follow_ups = Vec::new();
        for event in events_for(raw) {
            follow_ups.extend(session.handle_event(&event).follow_ups);
        }
        follow_ups
    }

    fn new_session(retention: RetentionPolicy) -> LiveSession {
        LiveSession::new("s", "p", retention, Utc::now())
    }

    #[test]
    fn pairs_tool_use_with_result() {
        let mut session = new_session(RetentionPolicy::Full);
        let extras = feed(&mut session, tool_use_entry("2025-01-05T20:19:25Z", "t1"));
        assert!(extras.is_empty());
        assert_eq!(session.pending_tool_count(), 1);

        let extras = feed(
            &mut session,
            tool_result_entry("2025-01-05T20:19:27.500Z", "t1", false),
        );
        assert_eq!(extras.len(), 1);
        match &extras[0].payload {
            EventPayload::ToolCallCompleted {
                tool_name,
                is_error,
                duration_seconds,
                tool_call,
            } => {
                assert_eq!(tool_name, "Bash");
                assert!(!is_error);
                assert!((duration_seconds - 2.5).abs() < 1e-9);
                assert!(tool_call.as_ref().unwrap().is_closed());
            }
            other => panic!("expected completion, got {:?}", other.kind()),
        }
        assert_eq!(session.pending_tool_count(), 0);
        assert_eq!(session.to_session().tool_calls.len(), 1);
    }

    #[test]
    fn duplicate_tool_use_id_is_a_collision() {
        let mut session = new_session(RetentionPolicy::Full);
        feed(&mut session, tool_use_entry("2025-01-05T20:19:25Z", "t1"));
        let extras = feed(&mut session, tool_use_entry("2025-01-05T20:19:26Z", "t1"));
        assert_eq!(extras.len(), 1);
        assert_eq!(extras[0].kind(), EventKind::Error);
        match &extras[0].payload {
            EventPayload::Error { error_message, .. } => {
                assert!(error_message.contains("collision"));
            }
            _ => unreachable!(),
        }

        // The single result pairs with the first use, exactly once.
        let extras = feed(
            &mut session,
            tool_result_entry("2025-01-05T20:19:27Z", "t1", false),
        );
        assert_eq!(extras.len(), 1);
        assert_eq!(extras[0].kind(), EventKind::ToolCallCompleted);

        // A replayed use of a closed id is also a collision.
        let extras = feed(&mut session, tool_use_entry("2025-01-05T20:19:28Z", "t1"));
        assert_eq!(extras[0].kind(), EventKind::Error);
    }

    #[test]
    fn orphan_results_never_complete() {
        let mut session = new_session(RetentionPolicy::Full);
        let extras = feed(
            &mut session,
            tool_result_entry("2025-01-05T20:19:27Z", "missing", false),
        );
        assert!(extras.is_empty());
        assert!(session.to_session().tool_calls.is_empty());
    }

    #[test]
    fn sliding_retention_keeps_pairing_alive() {
        let mut session = new_session(RetentionPolicy::Sliding(1));
        feed(&mut session, tool_use_entry("2025-01-05T20:19:25Z", "t1"));
        // Push enough messages to evict the request from the window.
        for n in 0..3 {
            feed(
                &mut session,
                serde_json::json!({
                    "uuid": format!("m{}", n),
                    "timestamp": "2025-01-05T20:19:26Z",
                    "type": "user",
                    "sessionId": "s",
                    "message": {"role": "user", "content": [{"type": "text", "text": "x"}]}
                }),
            );
        }
        let snapshot = session.to_session();
        assert_eq!(snapshot.main_thread.len(), 1);
        assert_eq!(snapshot.counters.message_count, 4);

        let extras = feed(
            &mut session,
            tool_result_entry("2025-01-05T20:19:30Z", "t1", true),
        );
        assert_eq!(extras.len(), 1);
        assert_eq!(extras[0].kind(), EventKind::ToolCallCompleted);
    }

    #[test]
    fn none_retention_keeps_counters_only() {
        let mut session = new_session(RetentionPolicy::None);
        feed(
            &mut session,
            serde_json::json!({
                "uuid": "m1",
                "timestamp": "2025-01-05T20:19:26Z",
                "type": "user",
                "sessionId": "s",
                "message": {"role": "user", "content": [{"type": "text", "text": "x"}]}
            }),
        );
        let snapshot = session.to_session();
        assert!(snapshot.main_thread.is_empty());
        assert_eq!(snapshot.counters.message_count, 1);
    }

    #[test]
    fn sidechain_messages_group_under_agents() {
        let mut session = new_session(RetentionPolicy::Full);
        feed(
            &mut session,
            serde_json::json!({
                "uuid": "m1",
                "timestamp": "2025-01-05T20:19:26Z",
                "type": "user",
                "sessionId": "s",
                "isSidechain": true,
                "agentId": "a1",
                "message": {"role": "user", "content": [{"type": "text", "text": "x"}]}
            }),
        );
        let snapshot = session.to_session();
        assert!(snapshot.main_thread.is_empty());
        assert_eq!(snapshot.agents.len(), 1);
        assert_eq!(snapshot.agents[0].agent_id, "a1");
        assert_eq!(snapshot.agents[0].message_count, 1);
    }

    #[test]
    fn token_usage_accumulates() {
        let mut session = new_session(RetentionPolicy::Full);
        for _ in 0..2 {
            feed(
                &mut session,
                serde_json::json!({
                    "uuid": "m1",
                    "timestamp": "2025-01-05T20:19:26Z",
                    "type": "assistant",
                    "sessionId": "s",
                    "message": {
                        "role": "assistant",
                        "content": [{"type": "text", "text": "x"}],
                        "usage": {"input_tokens": 10, "output_tokens": 5}
                    }
                }),
            );
        }
        let counters = session.to_session().counters;
        assert_eq!(counters.token_usage.input_tokens, 20);
        assert_eq!(counters.token_usage.output_tokens, 10);
    }

    #[test]
    fn map_insert_lookup_remove() {
        let map = LiveSessionMap::new();
        map.insert(new_session(RetentionPolicy::Full));
        assert_eq!(map.len(), 1);
        assert_eq!(map.project_of("s").as_deref(), Some("p"));
        assert!(map.snapshot("s").is_some());
        assert!(map.remove("s").is_some());
        assert!(map.is_empty());
    }
}
