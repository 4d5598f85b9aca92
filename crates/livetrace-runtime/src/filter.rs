use std::sync::Arc;

use livetrace_types::{EventKind, EventPayload, Role, SessionEvent, ToolCategory};

use crate::emitter::EventEmitter;
use crate::live::LiveSessionMap;

/// A composable predicate over events. Cheap to clone; combinators
/// short-circuit and have no side effects.
#[derive(Clone)]
pub struct EventFilter {
    inner: Arc<dyn Fn(&SessionEvent) -> bool + Send + Sync>,
}

impl EventFilter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&SessionEvent) -> bool + Send + Sync + 'static,
    {
        EventFilter {
            inner: Arc::new(predicate),
        }
    }

    pub fn matches(&self, event: &SessionEvent) -> bool {
        (self.inner)(event)
    }

    pub fn and(self, other: EventFilter) -> EventFilter {
        and_(self, other)
    }

    pub fn or(self, other: EventFilter) -> EventFilter {
        or_(self, other)
    }

    pub fn negate(self) -> EventFilter {
        not_(self)
    }
}

pub fn always() -> EventFilter {
    EventFilter::new(|_| true)
}

pub fn never() -> EventFilter {
    EventFilter::new(|_| false)
}

pub fn and_(a: EventFilter, b: EventFilter) -> EventFilter {
    EventFilter::new(move |event| a.matches(event) && b.matches(event))
}

pub fn or_(a: EventFilter, b: EventFilter) -> EventFilter {
    EventFilter::new(move |event| a.matches(event) || b.matches(event))
}

pub fn not_(filter: EventFilter) -> EventFilter {
    EventFilter::new(move |event| !filter.matches(event))
}

/// Match events from one session.
pub fn session(session_id: impl Into<String>) -> EventFilter {
    let session_id = session_id.into();
    EventFilter::new(move |event| event.session_id == session_id)
}

/// Match sessions whose id starts with `prefix`.
pub fn session_prefix(prefix: impl Into<String>) -> EventFilter {
    let prefix = prefix.into();
    EventFilter::new(move |event| event.session_id.starts_with(&prefix))
}

/// Match events belonging to one project. Project attribution lives in the
/// watcher's live session map, which is passed in explicitly.
pub fn project(sessions: LiveSessionMap, slug: impl Into<String>) -> EventFilter {
    let slug = slug.into();
    EventFilter::new(move |event| match &event.payload {
        EventPayload::SessionStart { project_slug, .. } => *project_slug == slug,
        _ => sessions.project_of(&event.session_id).as_deref() == Some(slug.as_str()),
    })
}

/// Match any of the given event types.
pub fn event_type(kinds: &[EventKind]) -> EventFilter {
    let kinds = kinds.to_vec();
    EventFilter::new(move |event| kinds.contains(&event.kind()))
}

/// Match tool_use / tool_call_completed events for any of the given tools.
pub fn tool_name(names: &[&str]) -> EventFilter {
    let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    EventFilter::new(move |event| match &event.payload {
        EventPayload::ToolUse { tool_name, .. }
        | EventPayload::ToolCallCompleted { tool_name, .. } => names.contains(tool_name),
        _ => false,
    })
}

/// Match tool traffic in any of the given categories.
pub fn tool_category(categories: &[ToolCategory]) -> EventFilter {
    let categories = categories.to_vec();
    EventFilter::new(move |event| match &event.payload {
        EventPayload::ToolUse { tool_category, .. } => categories.contains(tool_category),
        EventPayload::ToolCallCompleted { tool_name, .. } => {
            categories.contains(&ToolCategory::of(tool_name))
        }
        _ => false,
    })
}

/// Match sidechain events (non-null agent_id).
pub fn agent() -> EventFilter {
    EventFilter::new(|event| event.agent_id.is_some())
}

/// Match main-thread events (null agent_id).
pub fn main_thread() -> EventFilter {
    EventFilter::new(|event| event.agent_id.is_none())
}

/// Match error events and tool traffic that reported a failure.
pub fn has_error() -> EventFilter {
    EventFilter::new(|event| event.is_error_like())
}

/// Match events whose underlying message has the given role.
pub fn role(role: Role) -> EventFilter {
    EventFilter::new(move |event| match &event.payload {
        EventPayload::Message { message }
        | EventPayload::ToolUse { message, .. }
        | EventPayload::ToolResult { message, .. } => message.role == role,
        _ => false,
    })
}

/// A filtered view over an emitter: handlers registered through the
/// pipeline only see events matching the predicate.
pub struct FilterPipeline<'a> {
    emitter: &'a mut EventEmitter,
    filter: EventFilter,
}

impl<'a> FilterPipeline<'a> {
    pub fn new(emitter: &'a mut EventEmitter, filter: EventFilter) -> Self {
        FilterPipeline { emitter, filter }
    }

    pub fn on<F>(&mut self, kind: EventKind, mut handler: F) -> &mut Self
    where
        F: FnMut(&SessionEvent) -> anyhow::Result<()> + Send + 'static,
    {
        let filter = self.filter.clone();
        self.emitter.on(kind, move |event| {
            if filter.matches(event) {
                handler(event)
            } else {
                Ok(())
            }
        });
        self
    }

    pub fn on_any<F>(&mut self, mut handler: F) -> &mut Self
    where
        F: FnMut(&SessionEvent) -> anyhow::Result<()> + Send + 'static,
    {
        let filter = self.filter.clone();
        self.emitter.on_any(move |event| {
            if filter.matches(event) {
                handler(event)
            } else {
                Ok(())
            }
        });
        self
    }
}

impl EventEmitter {
    /// Wrap this emitter in a filtered registration view.
    pub fn pipeline(&mut self, filter: EventFilter) -> FilterPipeline<'_> {
        FilterPipeline::new(self, filter)
    }
}
