use livetrace_types::{EventPayload, SessionEvent};

use crate::args::OutputFormat;

/// Render one event for the terminal.
pub fn format_event(event: &SessionEvent, format: OutputFormat) -> Option<String> {
    match format {
        OutputFormat::Json => serde_json::to_string(event).ok(),
        OutputFormat::Text => Some(format_text(event)),
    }
}

fn format_text(event: &SessionEvent) -> String {
    let time = event.timestamp.format("%H:%M:%S%.3f");
    let session = short_id(&event.session_id);
    let agent = event
        .agent_id
        .as_deref()
        .map(|id| format!(" agent={}", id))
        .unwrap_or_default();

    let detail = match &event.payload {
        EventPayload::Message { message } => {
            format!("message {} {}", message.role, snippet(&message.text_content()))
        }
        EventPayload::ToolUse {
            tool_name,
            tool_category,
            ..
        } => format!("tool_use {} ({})", tool_name, tool_category),
        EventPayload::ToolResult { is_error, content, .. } => {
            let status = if *is_error { "error" } else { "ok" };
            format!("tool_result {} {}", status, snippet(content))
        }
        EventPayload::ToolCallCompleted {
            tool_name,
            is_error,
            duration_seconds,
            ..
        } => {
            let status = if *is_error { "error" } else { "ok" };
            format!(
                "tool_call_completed {} {} in {:.2}s",
                tool_name, status, duration_seconds
            )
        }
        EventPayload::Error { error_message, .. } => format!("error {}", error_message),
        EventPayload::SessionStart { project_slug, .. } => {
            format!("session_start project={}", project_slug)
        }
        EventPayload::SessionIdle { .. } => "session_idle".to_string(),
        EventPayload::SessionResume {
            idle_duration_seconds,
        } => format!("session_resume after {:.1}s", idle_duration_seconds),
        EventPayload::SessionEnd {
            reason,
            message_count,
            tool_count,
            ..
        } => format!(
            "session_end {} messages={} tools={}",
            reason, message_count, tool_count
        ),
    };

    format!("{} [{}{}] {}", time, session, agent, detail)
}

fn short_id(session_id: &str) -> &str {
    match session_id.char_indices().nth(8) {
        Some((index, _)) => &session_id[..index],
        None => session_id,
    }
}

fn snippet(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let trimmed = flat.trim();
    if trimmed.len() <= 80 {
        trimmed.to_string()
    } else {
        let mut end = 80;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    }
}
