use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use livetrace_types::{EventPayload, SessionEvent};

/// Histogram bucket upper bounds for tool durations, in seconds.
const DURATION_BUCKETS: [f64; 10] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Counters, gauges, and histograms driven off the event stream, with
/// Prometheus text export.
///
/// Cheap to clone; all clones share state. Counter increments are atomic;
/// the label maps take a read lock on the hot path and a write lock only
/// when a new label combination appears.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Inner>,
}

struct Inner {
    messages_total: LabeledCounter,
    tool_calls_total: LabeledCounter,
    tool_errors_total: LabeledCounter,
    session_starts_total: LabeledCounter,
    session_ends_total: LabeledCounter,
    webhook_drop_total: LabeledCounter,
    parse_errors_total: AtomicU64,
    events_dropped_total: AtomicU64,
    active_sessions: AtomicI64,
    tool_duration: DurationHistogram,
    /// session_id to project slug, learned from session_start, so
    /// session_end can be labeled by project.
    session_projects: Mutex<HashMap<String, String>>,
    message_rate: Mutex<EwmaRate>,
    tool_rate: Mutex<EwmaRate>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        MetricsCollector {
            inner: Arc::new(Inner {
                messages_total: LabeledCounter::new(&["role"]),
                tool_calls_total: LabeledCounter::new(&["tool", "category"]),
                tool_errors_total: LabeledCounter::new(&["tool"]),
                session_starts_total: LabeledCounter::new(&["project"]),
                session_ends_total: LabeledCounter::new(&["project", "reason"]),
                webhook_drop_total: LabeledCounter::new(&["kind"]),
                parse_errors_total: AtomicU64::new(0),
                events_dropped_total: AtomicU64::new(0),
                active_sessions: AtomicI64::new(0),
                tool_duration: DurationHistogram::new(),
                session_projects: Mutex::new(HashMap::new()),
                message_rate: Mutex::new(EwmaRate::new()),
                tool_rate: Mutex::new(EwmaRate::new()),
            }),
        }
    }

    /// A handler suitable for `EventEmitter::on_any` registration.
    pub fn handler(&self) -> impl FnMut(&SessionEvent) -> anyhow::Result<()> + Send + 'static {
        let collector = self.clone();
        move |event| {
            collector.observe(event);
            Ok(())
        }
    }

    pub fn observe(&self, event: &SessionEvent) {
        let inner = &self.inner;
        match &event.payload {
            EventPayload::Message { message } => {
                inner.messages_total.inc(&[message.role.as_str()]);
            }
            EventPayload::ToolUse {
                tool_name,
                tool_category,
                ..
            } => {
                inner
                    .tool_calls_total
                    .inc(&[tool_name, tool_category.as_str()]);
            }
            EventPayload::ToolCallCompleted {
                tool_name,
                is_error,
                duration_seconds,
                ..
            } => {
                inner.tool_duration.observe(*duration_seconds);
                if *is_error {
                    inner.tool_errors_total.inc(&[tool_name]);
                }
            }
            EventPayload::ToolResult { .. } => {}
            EventPayload::Error { .. } => {
                inner.parse_errors_total.fetch_add(1, Ordering::Relaxed);
            }
            EventPayload::SessionStart { project_slug, .. } => {
                inner.session_starts_total.inc(&[project_slug]);
                inner.active_sessions.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut projects) = inner.session_projects.lock() {
                    projects.insert(event.session_id.clone(), project_slug.clone());
                }
            }
            EventPayload::SessionEnd { reason, .. } => {
                let project = inner
                    .session_projects
                    .lock()
                    .ok()
                    .and_then(|mut projects| projects.remove(&event.session_id));
                // Only sessions whose start this collector saw count
                // against the gauge.
                if project.is_some() {
                    inner.active_sessions.fetch_sub(1, Ordering::Relaxed);
                }
                let project = project.unwrap_or_else(|| "unknown".to_string());
                inner.session_ends_total.inc(&[&project, reason.as_str()]);
            }
            EventPayload::SessionIdle { .. } | EventPayload::SessionResume { .. } => {}
        }
    }

    /// Number of sessions currently active or idle.
    pub fn active_sessions(&self) -> i64 {
        self.inner.active_sessions.load(Ordering::Relaxed)
    }

    /// Exponentially weighted message rate over a 60 second window.
    pub fn messages_per_minute(&self) -> f64 {
        let total = self.inner.messages_total.total();
        self.inner
            .message_rate
            .lock()
            .map(|mut rate| rate.sample(total))
            .unwrap_or(0.0)
    }

    /// Exponentially weighted tool-call rate over a 60 second window.
    pub fn tools_per_minute(&self) -> f64 {
        let total = self.inner.tool_calls_total.total();
        self.inner
            .tool_rate
            .lock()
            .map(|mut rate| rate.sample(total))
            .unwrap_or(0.0)
    }

    /// Fraction of tool calls that completed with an error; 0 when no
    /// calls have completed.
    pub fn error_rate(&self) -> f64 {
        let calls = self.inner.tool_calls_total.total();
        if calls == 0 {
            return 0.0;
        }
        self.inner.tool_errors_total.total() as f64 / calls as f64
    }

    pub fn record_webhook_drop(&self, kind: &str) {
        self.inner.webhook_drop_total.inc(&[kind]);
    }

    pub fn record_dropped_event(&self) {
        self.inner.events_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let inner = &self.inner;
        let mut out = String::new();

        inner.messages_total.render(
            &mut out,
            "messages_total",
            "Messages observed, by role.",
        );
        inner.tool_calls_total.render(
            &mut out,
            "tool_calls_total",
            "Tool invocations observed, by tool and category.",
        );
        inner.tool_errors_total.render(
            &mut out,
            "tool_errors_total",
            "Tool calls that completed with an error, by tool.",
        );
        inner.session_starts_total.render(
            &mut out,
            "session_starts_total",
            "Sessions started, by project.",
        );
        inner.session_ends_total.render(
            &mut out,
            "session_ends_total",
            "Sessions ended, by project and reason.",
        );
        render_scalar(
            &mut out,
            "parse_errors_total",
            "counter",
            "Entries that failed to parse.",
            inner.parse_errors_total.load(Ordering::Relaxed) as f64,
        );
        inner.webhook_drop_total.render(
            &mut out,
            "webhook_drop_total",
            "Webhook batches dropped, by failure kind.",
        );
        render_scalar(
            &mut out,
            "events_dropped_total",
            "counter",
            "Events dropped from the bounded async queue.",
            inner.events_dropped_total.load(Ordering::Relaxed) as f64,
        );
        render_scalar(
            &mut out,
            "active_sessions",
            "gauge",
            "Sessions currently active or idle.",
            inner.active_sessions.load(Ordering::Relaxed) as f64,
        );
        inner.tool_duration.render(
            &mut out,
            "tool_duration_seconds",
            "Latency between tool use and its result.",
        );
        render_scalar(
            &mut out,
            "messages_per_minute",
            "gauge",
            "Exponentially weighted message rate.",
            self.messages_per_minute(),
        );
        render_scalar(
            &mut out,
            "tools_per_minute",
            "gauge",
            "Exponentially weighted tool-call rate.",
            self.tools_per_minute(),
        );
        render_scalar(
            &mut out,
            "error_rate",
            "gauge",
            "tool_errors_total over tool_calls_total.",
            self.error_rate(),
        );

        out
    }
}

struct LabeledCounter {
    label_names: Vec<&'static str>,
    values: RwLock<HashMap<Vec<String>, AtomicU64>>,
}

impl LabeledCounter {
    fn new(label_names: &[&'static str]) -> Self {
        LabeledCounter {
            label_names: label_names.to_vec(),
            values: RwLock::new(HashMap::new()),
        }
    }

    fn inc(&self, label_values: &[&str]) {
        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
        if let Ok(values) = self.values.read()
            && let Some(counter) = values.get(&key)
        {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Ok(mut values) = self.values.write() {
            values
                .entry(key)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn get(&self, label_values: &[&str]) -> u64 {
        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
        self.values
            .read()
            .ok()
            .and_then(|values| values.get(&key).map(|c| c.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }

    fn total(&self) -> u64 {
        self.values
            .read()
            .map(|values| values.values().map(|c| c.load(Ordering::Relaxed)).sum())
            .unwrap_or(0)
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} counter", name);
        let Ok(values) = self.values.read() else {
            return;
        };
        let mut rows: Vec<(&Vec<String>, u64)> = values
            .iter()
            .map(|(key, counter)| (key, counter.load(Ordering::Relaxed)))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in rows {
            let labels = self
                .label_names
                .iter()
                .zip(key)
                .map(|(name, value)| format!("{}=\"{}\"", name, escape_label(value)))
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(out, "{}{{{}}} {}", name, labels, value);
        }
    }
}

struct DurationHistogram {
    buckets: [AtomicU64; DURATION_BUCKETS.len()],
    count: AtomicU64,
    /// Integer microseconds keep the sum atomically incrementable.
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn new() -> Self {
        DurationHistogram {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn observe(&self, seconds: f64) {
        let seconds = seconds.max(0.0);
        for (index, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.buckets[index].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} histogram", name);
        let mut cumulative = 0u64;
        for (index, bound) in DURATION_BUCKETS.iter().enumerate() {
            cumulative += self.buckets[index].load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, bound, cumulative);
        }
        let count = self.count.load(Ordering::Relaxed);
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, count);
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(out, "{}_sum {}", name, sum);
        let _ = writeln!(out, "{}_count {}", name, count);
    }
}

struct EwmaRate {
    last_total: u64,
    last_update: Instant,
    rate_per_min: f64,
}

impl EwmaRate {
    fn new() -> Self {
        EwmaRate {
            last_total: 0,
            last_update: Instant::now(),
            rate_per_min: 0.0,
        }
    }

    /// Fold the counter delta since the last sample into the rate, with a
    /// smoothing constant tied to a 60 second window.
    fn sample(&mut self, current_total: u64) -> f64 {
        let elapsed = self.last_update.elapsed().as_secs_f64();
        if elapsed < 1e-3 {
            return self.rate_per_min;
        }
        let delta = current_total.saturating_sub(self.last_total) as f64;
        let instantaneous = delta / (elapsed / 60.0);
        let alpha = 1.0 - (-elapsed / 60.0).exp();
        self.rate_per_min += alpha * (instantaneous - self.rate_per_min);
        self.last_total = current_total;
        self.last_update = Instant::now();
        self.rate_per_min
    }
}

fn render_scalar(out: &mut String, name: &str, kind: &str, help: &str, value: f64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
    let _ = writeln!(out, "{} {}", name, value);
}

/// Escape a label value per the Prometheus exposition format.
fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use livetrace_core::EntryParser;
    use livetrace_types::EndReason;

    fn events_for(raw: serde_json::Value) -> Vec<SessionEvent> {
        EntryParser::default().parse_entry(&raw, None)
    }

    fn lifecycle_event(session: &str, payload: EventPayload) -> SessionEvent {
        SessionEvent {
            timestamp: chrono::Utc::now(),
            session_id: session.to_string(),
            agent_id: None,
            payload,
        }
    }

    fn observe_all(collector: &MetricsCollector, raw: serde_json::Value) {
        for event in events_for(raw) {
            collector.observe(&event);
        }
    }

    #[test]
    fn counts_messages_by_role() {
        let collector = MetricsCollector::new();
        observe_all(
            &collector,
            serde_json::json!({
                "uuid": "u1", "timestamp": "2025-01-05T20:19:25Z", "type": "user",
                "sessionId": "s",
                "message": {"role": "user", "content": [{"type": "text", "text": "hi"}]}
            }),
        );
        assert_eq!(collector.inner.messages_total.get(&["user"]), 1);
        assert_eq!(collector.inner.messages_total.get(&["assistant"]), 0);
    }

    #[test]
    fn tracks_tool_calls_and_errors() {
        let collector = MetricsCollector::new();
        observe_all(
            &collector,
            serde_json::json!({
                "uuid": "u1", "timestamp": "2025-01-05T20:19:25Z", "type": "assistant",
                "sessionId": "s",
                "message": {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}
                ]}
            }),
        );
        collector.observe(&lifecycle_event(
            "s",
            EventPayload::ToolCallCompleted {
                tool_name: "Bash".to_string(),
                is_error: true,
                duration_seconds: 0.3,
                tool_call: None,
            },
        ));

        assert_eq!(collector.inner.tool_calls_total.get(&["Bash", "bash"]), 1);
        assert_eq!(collector.inner.tool_errors_total.get(&["Bash"]), 1);
        assert!((collector.error_rate() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn active_sessions_gauge_follows_lifecycle() {
        let collector = MetricsCollector::new();
        collector.observe(&lifecycle_event(
            "s1",
            EventPayload::SessionStart {
                project_slug: "p".to_string(),
                file_path: "/tmp/s1.jsonl".into(),
                cwd: None,
            },
        ));
        collector.observe(&lifecycle_event(
            "s2",
            EventPayload::SessionStart {
                project_slug: "p".to_string(),
                file_path: "/tmp/s2.jsonl".into(),
                cwd: None,
            },
        ));
        assert_eq!(collector.active_sessions(), 2);

        collector.observe(&lifecycle_event(
            "s1",
            EventPayload::SessionEnd {
                reason: EndReason::IdleTimeout,
                idle_duration_seconds: 1.0,
                message_count: 3,
                tool_count: 1,
            },
        ));
        assert_eq!(collector.active_sessions(), 1);
        assert_eq!(
            collector
                .inner
                .session_ends_total
                .get(&["p", "idle_timeout"]),
            1
        );

        // An end without a matching start gets the unknown project label
        // and does not drive the gauge negative.
        collector.observe(&lifecycle_event(
            "ghost",
            EventPayload::SessionEnd {
                reason: EndReason::Shutdown,
                idle_duration_seconds: 0.0,
                message_count: 0,
                tool_count: 0,
            },
        ));
        assert_eq!(collector.active_sessions(), 1);
        assert_eq!(
            collector
                .inner
                .session_ends_total
                .get(&["unknown", "shutdown"]),
            1
        );
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let collector = MetricsCollector::new();
        for duration in [0.03, 0.2, 0.2, 7.0, 120.0] {
            collector.observe(&lifecycle_event(
                "s",
                EventPayload::ToolCallCompleted {
                    tool_name: "Bash".to_string(),
                    is_error: false,
                    duration_seconds: duration,
                    tool_call: None,
                },
            ));
        }
        let rendered = collector.render();
        assert!(rendered.contains("tool_duration_seconds_bucket{le=\"0.05\"} 1"));
        assert!(rendered.contains("tool_duration_seconds_bucket{le=\"0.25\"} 3"));
        assert!(rendered.contains("tool_duration_seconds_bucket{le=\"10\"} 4"));
        assert!(rendered.contains("tool_duration_seconds_bucket{le=\"+Inf\"} 5"));
        assert!(rendered.contains("tool_duration_seconds_count 5"));
    }

    #[test]
    fn render_includes_help_and_type_lines() {
        let collector = MetricsCollector::new();
        let rendered = collector.render();
        for name in [
            "messages_total",
            "tool_calls_total",
            "parse_errors_total",
            "active_sessions",
            "tool_duration_seconds",
            "messages_per_minute",
            "error_rate",
        ] {
            assert!(rendered.contains(&format!("# HELP {}", name)), "{}", name);
            assert!(rendered.contains(&format!("# TYPE {}", name)), "{}", name);
        }
    }

    #[test]
    fn label_values_are_escaped() {
        let collector = MetricsCollector::new();
        collector.observe(&lifecycle_event(
            "s",
            EventPayload::SessionStart {
                project_slug: "pro\"ject\\with\nweird".to_string(),
                file_path: "/tmp/x.jsonl".into(),
                cwd: None,
            },
        ));
        let rendered = collector.render();
        assert!(rendered.contains(r#"project="pro\"ject\\with\nweird""#));
    }

    #[test]
    fn rates_move_with_traffic() {
        let collector = MetricsCollector::new();
        assert_eq!(collector.messages_per_minute(), 0.0);
        for _ in 0..10 {
            observe_all(
                &collector,
                serde_json::json!({
                    "uuid": "u1", "timestamp": "2025-01-05T20:19:25Z", "type": "user",
                    "sessionId": "s",
                    "message": {"role": "user", "content": [{"type": "text", "text": "hi"}]}
                }),
            );
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(collector.messages_per_minute() > 0.0);
    }
}
