use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use livetrace_core::{EntryParser, JsonlTailer, MultiTailer, PositionStore, TailedLine, TailerPosition};
use livetrace_types::{EndReason, EventKind, EventPayload, SessionEvent};

use crate::config::WatcherConfig;
use crate::discovery::{ChangeListener, DiscoveredFile, scan_session_files};
use crate::emitter::EventEmitter;
use crate::error::{Error, Result};
use crate::filter::{EventFilter, FilterPipeline};
use crate::live::{LiveSession, LiveSessionMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Idle,
}

struct FileMeta {
    project_slug: String,
    /// Session this file feeds. Main files resolve from the filename stem;
    /// sidechain files resolve from the sessionId of their first entry.
    session_id: Option<String>,
    /// First non-null agentId seen in this file, trusted for later entries
    /// that omit it.
    agent_id: Option<String>,
    error_since: Option<Instant>,
}

struct SessionMeta {
    project_slug: String,
    phase: Phase,
    /// Monotonic moment of the last observed entry; idle and end decisions
    /// are pure functions of this and the current time.
    last_seen: Instant,
    idle_since: Option<DateTime<Utc>>,
    idle_entered: Option<Instant>,
    message_count: u64,
    tool_count: u64,
}

/// Cooperative stop signal shared with the running watcher.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Top-level orchestrator: discovers session files, drives tailers and the
/// parser, infers session lifecycle, and dispatches events to handlers.
///
/// Everything runs on one poll thread; handlers are invoked there and must
/// not block for long, or the next poll is delayed.
pub struct SessionWatcher {
    config: WatcherConfig,
    parser: EntryParser,
    emitter: EventEmitter,
    sessions: LiveSessionMap,
    tailers: MultiTailer,
    file_meta: HashMap<PathBuf, FileMeta>,
    metas: HashMap<String, SessionMeta>,
    resume_positions: Vec<TailerPosition>,
    store: Option<PositionStore>,
    last_save: Instant,
    stop: Arc<AtomicBool>,
    listener: ChangeListener,
}

impl SessionWatcher {
    pub fn new(config: WatcherConfig) -> Result<Self> {
        let store = config.state_file.clone().map(PositionStore::new);
        let resume_positions = store.as_ref().map(|s| s.load()).unwrap_or_default();

        let listener = if config.use_notify && config.base_path.exists() {
            match ChangeListener::start(&config.base_path) {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::warn!(error = %err, "filesystem notification unavailable, polling only");
                    ChangeListener::disabled()
                }
            }
        } else {
            ChangeListener::disabled()
        };

        let parser = EntryParser::new(config.truncate_inputs, config.max_input_length);
        let mut watcher = SessionWatcher {
            parser,
            emitter: EventEmitter::new(),
            sessions: LiveSessionMap::new(),
            tailers: MultiTailer::new(),
            file_meta: HashMap::new(),
            metas: HashMap::new(),
            resume_positions,
            store,
            last_save: Instant::now(),
            stop: Arc::new(AtomicBool::new(false)),
            listener,
            config,
        };

        let discovered = scan_session_files(&watcher.config.base_path);
        for file in &discovered {
            watcher.add_tracker(file, true);
        }
        if !discovered.is_empty() && watcher.tailers.is_empty() {
            return Err(Error::Setup(format!(
                "could not open any of {} session files under {}",
                discovered.len(),
                watcher.config.base_path.display()
            )));
        }

        Ok(watcher)
    }

    /// Register a handler for one event type.
    pub fn on<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&SessionEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.emitter.on(kind, handler);
    }

    /// Register a handler for every event.
    pub fn on_any<F>(&mut self, handler: F)
    where
        F: FnMut(&SessionEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.emitter.on_any(handler);
    }

    /// Filtered registration view over this watcher's emitter.
    pub fn pipeline(&mut self, filter: EventFilter) -> FilterPipeline<'_> {
        self.emitter.pipeline(filter)
    }

    /// Shared handle to the live session map, usable from any thread.
    pub fn live_sessions(&self) -> LiveSessionMap {
        self.sessions.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Run until [`StopHandle::stop`] is called. Finishes the current poll,
    /// ends every tracked session with reason `shutdown`, and persists
    /// final tailer positions before returning.
    pub fn run(&mut self) -> Result<()> {
        self.run_until(None)
    }

    /// Run for at most `duration`, then stop cleanly.
    pub fn run_for(&mut self, duration: Duration) -> Result<()> {
        self.run_until(Some(Instant::now() + duration))
    }

    /// Move the watcher onto a named worker thread.
    pub fn spawn(mut self) -> Result<WatcherHandle> {
        let stop = self.stop_handle();
        let sessions = self.live_sessions();
        let handle = std::thread::Builder::new()
            .name("livetrace-watcher".to_string())
            .spawn(move || self.run())?;
        Ok(WatcherHandle {
            stop,
            sessions,
            handle,
        })
    }

    fn run_until(&mut self, deadline: Option<Instant>) -> Result<()> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                break;
            }

            let tick_started = Instant::now();
            self.tick();

            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let mut budget = self
                .config
                .poll_interval
                .saturating_sub(tick_started.elapsed());
            if let Some(deadline) = deadline {
                budget = budget.min(deadline.saturating_duration_since(Instant::now()));
            }
            if !budget.is_zero() {
                self.listener.wait_timeout(budget);
            }
        }

        // Final drain so nothing written before stop is dropped.
        self.tick();
        let keys: Vec<String> = self.metas.keys().cloned().collect();
        for key in keys {
            self.end_session(&key, EndReason::Shutdown);
        }
        self.save_positions(true);
        Ok(())
    }

    /// One poll cycle. Public so embedders with their own scheduling can
    /// drive the watcher directly.
    pub fn tick(&mut self) {
        self.refresh_files();
        self.reap_missing_files();
        self.drain_files();
        self.scan_lifecycle();
        self.save_positions(false);
    }

    fn add_tracker(&mut self, file: &DiscoveredFile, initial: bool) {
        if self.tailers.contains(&file.path) {
            return;
        }

        let resumed = PositionStore::find(&self.resume_positions, &file.path);
        let opened = match resumed {
            Some(position) => JsonlTailer::resume(&file.path, position),
            None if initial && !self.config.process_existing => JsonlTailer::open_at_end(&file.path),
            None => JsonlTailer::open(&file.path),
        };

        let tailer = match opened {
            Ok(tailer) => tailer.with_chunk_size(self.config.read_chunk_size),
            Err(err) => {
                tracing::warn!(path = %file.path.display(), error = %err, "failed to open session file");
                return;
            }
        };

        let session_id = if file.is_sidechain_file() {
            None
        } else {
            Some(file.stem.clone())
        };

        self.tailers.add(tailer);
        self.file_meta.insert(
            file.path.clone(),
            FileMeta {
                project_slug: file.project_slug.clone(),
                session_id,
                agent_id: None,
                error_since: None,
            },
        );
    }

    fn refresh_files(&mut self) {
        for file in scan_session_files(&self.config.base_path) {
            self.add_tracker(&file, false);
        }
    }

    fn reap_missing_files(&mut self) {
        let gone: Vec<PathBuf> = self
            .tailers
            .paths()
            .filter(|path| !path.exists())
            .map(|path| path.to_path_buf())
            .collect();
        for path in gone {
            self.file_gone(&path);
        }
    }

    fn file_gone(&mut self, path: &Path) {
        self.tailers.remove(path);
        let Some(meta) = self.file_meta.remove(path) else {
            return;
        };
        let Some(session_id) = meta.session_id else {
            return;
        };

        let was_main = !is_sidechain_stem(path);
        let has_other_files = self
            .file_meta
            .values()
            .any(|m| m.session_id.as_deref() == Some(session_id.as_str()));

        if was_main || !has_other_files {
            self.end_session(&session_id, EndReason::FileGone);
        }
    }

    fn drain_files(&mut self) {
        for (path, result) in self.tailers.poll_files() {
            match result {
                Ok(lines) => {
                    if let Some(meta) = self.file_meta.get_mut(&path) {
                        meta.error_since = None;
                    }
                    for line in lines {
                        self.process_line(&path, line);
                    }
                }
                Err(err) => self.note_read_error(&path, err),
            }
        }
    }

    fn note_read_error(&mut self, path: &Path, err: livetrace_core::Error) {
        if !path.exists() {
            self.file_gone(path);
            return;
        }
        let end_timeout = self.config.end_timeout;
        let Some(meta) = self.file_meta.get_mut(path) else {
            return;
        };
        let since = *meta.error_since.get_or_insert_with(Instant::now);
        tracing::debug!(path = %path.display(), error = %err, "transient read failure");
        if since.elapsed() >= end_timeout {
            self.file_gone(path);
        }
    }

    fn process_line(&mut self, path: &Path, line: TailedLine) {
        let (agent_hint, slug) = {
            let Some(meta) = self.file_meta.get_mut(path) else {
                return;
            };
            if let TailedLine::Entry(value) = &line {
                if meta.agent_id.is_none()
                    && let Some(agent_id) = value.get("agentId").and_then(|v| v.as_str())
                {
                    meta.agent_id = Some(agent_id.to_string());
                }
                if meta.session_id.is_none()
                    && let Some(session_id) = value.get("sessionId").and_then(|v| v.as_str())
                {
                    meta.session_id = Some(session_id.to_string());
                }
            }
            (meta.agent_id.clone(), meta.project_slug.clone())
        };

        let mut events = self.parser.parse_line(&line, agent_hint.as_deref());
        if events.is_empty() {
            return;
        }

        let session_key = self
            .file_meta
            .get(path)
            .and_then(|m| m.session_id.clone())
            .or_else(|| {
                events
                    .iter()
                    .find(|e| !e.session_id.is_empty())
                    .map(|e| e.session_id.clone())
            });

        let Some(session_key) = session_key else {
            // No attribution yet (a sidechain file whose first lines are
            // unparseable); deliver without lifecycle bookkeeping.
            for event in events {
                self.emitter.emit(&event);
            }
            return;
        };

        for event in &mut events {
            if event.session_id.is_empty() {
                event.session_id = session_key.clone();
            }
        }

        self.ensure_session(&session_key, &slug, path, &events);
        for event in events {
            self.route_event(&session_key, event);
        }
    }

    fn ensure_session(
        &mut self,
        session_key: &str,
        project_slug: &str,
        path: &Path,
        events: &[SessionEvent],
    ) {
        if !self.metas.contains_key(session_key) {
            let timestamp = events.first().map(|e| e.timestamp).unwrap_or_else(Utc::now);
            let cwd = events.iter().find_map(|event| match &event.payload {
                EventPayload::Message { message } => message.cwd.clone(),
                _ => None,
            });

            self.metas.insert(
                session_key.to_string(),
                SessionMeta {
                    project_slug: project_slug.to_string(),
                    phase: Phase::Active,
                    last_seen: Instant::now(),
                    idle_since: None,
                    idle_entered: None,
                    message_count: 0,
                    tool_count: 0,
                },
            );
            self.sessions.insert(LiveSession::new(
                session_key,
                project_slug,
                self.config.retention_policy,
                timestamp,
            ));

            if self.config.emit_session_events {
                self.emitter.emit(&SessionEvent {
                    timestamp,
                    session_id: session_key.to_string(),
                    agent_id: None,
                    payload: EventPayload::SessionStart {
                        project_slug: project_slug.to_string(),
                        file_path: path.to_path_buf(),
                        cwd,
                    },
                });
            }
            return;
        }

        let resume = match self.metas.get_mut(session_key) {
            Some(meta) if meta.phase == Phase::Idle => {
                let now = Utc::now();
                let idle_since = meta.idle_since.unwrap_or(now);
                meta.phase = Phase::Active;
                meta.idle_since = None;
                meta.idle_entered = None;
                Some(seconds_between(idle_since, now))
            }
            _ => None,
        };

        if let Some(idle_duration_seconds) = resume {
            self.set_session_idle(session_key, false);
            if self.config.emit_session_events {
                self.emitter.emit(&SessionEvent {
                    timestamp: Utc::now(),
                    session_id: session_key.to_string(),
                    agent_id: None,
                    payload: EventPayload::SessionResume {
                        idle_duration_seconds,
                    },
                });
            }
        }
    }

    fn route_event(&mut self, session_key: &str, event: SessionEvent) {
        if let Some(meta) = self.metas.get_mut(session_key) {
            meta.last_seen = Instant::now();
        }

        let outcome = match self.sessions.get_session(session_key) {
            Some(handle) => match handle.lock() {
                Ok(mut session) => session.handle_event(&event),
                Err(_) => crate::live::HandleOutcome {
                    deliver_original: true,
                    follow_ups: Vec::new(),
                },
            },
            None => crate::live::HandleOutcome {
                deliver_original: true,
                follow_ups: Vec::new(),
            },
        };

        if outcome.deliver_original {
            if let Some(meta) = self.metas.get_mut(session_key) {
                match event.kind() {
                    EventKind::Message => meta.message_count += 1,
                    EventKind::ToolUse => meta.tool_count += 1,
                    _ => {}
                }
            }
            self.emitter.emit(&event);
        }
        for follow_up in outcome.follow_ups {
            self.emitter.emit(&follow_up);
        }
    }

    fn scan_lifecycle(&mut self) {
        let now = Instant::now();

        let to_idle: Vec<String> = self
            .metas
            .iter()
            .filter(|(_, meta)| {
                meta.phase == Phase::Active
                    && now.duration_since(meta.last_seen) >= self.config.idle_timeout
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in to_idle {
            let now_wall = Utc::now();
            if let Some(meta) = self.metas.get_mut(&key) {
                meta.phase = Phase::Idle;
                meta.idle_since = Some(now_wall);
                meta.idle_entered = Some(now);
            }
            self.set_session_idle(&key, true);
            if self.config.emit_session_events {
                self.emitter.emit(&SessionEvent {
                    timestamp: now_wall,
                    session_id: key.clone(),
                    agent_id: None,
                    payload: EventPayload::SessionIdle {
                        idle_since: now_wall,
                    },
                });
            }
        }

        let to_end: Vec<String> = self
            .metas
            .iter()
            .filter(|(_, meta)| {
                meta.phase == Phase::Idle
                    && meta
                        .idle_entered
                        .is_some_and(|entered| now.duration_since(entered) >= self.config.end_timeout)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in to_end {
            self.end_session(&key, EndReason::IdleTimeout);
        }
    }

    fn end_session(&mut self, session_key: &str, reason: EndReason) {
        let Some(meta) = self.metas.remove(session_key) else {
            return;
        };
        self.sessions.remove(session_key);

        if self.config.emit_session_events {
            let now = Utc::now();
            let idle_duration_seconds = meta
                .idle_since
                .map(|since| seconds_between(since, now))
                .unwrap_or(0.0);
            self.emitter.emit(&SessionEvent {
                timestamp: now,
                session_id: session_key.to_string(),
                agent_id: None,
                payload: EventPayload::SessionEnd {
                    reason,
                    idle_duration_seconds,
                    message_count: meta.message_count,
                    tool_count: meta.tool_count,
                },
            });
        }
    }

    fn set_session_idle(&self, session_key: &str, idle: bool) {
        if let Some(handle) = self.sessions.get_session(session_key)
            && let Ok(mut session) = handle.lock()
        {
            session.set_idle(idle);
        }
    }

    fn save_positions(&mut self, force: bool) {
        let Some(store) = &self.store else {
            return;
        };
        if !force && self.last_save.elapsed() < self.config.save_interval {
            return;
        }
        let positions = self.tailers.positions();
        if let Err(err) = store.save(&positions) {
            tracing::warn!(path = %store.path().display(), error = %err, "failed to save tailer positions");
        }
        self.last_save = Instant::now();
    }
}

/// Handle to a watcher running on its own thread.
pub struct WatcherHandle {
    stop: StopHandle,
    sessions: LiveSessionMap,
    handle: JoinHandle<Result<()>>,
}

impl WatcherHandle {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn live_sessions(&self) -> LiveSessionMap {
        self.sessions.clone()
    }

    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| Error::Setup("watcher thread panicked".to_string()))?
    }

    pub fn stop_and_join(self) -> Result<()> {
        self.stop();
        self.join()
    }
}

fn is_sidechain_stem(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem.starts_with("agent-"))
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds().max(0) as f64) / 1000.0
}
