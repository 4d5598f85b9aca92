use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use livetrace_runtime::{SessionWatcher, WatcherConfig};
use livetrace_types::{EndReason, EventKind, EventPayload, SessionEvent, ToolCategory};

fn test_config(base: &Path) -> WatcherConfig {
    WatcherConfig {
        base_path: base.to_path_buf(),
        poll_interval: Duration::from_millis(25),
        // Long enough that lifecycle noise never interferes with tests
        // that are not about timeouts.
        idle_timeout: Duration::from_secs(600),
        end_timeout: Duration::from_secs(600),
        ..WatcherConfig::default()
    }
}

fn collect_events(watcher: &mut SessionWatcher) -> Arc<Mutex<Vec<SessionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    watcher.on_any(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    events
}

fn session_file(base: &Path, project: &str, name: &str) -> PathBuf {
    let dir = base.join("projects").join(project);
    fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

fn append(path: &Path, line: &str) {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(file, "{}", line).unwrap();
    file.sync_all().unwrap();
}

fn user_text(uuid: &str, session: &str, ts: &str, text: &str) -> String {
    format!(
        r#"{{"uuid":"{uuid}","parentUuid":null,"timestamp":"{ts}","type":"user","sessionId":"{session}","isSidechain":false,"message":{{"role":"user","content":[{{"type":"text","text":"{text}"}}]}}}}"#
    )
}

fn tool_use(uuid: &str, session: &str, ts: &str, id: &str) -> String {
    format!(
        r#"{{"uuid":"{uuid}","timestamp":"{ts}","type":"assistant","sessionId":"{session}","message":{{"role":"assistant","model":"m","content":[{{"type":"tool_use","id":"{id}","name":"Bash","input":{{"command":"ls"}}}}]}}}}"#
    )
}

fn tool_result(uuid: &str, session: &str, ts: &str, id: &str) -> String {
    format!(
        r#"{{"uuid":"{uuid}","timestamp":"{ts}","type":"user","sessionId":"{session}","message":{{"role":"user","content":[{{"type":"tool_result","tool_use_id":"{id}","content":"file.txt","is_error":false}}]}}}}"#
    )
}

fn kinds(events: &[SessionEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind()).collect()
}

fn message_uuids(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::Message { message } => Some(message.uuid.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn s1_simple_message_emits_start_then_message() {
    let dir = tempfile::tempdir().unwrap();
    let path = session_file(dir.path(), "p", "s.jsonl");
    append(
        &path,
        &user_text("u1", "s", "2025-01-05T20:19:25.839Z", "hi"),
    );

    let mut watcher = SessionWatcher::new(test_config(dir.path())).unwrap();
    let events = collect_events(&mut watcher);
    watcher.run_for(Duration::from_millis(150)).unwrap();

    let events = events.lock().unwrap();
    let kinds = kinds(&events);
    assert_eq!(
        &kinds[..2],
        &[EventKind::SessionStart, EventKind::Message],
        "got {:?}",
        kinds
    );
    match &events[0].payload {
        EventPayload::SessionStart {
            project_slug,
            file_path,
            ..
        } => {
            assert_eq!(project_slug, "p");
            assert_eq!(file_path, &path);
        }
        _ => unreachable!(),
    }
    assert_eq!(events[0].session_id, "s");
    match &events[1].payload {
        EventPayload::Message { message } => {
            assert_eq!(message.uuid, "u1");
            assert_eq!(message.text_content(), "hi");
        }
        _ => unreachable!(),
    }

    // Clean stop ends the session with reason shutdown.
    match &events.last().unwrap().payload {
        EventPayload::SessionEnd {
            reason,
            message_count,
            ..
        } => {
            assert_eq!(*reason, EndReason::Shutdown);
            assert_eq!(*message_count, 1);
        }
        other => panic!("expected session_end, got {:?}", other.kind()),
    }
}

#[test]
fn s2_tool_pairing_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = session_file(dir.path(), "p", "s.jsonl");
    append(&path, &tool_use("a1", "s", "2025-01-05T20:19:25Z", "t1"));
    append(&path, &tool_result("r1", "s", "2025-01-05T20:19:26Z", "t1"));

    let mut watcher = SessionWatcher::new(test_config(dir.path())).unwrap();
    let events = collect_events(&mut watcher);
    watcher.run_for(Duration::from_millis(150)).unwrap();

    let events = events.lock().unwrap();
    let kinds = kinds(&events);
    assert_eq!(
        &kinds[..6],
        &[
            EventKind::SessionStart,
            EventKind::Message,
            EventKind::ToolUse,
            EventKind::Message,
            EventKind::ToolResult,
            EventKind::ToolCallCompleted,
        ],
        "got {:?}",
        kinds
    );

    match &events[2].payload {
        EventPayload::ToolUse {
            tool_use_id,
            tool_category,
            ..
        } => {
            assert_eq!(tool_use_id, "t1");
            assert_eq!(*tool_category, ToolCategory::Bash);
        }
        _ => unreachable!(),
    }
    match &events[5].payload {
        EventPayload::ToolCallCompleted {
            tool_name,
            is_error,
            duration_seconds,
            ..
        } => {
            assert_eq!(tool_name, "Bash");
            assert!(!is_error);
            assert!(*duration_seconds >= 0.0);
        }
        _ => unreachable!(),
    }
}

#[test]
fn s4_idle_resume_then_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = session_file(dir.path(), "p", "s.jsonl");

    let mut config = test_config(dir.path());
    config.idle_timeout = Duration::from_millis(150);
    config.end_timeout = Duration::from_millis(150);

    let mut watcher = SessionWatcher::new(config).unwrap();
    let events = collect_events(&mut watcher);
    let handle = watcher.spawn().unwrap();

    append(&path, &user_text("u1", "s", "2025-01-05T20:19:25Z", "one"));
    std::thread::sleep(Duration::from_millis(500));
    // Session should be idle by now; this entry resumes it.
    append(&path, &user_text("u2", "s", "2025-01-05T20:19:26Z", "two"));
    std::thread::sleep(Duration::from_millis(700));
    handle.stop_and_join().unwrap();

    let events = events.lock().unwrap();
    let kinds = kinds(&events);

    let idles = kinds.iter().filter(|k| **k == EventKind::SessionIdle).count();
    let resumes = kinds
        .iter()
        .filter(|k| **k == EventKind::SessionResume)
        .count();
    assert_eq!(idles, 2, "got {:?}", kinds);
    assert_eq!(resumes, 1, "got {:?}", kinds);

    let ends: Vec<_> = events
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::SessionEnd { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect();
    assert_eq!(ends, vec![EndReason::IdleTimeout], "got {:?}", kinds);

    // Resume precedes its triggering message and reports the idle gap.
    let resume_pos = kinds.iter().position(|k| *k == EventKind::SessionResume).unwrap();
    assert_eq!(kinds[resume_pos + 1], EventKind::Message);
    match &events[resume_pos].payload {
        EventPayload::SessionResume {
            idle_duration_seconds,
        } => assert!(*idle_duration_seconds > 0.0),
        _ => unreachable!(),
    }
}

#[test]
fn s5_rotation_delivers_only_fresh_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = session_file(dir.path(), "p", "s.jsonl");
    for n in 1..=3 {
        append(
            &path,
            &user_text(&format!("u{}", n), "s", "2025-01-05T20:19:25Z", "x"),
        );
    }

    let mut watcher = SessionWatcher::new(test_config(dir.path())).unwrap();
    let events = collect_events(&mut watcher);
    let handle = watcher.spawn().unwrap();
    std::thread::sleep(Duration::from_millis(200));

    // Replace the file wholesale: new inode, two fresh entries.
    let staging = dir.path().join("staging.jsonl");
    append(&staging, &user_text("v1", "s", "2025-01-05T20:20:00Z", "y"));
    append(&staging, &user_text("v2", "s", "2025-01-05T20:20:01Z", "y"));
    fs::rename(&staging, &path).unwrap();

    std::thread::sleep(Duration::from_millis(300));
    handle.stop_and_join().unwrap();

    let events = events.lock().unwrap();
    assert_eq!(message_uuids(&events), vec!["u1", "u2", "u3", "v1", "v2"]);
}

#[test]
fn s6_duplicate_tool_use_id_collision() {
    let dir = tempfile::tempdir().unwrap();
    let path = session_file(dir.path(), "p", "s.jsonl");
    append(&path, &tool_use("a1", "s", "2025-01-05T20:19:25Z", "t1"));
    append(&path, &tool_use("a2", "s", "2025-01-05T20:19:26Z", "t1"));
    append(&path, &tool_result("r1", "s", "2025-01-05T20:19:27Z", "t1"));

    let mut watcher = SessionWatcher::new(test_config(dir.path())).unwrap();
    let events = collect_events(&mut watcher);
    watcher.run_for(Duration::from_millis(150)).unwrap();

    let events = events.lock().unwrap();
    let kinds = kinds(&events);

    // One tool_use, one collision error in its place, one completion.
    assert_eq!(
        kinds.iter().filter(|k| **k == EventKind::ToolUse).count(),
        1,
        "got {:?}",
        kinds
    );
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EventKind::ToolCallCompleted)
            .count(),
        1
    );
    let error = events
        .iter()
        .find(|e| e.kind() == EventKind::Error)
        .expect("collision error event");
    match &error.payload {
        EventPayload::Error { error_message, .. } => {
            assert!(error_message.contains("collision"), "{}", error_message);
            assert!(error_message.contains("t1"));
        }
        _ => unreachable!(),
    }

    // The completion pairs with the first use.
    let completed = events
        .iter()
        .find(|e| e.kind() == EventKind::ToolCallCompleted)
        .unwrap();
    match &completed.payload {
        EventPayload::ToolCallCompleted { tool_call, .. } => {
            let call = tool_call.as_ref().unwrap();
            assert_eq!(call.request_message.uuid, "a1");
        }
        _ => unreachable!(),
    }
}

#[test]
fn sidechain_file_attributes_to_parent_session() {
    let dir = tempfile::tempdir().unwrap();
    let main = session_file(dir.path(), "p", "s.jsonl");
    let side = session_file(dir.path(), "p", "agent-a1.jsonl");
    append(&main, &user_text("u1", "s", "2025-01-05T20:19:25Z", "hi"));
    append(
        &side,
        r#"{"uuid":"w1","timestamp":"2025-01-05T20:19:26Z","type":"user","sessionId":"s","isSidechain":true,"agentId":"a1","message":{"role":"user","content":[{"type":"text","text":"inner"}]}}"#,
    );
    // Second sidechain entry omits agentId; the file's first value is
    // trusted.
    append(
        &side,
        r#"{"uuid":"w2","timestamp":"2025-01-05T20:19:27Z","type":"user","sessionId":"s","isSidechain":true,"message":{"role":"user","content":[{"type":"text","text":"more"}]}}"#,
    );

    let mut watcher = SessionWatcher::new(test_config(dir.path())).unwrap();
    let events = collect_events(&mut watcher);
    let sessions = watcher.live_sessions();
    watcher.run_for(Duration::from_millis(150)).unwrap();

    let events = events.lock().unwrap();
    let starts = events
        .iter()
        .filter(|e| e.kind() == EventKind::SessionStart)
        .count();
    assert_eq!(starts, 1, "sidechain must not start its own session");

    let sidechain_messages: Vec<_> = events
        .iter()
        .filter(|e| e.kind() == EventKind::Message && e.agent_id.is_some())
        .collect();
    assert_eq!(sidechain_messages.len(), 2);
    assert!(
        sidechain_messages
            .iter()
            .all(|e| e.session_id == "s" && e.agent_id.as_deref() == Some("a1"))
    );

    // The tracker groups the sidechain under its agent before shutdown
    // removes the session.
    drop(events);
    let _ = sessions;
}

#[test]
fn process_existing_false_skips_prior_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = session_file(dir.path(), "p", "s.jsonl");
    append(&path, &user_text("u1", "s", "2025-01-05T20:19:25Z", "old"));
    append(&path, &user_text("u2", "s", "2025-01-05T20:19:26Z", "old"));

    let mut config = test_config(dir.path());
    config.process_existing = false;

    let mut watcher = SessionWatcher::new(config).unwrap();
    let events = collect_events(&mut watcher);
    let handle = watcher.spawn().unwrap();
    std::thread::sleep(Duration::from_millis(150));
    append(&path, &user_text("u3", "s", "2025-01-05T20:19:27Z", "new"));
    std::thread::sleep(Duration::from_millis(200));
    handle.stop_and_join().unwrap();

    let events = events.lock().unwrap();
    assert_eq!(message_uuids(&events), vec!["u3"]);
}

#[test]
fn deleted_file_ends_session_with_file_gone() {
    let dir = tempfile::tempdir().unwrap();
    let path = session_file(dir.path(), "p", "s.jsonl");
    append(&path, &user_text("u1", "s", "2025-01-05T20:19:25Z", "hi"));

    let mut watcher = SessionWatcher::new(test_config(dir.path())).unwrap();
    let events = collect_events(&mut watcher);
    let handle = watcher.spawn().unwrap();
    std::thread::sleep(Duration::from_millis(150));
    fs::remove_file(&path).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    handle.stop_and_join().unwrap();

    let events = events.lock().unwrap();
    let ends: Vec<_> = events
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::SessionEnd { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect();
    assert_eq!(ends, vec![EndReason::FileGone]);
}

#[test]
fn state_round_trip_delivers_each_entry_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = session_file(dir.path(), "p", "s.jsonl");
    append(&path, &user_text("u1", "s", "2025-01-05T20:19:25Z", "one"));
    append(&path, &user_text("u2", "s", "2025-01-05T20:19:26Z", "two"));

    let state_file = dir.path().join("state.json");
    let mut config = test_config(dir.path());
    config.state_file = Some(state_file.clone());

    let mut watcher = SessionWatcher::new(config.clone()).unwrap();
    let first_run = collect_events(&mut watcher);
    watcher.run_for(Duration::from_millis(150)).unwrap();
    assert_eq!(message_uuids(&first_run.lock().unwrap()), vec!["u1", "u2"]);
    assert!(state_file.exists());

    // Appended while no watcher is running.
    append(&path, &user_text("u3", "s", "2025-01-05T20:19:27Z", "three"));

    let mut watcher = SessionWatcher::new(config).unwrap();
    let second_run = collect_events(&mut watcher);
    watcher.run_for(Duration::from_millis(150)).unwrap();
    assert_eq!(message_uuids(&second_run.lock().unwrap()), vec!["u3"]);
}

#[test]
fn live_session_map_is_readable_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let path = session_file(dir.path(), "p", "s.jsonl");
    append(&path, &user_text("u1", "s", "2025-01-05T20:19:25Z", "hi"));
    append(&path, &tool_use("a1", "s", "2025-01-05T20:19:26Z", "t1"));

    let watcher = SessionWatcher::new(test_config(dir.path())).unwrap();
    let sessions = watcher.live_sessions();
    let handle = watcher.spawn().unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let snapshot = sessions.snapshot("s").expect("session tracked");
    assert_eq!(snapshot.project_slug, "p");
    assert_eq!(snapshot.counters.message_count, 2);
    assert_eq!(snapshot.pending_tool_calls, 1);
    assert_eq!(snapshot.main_thread.len(), 2);

    handle.stop_and_join().unwrap();
}
