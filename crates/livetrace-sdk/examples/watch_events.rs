//! Real-time event watching example.
//!
//! Streams events from the default host directory (~/.claude) and prints
//! one line per event. Start an agent session in another terminal to see
//! activity; press Ctrl+C to exit.

use futures::StreamExt;
use livetrace_sdk::AsyncWatcher;
use livetrace_runtime::WatcherConfig;
use livetrace_types::EventPayload;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = WatcherConfig {
        // Skip history; only show what happens from now on.
        process_existing: false,
        ..WatcherConfig::default()
    };

    let mut watcher = AsyncWatcher::new(config)?;
    let mut events = watcher.events();
    let handle = watcher.start()?;

    println!("watching {} (Ctrl+C to exit)", "~/.claude");

    let stop = handle.stop_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop.stop();
    });

    while let Some(event) = events.next().await {
        match &event.payload {
            EventPayload::SessionStart { project_slug, .. } => {
                println!("session {} started in {}", event.session_id, project_slug);
            }
            EventPayload::Message { message } => {
                println!("[{}] {}: {}", event.session_id, message.role, message.text_content());
            }
            EventPayload::ToolCallCompleted {
                tool_name,
                duration_seconds,
                ..
            } => {
                println!("[{}] {} finished in {:.2}s", event.session_id, tool_name, duration_seconds);
            }
            EventPayload::SessionEnd { reason, .. } => {
                println!("session {} ended ({})", event.session_id, reason);
            }
            _ => {}
        }
    }

    handle.join().await?;
    Ok(())
}
