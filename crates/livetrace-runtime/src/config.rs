use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::live::RetentionPolicy;

/// Configuration for a [`crate::SessionWatcher`].
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Root of the host's data directory; session files live under
    /// `<base_path>/projects/<project_slug>/*.jsonl`.
    pub base_path: PathBuf,
    pub poll_interval: Duration,
    /// Inactivity threshold before a session is reported idle.
    pub idle_timeout: Duration,
    /// Further inactivity past going idle before the session ends.
    pub end_timeout: Duration,
    /// Replay entries already on disk at startup; otherwise tailers open at
    /// the current end of each file.
    pub process_existing: bool,
    /// Emit session_start / session_idle / session_resume / session_end.
    pub emit_session_events: bool,
    pub truncate_inputs: bool,
    pub max_input_length: usize,
    /// Where to persist tailer positions; None disables persistence.
    pub state_file: Option<PathBuf>,
    pub save_interval: Duration,
    pub retention_policy: RetentionPolicy,
    /// Use a native filesystem watch to cut discovery latency. The poll
    /// loop stays authoritative either way.
    pub use_notify: bool,
    /// Per-file read budget per poll.
    pub read_chunk_size: usize,
    /// Bound of the async facade's event queue; overflow drops the oldest
    /// element.
    pub async_queue_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            base_path: default_base_path(),
            poll_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(120),
            end_timeout: Duration::from_secs(300),
            process_existing: true,
            emit_session_events: true,
            truncate_inputs: true,
            max_input_length: 1024,
            state_file: None,
            save_interval: Duration::from_secs(30),
            retention_policy: RetentionPolicy::Full,
            use_notify: false,
            read_chunk_size: livetrace_core::tailer::DEFAULT_CHUNK_SIZE,
            async_queue_capacity: 1024,
        }
    }
}

impl WatcherConfig {
    /// Apply values from a TOML config file; fields absent from the file
    /// keep their current value.
    pub fn apply_file(mut self, path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content)?;

        if let Some(base_path) = file.base_path {
            self.base_path = expand_tilde(&base_path);
        }
        if let Some(secs) = file.poll_interval_secs {
            self.poll_interval = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = file.idle_timeout_secs {
            self.idle_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = file.end_timeout_secs {
            self.end_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(process_existing) = file.process_existing {
            self.process_existing = process_existing;
        }
        if let Some(emit) = file.emit_session_events {
            self.emit_session_events = emit;
        }
        if let Some(truncate) = file.truncate_inputs {
            self.truncate_inputs = truncate;
        }
        if let Some(max) = file.max_input_length {
            self.max_input_length = max;
        }
        if let Some(state_file) = file.state_file {
            self.state_file = Some(expand_tilde(&state_file));
        }
        if let Some(secs) = file.save_interval_secs {
            self.save_interval = Duration::from_secs_f64(secs);
        }
        if let Some(policy) = file.retention_policy {
            self.retention_policy = parse_retention(&policy, file.max_messages)?;
        }
        if let Some(use_notify) = file.use_notify {
            self.use_notify = use_notify;
        }
        if let Some(capacity) = file.async_queue_capacity {
            self.async_queue_capacity = capacity;
        }
        Ok(self)
    }
}

fn parse_retention(name: &str, max_messages: Option<usize>) -> Result<RetentionPolicy> {
    match name {
        "full" => Ok(RetentionPolicy::Full),
        "none" => Ok(RetentionPolicy::None),
        "sliding" => {
            let max = max_messages.ok_or_else(|| {
                Error::Config("retention_policy = \"sliding\" requires max_messages".to_string())
            })?;
            Ok(RetentionPolicy::Sliding(max))
        }
        other => Err(Error::Config(format!("unknown retention policy: {}", other))),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    base_path: Option<String>,
    poll_interval_secs: Option<f64>,
    idle_timeout_secs: Option<f64>,
    end_timeout_secs: Option<f64>,
    process_existing: Option<bool>,
    emit_session_events: Option<bool>,
    truncate_inputs: Option<bool>,
    max_input_length: Option<usize>,
    state_file: Option<String>,
    save_interval_secs: Option<f64>,
    retention_policy: Option<String>,
    max_messages: Option<usize>,
    use_notify: Option<bool>,
    async_queue_capacity: Option<usize>,
}

/// Default host data directory: `~/.claude`.
pub fn default_base_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

/// Expand a leading tilde to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = WatcherConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.end_timeout, Duration::from_secs(300));
        assert!(config.process_existing);
        assert!(config.emit_session_events);
        assert!(config.truncate_inputs);
        assert_eq!(config.max_input_length, 1024);
        assert!(config.state_file.is_none());
        assert_eq!(config.save_interval, Duration::from_secs(30));
        assert_eq!(config.retention_policy, RetentionPolicy::Full);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livetrace.toml");
        std::fs::write(
            &path,
            r#"
poll_interval_secs = 0.1
idle_timeout_secs = 2
retention_policy = "sliding"
max_messages = 50
process_existing = false
"#,
        )
        .unwrap();

        let config = WatcherConfig::default().apply_file(&path).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.idle_timeout, Duration::from_secs(2));
        assert_eq!(config.retention_policy, RetentionPolicy::Sliding(50));
        assert!(!config.process_existing);
        // Untouched fields keep their defaults.
        assert_eq!(config.end_timeout, Duration::from_secs(300));
    }

    #[test]
    fn sliding_without_max_messages_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livetrace.toml");
        std::fs::write(&path, "retention_policy = \"sliding\"\n").unwrap();
        assert!(WatcherConfig::default().apply_file(&path).is_err());
    }
}
