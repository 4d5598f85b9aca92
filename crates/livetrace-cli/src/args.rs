use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use livetrace_types::{EventKind, ToolCategory};

#[derive(Debug, Parser)]
#[command(
    name = "livetrace",
    version,
    about = "Observe AI coding agent sessions in real time"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Tail session transcripts and print events as they happen
    Watch(WatchArgs),
    /// Tail session transcripts and serve Prometheus metrics
    Metrics(MetricsArgs),
}

#[derive(Debug, Args)]
pub struct WatcherArgs {
    /// Host data directory (defaults to ~/.claude)
    #[arg(long)]
    pub base_path: Option<PathBuf>,

    /// Poll interval, e.g. 500ms or 2s
    #[arg(long, value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Inactivity before a session is reported idle
    #[arg(long, value_parser = humantime::parse_duration)]
    pub idle_timeout: Option<Duration>,

    /// Further inactivity past idle before the session ends
    #[arg(long, value_parser = humantime::parse_duration)]
    pub end_timeout: Option<Duration>,

    /// Start at the end of existing files instead of replaying them
    #[arg(long)]
    pub no_process_existing: bool,

    /// Suppress session lifecycle events
    #[arg(long)]
    pub no_session_events: bool,

    /// Keep oversized tool inputs intact
    #[arg(long)]
    pub no_truncate_inputs: bool,

    /// Truncation threshold for tool inputs, in bytes
    #[arg(long)]
    pub max_input_length: Option<usize>,

    /// Persist tailer positions to this file
    #[arg(long)]
    pub state_file: Option<PathBuf>,

    /// How often to persist tailer positions
    #[arg(long, value_parser = humantime::parse_duration)]
    pub save_interval: Option<Duration>,

    /// Message retention in the live session tracker
    #[arg(long, value_enum, default_value_t = RetentionArg::Full)]
    pub retention: RetentionArg,

    /// Window size for --retention sliding
    #[arg(long)]
    pub max_messages: Option<usize>,

    /// Use native filesystem notification to cut discovery latency
    #[arg(long)]
    pub notify: bool,

    /// TOML config file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub watcher: WatcherArgs,

    /// Only events from this project slug
    #[arg(long)]
    pub project: Option<String>,

    /// Only events from this session id
    #[arg(long)]
    pub session: Option<String>,

    /// Only sessions whose id starts with this prefix
    #[arg(long)]
    pub session_prefix: Option<String>,

    /// Only these event types (repeatable)
    #[arg(long = "event-type", value_parser = parse_event_kind)]
    pub event_types: Vec<EventKind>,

    /// Only these tools (repeatable)
    #[arg(long = "tool")]
    pub tools: Vec<String>,

    /// Only these tool categories (repeatable)
    #[arg(long = "category", value_parser = parse_tool_category)]
    pub categories: Vec<ToolCategory>,

    /// Only errors and failed tool calls
    #[arg(long)]
    pub errors_only: bool,

    /// Only sidechain (sub-agent) events
    #[arg(long, conflicts_with = "main_only")]
    pub agent_only: bool,

    /// Only main-thread events
    #[arg(long)]
    pub main_only: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// POST event batches to this URL (repeatable)
    #[arg(long = "webhook")]
    pub webhooks: Vec<String>,

    /// Extra header for every webhook, as name=value (repeatable)
    #[arg(long = "webhook-header", value_parser = parse_header)]
    pub webhook_headers: Vec<(String, String)>,

    /// Also serve /metrics and /health on this address
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,

    /// Exit after this long instead of running until interrupted
    #[arg(long, value_parser = humantime::parse_duration)]
    pub run_for: Option<Duration>,
}

#[derive(Debug, Args)]
pub struct MetricsArgs {
    #[command(flatten)]
    pub watcher: WatcherArgs,

    /// Address for the metrics endpoint
    #[arg(long, default_value = livetrace_export::DEFAULT_METRICS_ADDR)]
    pub bind: SocketAddr,

    /// Exit after this long instead of running until interrupted
    #[arg(long, value_parser = humantime::parse_duration)]
    pub run_for: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RetentionArg {
    Full,
    Sliding,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

fn parse_event_kind(value: &str) -> Result<EventKind, String> {
    value.parse()
}

fn parse_tool_category(value: &str) -> Result<ToolCategory, String> {
    value.parse()
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(name, val)| (name.trim().to_string(), val.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got {:?}", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_watch_flags() {
        let cli = Cli::parse_from([
            "livetrace",
            "watch",
            "--base-path",
            "/tmp/claude",
            "--poll-interval",
            "250ms",
            "--event-type",
            "tool_use",
            "--event-type",
            "tool_call_completed",
            "--category",
            "bash",
            "--webhook",
            "http://localhost:9999/hook",
            "--webhook-header",
            "authorization=Bearer x",
            "--format",
            "json",
        ]);
        let Command::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        assert_eq!(args.watcher.base_path.as_deref().unwrap().to_str(), Some("/tmp/claude"));
        assert_eq!(args.watcher.poll_interval, Some(Duration::from_millis(250)));
        assert_eq!(
            args.event_types,
            vec![EventKind::ToolUse, EventKind::ToolCallCompleted]
        );
        assert_eq!(args.categories, vec![ToolCategory::Bash]);
        assert_eq!(args.webhooks.len(), 1);
        assert_eq!(
            args.webhook_headers,
            vec![("authorization".to_string(), "Bearer x".to_string())]
        );
        assert_eq!(args.format, OutputFormat::Json);
    }

    #[test]
    fn rejects_unknown_event_type() {
        assert!(Cli::try_parse_from(["livetrace", "watch", "--event-type", "nope"]).is_err());
    }

    #[test]
    fn metrics_bind_defaults() {
        let cli = Cli::parse_from(["livetrace", "metrics"]);
        let Command::Metrics(args) = cli.command else {
            panic!("expected metrics");
        };
        assert_eq!(args.bind.port(), 9090);
    }
}
