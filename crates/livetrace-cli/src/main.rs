mod args;
mod format;

use anyhow::Context;
use clap::Parser;

use livetrace_export::{MetricsCollector, MetricsServer, WebhookConfig, WebhookDispatcher};
use livetrace_runtime::{filter, EventFilter, SessionWatcher, WatcherConfig};

use args::{Cli, Command, MetricsArgs, RetentionArg, WatchArgs, WatcherArgs};
use format::format_event;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("livetrace=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Watch(args) => run_watch(args),
        Command::Metrics(args) => run_metrics(args),
    };

    match result {
        Ok(()) => {}
        Err(err) => {
            eprintln!("livetrace: {:#}", err);
            std::process::exit(1);
        }
    }
}

fn build_config(args: &WatcherArgs) -> anyhow::Result<WatcherConfig> {
    let mut config = WatcherConfig::default();
    if let Some(path) = &args.config {
        config = config
            .apply_file(path)
            .with_context(|| format!("loading config file {}", path.display()))?;
    }

    if let Some(base_path) = &args.base_path {
        config.base_path = base_path.clone();
    }
    if let Some(poll_interval) = args.poll_interval {
        config.poll_interval = poll_interval;
    }
    if let Some(idle_timeout) = args.idle_timeout {
        config.idle_timeout = idle_timeout;
    }
    if let Some(end_timeout) = args.end_timeout {
        config.end_timeout = end_timeout;
    }
    if args.no_process_existing {
        config.process_existing = false;
    }
    if args.no_session_events {
        config.emit_session_events = false;
    }
    if args.no_truncate_inputs {
        config.truncate_inputs = false;
    }
    if let Some(max_input_length) = args.max_input_length {
        config.max_input_length = max_input_length;
    }
    if let Some(state_file) = &args.state_file {
        config.state_file = Some(state_file.clone());
    }
    if let Some(save_interval) = args.save_interval {
        config.save_interval = save_interval;
    }
    config.retention_policy = match args.retention {
        RetentionArg::Full => livetrace_runtime::RetentionPolicy::Full,
        RetentionArg::None => livetrace_runtime::RetentionPolicy::None,
        RetentionArg::Sliding => {
            let max = args
                .max_messages
                .context("--retention sliding requires --max-messages")?;
            livetrace_runtime::RetentionPolicy::Sliding(max)
        }
    };
    if args.notify {
        config.use_notify = true;
    }
    Ok(config)
}

fn build_filter(args: &WatchArgs, watcher: &SessionWatcher) -> EventFilter {
    let mut combined = filter::always();
    if let Some(project) = &args.project {
        combined = combined.and(filter::project(watcher.live_sessions(), project.clone()));
    }
    if let Some(session) = &args.session {
        combined = combined.and(filter::session(session.clone()));
    }
    if let Some(prefix) = &args.session_prefix {
        combined = combined.and(filter::session_prefix(prefix.clone()));
    }
    if !args.event_types.is_empty() {
        combined = combined.and(filter::event_type(&args.event_types));
    }
    if !args.tools.is_empty() {
        let names: Vec<&str> = args.tools.iter().map(|s| s.as_str()).collect();
        combined = combined.and(filter::tool_name(&names));
    }
    if !args.categories.is_empty() {
        combined = combined.and(filter::tool_category(&args.categories));
    }
    if args.errors_only {
        combined = combined.and(filter::has_error());
    }
    if args.agent_only {
        combined = combined.and(filter::agent());
    }
    if args.main_only {
        combined = combined.and(filter::main_thread());
    }
    combined
}

fn webhook_configs(args: &WatchArgs) -> Vec<WebhookConfig> {
    args.webhooks
        .iter()
        .map(|url| {
            let mut config = WebhookConfig::new(url.clone());
            for (name, value) in &args.webhook_headers {
                config.headers.insert(name.clone(), value.clone());
            }
            config
        })
        .collect()
}

fn install_stop_signal(watcher: &SessionWatcher) -> anyhow::Result<()> {
    let stop = watcher.stop_handle();
    ctrlc::set_handler(move || {
        stop.stop();
    })
    .context("installing signal handler")
}

fn run_watch(args: WatchArgs) -> anyhow::Result<()> {
    let config = build_config(&args.watcher)?;
    let mut watcher = SessionWatcher::new(config).context("starting watcher")?;

    let metrics = MetricsCollector::new();
    watcher.on_any(metrics.handler());
    let server = match args.metrics_addr {
        Some(addr) => Some(MetricsServer::serve(metrics.clone(), addr)?),
        None => None,
    };

    let dispatcher = if args.webhooks.is_empty() {
        None
    } else {
        let dispatcher = WebhookDispatcher::start(webhook_configs(&args), Some(metrics.clone()));
        watcher.on_any(dispatcher.handler());
        Some(dispatcher)
    };

    let event_filter = build_filter(&args, &watcher);
    let format = args.format;
    watcher.pipeline(event_filter).on_any(move |event| {
        if let Some(line) = format_event(event, format) {
            println!("{}", line);
        }
        Ok(())
    });

    install_stop_signal(&watcher)?;
    match args.run_for {
        Some(duration) => watcher.run_for(duration)?,
        None => watcher.run()?,
    }

    if let Some(dispatcher) = dispatcher {
        dispatcher.shutdown();
    }
    if let Some(server) = server {
        server.shutdown();
    }
    Ok(())
}

fn run_metrics(args: MetricsArgs) -> anyhow::Result<()> {
    let config = build_config(&args.watcher)?;
    let mut watcher = SessionWatcher::new(config).context("starting watcher")?;

    let metrics = MetricsCollector::new();
    watcher.on_any(metrics.handler());
    let server = MetricsServer::serve(metrics, args.bind)?;
    eprintln!("livetrace: serving metrics on http://{}", server.addr());

    install_stop_signal(&watcher)?;
    match args.run_for {
        Some(duration) => watcher.run_for(duration)?,
        None => watcher.run()?,
    }

    server.shutdown();
    Ok(())
}
