use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use livetrace_types::SessionEvent;

use crate::metrics::MetricsCollector;

/// One webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub batch_size: usize,
    /// Flush a partial batch once this much time has passed since its
    /// first event was buffered.
    pub batch_timeout: Duration,
    pub max_retries: u32,
    /// Base delay of the exponential retry schedule (1x, 2x, 4x...).
    pub retry_backoff: Duration,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        WebhookConfig {
            url: url.into(),
            headers: HashMap::new(),
            batch_size: 10,
            batch_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Queued, batched, retrying HTTP delivery of events.
///
/// One worker thread per endpoint. Batches flush when `batch_size` is
/// reached or `batch_timeout` elapses. 5xx and network failures retry with
/// exponential backoff up to `max_retries`; 4xx responses drop the batch
/// after a single attempt. Shutdown drains the queues with a grace period
/// of twice the batch timeout.
pub struct WebhookDispatcher {
    senders: Vec<Sender<Value>>,
    workers: Vec<JoinHandle<()>>,
    shutting_down: Arc<AtomicBool>,
}

impl WebhookDispatcher {
    pub fn start(configs: Vec<WebhookConfig>, metrics: Option<MetricsCollector>) -> Self {
        let shutting_down = Arc::new(AtomicBool::new(false));
        let mut senders = Vec::new();
        let mut workers = Vec::new();

        for config in configs {
            let (tx, rx) = channel();
            let flag = Arc::clone(&shutting_down);
            let collector = metrics.clone();
            let name = format!("livetrace-webhook-{}", workers.len());
            match std::thread::Builder::new()
                .name(name)
                .spawn(move || run_worker(config, rx, flag, collector))
            {
                Ok(handle) => {
                    senders.push(tx);
                    workers.push(handle);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to spawn webhook worker");
                }
            }
        }

        WebhookDispatcher {
            senders,
            workers,
            shutting_down,
        }
    }

    /// A handler suitable for `EventEmitter::on_any` registration. Events
    /// are serialized once and fanned out to every endpoint queue.
    pub fn handler(&self) -> impl FnMut(&SessionEvent) -> anyhow::Result<()> + Send + 'static {
        let senders = self.senders.clone();
        move |event| {
            let value = serde_json::to_value(event)?;
            for sender in &senders {
                let _ = sender.send(value.clone());
            }
            Ok(())
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.senders.len()
    }

    /// Close the queues and wait for workers to drain in-flight batches.
    pub fn shutdown(self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        drop(self.senders);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn run_worker(
    config: WebhookConfig,
    rx: Receiver<Value>,
    shutting_down: Arc<AtomicBool>,
    metrics: Option<MetricsCollector>,
) {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(url = %config.url, error = %err, "webhook client unavailable");
            return;
        }
    };

    let mut batch: Vec<Value> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        // Bounded wait: handler clones of the sender can outlive the
        // dispatcher, so shutdown is detected by flag, not only by
        // disconnection.
        let wait = deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(config.batch_timeout)
            .min(Duration::from_millis(100));

        match rx.recv_timeout(wait) {
            Ok(value) => {
                if batch.is_empty() {
                    deadline = Some(Instant::now() + config.batch_timeout);
                }
                batch.push(value);
                if batch.len() >= config.batch_size {
                    flush(&client, &config, std::mem::take(&mut batch), None, &metrics);
                    deadline = None;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() && deadline.is_some_and(|d| Instant::now() >= d) {
                    flush(&client, &config, std::mem::take(&mut batch), None, &metrics);
                    deadline = None;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                drain_and_exit(&client, &config, &rx, batch, &metrics);
                return;
            }
        }

        if shutting_down.load(Ordering::SeqCst) {
            drain_and_exit(&client, &config, &rx, batch, &metrics);
            return;
        }
    }
}

/// Flush everything still buffered or queued, in batch-sized chunks, within
/// the shutdown grace period of twice the batch timeout.
fn drain_and_exit(
    client: &reqwest::blocking::Client,
    config: &WebhookConfig,
    rx: &Receiver<Value>,
    mut batch: Vec<Value>,
    metrics: &Option<MetricsCollector>,
) {
    while let Ok(value) = rx.try_recv() {
        batch.push(value);
    }
    if batch.is_empty() {
        return;
    }
    let grace = Instant::now() + config.batch_timeout * 2;
    for chunk in batch.chunks(config.batch_size.max(1)) {
        flush(client, config, chunk.to_vec(), Some(grace), metrics);
    }
}

fn flush(
    client: &reqwest::blocking::Client,
    config: &WebhookConfig,
    batch: Vec<Value>,
    retry_until: Option<Instant>,
    metrics: &Option<MetricsCollector>,
) {
    let body = serde_json::json!({ "events": batch });
    let mut drop_kind = "network";

    for attempt in 0..=config.max_retries {
        let mut request = client.post(&config.url).json(&body);
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match request.send() {
            Ok(response) if response.status().is_success() => return,
            Ok(response) if response.status().is_client_error() => {
                // 4xx is permanent; one attempt only.
                tracing::warn!(
                    url = %config.url,
                    status = %response.status(),
                    "webhook rejected batch"
                );
                record_drop(metrics, "4xx");
                return;
            }
            Ok(response) => {
                drop_kind = "5xx";
                tracing::debug!(
                    url = %config.url,
                    status = %response.status(),
                    attempt,
                    "webhook delivery failed"
                );
            }
            Err(err) => {
                drop_kind = "network";
                tracing::debug!(url = %config.url, error = %err, attempt, "webhook delivery failed");
            }
        }

        if attempt < config.max_retries {
            let backoff = config.retry_backoff * 2u32.saturating_pow(attempt);
            if let Some(until) = retry_until
                && Instant::now() + backoff > until
            {
                break;
            }
            std::thread::sleep(backoff);
        }
    }

    tracing::warn!(url = %config.url, kind = drop_kind, "webhook batch dropped");
    record_drop(metrics, drop_kind);
}

fn record_drop(metrics: &Option<MetricsCollector>, kind: &str) {
    if let Some(collector) = metrics {
        collector.record_webhook_drop(kind);
    }
}
