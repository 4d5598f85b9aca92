pub mod metrics;
pub mod server;
pub mod webhook;

pub use metrics::MetricsCollector;
pub use server::{MetricsServer, DEFAULT_METRICS_ADDR};
pub use webhook::{WebhookConfig, WebhookDispatcher};
