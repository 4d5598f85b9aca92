use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use std::net::SocketAddr;
use std::thread::JoinHandle;

use crate::metrics::MetricsCollector;

pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// HTTP endpoint exposing `/metrics` (Prometheus text format) and
/// `/health`, served from a dedicated thread running a current-thread
/// tokio runtime.
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsServer {
    /// Bind and start serving. Returns once the listener is bound, so the
    /// actual address (useful with port 0) is available immediately.
    pub fn serve(collector: MetricsCollector, addr: SocketAddr) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let (bound_tx, bound_rx) = std::sync::mpsc::channel::<Result<SocketAddr>>();

        let handle = std::thread::Builder::new()
            .name("livetrace-metrics".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("failed to build metrics runtime")
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = bound_tx.send(Err(err));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::bind(addr)
                        .await
                        .with_context(|| format!("failed to bind metrics endpoint on {}", addr))
                    {
                        Ok(listener) => listener,
                        Err(err) => {
                            let _ = bound_tx.send(Err(err));
                            return;
                        }
                    };
                    let local = match listener.local_addr() {
                        Ok(local) => local,
                        Err(err) => {
                            let _ = bound_tx.send(Err(err.into()));
                            return;
                        }
                    };
                    let _ = bound_tx.send(Ok(local));

                    let app = Router::new()
                        .route("/metrics", get(metrics_handler))
                        .route("/health", get(health_handler))
                        .with_state(collector);

                    if let Err(err) = axum::serve(listener, app)
                        .with_graceful_shutdown(async {
                            let _ = shutdown_rx.await;
                        })
                        .await
                    {
                        tracing::warn!(error = %err, "metrics server exited with error");
                    }
                });
            })?;

        let addr = bound_rx
            .recv()
            .context("metrics server thread died before binding")??;

        Ok(MetricsServer {
            addr,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// The address actually bound.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop serving and wait for the thread to exit.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn metrics_handler(State(collector): State<MetricsCollector>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
        collector.render(),
    )
}

async fn health_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_metrics_and_health() {
        let collector = MetricsCollector::new();
        let server = MetricsServer::serve(collector, "127.0.0.1:0".parse().unwrap()).unwrap();
        let base = format!("http://{}", server.addr());

        let health = reqwest::blocking::get(format!("{}/health", base)).unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().unwrap(), "ok");

        let metrics = reqwest::blocking::get(format!("{}/metrics", base)).unwrap();
        assert_eq!(metrics.status(), 200);
        assert_eq!(
            metrics.headers()[reqwest::header::CONTENT_TYPE],
            METRICS_CONTENT_TYPE
        );
        let body = metrics.text().unwrap();
        assert!(body.contains("# TYPE messages_total counter"));
        assert!(body.contains("active_sessions 0"));

        server.shutdown();
    }
}
