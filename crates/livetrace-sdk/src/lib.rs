//! Suspending view over the synchronous watcher core.
//!
//! The core poll loop is not forked: [`AsyncWatcher`] runs the same
//! [`SessionWatcher`] on a worker thread and bridges its event stream into
//! async consumers through a bounded queue. Two patterns are supported:
//! registering suspending handlers, awaited sequentially per event, and a
//! [`futures::Stream`] of events in emission order.

use futures::Stream;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use livetrace_export::MetricsCollector;
use livetrace_runtime::{Result, SessionWatcher, StopHandle, WatcherConfig, WatcherHandle};
use livetrace_types::{EventKind, SessionEvent};

pub use livetrace_runtime::{LiveSessionMap, WatcherConfig as Config};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

type AsyncHandler =
    Box<dyn FnMut(SessionEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct QueueInner {
    buf: VecDeque<SessionEvent>,
    capacity: usize,
    waker: Option<Waker>,
    closed: bool,
}

struct Queue {
    inner: Mutex<QueueInner>,
    dropped: AtomicU64,
    metrics: Option<MetricsCollector>,
}

impl Queue {
    fn new(capacity: usize, metrics: Option<MetricsCollector>) -> Arc<Self> {
        Arc::new(Queue {
            inner: Mutex::new(QueueInner {
                buf: VecDeque::new(),
                capacity: capacity.max(1),
                waker: None,
                closed: false,
            }),
            dropped: AtomicU64::new(0),
            metrics,
        })
    }

    /// Enqueue one event, dropping the oldest element on overflow.
    fn push(&self, event: SessionEvent) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.buf.len() >= inner.capacity {
            inner.buf.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(collector) = &self.metrics {
                collector.record_dropped_event();
            }
        }
        inner.buf.push_back(event);
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
    }

    fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
            if let Some(waker) = inner.waker.take() {
                waker.wake();
            }
        }
    }
}

/// Wakes the stream end when the producing watcher goes away, so the
/// stream terminates after draining instead of pending forever.
struct ProducerGuard(Arc<Queue>);

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Events in emission order, backed by a bounded drop-oldest queue.
pub struct EventStream {
    queue: Arc<Queue>,
}

impl EventStream {
    /// Events discarded so far because the consumer fell behind.
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Pop without waiting. Returns `None` when the queue is empty.
    pub fn try_next_now(&self) -> Option<SessionEvent> {
        self.queue.inner.lock().ok()?.buf.pop_front()
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Ok(mut inner) = self.queue.inner.lock() else {
            return Poll::Ready(None);
        };
        if let Some(event) = inner.buf.pop_front() {
            return Poll::Ready(Some(event));
        }
        if inner.closed {
            return Poll::Ready(None);
        }
        inner.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Builder-style async wrapper around [`SessionWatcher`].
pub struct AsyncWatcher {
    watcher: SessionWatcher,
    queue_capacity: usize,
    metrics: Option<MetricsCollector>,
    async_handlers: Vec<(Option<EventKind>, AsyncHandler)>,
}

impl AsyncWatcher {
    pub fn new(config: WatcherConfig) -> Result<Self> {
        Ok(Self::from_watcher(SessionWatcher::new(config)?))
    }

    pub fn from_watcher(watcher: SessionWatcher) -> Self {
        let queue_capacity = watcher.config().async_queue_capacity;
        AsyncWatcher {
            watcher,
            queue_capacity,
            metrics: None,
            async_handlers: Vec::new(),
        }
    }

    /// Bound for every stream created by [`AsyncWatcher::events`].
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Count queue overflow against `events_dropped_total`.
    pub fn with_metrics(mut self, collector: MetricsCollector) -> Self {
        self.metrics = Some(collector);
        self
    }

    /// Register a synchronous handler, exactly as on the inner watcher.
    pub fn on<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&SessionEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.watcher.on(kind, handler);
    }

    /// Register a synchronous wildcard handler.
    pub fn on_any<F>(&mut self, handler: F)
    where
        F: FnMut(&SessionEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.watcher.on_any(handler);
    }

    /// Register a suspending handler for one event type. Suspending
    /// handlers run on the surrounding runtime and are awaited
    /// sequentially per event; a failure is logged and does not
    /// unregister the handler.
    pub fn on_async<F, Fut>(&mut self, kind: EventKind, mut handler: F)
    where
        F: FnMut(SessionEvent) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.async_handlers
            .push((Some(kind), Box::new(move |event| Box::pin(handler(event)))));
    }

    /// Register a suspending handler for every event.
    pub fn on_any_async<F, Fut>(&mut self, mut handler: F)
    where
        F: FnMut(SessionEvent) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.async_handlers
            .push((None, Box::new(move |event| Box::pin(handler(event)))));
    }

    /// A suspending iterator over the event stream. May be called more
    /// than once; each stream gets its own queue.
    pub fn events(&mut self) -> EventStream {
        let queue = Queue::new(self.queue_capacity, self.metrics.clone());
        let producer = ProducerGuard(Arc::clone(&queue));
        self.watcher.on_any(move |event| {
            producer.0.push(event.clone());
            Ok(())
        });
        EventStream { queue }
    }

    pub fn live_sessions(&self) -> LiveSessionMap {
        self.watcher.live_sessions()
    }

    /// Start the core poll loop on a worker thread. When suspending
    /// handlers are registered this must be called from within a tokio
    /// runtime, which will drive them.
    pub fn start(mut self) -> Result<AsyncWatcherHandle> {
        let driver = if self.async_handlers.is_empty() {
            None
        } else {
            let mut stream = self.events();
            let mut handlers = std::mem::take(&mut self.async_handlers);
            Some(tokio::spawn(async move {
                use futures::StreamExt;
                while let Some(event) = stream.next().await {
                    for (kind, handler) in handlers.iter_mut() {
                        if kind.is_none_or(|k| k == event.kind())
                            && let Err(err) = handler(event.clone()).await
                        {
                            tracing::warn!(error = %err, "suspending handler failed");
                        }
                    }
                }
            }))
        };

        let inner = self.watcher.spawn()?;
        Ok(AsyncWatcherHandle { inner, driver })
    }
}

/// Handle to a running [`AsyncWatcher`].
pub struct AsyncWatcherHandle {
    inner: WatcherHandle,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl AsyncWatcherHandle {
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.inner.stop_handle()
    }

    pub fn live_sessions(&self) -> LiveSessionMap {
        self.inner.live_sessions()
    }

    /// Wait for the poll loop (and the suspending-handler driver, if any)
    /// to finish.
    pub async fn join(self) -> Result<()> {
        let AsyncWatcherHandle { inner, driver } = self;
        let result = tokio::task::spawn_blocking(move || inner.join())
            .await
            .map_err(|_| {
                livetrace_runtime::Error::Setup("watcher join task failed".to_string())
            })?;
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        result
    }

    /// Stop, then wait.
    pub async fn stop_and_join(self) -> Result<()> {
        self.stop();
        self.join().await
    }
}
