use chrono::Utc;
use std::collections::HashMap;

use livetrace_types::{EventKind, EventPayload, SessionEvent};

type Handler = Box<dyn FnMut(&SessionEvent) -> anyhow::Result<()> + Send>;

/// Registers handlers by event-type tag and dispatches events to them.
///
/// Handlers run in registration order, tag handlers before wildcards. A
/// failing handler produces a synthesized `error` event carrying the
/// original event; it stays registered and dispatch continues. Handlers run
/// on the watcher's poll thread, so long work belongs elsewhere.
#[derive(Default)]
pub struct EventEmitter {
    by_kind: HashMap<EventKind, Vec<Handler>>,
    wildcard: Vec<Handler>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&SessionEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.by_kind.entry(kind).or_default().push(Box::new(handler));
    }

    pub fn on_any<F>(&mut self, handler: F)
    where
        F: FnMut(&SessionEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.wildcard.push(Box::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.by_kind.values().map(|v| v.len()).sum::<usize>() + self.wildcard.len()
    }

    /// Deliver one event, then deliver a synthesized `error` event for each
    /// handler failure. Failures while handling the synthesized events are
    /// dropped to keep dispatch from recursing.
    pub fn emit(&mut self, event: &SessionEvent) {
        let failures = self.dispatch(event);
        for failure in failures {
            let error_event = SessionEvent {
                timestamp: Utc::now(),
                session_id: event.session_id.clone(),
                agent_id: event.agent_id.clone(),
                payload: EventPayload::Error {
                    error_message: format!("handler failed: {}", failure),
                    raw_entry: serde_json::to_value(event).unwrap_or_default(),
                },
            };
            let _ = self.dispatch(&error_event);
        }
    }

    fn dispatch(&mut self, event: &SessionEvent) -> Vec<String> {
        let mut failures = Vec::new();
        if let Some(handlers) = self.by_kind.get_mut(&event.kind()) {
            for handler in handlers.iter_mut() {
                if let Err(err) = handler(event) {
                    failures.push(err.to_string());
                }
            }
        }
        for handler in self.wildcard.iter_mut() {
            if let Err(err) = handler(event) {
                failures.push(err.to_string());
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn message_event() -> SessionEvent {
        let raw = serde_json::json!({
            "uuid": "u1",
            "timestamp": "2025-01-05T20:19:25Z",
            "type": "user",
            "sessionId": "s",
            "message": {"role": "user", "content": [{"type": "text", "text": "hi"}]}
        });
        livetrace_core::EntryParser::default()
            .parse_entry(&raw, None)
            .remove(0)
    }

    #[test]
    fn dispatches_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut emitter = EventEmitter::new();
        for n in 0..3 {
            let order = Arc::clone(&order);
            emitter.on(EventKind::Message, move |_| {
                order.lock().unwrap().push(n);
                Ok(())
            });
        }
        let order_any = Arc::clone(&order);
        emitter.on_any(move |_| {
            order_any.lock().unwrap().push(99);
            Ok(())
        });

        emitter.emit(&message_event());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 99]);
    }

    #[test]
    fn non_matching_kind_reaches_only_wildcards() {
        let tagged = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));
        let mut emitter = EventEmitter::new();
        let tagged_clone = Arc::clone(&tagged);
        emitter.on(EventKind::ToolUse, move |_| {
            tagged_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let any_clone = Arc::clone(&any);
        emitter.on_any(move |_| {
            any_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        emitter.emit(&message_event());
        assert_eq!(tagged.load(Ordering::SeqCst), 0);
        assert_eq!(any.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_handler_is_isolated() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let mut emitter = EventEmitter::new();

        emitter.on(EventKind::Message, |_| anyhow::bail!("boom"));
        let delivered_clone = Arc::clone(&delivered);
        emitter.on(EventKind::Message, move |_| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let errors_clone = Arc::clone(&errors);
        emitter.on(EventKind::Error, move |event| {
            assert!(matches!(event.payload, EventPayload::Error { .. }));
            errors_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // The raising handler stays registered and keeps producing one
        // error event per dispatch.
        emitter.emit(&message_event());
        emitter.emit(&message_event());
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_in_error_handler_does_not_recurse() {
        let mut emitter = EventEmitter::new();
        emitter.on_any(|_| anyhow::bail!("always"));
        // One synthesized error per original dispatch, whose own failure is
        // swallowed.
        emitter.emit(&message_event());
    }
}
