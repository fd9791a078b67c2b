//! Event fan-out: forwards lifecycle events to in-process subscribers and to
//! an optional real-time sink (socket server, message broker, ...).

use crate::types::SessionStatus;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::{Arc, RwLock};

/// In-process subscriber. Handlers must not block; heavy work belongs in a
/// task of their own.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &WbotEvent);
}

/// External real-time delivery (e.g. a websocket broadcast per tenant).
#[async_trait]
pub trait RealtimeSink: Send + Sync {
    async fn emit(&self, channel: &str, payload: Value);
}

#[derive(Debug, Clone, Serialize)]
pub enum WbotEvent {
    SessionStatus {
        session_id: i64,
        tenant_id: i64,
        status: SessionStatus,
        qr: Option<String>,
    },
    MessageReceived {
        session_id: i64,
        tenant_id: i64,
        payload: Value,
    },
}

impl WbotEvent {
    fn tenant_id(&self) -> i64 {
        match self {
            WbotEvent::SessionStatus { tenant_id, .. } => *tenant_id,
            WbotEvent::MessageReceived { tenant_id, .. } => *tenant_id,
        }
    }

    fn event_name(&self) -> &'static str {
        match self {
            WbotEvent::SessionStatus { .. } => "session-status-changed",
            WbotEvent::MessageReceived { .. } => "message-received",
        }
    }

    /// Channel name, namespaced by tenant so clients only see their own
    /// sessions.
    pub fn channel(&self) -> String {
        format!("{}:{}", self.tenant_id(), self.event_name())
    }
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    sink: RwLock<Option<Arc<dyn RealtimeSink>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    pub fn set_sink(&self, sink: Arc<dyn RealtimeSink>) {
        *self.sink.write().expect("RwLock should not be poisoned") = Some(sink);
    }

    pub async fn dispatch(&self, event: &WbotEvent) {
        let handlers: Vec<_> = self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .clone();
        for handler in &handlers {
            handler.handle_event(event);
        }

        let sink = self
            .sink
            .read()
            .expect("RwLock should not be poisoned")
            .clone();
        if let Some(sink) = sink {
            let payload = json!({
                "event": serde_json::to_value(event).unwrap_or(Value::Null),
                "timestamp": chrono::Utc::now(),
            });
            sink.emit(&event.channel(), payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl EventHandler for Counter {
        fn handle_event(&self, _event: &WbotEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Recorder(Mutex<Vec<(String, Value)>>);

    #[async_trait]
    impl RealtimeSink for Recorder {
        async fn emit(&self, channel: &str, payload: Value) {
            self.0.lock().unwrap().push((channel.to_string(), payload));
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_handlers_and_sink() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        bus.add_handler(counter.clone());
        bus.set_sink(recorder.clone());

        bus.dispatch(&WbotEvent::SessionStatus {
            session_id: 3,
            tenant_id: 12,
            status: SessionStatus::Qrcode,
            qr: Some("ABC".into()),
        })
        .await;

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        let emitted = recorder.0.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, "12:session-status-changed");
        assert_eq!(emitted[0].1["event"]["SessionStatus"]["qr"], json!("ABC"));
    }

    #[tokio::test]
    async fn test_dispatch_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.dispatch(&WbotEvent::MessageReceived {
            session_id: 1,
            tenant_id: 1,
            payload: json!({"body": "hi"}),
        })
        .await;
    }
}
