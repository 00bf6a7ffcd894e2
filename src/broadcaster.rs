// src/broadcaster.rs
// Broadcaster: in-process fan-out primitive. Each listener is dispatched on
// its own short-lived tokio task so that a slow listener cannot block
// another listener or the caller.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::{Map, Value};

pub type Listener = Arc<dyn Fn(EventDescriptor) + Send + Sync + 'static>;

#[derive(Debug, Clone)]
pub struct EventDescriptor {
    pub event_type: &'static str,
    pub timestamp: chrono::DateTime<Utc>,
    pub data: Map<String, Value>,
}

pub struct Broadcaster {
    listeners: RwLock<Vec<Listener>>,
    handle: tokio::runtime::Handle,
}

impl Broadcaster {
    /// Captures the calling task's runtime handle so that `broadcast` can be
    /// invoked from plain OS threads (e.g. the PTY reader thread) as well as
    /// async tasks.
    pub fn new() -> Self {
        Broadcaster {
            listeners: RwLock::new(Vec::new()),
            handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn add_listener(&self, listener: Listener) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn remove_all_listeners(&self) {
        self.listeners.write().unwrap().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap().len()
    }

    /// Dispatch `evt` to every registered listener. Listeners are spawned in
    /// registration order for this broadcast; execution across separate
    /// broadcasts may interleave.
    pub fn broadcast(&self, evt: EventDescriptor) {
        let snapshot: Vec<Listener> = self.listeners.read().unwrap().clone();
        for listener in snapshot {
            let evt = evt.clone();
            self.handle.spawn(async move {
                listener(evt);
            });
        }
    }

    pub fn emit_log(&self, stream: &str, line: &str, line_num: u64) {
        let mut data = Map::new();
        data.insert("stream".to_string(), Value::String(stream.to_string()));
        data.insert("line".to_string(), Value::String(line.to_string()));
        data.insert("line_num".to_string(), Value::from(line_num));
        self.broadcast(EventDescriptor {
            event_type: "log",
            timestamp: Utc::now(),
            data,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit_extraction(
        &self,
        event_type: &str,
        pattern: &str,
        value: &str,
        line: &str,
        line_num: u64,
        metadata: Map<String, Value>,
    ) {
        let mut data = Map::new();
        data.insert("type".to_string(), Value::String(event_type.to_string()));
        data.insert("pattern".to_string(), Value::String(pattern.to_string()));
        data.insert("value".to_string(), Value::String(value.to_string()));
        data.insert("line".to_string(), Value::String(line.to_string()));
        data.insert("line_num".to_string(), Value::from(line_num));
        data.insert("metadata".to_string(), Value::Object(metadata));
        self.broadcast(EventDescriptor {
            event_type: "extraction",
            timestamp: Utc::now(),
            data,
        });
    }

    pub fn emit_state(&self, state: &str, details: &str) {
        let mut data = Map::new();
        data.insert("state".to_string(), Value::String(state.to_string()));
        data.insert("details".to_string(), Value::String(details.to_string()));
        self.broadcast(EventDescriptor {
            event_type: "state",
            timestamp: Utc::now(),
            data,
        });
    }

    pub fn emit_complete(&self, exit_code: i32, duration_ms: i64) {
        let mut data = Map::new();
        data.insert("exit_code".to_string(), Value::from(exit_code));
        data.insert("duration".to_string(), Value::from(duration_ms));
        self.broadcast(EventDescriptor {
            event_type: "complete",
            timestamp: Utc::now(),
            data,
        });
    }

    pub fn emit_error(&self, error: &str, details: &str) {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(error.to_string()));
        data.insert("details".to_string(), Value::String(details.to_string()));
        self.broadcast(EventDescriptor {
            event_type: "error",
            timestamp: Utc::now(),
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn fan_out_reaches_every_listener() {
        let b = Broadcaster::new();
        let counters: Vec<Arc<AtomicUsize>> =
            (0..5).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        for c in &counters {
            let c = c.clone();
            b.add_listener(Arc::new(move |_evt| {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }

        b.emit_state("started", "ok");
        tokio::time::sleep(Duration::from_millis(50)).await;

        for c in &counters {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn remove_all_listeners_stops_dispatch() {
        let b = Broadcaster::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        b.add_listener(Arc::new(move |_evt| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        b.remove_all_listeners();
        b.emit_state("started", "ok");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
