//! Minimal publish/subscribe primitive used to decouple the transport
//! pool from the orchestrator
//!
//! The bus is deliberately small: string topics, clonable payloads, and
//! listener isolation. A panicking listener is caught and logged so it can
//! neither stop the remaining listeners nor propagate to the emitter.
//! Listeners for a topic run in registration order; nothing beyond that
//! ordering is promised.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::quality::QualitySample;
use crate::transport::TransportKind;

/// Topic name for pool-level transport failure escalation
pub const TOPIC_TRANSPORT_FAILED: &str = "transport-failed";
/// Topic name for in-progress ICE-restart recovery announcements
pub const TOPIC_TRANSPORT_RECOVERING: &str = "transport-recovering";
/// Topic name for periodic transport stat samples
pub const TOPIC_TRANSPORT_STATS: &str = "transport-stats";
/// Topic name for unexpected signaling-channel closure
pub const TOPIC_SIGNALING_CLOSED: &str = "signaling-closed";

/// Payloads carried across the bus
#[derive(Debug, Clone)]
pub enum BusMessage {
    /// A transport exhausted its local recovery budget
    TransportFailed {
        kind: TransportKind,
        transport_id: String,
        reason: String,
    },
    /// A transport started a bounded ICE-restart recovery attempt
    TransportRecovering {
        kind: TransportKind,
        transport_id: String,
        attempt: u32,
    },
    /// One stats-poll sample from a live transport
    TransportStats {
        kind: TransportKind,
        sample: QualitySample,
    },
    /// The signaling channel closed for an unexpected reason
    SignalingClosed { reason: String },
}

/// Identifier returned by [`EventBus::on`], usable with [`EventBus::off`]
pub type ListenerId = u64;

type ListenerFn = Arc<dyn Fn(&BusMessage) + Send + Sync>;

struct Listener {
    id: ListenerId,
    once: bool,
    f: ListenerFn,
}

/// Minimal topic-keyed publish/subscribe bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<HashMap<String, Vec<Listener>>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a listener for a topic. Returns an id for targeted removal.
    pub fn on<F>(&self, topic: impl Into<String>, f: F) -> ListenerId
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        self.register(topic.into(), Arc::new(f), false)
    }

    /// Register a listener that is removed after its first invocation
    pub fn once<F>(&self, topic: impl Into<String>, f: F) -> ListenerId
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        self.register(topic.into(), Arc::new(f), true)
    }

    fn register(&self, topic: String, f: ListenerFn, once: bool) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.inner.lock().expect("event bus lock poisoned");
        map.entry(topic).or_default().push(Listener { id, once, f });
        id
    }

    /// Remove one listener by id, or every listener for the topic when
    /// `listener` is `None`.
    pub fn off(&self, topic: &str, listener: Option<ListenerId>) {
        let mut map = self.inner.lock().expect("event bus lock poisoned");
        match listener {
            Some(id) => {
                if let Some(listeners) = map.get_mut(topic) {
                    listeners.retain(|l| l.id != id);
                    if listeners.is_empty() {
                        map.remove(topic);
                    }
                }
            }
            None => {
                map.remove(topic);
            }
        }
    }

    /// Publish a message to every listener of the topic.
    ///
    /// Each invocation is isolated: a panic in one listener is caught and
    /// logged, and the remaining listeners still run.
    pub fn emit(&self, topic: &str, message: &BusMessage) {
        let snapshot: Vec<(ListenerId, bool, ListenerFn)> = {
            let map = self.inner.lock().expect("event bus lock poisoned");
            match map.get(topic) {
                Some(listeners) => listeners
                    .iter()
                    .map(|l| (l.id, l.once, Arc::clone(&l.f)))
                    .collect(),
                None => return,
            }
        };

        let mut spent = Vec::new();
        for (id, once, f) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| f(message))).is_err() {
                error!(topic = topic, listener = id, "event listener panicked");
            }
            if once {
                spent.push(id);
            }
        }
        for id in spent {
            self.off(topic, Some(id));
        }
    }

    /// Number of listeners currently registered for a topic
    pub fn listener_count(&self, topic: &str) -> usize {
        let map = self.inner.lock().expect("event bus lock poisoned");
        map.get(topic).map(|l| l.len()).unwrap_or(0)
    }
}
