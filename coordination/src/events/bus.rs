//! Event bus for fleet coordination
//!
//! Two delivery paths share one emission order:
//! - synchronous listeners registered per event type with [`EventBus::on`],
//!   invoked in registration order before `emit` returns;
//! - a Tokio broadcast channel for async consumers that need to race an
//!   event against a timer ([`EventBus::subscribe`]).
//!
//! A bounded retention window keeps the most recent events for diagnostic
//! replay through [`EventBus::get_recent`].

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::FleetEvent;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Default number of events kept for `get_recent`
pub const DEFAULT_RETENTION: usize = 1000;

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is not initialized; call initialize() first")]
    NotInitialized,
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Handle returned by `on`/`once`, used to remove the listener again
pub type ListenerId = u64;

/// Synchronous event listener. Errors and panics are contained by the bus.
pub type Listener = Arc<dyn Fn(&FleetEvent) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    id: ListenerId,
    once: bool,
    handler: Listener,
}

struct BusState {
    initialized: bool,
    listeners: HashMap<String, Vec<Arc<Registration>>>,
    recent: VecDeque<FleetEvent>,
    next_sequence: u64,
}

/// Process-wide publish/subscribe hub, owned by the top-level orchestrator
/// and handed to every consumer.
pub struct EventBus {
    state: Mutex<BusState>,
    sender: broadcast::Sender<FleetEvent>,
    next_listener_id: AtomicU64,
    retention: usize,
}

impl EventBus {
    /// Create a bus with the default retention window
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create a bus keeping at most `retention` events for replay
    pub fn with_retention(retention: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(BusState {
                initialized: false,
                listeners: HashMap::new(),
                recent: VecDeque::new(),
                next_sequence: 0,
            }),
            sender,
            next_listener_id: AtomicU64::new(1),
            retention: retention.max(1),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // Listeners never run under this lock, so a poisoned guard still
        // holds consistent data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the bus. Calling it on an open bus is a no-op.
    pub fn initialize(&self) {
        let mut state = self.lock();
        if !state.initialized {
            state.initialized = true;
            debug!("Event bus initialized");
        }
    }

    /// Close the bus, dropping listeners and retained events. Calling it on a
    /// closed bus is a no-op.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.initialized {
            state.initialized = false;
            state.listeners.clear();
            state.recent.clear();
            debug!("Event bus closed");
        }
    }

    /// Whether the bus currently accepts emissions
    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Emit an event. Returns the number of synchronous listeners invoked.
    pub fn emit(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        source: &str,
    ) -> EventBusResult<usize> {
        self.publish(FleetEvent::new(event_type, payload, source))
    }

    /// Publish a pre-built event. The bus assigns its sequence number.
    pub fn publish(&self, mut event: FleetEvent) -> EventBusResult<usize> {
        let snapshot = {
            let mut state = self.lock();
            if !state.initialized {
                return Err(EventBusError::NotInitialized);
            }

            state.next_sequence += 1;
            event.sequence = state.next_sequence;

            state.recent.push_back(event.clone());
            while state.recent.len() > self.retention {
                state.recent.pop_front();
            }

            let snapshot: Vec<Arc<Registration>> = match state.listeners.get_mut(&event.event_type)
            {
                Some(regs) => {
                    let snapshot = regs.clone();
                    regs.retain(|r| !r.once);
                    snapshot
                }
                None => Vec::new(),
            };

            // Sent under the lock so broadcast order matches sequence order.
            match self.sender.send(event.clone()) {
                Ok(count) => debug!(
                    event_type = %event.event_type,
                    receivers = count,
                    "Event published"
                ),
                Err(_) => debug!(event_type = %event.event_type, "Event published (no receivers)"),
            }

            snapshot
        };

        for reg in &snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| (reg.handler)(&event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    event_type = %event.event_type,
                    listener_id = reg.id,
                    "Event listener failed: {}",
                    e
                ),
                Err(_) => warn!(
                    event_type = %event.event_type,
                    listener_id = reg.id,
                    "Event listener panicked"
                ),
            }
        }

        Ok(snapshot.len())
    }

    fn register(&self, event_type: &str, handler: Listener, once: bool) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        state
            .listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Arc::new(Registration { id, once, handler }));
        id
    }

    /// Register a listener for an event type
    pub fn on<F>(&self, event_type: &str, handler: F) -> ListenerId
    where
        F: Fn(&FleetEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event_type, Arc::new(handler), false)
    }

    /// Register a listener that is removed after its first invocation
    pub fn once<F>(&self, event_type: &str, handler: F) -> ListenerId
    where
        F: Fn(&FleetEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event_type, Arc::new(handler), true)
    }

    /// Remove a listener. Returns whether it was still registered.
    pub fn off(&self, event_type: &str, id: ListenerId) -> bool {
        let mut state = self.lock();
        let Some(regs) = state.listeners.get_mut(event_type) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|r| r.id != id);
        let removed = regs.len() != before;
        if regs.is_empty() {
            state.listeners.remove(event_type);
        }
        removed
    }

    /// Number of synchronous listeners for an event type
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.lock()
            .listeners
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// The most recent `limit` events of a type, oldest first
    pub fn get_recent(&self, event_type: &str, limit: usize) -> Vec<FleetEvent> {
        let state = self.lock();
        let mut events: Vec<FleetEvent> = state
            .recent
            .iter()
            .rev()
            .filter(|e| e.event_type == event_type)
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    /// Subscribe to receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current broadcast subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by event types
    pub event_types: Option<Vec<String>>,
    /// Filter by emitting source
    pub source: Option<String>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event types
    pub fn types(mut self, event_types: &[&str]) -> Self {
        self.event_types = Some(event_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Filter by source
    pub fn source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &FleetEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| *t == event.event_type) {
                return false;
            }
        }

        if let Some(ref source) = self.source {
            if *source != event.source {
                return false;
            }
        }

        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<FleetEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Create a new filtered receiver
    pub fn new(receiver: broadcast::Receiver<FleetEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event.
    ///
    /// `RecvError::Lagged` is passed through so callers can rescan durable
    /// state for anything they missed.
    pub async fn recv(&mut self) -> Result<FleetEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// Extension trait for subscribing with filters
pub trait EventBusExt {
    /// Subscribe with a filter
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

impl EventBusExt for SharedEventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}
