//! Event types for fleet coordination
//!
//! Events are open-tagged: the `event_type` string selects listeners and the
//! payload is an opaque JSON value owned by whoever emits it. The kernel's own
//! event tags live in [`event_types`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for events
pub type EventId = String;

/// Well-known event tags emitted by the kernel components.
pub mod event_types {
    /// An agent's lifecycle state changed
    pub const AGENT_STATUS_CHANGED: &str = "agent:status-changed";
    /// A new agent joined the fleet
    pub const AGENT_SPAWNED: &str = "agent:spawned";
    /// An agent left the fleet
    pub const AGENT_TERMINATED: &str = "agent:terminated";
    /// An agent missed its heartbeat window
    pub const AGENT_UNHEALTHY: &str = "agent:unhealthy";
    /// An agent finished a task (successfully or not)
    pub const TASK_COMPLETED: &str = "task:completed";
    /// The auto-scaler applied a decision
    pub const FLEET_SCALED: &str = "fleet:scaled";
    /// A consensus proposal was opened
    pub const PROPOSAL_OPENED: &str = "consensus:proposal-opened";
    /// A vote was cast on a proposal
    pub const VOTE_CAST: &str = "consensus:vote-cast";
    /// A proposal left the pending state
    pub const CONSENSUS_REACHED: &str = "consensus:reached";
    /// A hint was durably posted to the blackboard
    pub const HINT_POSTED: &str = "blackboard:hint-posted";
    /// A hint was consumed by a waiter
    pub const HINT_CONSUMED: &str = "blackboard:hint-consumed";
}

/// A single emitted event. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEvent {
    /// Unique event id
    pub id: EventId,
    /// Type tag used for listener dispatch
    pub event_type: String,
    /// Opaque structured payload
    pub payload: serde_json::Value,
    /// Emitting agent or component
    pub source: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Position in the bus's emission order
    pub sequence: u64,
}

impl FleetEvent {
    /// Create an event that has not been sequenced by a bus yet
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Self::new_id(),
            event_type: event_type.into(),
            payload,
            source: source.into(),
            timestamp: Utc::now(),
            sequence: 0,
        }
    }

    /// Read a string field out of the payload
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|v| v.as_str())
    }

    /// Decode the payload into a typed value
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Create a new unique event ID
    pub fn new_id() -> EventId {
        uuid::Uuid::new_v4().to_string()
    }
}
