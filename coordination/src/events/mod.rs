//! Event-driven coordination module for the agent fleet
//!
//! This module provides the pub/sub messaging infrastructure every other
//! component is built on.
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): the open-tagged [`FleetEvent`] record and
//!    the kernel's well-known tags.
//!
//! 2. **Event Bus** (`bus.rs`): ordered synchronous listeners plus a Tokio
//!    broadcast channel, with a bounded retention window.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌────────────────────┐
//! │   Producer   │────▶│  Event Bus   │────▶│ listeners (sync)   │
//! │   (emit)     │     │  (sequence)  │────▶│ subscribers (recv) │
//! └──────────────┘     └──────┬───────┘     └────────────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │  retention   │
//!                      │ (get_recent) │
//!                      └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fleet_coordination::events::{EventBus, event_types};
//! use serde_json::json;
//!
//! let bus = EventBus::new().shared();
//! bus.initialize();
//!
//! bus.on(event_types::AGENT_SPAWNED, |event| {
//!     tracing::info!(source = %event.source, "agent joined");
//!     Ok(())
//! });
//!
//! bus.emit(event_types::AGENT_SPAWNED, json!({ "agent_id": "a-1" }), "fleet")?;
//! let recent = bus.get_recent(event_types::AGENT_SPAWNED, 10);
//! ```

pub mod bus;
pub mod types;

// Re-export core types
pub use bus::{
    EventBus, EventBusError, EventBusExt, EventBusResult, EventFilter, FilteredReceiver, Listener,
    ListenerId, SharedEventBus, DEFAULT_RETENTION,
};
pub use types::{event_types, EventId, FleetEvent};
