//! Fleet management: agent registry, health monitoring and auto-scaling
//!
//! [`FleetManager`] is the entry point. It owns one lifecycle manager per
//! agent plus one for the fleet itself, persists agent rows through the
//! state store and announces everything on the event bus.

pub mod agent;
pub mod manager;
pub mod scaling;

pub use agent::{AgentId, AgentInfo, AgentSpec, FleetAgent};
pub use manager::{FleetError, FleetManager, FleetResult, FleetSnapshot};
pub use scaling::{AutoScaler, LoadSignal, ScaleDecision};
