//! Fleet Coordination Kernel
//!
//! This library provides the coordination core for a fleet of autonomous
//! agents:
//! - An in-process event bus with ordered listeners and broadcast subscribers
//! - A per-agent lifecycle state machine with awaitable transitions
//! - Durable shared state on RocksDB (partitions, access levels, TTLs)
//! - Consensus gating for multi-agent approval decisions
//! - A blackboard for opportunistic hint exchange
//! - A fleet manager that spawns, monitors and auto-scales agents
//!
//! # Layering
//!
//! ```text
//!                ┌──────────────────┐
//!                │   FleetManager   │
//!                └───┬──────────┬───┘
//!                    │          │
//!   ┌────────────────▼─┐  ┌─────▼──────────────┐  ┌──────────────┐
//!   │ AgentLifecycle   │  │ ConsensusGating    │  │ Blackboard   │
//!   │ Manager (each)   │  │                    │  │ Coordination │
//!   └────────┬─────────┘  └─────┬──────────────┘  └──────┬───────┘
//!            │                  │                        │
//!      ┌─────▼──────────────────▼────────────────────────▼─────┐
//!      │          EventBus            SharedStateStore          │
//!      └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fleet_coordination::{AgentSpec, FleetConfig, FleetManager};
//!
//! let fleet = FleetManager::from_config(FleetConfig::load(None)?);
//! fleet.initialize()?;
//!
//! let agent = fleet.spawn_agent(AgentSpec::new("test-generator"))?;
//! fleet.begin_task(&agent, "task-1")?;
//! fleet.complete_task(&agent, true)?;
//!
//! fleet.shutdown().await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod blackboard;
pub mod config;
pub mod consensus;
pub mod events;
pub mod fleet;
pub mod lifecycle;
pub mod state;

pub use config::{AgentGroup, AutoscaleConfig, FleetConfig, HealthPolicy};

pub use events::{
    event_types, EventBus, EventBusError, EventBusExt, EventFilter, FleetEvent, SharedEventBus,
};

pub use lifecycle::{AgentLifecycleManager, LifecycleError, LifecycleState, StatusChange};

pub use state::{
    AccessLevel, Requester, RetrieveOptions, SharedStateStore, StateStore, StoreError,
    StoreOptions,
};

pub use consensus::{ConsensusError, ConsensusGating, Decision, Proposal};

pub use blackboard::{BlackboardCoordination, BlackboardError, HintMatcher};

pub use fleet::{AgentSpec, FleetError, FleetManager, FleetSnapshot, ScaleDecision};
