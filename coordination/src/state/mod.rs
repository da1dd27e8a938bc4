//! Durable shared state for the fleet
//!
//! This module provides RocksDB-backed persistent storage for:
//! - Partitioned coordination entries with TTL and access control
//! - Learned patterns indexed by agent and confidence
//! - Event and performance-metric history
//! - The agent registry and sessions
//! - Consensus proposals, blackboard hints and workflow checkpoints
//!
//! # Architecture
//!
//! Column families separate the tables while sharing one database instance.
//! Two of them are pure indexes:
//!
//! - `entry_expiry`: `(expires_at, partition, key)` so the sweep touches only
//!   rows that are due
//! - `patterns_by_agent`: `(agent, inverted confidence, id)` so
//!   highest-confidence patterns come out of a prefix scan first
//!
//! # Usage
//!
//! ```ignore
//! use fleet_coordination::state::{StateStore, StoreOptions, RetrieveOptions};
//!
//! let store = StateStore::open("./fleet-state")?;
//! store.store("leader", json!("agent-1"), StoreOptions::partition("election"))?;
//! let leader = store.retrieve("leader", RetrieveOptions::partition("election"))?;
//! ```

pub mod schema;
pub mod store;
pub mod types;

pub use store::{SharedStateStore, StateStore, StoreError, StoreResult};
pub use types::{
    AccessLevel, AgentPerformance, AgentRecord, BlackboardHint, ConsensusState, ConsensusStatus,
    MemoryEntry, Pattern, PerformanceMetric, Requester, RetrieveOptions, SessionRecord,
    StoreOptions, StoreStats, StoredEvent, Vote, VotingRule, WorkflowCheckpoint,
    DEFAULT_PARTITION, SYSTEM_OWNER,
};
