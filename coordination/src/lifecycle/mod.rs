//! Agent lifecycle: the state set, its transition table and the per-agent
//! manager that enforces it.
//!
//! ```text
//! Initializing ─▶ Idle ⇄ Active ⇄ Busy
//!      ▲            │       │       │
//!      └── Error ◀──┴───────┴───────┘
//!                    (any live state) ─▶ Terminating ─▶ Terminated
//! ```

pub mod manager;
pub mod state;

pub use manager::{
    AgentLifecycleManager, LifecycleError, LifecycleResult, StatusCallback, StatusChange,
};
pub use state::{IllegalTransition, LifecycleState, TransitionRecord};
