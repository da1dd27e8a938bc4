//! Blackboard coordination: opportunistic hint exchange between agents,
//! decoupled in time and identity.

pub mod coordination;

pub use coordination::{BlackboardCoordination, BlackboardError, BlackboardResult, HintMatcher};
