//! Consensus gating for multi-agent approval decisions
//!
//! A proposal is opened with a quorum and a voting rule, votes arrive as bus
//! events and the decision is announced once. Waiting on a decision races the
//! decision against a timer; a timeout never reads as approval.

pub mod gating;

pub use gating::{
    Ballot, ConsensusError, ConsensusGating, ConsensusResult, Decision, Proposal,
    DEFAULT_DECISION_TIMEOUT,
};
