//! Agent lifecycle states and the legal transition table.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The set of agent lifecycle states.
///
/// Every agent starts at `Initializing`; `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Setting up resources before accepting work.
    Initializing,
    /// Ready, no work in hand.
    Idle,
    /// Participating in the fleet, may pick up work.
    Active,
    /// Executing a task.
    Busy,
    /// Failed; may recover to `Idle` or restart at `Initializing`.
    Error,
    /// Shutting down.
    Terminating,
    /// Gone for good.
    Terminated,
}

impl LifecycleState {
    /// All states, in declaration order.
    pub const ALL: [LifecycleState; 7] = [
        Self::Initializing,
        Self::Idle,
        Self::Active,
        Self::Busy,
        Self::Error,
        Self::Terminating,
        Self::Terminated,
    ];

    /// Whether this is the absorbing terminal state.
    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }

    /// Whether an agent in this state can be handed work.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Idle | Self::Active)
    }

    /// Stable string form, used in event payloads and persisted rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    /// Whether `self → to` is an edge of the transition table.
    ///
    /// ```text
    /// Initializing → Idle | Error | Terminating
    /// Idle         → Active | Busy | Error | Terminating
    /// Active       → Idle | Busy | Error | Terminating
    /// Busy         → Idle | Active | Error | Terminating
    /// Error        → Initializing | Idle | Terminating
    /// Terminating  → Terminated
    /// ```
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        use LifecycleState::*;

        matches!(
            (self, to),
            (Initializing, Idle | Error | Terminating)
                | (Idle, Active | Busy | Error | Terminating)
                | (Active, Idle | Busy | Error | Terminating)
                | (Busy, Idle | Active | Error | Terminating)
                | (Error, Initializing | Idle | Terminating)
                | (Terminating, Terminated)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown lifecycle state: {s}"))
    }
}

/// A single recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// The state transitioned from.
    pub from: LifecycleState,
    /// The state transitioned to.
    pub to: LifecycleState,
    /// Optional context about why this transition happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the transition was applied.
    pub at: DateTime<Utc>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal state transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn test_no_self_transitions() {
        for state in LifecycleState::ALL {
            assert!(!state.can_transition_to(state), "{state} → {state}");
        }
    }

    #[test]
    fn test_terminated_is_absorbing() {
        for to in LifecycleState::ALL {
            assert!(!Terminated.can_transition_to(to));
        }
        assert!(Terminated.is_terminal());
    }

    #[test]
    fn test_only_terminating_reaches_terminated() {
        for from in LifecycleState::ALL {
            assert_eq!(from.can_transition_to(Terminated), from == Terminating);
        }
    }

    #[test]
    fn test_every_live_state_can_shut_down() {
        for from in [Initializing, Idle, Active, Busy, Error] {
            assert!(from.can_transition_to(Terminating));
        }
    }

    #[test]
    fn test_illegal_skips() {
        assert!(!Initializing.can_transition_to(Active));
        assert!(!Initializing.can_transition_to(Busy));
        assert!(!Error.can_transition_to(Busy));
        assert!(!Terminating.can_transition_to(Idle));
    }

    #[test]
    fn test_string_roundtrip() {
        for state in LifecycleState::ALL {
            assert_eq!(state.as_str().parse::<LifecycleState>().unwrap(), state);
        }
        assert!("sleeping".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn test_ready_states() {
        assert!(Idle.is_ready());
        assert!(Active.is_ready());
        assert!(!Busy.is_ready());
        assert!(!Initializing.is_ready());
    }
}
