//! Per-agent lifecycle manager
//!
//! Owns one agent's [`LifecycleState`], validates every change against the
//! transition table and tells the outside world about it through a single
//! status-change callback supplied at construction.
//!
//! Transitions are serialized: a transition and its callback complete before
//! the next transition starts, so observers see changes in the order they
//! were applied. The callback must not transition the same agent.
//!
//! Waits are a race between a one-shot waiter and a timer. Waiters are
//! registered and fired under the same lock that applies transitions, so a
//! transition landing while a wait is being set up is never missed. When
//! the timer and the transition land together, the transition wins.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use super::state::{IllegalTransition, LifecycleState, TransitionRecord};

/// Error type for lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("Timed out after {timeout:?} waiting for agent {agent_id} to reach {target}")]
    Timeout {
        agent_id: String,
        target: String,
        timeout: Duration,
    },

    #[error("Agent {0} terminated before reaching the awaited state")]
    Terminated(String),
}

/// Result type for lifecycle operations
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// A successful transition, as delivered to the status-change callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub agent_id: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Status-change callback. Runs synchronously inside `transition_to`, in
/// transition order. It may read the agent's state but must not transition it.
pub type StatusCallback = Arc<dyn Fn(&StatusChange) + Send + Sync>;

struct Waiter {
    id: u64,
    targets: Vec<LifecycleState>,
    tx: oneshot::Sender<LifecycleState>,
}

struct LifecycleInner {
    current: LifecycleState,
    transitions: Vec<TransitionRecord>,
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
}

/// State machine for a single agent.
pub struct AgentLifecycleManager {
    agent_id: String,
    /// Held from applying a transition until its callback returns
    sequencer: Mutex<()>,
    inner: Mutex<LifecycleInner>,
    state_tx: watch::Sender<LifecycleState>,
    callback: Option<StatusCallback>,
}

impl AgentLifecycleManager {
    /// Create a manager without a status-change callback.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self::build(agent_id.into(), None)
    }

    /// Create a manager that reports every transition to `callback`.
    pub fn with_callback(agent_id: impl Into<String>, callback: StatusCallback) -> Self {
        Self::build(agent_id.into(), Some(callback))
    }

    fn build(agent_id: String, callback: Option<StatusCallback>) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Initializing);
        Self {
            agent_id,
            sequencer: Mutex::new(()),
            inner: Mutex::new(LifecycleInner {
                current: LifecycleState::Initializing,
                transitions: Vec::new(),
                waiters: Vec::new(),
                next_waiter_id: 0,
            }),
            state_tx,
            callback,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        // The callback runs outside this lock; nothing can panic mid-update.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sequence(&self) -> MutexGuard<'_, ()> {
        self.sequencer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The agent this manager belongs to.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Get the current state.
    pub fn current_state(&self) -> LifecycleState {
        self.lock().current
    }

    /// Whether the agent has reached the absorbing state.
    pub fn is_terminal(&self) -> bool {
        self.current_state().is_terminal()
    }

    /// Get the full transition log.
    pub fn transitions(&self) -> Vec<TransitionRecord> {
        self.lock().transitions.clone()
    }

    /// Watch the current state. Intermediate states may be coalesced, so use
    /// the wait operations when a specific state must not be missed.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Attempt to move to `to`.
    ///
    /// Illegal transitions are logged and rejected, leaving the state as it
    /// was. A legal one is recorded, wakes matching waiters and invokes the
    /// status-change callback once before returning.
    pub fn transition_to(
        &self,
        to: LifecycleState,
        reason: Option<&str>,
    ) -> LifecycleResult<TransitionRecord> {
        let _sequenced = self.sequence();
        self.apply(to, reason)
    }

    /// Apply one transition and notify. Caller holds the sequencer.
    fn apply(&self, to: LifecycleState, reason: Option<&str>) -> LifecycleResult<TransitionRecord> {
        let record = {
            let mut inner = self.lock();
            let from = inner.current;

            if !from.can_transition_to(to) {
                warn!(
                    agent_id = %self.agent_id,
                    from = %from,
                    to = %to,
                    reason = reason.unwrap_or(""),
                    "Rejected lifecycle transition"
                );
                return Err(IllegalTransition { from, to }.into());
            }

            let record = TransitionRecord {
                from,
                to,
                reason: reason.map(String::from),
                at: Utc::now(),
            };
            inner.transitions.push(record.clone());
            inner.current = to;

            // Fire waiters while still holding the lock so a timed-out waiter
            // that re-acquires it always finds its value already sent.
            let waiters = std::mem::take(&mut inner.waiters);
            for waiter in waiters {
                if waiter.targets.contains(&to) {
                    let _ = waiter.tx.send(to);
                } else if !to.is_terminal() {
                    inner.waiters.push(waiter);
                }
            }

            self.state_tx.send_replace(to);
            record
        };

        debug!(
            agent_id = %self.agent_id,
            from = %record.from,
            to = %record.to,
            "Lifecycle transition"
        );

        if let Some(callback) = &self.callback {
            callback(&StatusChange {
                agent_id: self.agent_id.clone(),
                from: record.from,
                to: record.to,
                reason: record.reason.clone(),
                at: record.at,
            });
        }

        Ok(record)
    }

    /// Move to `Error` from any live state.
    pub fn fail(&self, reason: &str) -> LifecycleResult<TransitionRecord> {
        self.transition_to(LifecycleState::Error, Some(reason))
    }

    /// Drive the agent to `Terminated`, passing through `Terminating`.
    pub fn terminate(&self, reason: &str) -> LifecycleResult<()> {
        let _sequenced = self.sequence();
        match self.current_state() {
            LifecycleState::Terminated => return Ok(()),
            LifecycleState::Terminating => {}
            _ => {
                self.apply(LifecycleState::Terminating, Some(reason))?;
            }
        }
        self.apply(LifecycleState::Terminated, Some(reason))?;
        Ok(())
    }

    /// Wait until the agent is in `target`. Resolves immediately if it
    /// already is.
    pub async fn wait_for_status(
        &self,
        target: LifecycleState,
        timeout: Duration,
    ) -> LifecycleResult<LifecycleState> {
        self.wait_for_any(&[target], timeout).await
    }

    /// Wait until the agent can accept work (`Idle` or `Active`).
    pub async fn wait_for_ready(&self, timeout: Duration) -> LifecycleResult<LifecycleState> {
        self.wait_for_any(&[LifecycleState::Idle, LifecycleState::Active], timeout)
            .await
    }

    /// Wait until the agent enters any of `targets`.
    pub async fn wait_for_any(
        &self,
        targets: &[LifecycleState],
        timeout: Duration,
    ) -> LifecycleResult<LifecycleState> {
        let (id, mut rx) = {
            let mut inner = self.lock();
            if targets.contains(&inner.current) {
                return Ok(inner.current);
            }
            if inner.current.is_terminal() {
                return Err(LifecycleError::Terminated(self.agent_id.clone()));
            }

            let (tx, rx) = oneshot::channel();
            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiters.push(Waiter {
                id,
                targets: targets.to_vec(),
                tx,
            });
            (id, rx)
        };
        let registration = WaitRegistration { manager: self, id };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(LifecycleError::Terminated(self.agent_id.clone())),
            Err(_) => {
                drop(registration);
                // The transition may have landed in the same tick as the timer.
                if let Ok(state) = rx.try_recv() {
                    return Ok(state);
                }
                Err(LifecycleError::Timeout {
                    agent_id: self.agent_id.clone(),
                    target: targets
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join("|"),
                    timeout,
                })
            }
        }
    }

    /// Number of registered waiters (diagnostics).
    pub fn pending_waiters(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// Removes a waiter when its wait ends, including when the wait is dropped
struct WaitRegistration<'a> {
    manager: &'a AgentLifecycleManager,
    id: u64,
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.manager.lock().waiters.retain(|w| w.id != id);
    }
}

impl std::fmt::Debug for AgentLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLifecycleManager")
            .field("agent_id", &self.agent_id)
            .field("current", &self.current_state())
            .finish()
    }
}
