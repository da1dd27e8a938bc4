//! Consensus gating over the event bus
//!
//! Votes travel as `consensus:vote-cast` events. A listener registered on the
//! bus records them into the proposal ledger; the first time a proposal's
//! counted votes reach quorum its rule is applied, the status leaves
//! `pending` and `consensus:reached` is emitted once.
//!
//! A vote reaches the ledger only after it has been written to the store.
//! `cast_vote` records its ballot directly so a failed write is returned to
//! the voter, then broadcasts it; the listener skips ballots it has already
//! recorded.
//!
//! The listener holds only a weak reference to the bus, so the bus owning the
//! listener does not keep itself alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::events::{event_types, EventBus, EventBusError, ListenerId, SharedEventBus};
use crate::state::{
    ConsensusState, ConsensusStatus, SharedStateStore, StoreError, Vote, VotingRule,
};

/// Source tag for events emitted by the gating component
const SOURCE: &str = "consensus";

/// Timeout used by [`ConsensusGating::await_default`]
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for consensus operations
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// Parameters for a new proposal
#[derive(Debug, Clone)]
pub struct Proposal {
    pub topic: String,
    pub proposer: String,
    pub payload: serde_json::Value,
    /// Distinct voters required before the rule is applied
    pub quorum: usize,
    pub rule: VotingRule,
    /// When set, votes from anyone else are ignored
    pub eligible_voters: Option<Vec<String>>,
    /// Pending proposals older than this are timed out by `expire_overdue`
    pub deadline: Option<Duration>,
}

impl Proposal {
    pub fn new(topic: impl Into<String>, proposer: impl Into<String>, quorum: usize) -> Self {
        Self {
            topic: topic.into(),
            proposer: proposer.into(),
            payload: serde_json::Value::Null,
            quorum,
            rule: VotingRule::Majority,
            eligible_voters: None,
            deadline: None,
        }
    }

    pub fn with_rule(mut self, rule: VotingRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_eligible_voters<I, S>(mut self, voters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.eligible_voters = Some(voters.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn validate(&self) -> ConsensusResult<()> {
        if self.quorum == 0 {
            return Err(ConsensusError::InvalidProposal(
                "quorum must be at least 1".to_string(),
            ));
        }
        if let Some(voters) = &self.eligible_voters {
            if self.quorum > voters.len() {
                return Err(ConsensusError::InvalidProposal(format!(
                    "quorum {} exceeds {} eligible voters",
                    self.quorum,
                    voters.len()
                )));
            }
        }
        if let VotingRule::Threshold(fraction) = self.rule {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(ConsensusError::InvalidProposal(format!(
                    "threshold {} outside [0, 1]",
                    fraction
                )));
            }
        }
        Ok(())
    }
}

/// Outcome handed to `await_decision` callers and carried by
/// `consensus:reached` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub proposal_id: String,
    pub status: ConsensusStatus,
    /// True only for `approved`
    pub approved: bool,
    pub approvals: usize,
    pub rejections: usize,
}

impl Decision {
    fn from_state(state: &ConsensusState) -> Self {
        let approvals = state.votes.values().filter(|v| v.approve).count();
        Self {
            proposal_id: state.proposal_id.clone(),
            status: state.status,
            approved: state.status == ConsensusStatus::Approved,
            approvals,
            rejections: state.votes.len() - approvals,
        }
    }

    fn timed_out(state: Option<&ConsensusState>, proposal_id: &str) -> Self {
        let mut decision = match state {
            Some(state) => Self::from_state(state),
            None => Self {
                proposal_id: proposal_id.to_string(),
                status: ConsensusStatus::TimedOut,
                approved: false,
                approvals: 0,
                rejections: 0,
            },
        };
        decision.status = ConsensusStatus::TimedOut;
        decision.approved = false;
        decision
    }
}

/// Payload of a `consensus:vote-cast` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    pub proposal_id: String,
    pub voter_id: String,
    pub approve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub cast_at: DateTime<Utc>,
}

/// Apply the proposal's rule once quorum is met
fn evaluate(state: &ConsensusState) -> Option<ConsensusStatus> {
    let total = state.votes.len();
    if total < state.quorum {
        return None;
    }
    let approvals = state.votes.values().filter(|v| v.approve).count();
    let rejections = total - approvals;

    let approved = match state.rule {
        VotingRule::Majority => approvals > rejections,
        VotingRule::Unanimous => rejections == 0,
        VotingRule::Threshold(fraction) => approvals as f64 / total as f64 >= fraction,
    };
    Some(if approved {
        ConsensusStatus::Approved
    } else {
        ConsensusStatus::Rejected
    })
}

/// What recording a ballot did to the ledger
#[derive(Debug)]
enum Recorded {
    /// Unknown proposal, ineligible voter or a ballot already recorded
    Ignored,
    /// Written and committed, with the decision it produced
    Stored(Option<Decision>),
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Decision>,
}

#[derive(Default)]
struct Ledger {
    proposals: HashMap<String, ConsensusState>,
    waiters: HashMap<String, Vec<Waiter>>,
    next_waiter_id: u64,
}

impl Ledger {
    fn unregister(&mut self, proposal_id: &str, id: u64) {
        if let Some(waiters) = self.waiters.get_mut(proposal_id) {
            waiters.retain(|w| w.id != id);
            if waiters.is_empty() {
                self.waiters.remove(proposal_id);
            }
        }
    }

    fn settle(&mut self, decision: &Decision) {
        if let Some(waiters) = self.waiters.remove(&decision.proposal_id) {
            for waiter in waiters {
                let _ = waiter.tx.send(decision.clone());
            }
        }
    }
}

/// State shared between the gating handle and its bus listener
struct GatingCore {
    ledger: Mutex<Ledger>,
    store: Option<SharedStateStore>,
    bus: Weak<EventBus>,
}

impl GatingCore {
    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &ConsensusState) -> ConsensusResult<()> {
        if let Some(store) = &self.store {
            store.put_consensus(state)?;
        }
        Ok(())
    }

    /// Make sure a persisted proposal is in the ledger
    fn ensure_loaded(&self, ledger: &mut Ledger, proposal_id: &str) -> bool {
        if ledger.proposals.contains_key(proposal_id) {
            return true;
        }
        let Some(store) = &self.store else {
            return false;
        };
        match store.get_consensus(proposal_id) {
            Ok(Some(state)) => {
                debug!(proposal_id, "Loaded proposal from store");
                ledger.proposals.insert(proposal_id.to_string(), state);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(proposal_id, error = %e, "Failed to load proposal");
                false
            }
        }
    }

    /// Persist the ballot's effect, then commit it to the ledger. A failed
    /// write leaves the ledger untouched.
    fn record_vote(&self, ballot: Ballot) -> ConsensusResult<Recorded> {
        let mut guard = self.lock();
        let ledger = &mut *guard;
        if !self.ensure_loaded(ledger, &ballot.proposal_id) {
            debug!(proposal_id = %ballot.proposal_id, "Vote for unknown proposal ignored");
            return Ok(Recorded::Ignored);
        }
        let Some(current) = ledger.proposals.get(&ballot.proposal_id) else {
            return Ok(Recorded::Ignored);
        };

        if let Some(eligible) = &current.eligible_voters {
            if !eligible.contains(&ballot.voter_id) {
                warn!(
                    proposal_id = %ballot.proposal_id,
                    voter_id = %ballot.voter_id,
                    "Vote from ineligible voter ignored"
                );
                return Ok(Recorded::Ignored);
            }
        }

        let vote = Vote {
            voter_id: ballot.voter_id,
            approve: ballot.approve,
            reason: ballot.reason,
            cast_at: ballot.cast_at,
        };
        if current.votes.get(&vote.voter_id) == Some(&vote) || current.late_votes.contains(&vote) {
            return Ok(Recorded::Ignored);
        }

        let mut next = current.clone();
        let decision = if next.status.is_terminal() {
            debug!(
                proposal_id = %next.proposal_id,
                voter_id = %vote.voter_id,
                status = %next.status,
                "Late vote recorded for audit"
            );
            next.late_votes.push(vote);
            None
        } else {
            next.votes.insert(vote.voter_id.clone(), vote);
            evaluate(&next).map(|status| {
                next.status = status;
                next.decided_at = Some(Utc::now());
                Decision::from_state(&next)
            })
        };
        self.persist(&next)?;

        ledger.proposals.insert(next.proposal_id.clone(), next);
        if let Some(decision) = &decision {
            ledger.settle(decision);
        }
        Ok(Recorded::Stored(decision))
    }

    fn announce(&self, decision: &Decision) {
        info!(
            proposal_id = %decision.proposal_id,
            status = %decision.status,
            approvals = decision.approvals,
            rejections = decision.rejections,
            "Consensus reached"
        );
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let payload = json!({
            "proposal_id": decision.proposal_id,
            "status": decision.status,
            "approved": decision.approved,
            "approvals": decision.approvals,
            "rejections": decision.rejections,
        });
        if let Err(e) = bus.emit(event_types::CONSENSUS_REACHED, payload, SOURCE) {
            warn!(proposal_id = %decision.proposal_id, error = %e, "Failed to announce decision");
        }
    }
}

/// Multi-agent approval protocol built on the event bus.
pub struct ConsensusGating {
    core: Arc<GatingCore>,
    bus: SharedEventBus,
    listener: ListenerId,
    default_timeout: Duration,
}

impl ConsensusGating {
    /// Attach to `bus`. With a store, proposals and decisions are persisted.
    pub fn new(bus: SharedEventBus, store: Option<SharedStateStore>) -> Self {
        let core = Arc::new(GatingCore {
            ledger: Mutex::new(Ledger::default()),
            store,
            bus: Arc::downgrade(&bus),
        });

        let listener_core = Arc::clone(&core);
        let listener = bus.on(event_types::VOTE_CAST, move |event| {
            let ballot: Ballot = event.decode()?;
            if let Recorded::Stored(Some(decision)) = listener_core.record_vote(ballot)? {
                listener_core.announce(&decision);
            }
            Ok(())
        });

        Self {
            core,
            bus,
            listener,
            default_timeout: DEFAULT_DECISION_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Open a proposal and announce it. Returns the proposal id.
    pub fn open_proposal(&self, proposal: Proposal) -> ConsensusResult<String> {
        proposal.validate()?;

        let now = Utc::now();
        let deadline = proposal
            .deadline
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .and_then(|d| now.checked_add_signed(d));
        let state = ConsensusState {
            proposal_id: uuid::Uuid::new_v4().to_string(),
            topic: proposal.topic,
            proposer: proposal.proposer,
            payload: proposal.payload,
            rule: proposal.rule,
            quorum: proposal.quorum,
            eligible_voters: proposal.eligible_voters,
            votes: Default::default(),
            late_votes: Vec::new(),
            status: ConsensusStatus::Pending,
            created_at: now,
            deadline,
            decided_at: None,
        };
        let proposal_id = state.proposal_id.clone();

        if let Some(store) = &self.core.store {
            store.put_consensus(&state)?;
        }
        let payload = json!({
            "proposal_id": proposal_id,
            "topic": state.topic,
            "proposer": state.proposer,
            "quorum": state.quorum,
            "rule": state.rule,
        });
        self.core.lock().proposals.insert(proposal_id.clone(), state);

        if let Err(e) = self.bus.emit(event_types::PROPOSAL_OPENED, payload, SOURCE) {
            self.core.lock().proposals.remove(&proposal_id);
            return Err(e.into());
        }

        info!(proposal_id = %proposal_id, "Proposal opened");
        Ok(proposal_id)
    }

    /// Record a vote and broadcast it on the bus. Returns the proposal's
    /// status after the vote was recorded.
    ///
    /// Fails with the store's error if the vote could not be persisted; the
    /// proposal is then unchanged.
    pub fn cast_vote(
        &self,
        proposal_id: &str,
        voter_id: &str,
        approve: bool,
        reason: Option<&str>,
    ) -> ConsensusResult<ConsensusStatus> {
        {
            let mut ledger = self.core.lock();
            if !self.core.ensure_loaded(&mut ledger, proposal_id) {
                return Err(ConsensusError::ProposalNotFound(proposal_id.to_string()));
            }
        }

        let ballot = Ballot {
            proposal_id: proposal_id.to_string(),
            voter_id: voter_id.to_string(),
            approve,
            reason: reason.map(String::from),
            cast_at: Utc::now(),
        };
        let payload = serde_json::to_value(&ballot)
            .map_err(|e| ConsensusError::InvalidProposal(e.to_string()))?;

        let Recorded::Stored(decision) = self.core.record_vote(ballot)? else {
            return self.status(proposal_id);
        };
        if let Err(e) = self.bus.emit(event_types::VOTE_CAST, payload, voter_id) {
            warn!(proposal_id, voter_id, error = %e, "Recorded vote not broadcast");
        }
        if let Some(decision) = decision {
            self.core.announce(&decision);
        }

        self.status(proposal_id)
    }

    /// Current status of a proposal
    pub fn status(&self, proposal_id: &str) -> ConsensusResult<ConsensusStatus> {
        self.core
            .lock()
            .proposals
            .get(proposal_id)
            .map(|s| s.status)
            .ok_or_else(|| ConsensusError::ProposalNotFound(proposal_id.to_string()))
    }

    /// Full state of a proposal
    pub fn proposal(&self, proposal_id: &str) -> Option<ConsensusState> {
        self.core.lock().proposals.get(proposal_id).cloned()
    }

    /// Ids of proposals still pending
    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .core
            .lock()
            .proposals
            .values()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.proposal_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Wait for the proposal's decision.
    ///
    /// Resolves with the decision if it is reached before `timeout`. On
    /// timeout the result is `timed_out` with `approved == false`; the
    /// proposal itself stays pending. When the decisive vote and the timer
    /// land together, the vote wins.
    pub async fn await_decision(
        &self,
        proposal_id: &str,
        timeout: Duration,
    ) -> ConsensusResult<Decision> {
        let (id, mut rx) = {
            let mut guard = self.core.lock();
            let ledger = &mut *guard;
            if !self.core.ensure_loaded(ledger, proposal_id) {
                return Err(ConsensusError::ProposalNotFound(proposal_id.to_string()));
            }
            if let Some(state) = ledger.proposals.get(proposal_id) {
                if state.status.is_terminal() {
                    return Ok(Decision::from_state(state));
                }
            }

            let (tx, rx) = oneshot::channel();
            let id = ledger.next_waiter_id;
            ledger.next_waiter_id += 1;
            ledger
                .waiters
                .entry(proposal_id.to_string())
                .or_default()
                .push(Waiter { id, tx });
            (id, rx)
        };
        let registration = DecisionWait {
            core: &*self.core,
            proposal_id,
            id,
        };

        if let Ok(Ok(decision)) = tokio::time::timeout(timeout, &mut rx).await {
            return Ok(decision);
        }

        drop(registration);
        if let Ok(decision) = rx.try_recv() {
            return Ok(decision);
        }

        let decision =
            Decision::timed_out(self.core.lock().proposals.get(proposal_id), proposal_id);
        info!(proposal_id, ?timeout, "Consensus wait timed out");
        Ok(decision)
    }

    /// Number of `await_decision` calls currently waiting
    pub fn pending_waiters(&self) -> usize {
        self.core.lock().waiters.values().map(Vec::len).sum()
    }

    /// `await_decision` with the configured default timeout
    pub async fn await_default(&self, proposal_id: &str) -> ConsensusResult<Decision> {
        self.await_decision(proposal_id, self.default_timeout).await
    }

    /// Time out every pending proposal whose deadline has passed. Returns how
    /// many were closed. A proposal whose timeout cannot be persisted stays
    /// pending until the next sweep.
    pub fn expire_overdue(&self) -> usize {
        let now = Utc::now();
        let decisions: Vec<Decision> = {
            let mut guard = self.core.lock();
            let ledger = &mut *guard;
            let mut decisions = Vec::new();
            for state in ledger.proposals.values_mut() {
                let overdue = matches!(state.deadline, Some(deadline) if deadline <= now);
                if state.status.is_terminal() || !overdue {
                    continue;
                }
                let mut next = state.clone();
                next.status = ConsensusStatus::TimedOut;
                next.decided_at = Some(now);
                if let Err(e) = self.core.persist(&next) {
                    warn!(proposal_id = %next.proposal_id, error = %e, "Overdue proposal left pending");
                    continue;
                }
                *state = next;
                decisions.push(Decision::from_state(state));
            }
            for decision in &decisions {
                ledger.settle(decision);
            }
            decisions
        };

        for decision in &decisions {
            self.core.announce(decision);
        }
        decisions.len()
    }

    /// Reload persisted proposals into the ledger. Returns how many were added.
    pub fn restore(&self) -> ConsensusResult<usize> {
        let Some(store) = &self.core.store else {
            return Ok(0);
        };
        let persisted = store.list_consensus()?;
        let mut ledger = self.core.lock();
        let mut restored = 0;
        for state in persisted {
            if !ledger.proposals.contains_key(&state.proposal_id) {
                ledger.proposals.insert(state.proposal_id.clone(), state);
                restored += 1;
            }
        }
        info!(restored, "Restored consensus proposals");
        Ok(restored)
    }
}

/// Removes a decision waiter when its wait ends, including when the wait is
/// dropped
struct DecisionWait<'a> {
    core: &'a GatingCore,
    proposal_id: &'a str,
    id: u64,
}

impl Drop for DecisionWait<'_> {
    fn drop(&mut self) {
        self.core.lock().unregister(self.proposal_id, self.id);
    }
}

impl Drop for ConsensusGating {
    fn drop(&mut self) {
        self.bus.off(event_types::VOTE_CAST, self.listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn open_bus() -> SharedEventBus {
        let bus = EventBus::new().shared();
        bus.initialize();
        bus
    }

    fn count_decisions(bus: &SharedEventBus) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on(event_types::CONSENSUS_REACHED, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    #[tokio::test]
    async fn test_quorum_unmet_times_out_conservatively() {
        let bus = open_bus();
        let gating = ConsensusGating::new(bus, None);
        let id = gating
            .open_proposal(Proposal::new("deploy", "lead", 2).with_eligible_voters(["a", "b", "c"]))
            .unwrap();
        gating.cast_vote(&id, "a", true, None).unwrap();

        let started = tokio::time::Instant::now();
        let decision = gating
            .await_decision(&id, Duration::from_millis(50))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(decision.status, ConsensusStatus::TimedOut);
        assert!(!decision.approved);
        assert_eq!(decision.approvals, 1);
        assert_eq!(gating.status(&id).unwrap(), ConsensusStatus::Pending);
    }

    #[tokio::test]
    async fn test_decisive_vote_after_wait_started() {
        let bus = open_bus();
        let gating = Arc::new(ConsensusGating::new(bus, None));
        let id = gating
            .open_proposal(Proposal::new("merge", "lead", 2))
            .unwrap();
        gating.cast_vote(&id, "a", true, None).unwrap();

        let waiter = {
            let gating = gating.clone();
            let id = id.clone();
            tokio::spawn(async move { gating.await_decision(&id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        gating.cast_vote(&id, "b", true, Some("looks good")).unwrap();

        let decision = waiter.await.unwrap().unwrap();
        assert_eq!(decision.status, ConsensusStatus::Approved);
        assert!(decision.approved);
        assert_eq!(decision.approvals, 2);
    }

    #[tokio::test]
    async fn test_decision_emitted_exactly_once() {
        let bus = open_bus();
        let reached = count_decisions(&bus);
        let gating = ConsensusGating::new(bus, None);
        let id = gating
            .open_proposal(Proposal::new("t", "p", 2))
            .unwrap();

        gating.cast_vote(&id, "a", false, None).unwrap();
        assert_eq!(
            gating.cast_vote(&id, "b", false, None).unwrap(),
            ConsensusStatus::Rejected
        );
        // Votes after the decision are audited, never re-decided.
        assert_eq!(
            gating.cast_vote(&id, "c", true, None).unwrap(),
            ConsensusStatus::Rejected
        );
        assert_eq!(
            gating.cast_vote(&id, "d", true, None).unwrap(),
            ConsensusStatus::Rejected
        );

        assert_eq!(reached.load(Ordering::SeqCst), 1);
        let state = gating.proposal(&id).unwrap();
        assert_eq!(state.votes.len(), 2);
        assert_eq!(state.late_votes.len(), 2);

        let decision = gating
            .await_decision(&id, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(decision.status, ConsensusStatus::Rejected);
    }

    #[tokio::test]
    async fn test_voting_rules() {
        let bus = open_bus();
        let gating = ConsensusGating::new(bus, None);

        let tie = gating.open_proposal(Proposal::new("tie", "p", 2)).unwrap();
        gating.cast_vote(&tie, "a", true, None).unwrap();
        assert_eq!(
            gating.cast_vote(&tie, "b", false, None).unwrap(),
            ConsensusStatus::Rejected
        );

        let unanimous = gating
            .open_proposal(Proposal::new("u", "p", 3).with_rule(VotingRule::Unanimous))
            .unwrap();
        for voter in ["a", "b", "c"] {
            gating.cast_vote(&unanimous, voter, true, None).unwrap();
        }
        assert_eq!(gating.status(&unanimous).unwrap(), ConsensusStatus::Approved);

        let threshold = gating
            .open_proposal(Proposal::new("t", "p", 4).with_rule(VotingRule::Threshold(0.75)))
            .unwrap();
        for (voter, approve) in [("a", true), ("b", true), ("c", true), ("d", false)] {
            gating.cast_vote(&threshold, voter, approve, None).unwrap();
        }
        assert_eq!(gating.status(&threshold).unwrap(), ConsensusStatus::Approved);
    }

    #[tokio::test]
    async fn test_revote_replaces_and_ineligible_ignored() {
        let bus = open_bus();
        let gating = ConsensusGating::new(bus, None);
        let id = gating
            .open_proposal(Proposal::new("x", "p", 2).with_eligible_voters(["a", "b"]))
            .unwrap();

        gating.cast_vote(&id, "a", false, None).unwrap();
        gating.cast_vote(&id, "a", true, None).unwrap();
        assert_eq!(
            gating.cast_vote(&id, "mallory", true, None).unwrap(),
            ConsensusStatus::Pending
        );

        let state = gating.proposal(&id).unwrap();
        assert_eq!(state.votes.len(), 1);
        assert!(state.votes["a"].approve);

        assert_eq!(
            gating.cast_vote(&id, "b", true, None).unwrap(),
            ConsensusStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_invalid_and_unknown_proposals() {
        let bus = open_bus();
        let gating = ConsensusGating::new(bus, None);

        assert!(matches!(
            gating.open_proposal(Proposal::new("x", "p", 0)),
            Err(ConsensusError::InvalidProposal(_))
        ));
        assert!(matches!(
            gating.open_proposal(Proposal::new("x", "p", 3).with_eligible_voters(["a"])),
            Err(ConsensusError::InvalidProposal(_))
        ));
        assert!(matches!(
            gating.cast_vote("nope", "a", true, None),
            Err(ConsensusError::ProposalNotFound(_))
        ));
        assert!(matches!(
            gating.await_decision("nope", Duration::from_millis(1)).await,
            Err(ConsensusError::ProposalNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_overdue() {
        let bus = open_bus();
        let reached = count_decisions(&bus);
        let gating = ConsensusGating::new(bus, None);
        let id = gating
            .open_proposal(Proposal::new("slow", "p", 2).with_deadline(Duration::from_millis(10)))
            .unwrap();
        let open = gating.open_proposal(Proposal::new("open", "p", 2)).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gating.expire_overdue(), 1);
        assert_eq!(gating.expire_overdue(), 0);

        assert_eq!(gating.status(&id).unwrap(), ConsensusStatus::TimedOut);
        assert_eq!(gating.pending(), vec![open]);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("consensus.db")).unwrap().shared();

        let id = {
            let gating = ConsensusGating::new(open_bus(), Some(store.clone()));
            let id = gating.open_proposal(Proposal::new("keep", "p", 1)).unwrap();
            gating.cast_vote(&id, "a", true, None).unwrap();
            id
        };

        let persisted = store.get_consensus(&id).unwrap().unwrap();
        assert_eq!(persisted.status, ConsensusStatus::Approved);

        let gating = ConsensusGating::new(open_bus(), Some(store));
        assert_eq!(gating.restore().unwrap(), 1);
        let decision = gating
            .await_decision(&id, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn test_failed_vote_write_leaves_proposal_unchanged() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("consensus.db")).unwrap().shared();
        let bus = open_bus();
        let reached = count_decisions(&bus);
        let gating = ConsensusGating::new(bus, Some(store.clone()));
        let id = gating.open_proposal(Proposal::new("ship", "p", 1)).unwrap();

        store.close().unwrap();
        assert!(matches!(
            gating.cast_vote(&id, "a", true, None),
            Err(ConsensusError::Store(StoreError::NotInitialized))
        ));

        let state = gating.proposal(&id).unwrap();
        assert_eq!(state.status, ConsensusStatus::Pending);
        assert!(state.votes.is_empty());
        assert_eq!(reached.load(Ordering::SeqCst), 0);

        // The same vote succeeds once the store is back.
        store.initialize().unwrap();
        assert_eq!(
            gating.cast_vote(&id, "a", true, None).unwrap(),
            ConsensusStatus::Approved
        );
        assert_eq!(
            store.get_consensus(&id).unwrap().unwrap().status,
            ConsensusStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_expire_overdue_keeps_unwritten_timeouts_pending() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("consensus.db")).unwrap().shared();
        let gating = ConsensusGating::new(open_bus(), Some(store.clone()));
        let id = gating
            .open_proposal(Proposal::new("slow", "p", 2).with_deadline(Duration::from_millis(5)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.close().unwrap();
        assert_eq!(gating.expire_overdue(), 0);
        assert_eq!(gating.status(&id).unwrap(), ConsensusStatus::Pending);

        store.initialize().unwrap();
        assert_eq!(gating.expire_overdue(), 1);
        assert_eq!(
            store.get_consensus(&id).unwrap().unwrap().status,
            ConsensusStatus::TimedOut
        );
    }

    #[tokio::test]
    async fn test_bus_ballots_counted_once() {
        let bus = open_bus();
        let reached = count_decisions(&bus);
        let gating = ConsensusGating::new(bus.clone(), None);
        let id = gating.open_proposal(Proposal::new("t", "p", 2)).unwrap();

        // A ballot from another participant arrives only through the bus.
        let ballot = Ballot {
            proposal_id: id.clone(),
            voter_id: "remote".into(),
            approve: true,
            reason: None,
            cast_at: Utc::now(),
        };
        let payload = serde_json::to_value(&ballot).unwrap();
        bus.emit(event_types::VOTE_CAST, payload.clone(), "remote").unwrap();
        bus.emit(event_types::VOTE_CAST, payload, "remote").unwrap();
        assert_eq!(gating.proposal(&id).unwrap().votes.len(), 1);

        assert_eq!(
            gating.cast_vote(&id, "local", true, None).unwrap(),
            ConsensusStatus::Approved
        );
        let state = gating.proposal(&id).unwrap();
        assert_eq!(state.votes.len(), 2);
        assert!(state.late_votes.is_empty());
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_wait_unregisters() {
        let gating = Arc::new(ConsensusGating::new(open_bus(), None));
        let id = gating.open_proposal(Proposal::new("t", "p", 2)).unwrap();

        let waiter = {
            let gating = gating.clone();
            let id = id.clone();
            tokio::spawn(async move { gating.await_decision(&id, Duration::from_secs(5)).await })
        };
        while gating.pending_waiters() == 0 {
            tokio::task::yield_now().await;
        }

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(gating.pending_waiters(), 0);

        let decision = gating
            .await_decision(&id, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(decision.status, ConsensusStatus::TimedOut);
        assert_eq!(gating.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn test_drop_unregisters_listener() {
        let bus = open_bus();
        {
            let _gating = ConsensusGating::new(bus.clone(), None);
            assert_eq!(bus.listener_count(event_types::VOTE_CAST), 1);
        }
        assert_eq!(bus.listener_count(event_types::VOTE_CAST), 0);
    }
}
