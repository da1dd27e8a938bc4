//! Core types for durable coordination state
//!
//! These types are stored in RocksDB and represent everything the fleet
//! needs to survive a process restart: coordination entries, learned
//! patterns, events, metrics, the agent registry, sessions, consensus
//! proposals, blackboard hints and workflow checkpoints.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleState;

/// Partition used when the caller does not name one
pub const DEFAULT_PARTITION: &str = "default";

/// Owner recorded when the caller does not name one
pub const SYSTEM_OWNER: &str = "system";

/// `now + ttl`, or `None` for a missing or zero TTL.
pub fn expiry_from_ttl(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl.filter(|t| !t.is_zero())?;
    let delta = chrono::Duration::from_std(ttl).ok()?;
    now.checked_add_signed(delta)
}

fn is_past(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(expires_at, Some(t) if t <= now)
}

// =========================================================================
// Coordination entries
// =========================================================================

/// Who may read an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Owner only
    #[default]
    Private,
    /// Owner and agents sharing its team id
    Team,
    /// Anyone
    Public,
}

/// Identity of an agent performing a read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub agent_id: String,
    pub team_id: Option<String>,
}

impl Requester {
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            team_id: None,
        }
    }

    pub fn in_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }
}

/// A coordination entry. Unique per (key, partition).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub partition: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub owner: String,
    pub access_level: AccessLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    /// Whether the entry's TTL has elapsed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_past(self.expires_at, now)
    }

    /// Access check for a read performed by `requester`
    pub fn is_readable_by(&self, requester: &Requester) -> bool {
        if requester.agent_id == self.owner {
            return true;
        }
        match self.access_level {
            AccessLevel::Public => true,
            AccessLevel::Team => {
                self.team_id.is_some() && self.team_id.as_deref() == requester.team_id.as_deref()
            }
            AccessLevel::Private => false,
        }
    }
}

/// Options for [`StateStore::store`](super::StateStore::store)
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub partition: String,
    /// Zero or `None` means the entry never expires
    pub ttl: Option<Duration>,
    pub owner: Option<String>,
    pub access_level: AccessLevel,
    pub metadata: Option<serde_json::Value>,
    pub team_id: Option<String>,
    pub swarm_id: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            partition: DEFAULT_PARTITION.to_string(),
            ttl: None,
            owner: None,
            access_level: AccessLevel::default(),
            metadata: None,
            team_id: None,
            swarm_id: None,
        }
    }
}

impl StoreOptions {
    pub fn partition(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_access(mut self, access_level: AccessLevel) -> Self {
        self.access_level = access_level;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn with_swarm(mut self, swarm_id: impl Into<String>) -> Self {
        self.swarm_id = Some(swarm_id.into());
        self
    }
}

/// Options for reads
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub partition: String,
    /// `None` is a system read and skips the access check
    pub requester: Option<Requester>,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            partition: DEFAULT_PARTITION.to_string(),
            requester: None,
        }
    }
}

impl RetrieveOptions {
    pub fn partition(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            requester: None,
        }
    }

    pub fn as_requester(mut self, requester: Requester) -> Self {
        self.requester = Some(requester);
        self
    }
}

// =========================================================================
// Learned patterns
// =========================================================================

/// A learned coordination fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub pattern: String,
    /// Always within [0, 1]
    pub confidence: f64,
    pub usage_count: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pattern {
    pub fn new(pattern: impl Into<String>, confidence: f64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: pattern.into(),
            confidence,
            usage_count: 0,
            metadata: serde_json::Value::Null,
            agent_id: None,
            domain: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// =========================================================================
// Events and metrics
// =========================================================================

/// A persisted event row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredEvent {
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            source: source.into(),
            timestamp: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.expires_at = expiry_from_ttl(self.timestamp, ttl);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_past(self.expires_at, now)
    }
}

/// A single performance sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub id: String,
    pub metric: String,
    pub value: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PerformanceMetric {
    pub fn new(metric: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metric: metric.into(),
            value,
            unit: unit.into(),
            agent_id: None,
            timestamp: Utc::now(),
            expires_at: None,
        }
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.expires_at = expiry_from_ttl(self.timestamp, ttl);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_past(self.expires_at, now)
    }
}

// =========================================================================
// Agent registry and sessions
// =========================================================================

/// Rolling performance counters for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Fraction of finished tasks that succeeded (1.0 before any task)
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

impl Default for AgentPerformance {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            success_rate: 1.0,
            avg_duration_ms: 0.0,
        }
    }
}

impl AgentPerformance {
    /// Fold one finished task into the counters
    pub fn record(&mut self, success: bool, duration: Duration) {
        let finished = self.tasks_completed + self.tasks_failed;
        let duration_ms = duration.as_secs_f64() * 1000.0;
        self.avg_duration_ms =
            (self.avg_duration_ms * finished as f64 + duration_ms) / (finished + 1) as f64;

        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.success_rate = self.tasks_completed as f64 / (finished + 1) as f64;
    }

    pub fn total_tasks(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }
}

/// Registry row for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub agent_type: String,
    pub status: LifecycleState,
    pub capabilities: Vec<String>,
    pub performance: AgentPerformance,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            status: LifecycleState::Initializing,
            capabilities: Vec::new(),
            performance: AgentPerformance::default(),
            registered_at: now,
            updated_at: now,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// A coordination session (e.g. one fleet run)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub mode: String,
    pub phase: String,
    pub completed_tasks: Vec<String>,
    pub pending_tasks: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(mode: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mode: mode.into(),
            phase: "started".to_string(),
            completed_tasks: Vec::new(),
            pending_tasks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move a task from pending to completed
    pub fn complete_task(&mut self, task_id: &str) {
        self.pending_tasks.retain(|t| t != task_id);
        if !self.completed_tasks.iter().any(|t| t == task_id) {
            self.completed_tasks.push(task_id.to_string());
        }
        self.updated_at = Utc::now();
    }
}

/// Snapshot of a multi-step workflow for resumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub id: String,
    pub workflow_id: String,
    pub step: u32,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl WorkflowCheckpoint {
    pub fn new(workflow_id: impl Into<String>, step: u32, state: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            step,
            state,
            created_at: Utc::now(),
        }
    }
}

// =========================================================================
// Consensus
// =========================================================================

/// Rule deciding a proposal once quorum is met
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "value", rename_all = "snake_case")]
pub enum VotingRule {
    /// More approvals than rejections
    Majority,
    /// Every counted vote approves
    Unanimous,
    /// Approval fraction of counted votes at least this value
    Threshold(f64),
}

impl Default for VotingRule {
    fn default() -> Self {
        Self::Majority
    }
}

/// Consensus proposal status. Leaves `Pending` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl ConsensusStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for ConsensusStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: String,
    pub approve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub cast_at: DateTime<Utc>,
}

/// Full state of one consensus proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusState {
    pub proposal_id: String,
    pub topic: String,
    pub proposer: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub rule: VotingRule,
    /// Distinct voters required before a decision
    pub quorum: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligible_voters: Option<Vec<String>>,
    /// Counted votes keyed by voter id
    pub votes: BTreeMap<String, Vote>,
    /// Votes that arrived after the decision, kept for audit
    #[serde(default)]
    pub late_votes: Vec<Vote>,
    pub status: ConsensusStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

// =========================================================================
// Blackboard
// =========================================================================

/// A posted blackboard hint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardHint {
    /// Time-ordered id (`{posted_nanos}-{uuid}`)
    pub id: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub posted_by: String,
    pub posted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BlackboardHint {
    pub fn new(
        key: impl Into<String>,
        payload: serde_json::Value,
        posted_by: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        let posted_at = Utc::now();
        let nanos = posted_at.timestamp_nanos_opt().unwrap_or(0);
        Self {
            id: format!("{:020}-{}", nanos, uuid::Uuid::new_v4().simple()),
            key: key.into(),
            payload,
            posted_by: posted_by.into(),
            posted_at,
            expires_at: expiry_from_ttl(posted_at, ttl),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_past(self.expires_at, now)
    }
}

// =========================================================================
// Diagnostics
// =========================================================================

/// Row counts per table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub patterns: usize,
    pub events: usize,
    pub metrics: usize,
    pub agents: usize,
    pub sessions: usize,
    pub consensus: usize,
    pub hints: usize,
    pub checkpoints: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(access_level: AccessLevel, team_id: Option<&str>) -> MemoryEntry {
        let now = Utc::now();
        MemoryEntry {
            key: "k".into(),
            partition: DEFAULT_PARTITION.into(),
            value: serde_json::json!(1),
            metadata: serde_json::Value::Null,
            owner: "owner".into(),
            access_level,
            team_id: team_id.map(String::from),
            swarm_id: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let now = Utc::now();
        assert_eq!(expiry_from_ttl(now, None), None);
        assert_eq!(expiry_from_ttl(now, Some(Duration::ZERO)), None);
        assert_eq!(
            expiry_from_ttl(now, Some(Duration::from_secs(1))),
            Some(now + chrono::Duration::seconds(1))
        );
    }

    #[test]
    fn test_access_rules() {
        let alice = Requester::agent("alice").in_team("red");
        let owner = Requester::agent("owner");

        assert!(entry(AccessLevel::Private, None).is_readable_by(&owner));
        assert!(!entry(AccessLevel::Private, None).is_readable_by(&alice));

        assert!(entry(AccessLevel::Team, Some("red")).is_readable_by(&alice));
        assert!(!entry(AccessLevel::Team, Some("blue")).is_readable_by(&alice));
        assert!(!entry(AccessLevel::Team, None).is_readable_by(&Requester::agent("bob")));

        assert!(entry(AccessLevel::Public, None).is_readable_by(&alice));
    }

    #[test]
    fn test_expiry_boundary() {
        let mut e = entry(AccessLevel::Public, None);
        let now = Utc::now();
        e.expires_at = Some(now);
        assert!(e.is_expired_at(now));
        assert!(!e.is_expired_at(now - chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_fresh_performance_reports_full_success() {
        let perf = AgentPerformance::default();
        assert_eq!(perf.total_tasks(), 0);
        assert_eq!(perf.success_rate, 1.0);
        assert_eq!(AgentRecord::new("a", "t").performance, perf);

        let mut failed = perf;
        failed.record(false, Duration::from_millis(10));
        assert_eq!(failed.success_rate, 0.0);
    }

    #[test]
    fn test_performance_counters() {
        let mut perf = AgentPerformance::default();
        perf.record(true, Duration::from_millis(100));
        perf.record(false, Duration::from_millis(300));
        perf.record(true, Duration::from_millis(200));

        assert_eq!(perf.tasks_completed, 2);
        assert_eq!(perf.tasks_failed, 1);
        assert_eq!(perf.total_tasks(), 3);
        assert!((perf.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((perf.avg_duration_ms - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_session_complete_task() {
        let mut session = SessionRecord::new("fleet");
        session.pending_tasks = vec!["t1".into(), "t2".into()];
        session.complete_task("t1");
        session.complete_task("t1");
        assert_eq!(session.pending_tasks, vec!["t2".to_string()]);
        assert_eq!(session.completed_tasks, vec!["t1".to_string()]);
    }

    #[test]
    fn test_hint_ids_sort_by_post_time() {
        let a = BlackboardHint::new("k", serde_json::Value::Null, "a", None);
        std::thread::sleep(Duration::from_millis(2));
        let b = BlackboardHint::new("k", serde_json::Value::Null, "b", None);
        assert!(a.id < b.id);
    }

    #[test]
    fn test_voting_rule_serialization() {
        let json = serde_json::to_string(&VotingRule::Threshold(0.75)).unwrap();
        assert_eq!(json, r#"{"rule":"threshold","value":0.75}"#);
        let rule: VotingRule = serde_json::from_str(r#"{"rule":"unanimous"}"#).unwrap();
        assert_eq!(rule, VotingRule::Unanimous);
    }
}
