//! Column family definitions for the RocksDB state store
//!
//! Each column family plays the role of one table while sharing the same
//! RocksDB instance. Index families hold empty values; the information is
//! in the key.

/// Column family for coordination entries, keyed by (partition, key)
pub const CF_ENTRIES: &str = "entries";

/// Index of entries by expiry time, for the garbage-collection sweep
pub const CF_ENTRY_EXPIRY: &str = "entry_expiry";

/// Column family for learned patterns
pub const CF_PATTERNS: &str = "patterns";

/// Index of patterns by owning agent, ordered by confidence descending
pub const CF_PATTERNS_BY_AGENT: &str = "patterns_by_agent";

/// Column family for event history
pub const CF_EVENTS: &str = "events";

/// Column family for performance metrics
pub const CF_METRICS: &str = "metrics";

/// Column family for the agent registry
pub const CF_AGENTS: &str = "agents";

/// Column family for sessions
pub const CF_SESSIONS: &str = "sessions";

/// Column family for consensus proposals
pub const CF_CONSENSUS: &str = "consensus";

/// Column family for blackboard hints
pub const CF_HINTS: &str = "hints";

/// Column family for workflow checkpoints
pub const CF_CHECKPOINTS: &str = "checkpoints";

/// All column family names
pub const ALL_CFS: &[&str] = &[
    CF_ENTRIES,
    CF_ENTRY_EXPIRY,
    CF_PATTERNS,
    CF_PATTERNS_BY_AGENT,
    CF_EVENTS,
    CF_METRICS,
    CF_AGENTS,
    CF_SESSIONS,
    CF_CONSENSUS,
    CF_HINTS,
    CF_CHECKPOINTS,
];

/// Separator for compound keys whose parts are caller-supplied strings.
/// Keys and partitions may not contain it.
pub const SEP: char = '\u{1f}';

/// Confidence is stored in index keys as a fixed-width integer
const CONFIDENCE_SCALE: f64 = 1_000_000_000.0;

/// Key prefixes for compound keys
pub mod keys {
    use super::{CONFIDENCE_SCALE, SEP};

    /// Create an entry key
    pub fn entry(partition: &str, key: &str) -> String {
        format!("{}{}{}", partition, SEP, key)
    }

    /// Prefix shared by every entry in a partition
    pub fn entry_partition_prefix(partition: &str) -> String {
        format!("{}{}", partition, SEP)
    }

    /// Create an expiry index key (timestamp first for ordered sweeps)
    pub fn entry_expiry(expires_nanos: i64, partition: &str, key: &str) -> String {
        format!("{:020}{}{}{}{}", expires_nanos, SEP, partition, SEP, key)
    }

    /// Parse (expires_nanos, partition, key) out of an expiry index key
    pub fn parse_entry_expiry(index_key: &str) -> Option<(i64, &str, &str)> {
        let mut parts = index_key.splitn(3, SEP);
        let nanos = parts.next()?.parse().ok()?;
        let partition = parts.next()?;
        let key = parts.next()?;
        Some((nanos, partition, key))
    }

    /// Create a pattern key
    pub fn pattern(pattern_id: &str) -> String {
        format!("pattern:{}", pattern_id)
    }

    /// Create an agent pattern index key. Higher confidence sorts first.
    pub fn pattern_by_agent(agent_id: &str, confidence: f64, pattern_id: &str) -> String {
        let scaled = (confidence.clamp(0.0, 1.0) * CONFIDENCE_SCALE).round() as u64;
        let inverted = CONFIDENCE_SCALE as u64 - scaled;
        format!("{}{}{:010}{}{}", agent_id, SEP, inverted, SEP, pattern_id)
    }

    /// Prefix shared by every index row of one agent
    pub fn pattern_agent_prefix(agent_id: &str) -> String {
        format!("{}{}", agent_id, SEP)
    }

    /// Parse (confidence, pattern_id) out of an agent pattern index key
    pub fn parse_pattern_by_agent(index_key: &str) -> Option<(f64, &str)> {
        let mut parts = index_key.splitn(3, SEP);
        let _agent = parts.next()?;
        let inverted: u64 = parts.next()?.parse().ok()?;
        let pattern_id = parts.next()?;
        let confidence = (CONFIDENCE_SCALE as u64).saturating_sub(inverted) as f64 / CONFIDENCE_SCALE;
        Some((confidence, pattern_id))
    }

    /// Create an event key (timestamp-based for ordering)
    pub fn event(timestamp_nanos: i64, event_id: &str) -> String {
        format!("evt:{:020}:{}", timestamp_nanos, event_id)
    }

    /// Parse event timestamp from key
    pub fn parse_event_timestamp(key: &str) -> Option<i64> {
        let parts: Vec<&str> = key.split(':').collect();
        if parts.len() >= 2 && parts[0] == "evt" {
            parts[1].parse().ok()
        } else {
            None
        }
    }

    /// Create a metric key (timestamp-based for ordering)
    pub fn metric(timestamp_nanos: i64, metric_id: &str) -> String {
        format!("metric:{:020}:{}", timestamp_nanos, metric_id)
    }

    /// Create an agent key
    pub fn agent(agent_id: &str) -> String {
        format!("agent:{}", agent_id)
    }

    /// Create a session key
    pub fn session(session_id: &str) -> String {
        format!("sess:{}", session_id)
    }

    /// Create a consensus proposal key
    pub fn proposal(proposal_id: &str) -> String {
        format!("proposal:{}", proposal_id)
    }

    /// Create a hint key. Hint ids are time-ordered.
    pub fn hint(hint_id: &str) -> String {
        format!("hint:{}", hint_id)
    }

    /// Create a checkpoint key (workflow first, then time)
    pub fn checkpoint(workflow_id: &str, created_nanos: i64) -> String {
        format!("ckpt:{}{}{:020}", workflow_id, SEP, created_nanos)
    }

    /// Prefix shared by every checkpoint of one workflow
    pub fn checkpoint_prefix(workflow_id: &str) -> String {
        format!("ckpt:{}{}", workflow_id, SEP)
    }
}
