//! RocksDB-backed state store for fleet coordination
//!
//! Provides persistent storage with column families for logical data separation.
//! Rows are serialized as JSON so they stay debuggable with stock RocksDB tools.
//!
//! Every multi-row change to a single logical entry (an entry plus its expiry
//! index row, a pattern plus its agent index row) goes through one
//! `WriteBatch`, so readers never observe half an update. Read-modify-write
//! paths are serialized by a store-wide writer lock; the last committed write
//! wins.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use super::schema::{self, ALL_CFS, SEP};
use super::types::*;
use crate::lifecycle::LifecycleState;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("State store is not initialized; call initialize() first")]
    NotInitialized,

    #[error("Access denied to {partition}/{key} for {requester}")]
    AccessDenied {
        key: String,
        partition: String,
        requester: String,
    },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to StateStore
pub type SharedStateStore = Arc<StateStore>;

enum DbSlot {
    Uninitialized,
    Open(DB),
    Closed,
}

/// RocksDB-backed persistent state store
pub struct StateStore {
    db: RwLock<DbSlot>,
    path: PathBuf,
    write_lock: Mutex<()>,
}

fn nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn cf<'a>(db: &'a DB, cf_name: &str) -> StoreResult<&'a ColumnFamily> {
    db.cf_handle(cf_name)
        .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}

/// Store a value in a column family
fn put<T: Serialize>(db: &DB, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
    let cf = cf(db, cf_name)?;
    db.put_cf(&cf, key.as_bytes(), encode(value)?)?;
    Ok(())
}

/// Get a value from a column family
fn get<T: DeserializeOwned>(db: &DB, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
    let cf = cf(db, cf_name)?;
    match db.get_cf(&cf, key.as_bytes())? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Delete a value from a column family
fn delete(db: &DB, cf_name: &str, key: &str) -> StoreResult<()> {
    let cf = cf(db, cf_name)?;
    db.delete_cf(&cf, key.as_bytes())?;
    Ok(())
}

/// All (key, value) pairs whose key starts with `prefix`, in key order
fn scan_prefix(db: &DB, cf_name: &str, prefix: &str) -> StoreResult<Vec<(String, Box<[u8]>)>> {
    let cf = cf(db, cf_name)?;
    let iter = db.prefix_iterator_cf(&cf, prefix.as_bytes());

    let mut rows = Vec::new();
    for result in iter {
        let (key, value) = result?;
        let key_str = String::from_utf8(key.to_vec())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        if !key_str.starts_with(prefix) {
            break; // Prefix no longer matches
        }
        rows.push((key_str, value));
    }
    Ok(rows)
}

fn scan_values<T: DeserializeOwned>(db: &DB, cf_name: &str, prefix: &str) -> StoreResult<Vec<T>> {
    scan_prefix(db, cf_name, prefix)?
        .iter()
        .map(|(_, value)| decode(value))
        .collect()
}

fn count_rows(db: &DB, cf_name: &str) -> StoreResult<usize> {
    let cf = cf(db, cf_name)?;
    let mut count = 0;
    for result in db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
        result?;
        count += 1;
    }
    Ok(count)
}

fn validate_name(what: &str, value: &str) -> StoreResult<()> {
    if value.is_empty() {
        return Err(StoreError::InvalidValue(format!("{what} must not be empty")));
    }
    if value.contains(SEP) {
        return Err(StoreError::InvalidValue(format!(
            "{what} must not contain the U+001F separator"
        )));
    }
    Ok(())
}

impl StateStore {
    /// Create a store handle for `path` without opening it. The database is
    /// opened by `initialize()` or lazily by the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            db: RwLock::new(DbSlot::Uninitialized),
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Open or create a state store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let store = Self::new(path);
        store.initialize()?;
        Ok(store)
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Open the database. A no-op if it is already open; reopens a closed store.
    pub fn initialize(&self) -> StoreResult<()> {
        let mut slot = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        if matches!(*slot, DbSlot::Open(_)) {
            return Ok(());
        }

        // Configure options
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Define column families
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        // Open database with column families
        let db = DB::open_cf_descriptors(&opts, &self.path, cf_descriptors)?;
        *slot = DbSlot::Open(db);

        info!(path = %self.path.display(), "State store initialized");
        Ok(())
    }

    /// Flush and release the database. Later operations fail with
    /// `NotInitialized` until `initialize()` is called again.
    pub fn close(&self) -> StoreResult<()> {
        let mut slot = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        match std::mem::replace(&mut *slot, DbSlot::Closed) {
            DbSlot::Open(db) => {
                for name in ALL_CFS {
                    db.flush_cf(cf(&db, name)?)?;
                }
                drop(db);
                info!(path = %self.path.display(), "State store closed");
            }
            DbSlot::Uninitialized => *slot = DbSlot::Uninitialized,
            DbSlot::Closed => {}
        }
        Ok(())
    }

    /// Whether the database is currently open
    pub fn is_initialized(&self) -> bool {
        self.db
            .read()
            .map(|slot| matches!(*slot, DbSlot::Open(_)))
            .unwrap_or(false)
    }

    /// Run `f` against the open database, opening it on first use.
    fn with_db<R>(&self, f: impl FnOnce(&DB) -> StoreResult<R>) -> StoreResult<R> {
        {
            let slot = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
            match &*slot {
                DbSlot::Open(db) => return f(db),
                DbSlot::Closed => return Err(StoreError::NotInitialized),
                DbSlot::Uninitialized => {}
            }
        }

        self.initialize()?;

        let slot = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        match &*slot {
            DbSlot::Open(db) => f(db),
            _ => Err(StoreError::NotInitialized),
        }
    }

    fn writer(&self) -> StoreResult<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)
    }

    // =========================================================================
    // Coordination entries
    // =========================================================================

    /// Upsert `value` under (key, options.partition).
    ///
    /// The creation time survives overwrites of a live entry; the expiry is
    /// always recomputed from the new TTL.
    pub fn store(
        &self,
        key: &str,
        value: serde_json::Value,
        options: StoreOptions,
    ) -> StoreResult<MemoryEntry> {
        validate_name("key", key)?;
        validate_name("partition", &options.partition)?;

        self.with_db(|db| {
            let _writer = self.writer()?;
            let now = Utc::now();
            let entry_key = schema::keys::entry(&options.partition, key);
            let previous: Option<MemoryEntry> = get(db, schema::CF_ENTRIES, &entry_key)?;

            let created_at = previous
                .as_ref()
                .filter(|p| !p.is_expired_at(now))
                .map(|p| p.created_at)
                .unwrap_or(now);

            let entry = MemoryEntry {
                key: key.to_string(),
                partition: options.partition.clone(),
                value,
                metadata: options.metadata.unwrap_or(serde_json::Value::Null),
                owner: options.owner.unwrap_or_else(|| SYSTEM_OWNER.to_string()),
                access_level: options.access_level,
                team_id: options.team_id,
                swarm_id: options.swarm_id,
                created_at,
                updated_at: now,
                expires_at: expiry_from_ttl(now, options.ttl),
            };

            let entries = cf(db, schema::CF_ENTRIES)?;
            let expiry = cf(db, schema::CF_ENTRY_EXPIRY)?;
            let mut batch = WriteBatch::default();
            batch.put_cf(&entries, entry_key.as_bytes(), encode(&entry)?);
            if let Some(old) = previous.as_ref().and_then(|p| p.expires_at) {
                let old_index = schema::keys::entry_expiry(nanos(old), &entry.partition, key);
                batch.delete_cf(&expiry, old_index.as_bytes());
            }
            if let Some(at) = entry.expires_at {
                let index = schema::keys::entry_expiry(nanos(at), &entry.partition, key);
                batch.put_cf(&expiry, index.as_bytes(), b"");
            }
            db.write(batch)?;

            debug!(key, partition = %entry.partition, expires_at = ?entry.expires_at, "Stored entry");
            Ok(entry)
        })
    }

    /// Current value under (key, options.partition), or `None`.
    pub fn retrieve(
        &self,
        key: &str,
        options: RetrieveOptions,
    ) -> StoreResult<Option<serde_json::Value>> {
        Ok(self.retrieve_entry(key, options)?.map(|e| e.value))
    }

    /// Full entry under (key, options.partition), or `None`.
    ///
    /// An expired entry is never returned; it is deleted on the spot instead
    /// of waiting for the sweep.
    pub fn retrieve_entry(
        &self,
        key: &str,
        options: RetrieveOptions,
    ) -> StoreResult<Option<MemoryEntry>> {
        self.with_db(|db| {
            let entry_key = schema::keys::entry(&options.partition, key);
            let Some(entry) = get::<MemoryEntry>(db, schema::CF_ENTRIES, &entry_key)? else {
                return Ok(None);
            };

            if entry.is_expired_at(Utc::now()) {
                debug!(key, partition = %options.partition, "Expired entry read; purging");
                self.purge_entry_if_expired(db, &options.partition, key)?;
                return Ok(None);
            }

            if let Some(requester) = &options.requester {
                if !entry.is_readable_by(requester) {
                    return Err(StoreError::AccessDenied {
                        key: key.to_string(),
                        partition: options.partition.clone(),
                        requester: requester.agent_id.clone(),
                    });
                }
            }

            Ok(Some(entry))
        })
    }

    /// Delete an entry if it is (still) expired. Returns whether a row went away.
    fn purge_entry_if_expired(&self, db: &DB, partition: &str, key: &str) -> StoreResult<bool> {
        let _writer = self.writer()?;
        let entry_key = schema::keys::entry(partition, key);
        let Some(entry) = get::<MemoryEntry>(db, schema::CF_ENTRIES, &entry_key)? else {
            return Ok(false);
        };
        if !entry.is_expired_at(Utc::now()) {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf(db, schema::CF_ENTRIES)?, entry_key.as_bytes());
        if let Some(at) = entry.expires_at {
            let index = schema::keys::entry_expiry(nanos(at), partition, key);
            batch.delete_cf(&cf(db, schema::CF_ENTRY_EXPIRY)?, index.as_bytes());
        }
        db.write(batch)?;
        Ok(true)
    }

    /// Delete an entry. Returns whether it existed.
    pub fn delete(&self, key: &str, partition: &str) -> StoreResult<bool> {
        self.with_db(|db| {
            let _writer = self.writer()?;
            let entry_key = schema::keys::entry(partition, key);
            let Some(entry) = get::<MemoryEntry>(db, schema::CF_ENTRIES, &entry_key)? else {
                return Ok(false);
            };

            let mut batch = WriteBatch::default();
            batch.delete_cf(&cf(db, schema::CF_ENTRIES)?, entry_key.as_bytes());
            if let Some(at) = entry.expires_at {
                let index = schema::keys::entry_expiry(nanos(at), partition, key);
                batch.delete_cf(&cf(db, schema::CF_ENTRY_EXPIRY)?, index.as_bytes());
            }
            db.write(batch)?;
            Ok(true)
        })
    }

    /// Live entries of a partition whose key starts with `prefix`
    pub fn query(&self, partition: &str, prefix: &str) -> StoreResult<Vec<MemoryEntry>> {
        self.with_db(|db| {
            let scan = format!("{}{}", schema::keys::entry_partition_prefix(partition), prefix);
            let now = Utc::now();
            let entries: Vec<MemoryEntry> = scan_values(db, schema::CF_ENTRIES, &scan)?;
            Ok(entries
                .into_iter()
                .filter(|e| !e.is_expired_at(now))
                .collect())
        })
    }

    /// Live keys of a partition whose key starts with `prefix`
    pub fn list_keys(&self, partition: &str, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .query(partition, prefix)?
            .into_iter()
            .map(|e| e.key)
            .collect())
    }

    /// Delete every entry of a partition. Returns the number removed.
    pub fn clear_partition(&self, partition: &str) -> StoreResult<usize> {
        self.with_db(|db| {
            let _writer = self.writer()?;
            let rows = scan_prefix(
                db,
                schema::CF_ENTRIES,
                &schema::keys::entry_partition_prefix(partition),
            )?;

            let entries = cf(db, schema::CF_ENTRIES)?;
            let expiry = cf(db, schema::CF_ENTRY_EXPIRY)?;
            let mut batch = WriteBatch::default();
            for (row_key, value) in &rows {
                let entry: MemoryEntry = decode(value)?;
                batch.delete_cf(&entries, row_key.as_bytes());
                if let Some(at) = entry.expires_at {
                    let index = schema::keys::entry_expiry(nanos(at), partition, &entry.key);
                    batch.delete_cf(&expiry, index.as_bytes());
                }
            }
            db.write(batch)?;

            info!(partition, count = rows.len(), "Cleared partition");
            Ok(rows.len())
        })
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Remove every expired row: entries (through the expiry index), events,
    /// metrics and hints. Returns the number of rows removed.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        self.with_db(|db| {
            let now = Utc::now();
            let now_nanos = nanos(now);
            let mut removed = 0;

            // Entries: walk the expiry index up to now.
            let due: Vec<String> = {
                let expiry = cf(db, schema::CF_ENTRY_EXPIRY)?;
                let mut due = Vec::new();
                for result in db.iterator_cf(&expiry, rocksdb::IteratorMode::Start) {
                    let (key, _) = result?;
                    let key_str = String::from_utf8(key.to_vec())
                        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                    match schema::keys::parse_entry_expiry(&key_str) {
                        Some((at, _, _)) if at > now_nanos => break,
                        _ => due.push(key_str),
                    }
                }
                due
            };

            for index_key in due {
                match schema::keys::parse_entry_expiry(&index_key) {
                    Some((_, partition, key)) => {
                        if self.purge_entry_if_expired(db, partition, key)? {
                            removed += 1;
                        } else {
                            // Stale index row left behind by an overwrite race.
                            let _writer = self.writer()?;
                            let entry_key = schema::keys::entry(partition, key);
                            let live: Option<MemoryEntry> =
                                get(db, schema::CF_ENTRIES, &entry_key)?;
                            let still_indexed = live
                                .and_then(|e| e.expires_at)
                                .map(|at| schema::keys::entry_expiry(nanos(at), partition, key))
                                .is_some_and(|k| k == index_key);
                            if !still_indexed {
                                delete(db, schema::CF_ENTRY_EXPIRY, &index_key)?;
                            }
                        }
                    }
                    None => delete(db, schema::CF_ENTRY_EXPIRY, &index_key)?,
                }
            }

            removed += self.purge_expired_rows::<StoredEvent>(db, schema::CF_EVENTS, "evt:", |e| {
                e.is_expired_at(now)
            })?;
            removed += self.purge_expired_rows::<PerformanceMetric>(
                db,
                schema::CF_METRICS,
                "metric:",
                |m| m.is_expired_at(now),
            )?;
            removed += self.purge_expired_rows::<BlackboardHint>(db, schema::CF_HINTS, "hint:", |h| {
                h.is_expired_at(now)
            })?;

            if removed > 0 {
                info!(removed, "Purged expired rows");
            }
            Ok(removed)
        })
    }

    fn purge_expired_rows<T: DeserializeOwned>(
        &self,
        db: &DB,
        cf_name: &str,
        prefix: &str,
        expired: impl Fn(&T) -> bool,
    ) -> StoreResult<usize> {
        let _writer = self.writer()?;
        let column = cf(db, cf_name)?;
        let mut batch = WriteBatch::default();
        let mut count = 0;
        for (key, value) in scan_prefix(db, cf_name, prefix)? {
            let row: T = decode(&value)?;
            if expired(&row) {
                batch.delete_cf(&column, key.as_bytes());
                count += 1;
            }
        }
        db.write(batch)?;
        Ok(count)
    }

    // =========================================================================
    // Pattern operations
    // =========================================================================

    /// Insert or replace a pattern. Returns its id.
    pub fn store_pattern(&self, pattern: &Pattern) -> StoreResult<String> {
        if !(0.0..=1.0).contains(&pattern.confidence) {
            return Err(StoreError::InvalidValue(format!(
                "pattern confidence {} outside [0, 1]",
                pattern.confidence
            )));
        }
        if let Some(agent_id) = &pattern.agent_id {
            validate_name("agent id", agent_id)?;
        }

        self.with_db(|db| {
            let _writer = self.writer()?;
            let previous: Option<Pattern> =
                get(db, schema::CF_PATTERNS, &schema::keys::pattern(&pattern.id))?;
            self.write_pattern(db, previous.as_ref(), pattern)?;
            Ok(pattern.id.clone())
        })
    }

    /// Write a pattern row and move its agent index row in one batch
    fn write_pattern(&self, db: &DB, previous: Option<&Pattern>, pattern: &Pattern) -> StoreResult<()> {
        let patterns = cf(db, schema::CF_PATTERNS)?;
        let index = cf(db, schema::CF_PATTERNS_BY_AGENT)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &patterns,
            schema::keys::pattern(&pattern.id).as_bytes(),
            encode(pattern)?,
        );
        if let Some(old) = previous {
            if let Some(agent_id) = &old.agent_id {
                let old_key = schema::keys::pattern_by_agent(agent_id, old.confidence, &old.id);
                batch.delete_cf(&index, old_key.as_bytes());
            }
        }
        if let Some(agent_id) = &pattern.agent_id {
            let key = schema::keys::pattern_by_agent(agent_id, pattern.confidence, &pattern.id);
            batch.put_cf(&index, key.as_bytes(), b"");
        }
        db.write(batch)?;
        Ok(())
    }

    /// Get a pattern by ID
    pub fn get_pattern(&self, pattern_id: &str) -> StoreResult<Option<Pattern>> {
        self.with_db(|db| get(db, schema::CF_PATTERNS, &schema::keys::pattern(pattern_id)))
    }

    /// Patterns owned by `agent_id` with confidence ≥ `min_confidence`,
    /// highest confidence first.
    ///
    /// Walks only the agent's slice of the confidence-ordered index and stops
    /// at the first row under the threshold.
    pub fn query_patterns_by_agent(
        &self,
        agent_id: &str,
        min_confidence: f64,
        limit: usize,
    ) -> StoreResult<Vec<Pattern>> {
        self.with_db(|db| {
            let index = cf(db, schema::CF_PATTERNS_BY_AGENT)?;
            let prefix = schema::keys::pattern_agent_prefix(agent_id);

            let mut patterns = Vec::new();
            for result in db.prefix_iterator_cf(&index, prefix.as_bytes()) {
                if patterns.len() >= limit {
                    break;
                }
                let (key, _) = result?;
                let key_str = String::from_utf8(key.to_vec())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                if !key_str.starts_with(&prefix) {
                    break;
                }
                let Some((confidence, pattern_id)) = schema::keys::parse_pattern_by_agent(&key_str)
                else {
                    continue;
                };
                if confidence < min_confidence {
                    break;
                }
                if let Some(pattern) =
                    get::<Pattern>(db, schema::CF_PATTERNS, &schema::keys::pattern(pattern_id))?
                {
                    patterns.push(pattern);
                }
            }
            Ok(patterns)
        })
    }

    /// Set a pattern's confidence (clamped to [0, 1]) and re-index it
    pub fn update_pattern_confidence(&self, pattern_id: &str, confidence: f64) -> StoreResult<Pattern> {
        if confidence.is_nan() {
            return Err(StoreError::InvalidValue("pattern confidence is NaN".to_string()));
        }
        let confidence = confidence.clamp(0.0, 1.0);
        self.modify_pattern(pattern_id, |p| p.confidence = confidence)
    }

    /// Bump a pattern's usage count by one
    pub fn increment_pattern_usage(&self, pattern_id: &str) -> StoreResult<Pattern> {
        self.modify_pattern(pattern_id, |p| p.usage_count += 1)
    }

    fn modify_pattern(&self, pattern_id: &str, change: impl FnOnce(&mut Pattern)) -> StoreResult<Pattern> {
        self.with_db(|db| {
            let _writer = self.writer()?;
            let previous: Pattern = get(db, schema::CF_PATTERNS, &schema::keys::pattern(pattern_id))?
                .ok_or_else(|| StoreError::NotFound(schema::keys::pattern(pattern_id)))?;
            let mut updated = previous.clone();
            change(&mut updated);
            updated.updated_at = Utc::now();
            self.write_pattern(db, Some(&previous), &updated)?;
            Ok(updated)
        })
    }

    /// Delete a pattern and its index row. Returns whether it existed.
    pub fn delete_pattern(&self, pattern_id: &str) -> StoreResult<bool> {
        self.with_db(|db| {
            let _writer = self.writer()?;
            let key = schema::keys::pattern(pattern_id);
            let Some(pattern) = get::<Pattern>(db, schema::CF_PATTERNS, &key)? else {
                return Ok(false);
            };
            let mut batch = WriteBatch::default();
            batch.delete_cf(&cf(db, schema::CF_PATTERNS)?, key.as_bytes());
            if let Some(agent_id) = &pattern.agent_id {
                let index = schema::keys::pattern_by_agent(agent_id, pattern.confidence, &pattern.id);
                batch.delete_cf(&cf(db, schema::CF_PATTERNS_BY_AGENT)?, index.as_bytes());
            }
            db.write(batch)?;
            Ok(true)
        })
    }

    // =========================================================================
    // Event operations (for replay)
    // =========================================================================

    /// Append an event row
    pub fn store_event(&self, event: &StoredEvent) -> StoreResult<()> {
        self.with_db(|db| {
            let key = schema::keys::event(nanos(event.timestamp), &event.id);
            put(db, schema::CF_EVENTS, &key, event)
        })
    }

    /// The most recent `limit` live events, optionally of one type, oldest first
    pub fn get_events(&self, event_type: Option<&str>, limit: usize) -> StoreResult<Vec<StoredEvent>> {
        self.with_db(|db| {
            let now = Utc::now();
            let events: Vec<StoredEvent> = scan_values(db, schema::CF_EVENTS, "evt:")?;
            let mut matching: Vec<StoredEvent> = events
                .into_iter()
                .rev()
                .filter(|e| !e.is_expired_at(now))
                .filter(|e| event_type.map_or(true, |t| e.event_type == t))
                .take(limit)
                .collect();
            matching.reverse();
            Ok(matching)
        })
    }

    /// Delete events older than `cutoff`
    pub fn prune_events_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.with_db(|db| {
            let _writer = self.writer()?;
            let events = cf(db, schema::CF_EVENTS)?;
            let end_key = schema::keys::event(nanos(cutoff), "");

            let mut batch = WriteBatch::default();
            let mut count = 0;
            for (key, _) in scan_prefix(db, schema::CF_EVENTS, "evt:")? {
                if key >= end_key {
                    break;
                }
                batch.delete_cf(&events, key.as_bytes());
                count += 1;
            }
            db.write(batch)?;
            Ok(count)
        })
    }

    // =========================================================================
    // Metric operations
    // =========================================================================

    /// Append a performance sample
    pub fn store_performance_metric(&self, metric: &PerformanceMetric) -> StoreResult<()> {
        self.with_db(|db| {
            let key = schema::keys::metric(nanos(metric.timestamp), &metric.id);
            put(db, schema::CF_METRICS, &key, metric)
        })
    }

    /// Live samples, optionally filtered by agent and metric name, oldest first
    pub fn get_metrics(
        &self,
        agent_id: Option<&str>,
        metric: Option<&str>,
    ) -> StoreResult<Vec<PerformanceMetric>> {
        self.with_db(|db| {
            let now = Utc::now();
            let metrics: Vec<PerformanceMetric> = scan_values(db, schema::CF_METRICS, "metric:")?;
            Ok(metrics
                .into_iter()
                .filter(|m| !m.is_expired_at(now))
                .filter(|m| agent_id.map_or(true, |a| m.agent_id.as_deref() == Some(a)))
                .filter(|m| metric.map_or(true, |n| m.metric == n))
                .collect())
        })
    }

    // =========================================================================
    // Agent registry operations
    // =========================================================================

    /// Insert or replace an agent row
    pub fn register_agent(&self, agent: &AgentRecord) -> StoreResult<()> {
        self.with_db(|db| put(db, schema::CF_AGENTS, &schema::keys::agent(&agent.id), agent))
    }

    /// Get an agent row by ID
    pub fn get_agent(&self, agent_id: &str) -> StoreResult<Option<AgentRecord>> {
        self.with_db(|db| get(db, schema::CF_AGENTS, &schema::keys::agent(agent_id)))
    }

    /// Update an agent's lifecycle status
    pub fn update_agent_status(&self, agent_id: &str, status: LifecycleState) -> StoreResult<()> {
        self.modify_agent(agent_id, |a| a.status = status)
    }

    /// Replace an agent's performance counters
    pub fn update_agent_performance(
        &self,
        agent_id: &str,
        performance: &AgentPerformance,
    ) -> StoreResult<()> {
        self.modify_agent(agent_id, |a| a.performance = performance.clone())
    }

    fn modify_agent(&self, agent_id: &str, change: impl FnOnce(&mut AgentRecord)) -> StoreResult<()> {
        self.with_db(|db| {
            let _writer = self.writer()?;
            let key = schema::keys::agent(agent_id);
            let mut agent: AgentRecord =
                get(db, schema::CF_AGENTS, &key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
            change(&mut agent);
            agent.updated_at = Utc::now();
            put(db, schema::CF_AGENTS, &key, &agent)
        })
    }

    /// List all agent rows
    pub fn list_agents(&self) -> StoreResult<Vec<AgentRecord>> {
        self.with_db(|db| scan_values(db, schema::CF_AGENTS, "agent:"))
    }

    /// Remove an agent row. Returns whether it existed.
    pub fn remove_agent(&self, agent_id: &str) -> StoreResult<bool> {
        self.with_db(|db| {
            let _writer = self.writer()?;
            let key = schema::keys::agent(agent_id);
            let existed = get::<AgentRecord>(db, schema::CF_AGENTS, &key)?.is_some();
            delete(db, schema::CF_AGENTS, &key)?;
            Ok(existed)
        })
    }

    // =========================================================================
    // Session operations
    // =========================================================================

    /// Store a session
    pub fn put_session(&self, session: &SessionRecord) -> StoreResult<()> {
        self.with_db(|db| put(db, schema::CF_SESSIONS, &schema::keys::session(&session.id), session))
    }

    /// Get a session by ID
    pub fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        self.with_db(|db| get(db, schema::CF_SESSIONS, &schema::keys::session(session_id)))
    }

    /// List all sessions, newest first
    pub fn list_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        self.with_db(|db| {
            let mut sessions: Vec<SessionRecord> = scan_values(db, schema::CF_SESSIONS, "sess:")?;
            sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(sessions)
        })
    }

    // =========================================================================
    // Consensus operations
    // =========================================================================

    /// Store a consensus proposal
    pub fn put_consensus(&self, state: &ConsensusState) -> StoreResult<()> {
        self.with_db(|db| {
            put(
                db,
                schema::CF_CONSENSUS,
                &schema::keys::proposal(&state.proposal_id),
                state,
            )
        })
    }

    /// Get a consensus proposal by ID
    pub fn get_consensus(&self, proposal_id: &str) -> StoreResult<Option<ConsensusState>> {
        self.with_db(|db| get(db, schema::CF_CONSENSUS, &schema::keys::proposal(proposal_id)))
    }

    /// List all consensus proposals
    pub fn list_consensus(&self) -> StoreResult<Vec<ConsensusState>> {
        self.with_db(|db| scan_values(db, schema::CF_CONSENSUS, "proposal:"))
    }

    // =========================================================================
    // Blackboard operations
    // =========================================================================

    /// Durably record a hint
    pub fn put_hint(&self, hint: &BlackboardHint) -> StoreResult<()> {
        self.with_db(|db| put(db, schema::CF_HINTS, &schema::keys::hint(&hint.id), hint))
    }

    /// Live hints in posting order
    pub fn list_hints(&self) -> StoreResult<Vec<BlackboardHint>> {
        self.with_db(|db| {
            let now = Utc::now();
            let hints: Vec<BlackboardHint> = scan_values(db, schema::CF_HINTS, "hint:")?;
            Ok(hints.into_iter().filter(|h| !h.is_expired_at(now)).collect())
        })
    }

    /// Remove expired hints only. Returns the number removed.
    pub fn purge_expired_hints(&self) -> StoreResult<usize> {
        self.with_db(|db| {
            let now = Utc::now();
            self.purge_expired_rows::<BlackboardHint>(db, schema::CF_HINTS, "hint:", |h| {
                h.is_expired_at(now)
            })
        })
    }

    /// Atomically remove and return a live hint. Two concurrent callers can
    /// never both receive the same hint.
    pub fn take_hint(&self, hint_id: &str) -> StoreResult<Option<BlackboardHint>> {
        self.with_db(|db| {
            let _writer = self.writer()?;
            let key = schema::keys::hint(hint_id);
            let Some(hint) = get::<BlackboardHint>(db, schema::CF_HINTS, &key)? else {
                return Ok(None);
            };
            delete(db, schema::CF_HINTS, &key)?;
            if hint.is_expired_at(Utc::now()) {
                return Ok(None);
            }
            Ok(Some(hint))
        })
    }

    // =========================================================================
    // Workflow checkpoint operations
    // =========================================================================

    /// Store a checkpoint
    pub fn put_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> StoreResult<()> {
        validate_name("workflow id", &checkpoint.workflow_id)?;
        self.with_db(|db| {
            let key = schema::keys::checkpoint(&checkpoint.workflow_id, nanos(checkpoint.created_at));
            put(db, schema::CF_CHECKPOINTS, &key, checkpoint)
        })
    }

    /// All checkpoints of a workflow, oldest first
    pub fn list_checkpoints(&self, workflow_id: &str) -> StoreResult<Vec<WorkflowCheckpoint>> {
        self.with_db(|db| {
            scan_values(
                db,
                schema::CF_CHECKPOINTS,
                &schema::keys::checkpoint_prefix(workflow_id),
            )
        })
    }

    /// The most recent checkpoint of a workflow
    pub fn latest_checkpoint(&self, workflow_id: &str) -> StoreResult<Option<WorkflowCheckpoint>> {
        Ok(self.list_checkpoints(workflow_id)?.pop())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Row counts per table (expired rows not yet swept included)
    pub fn stats(&self) -> StoreResult<StoreStats> {
        self.with_db(|db| {
            Ok(StoreStats {
                entries: count_rows(db, schema::CF_ENTRIES)?,
                patterns: count_rows(db, schema::CF_PATTERNS)?,
                events: count_rows(db, schema::CF_EVENTS)?,
                metrics: count_rows(db, schema::CF_METRICS)?,
                agents: count_rows(db, schema::CF_AGENTS)?,
                sessions: count_rows(db, schema::CF_SESSIONS)?,
                consensus: count_rows(db, schema::CF_CONSENSUS)?,
                hints: count_rows(db, schema::CF_HINTS)?,
                checkpoints: count_rows(db, schema::CF_CHECKPOINTS)?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_store_and_retrieve() {
        let (store, _dir) = test_store();

        store
            .store("k1", json!({ "v": 1 }), StoreOptions::partition("p1"))
            .unwrap();
        let value = store.retrieve("k1", RetrieveOptions::partition("p1")).unwrap();
        assert_eq!(value, Some(json!({ "v": 1 })));
    }

    #[test]
    fn test_partitions_are_independent() {
        let (store, _dir) = test_store();

        store.store("k", json!("a"), StoreOptions::partition("p1")).unwrap();
        store.store("k", json!("b"), StoreOptions::partition("p2")).unwrap();

        assert_eq!(
            store.retrieve("k", RetrieveOptions::partition("p1")).unwrap(),
            Some(json!("a"))
        );
        assert_eq!(
            store.retrieve("k", RetrieveOptions::partition("p2")).unwrap(),
            Some(json!("b"))
        );
        assert_eq!(store.retrieve("k", RetrieveOptions::default()).unwrap(), None);
    }

    #[test]
    fn test_last_write_wins_and_created_at_survives() {
        let (store, _dir) = test_store();

        let first = store.store("k", json!(1), StoreOptions::default()).unwrap();
        let second = store.store("k", json!(2), StoreOptions::default()).unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(
            store.retrieve("k", RetrieveOptions::default()).unwrap(),
            Some(json!(2))
        );
        assert_eq!(store.stats().unwrap().entries, 1);
    }

    #[test]
    fn test_expired_entry_is_never_returned() {
        let (store, _dir) = test_store();

        store
            .store("short", json!(1), StoreOptions::default().with_ttl(Duration::from_millis(20)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(store.retrieve("short", RetrieveOptions::default()).unwrap(), None);
        // The read purged the row and its index entry.
        let stats = store.stats().unwrap();
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_overwrite_without_ttl_clears_expiry() {
        let (store, _dir) = test_store();

        store
            .store("k", json!(1), StoreOptions::default().with_ttl(Duration::from_millis(20)))
            .unwrap();
        store.store("k", json!(2), StoreOptions::default()).unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(store.purge_expired().unwrap(), 0);
        assert_eq!(
            store.retrieve("k", RetrieveOptions::default()).unwrap(),
            Some(json!(2))
        );
    }

    #[test]
    fn test_sweep_purges_without_reads() {
        let (store, _dir) = test_store();

        for n in 0..3 {
            store
                .store(
                    &format!("gone-{n}"),
                    json!(n),
                    StoreOptions::partition("tmp").with_ttl(Duration::from_millis(10)),
                )
                .unwrap();
        }
        store.store("kept", json!(true), StoreOptions::partition("tmp")).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(store.purge_expired().unwrap(), 3);
        assert_eq!(store.list_keys("tmp", "").unwrap(), vec!["kept".to_string()]);
        assert_eq!(store.purge_expired().unwrap(), 0);
    }

    #[test]
    fn test_access_control() {
        let (store, _dir) = test_store();

        store
            .store(
                "secret",
                json!(1),
                StoreOptions::default().with_owner("alice").with_access(AccessLevel::Private),
            )
            .unwrap();
        store
            .store(
                "shared",
                json!(2),
                StoreOptions::default()
                    .with_owner("alice")
                    .with_access(AccessLevel::Team)
                    .with_team("red"),
            )
            .unwrap();

        let bob = Requester::agent("bob").in_team("red");
        let err = store
            .retrieve("secret", RetrieveOptions::default().as_requester(bob.clone()))
            .unwrap_err();
        assert!(matches!(err, StoreError::AccessDenied { .. }));

        assert_eq!(
            store
                .retrieve("shared", RetrieveOptions::default().as_requester(bob))
                .unwrap(),
            Some(json!(2))
        );
        assert_eq!(
            store
                .retrieve(
                    "secret",
                    RetrieveOptions::default().as_requester(Requester::agent("alice"))
                )
                .unwrap(),
            Some(json!(1))
        );
        // System reads skip the check.
        assert!(store.retrieve("secret", RetrieveOptions::default()).unwrap().is_some());
    }

    #[test]
    fn test_delete_and_clear_partition() {
        let (store, _dir) = test_store();

        store.store("a", json!(1), StoreOptions::partition("p")).unwrap();
        store
            .store("b", json!(2), StoreOptions::partition("p").with_ttl(Duration::from_secs(60)))
            .unwrap();
        store.store("a", json!(3), StoreOptions::partition("q")).unwrap();

        assert!(store.delete("a", "p").unwrap());
        assert!(!store.delete("a", "p").unwrap());
        assert_eq!(store.clear_partition("p").unwrap(), 1);
        assert_eq!(store.list_keys("q", "").unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_rejects_separator_in_names() {
        let (store, _dir) = test_store();
        let err = store
            .store("bad\u{1f}key", json!(1), StoreOptions::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue(_)));
    }

    #[test]
    fn test_lifecycle_lazy_init_and_close() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("lazy.db"));
        assert!(!store.is_initialized());

        store.store("k", json!(1), StoreOptions::default()).unwrap();
        assert!(store.is_initialized());

        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(
            store.retrieve("k", RetrieveOptions::default()),
            Err(StoreError::NotInitialized)
        ));

        store.initialize().unwrap();
        store.initialize().unwrap();
        assert_eq!(
            store.retrieve("k", RetrieveOptions::default()).unwrap(),
            Some(json!(1))
        );
    }

    #[test]
    fn test_pattern_queries_ordered_by_confidence() {
        let (store, _dir) = test_store();

        for (name, confidence) in [("low", 0.2), ("high", 0.9), ("mid", 0.6)] {
            store
                .store_pattern(&Pattern::new(name, confidence).for_agent("agent-1"))
                .unwrap();
        }
        store
            .store_pattern(&Pattern::new("other", 0.99).for_agent("agent-2"))
            .unwrap();
        store.store_pattern(&Pattern::new("unowned", 0.99)).unwrap();

        let all: Vec<String> = store
            .query_patterns_by_agent("agent-1", 0.0, 10)
            .unwrap()
            .into_iter()
            .map(|p| p.pattern)
            .collect();
        assert_eq!(all, vec!["high", "mid", "low"]);

        let confident = store.query_patterns_by_agent("agent-1", 0.5, 10).unwrap();
        assert_eq!(confident.len(), 2);

        let top = store.query_patterns_by_agent("agent-1", 0.0, 1).unwrap();
        assert_eq!(top[0].pattern, "high");
    }

    #[test]
    fn test_pattern_updates_reindex() {
        let (store, _dir) = test_store();

        let a = Pattern::new("a", 0.9).for_agent("agent");
        let b = Pattern::new("b", 0.5).for_agent("agent");
        store.store_pattern(&a).unwrap();
        store.store_pattern(&b).unwrap();

        let updated = store.update_pattern_confidence(&b.id, 0.95).unwrap();
        assert_eq!(updated.confidence, 0.95);
        store.increment_pattern_usage(&b.id).unwrap();
        store.increment_pattern_usage(&b.id).unwrap();

        let ordered = store.query_patterns_by_agent("agent", 0.0, 10).unwrap();
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].id, b.id);
        assert_eq!(ordered[0].usage_count, 2);

        assert_eq!(store.update_pattern_confidence(&a.id, 1.5).unwrap().confidence, 1.0);
        assert!(store.update_pattern_confidence(&a.id, f64::NAN).is_err());
        assert!(matches!(
            store.increment_pattern_usage("missing"),
            Err(StoreError::NotFound(_))
        ));

        assert!(store.delete_pattern(&a.id).unwrap());
        assert_eq!(store.query_patterns_by_agent("agent", 0.0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_events_and_metrics() {
        let (store, _dir) = test_store();

        store
            .store_event(&StoredEvent::new("a", json!({}), "test"))
            .unwrap();
        store
            .store_event(&StoredEvent::new("b", json!({}), "test"))
            .unwrap();
        store
            .store_event(
                &StoredEvent::new("a", json!({}), "test").with_ttl(Some(Duration::from_millis(5))),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(store.get_events(Some("a"), 10).unwrap().len(), 1);
        assert_eq!(store.get_events(None, 10).unwrap().len(), 2);

        store
            .store_performance_metric(&PerformanceMetric::new("latency", 12.0, "ms").for_agent("x"))
            .unwrap();
        store
            .store_performance_metric(&PerformanceMetric::new("latency", 7.0, "ms").for_agent("y"))
            .unwrap();
        assert_eq!(store.get_metrics(Some("x"), Some("latency")).unwrap().len(), 1);
        assert_eq!(store.get_metrics(None, None).unwrap().len(), 2);

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.prune_events_before(Utc::now()).unwrap(), 2);
    }

    #[test]
    fn test_agent_registry() {
        let (store, _dir) = test_store();

        let agent = AgentRecord::new("agent-1", "test-generator")
            .with_capabilities(vec!["unit-tests".into()]);
        store.register_agent(&agent).unwrap();
        store
            .update_agent_status("agent-1", LifecycleState::Idle)
            .unwrap();

        let mut perf = AgentPerformance::default();
        perf.record(true, Duration::from_millis(50));
        store.update_agent_performance("agent-1", &perf).unwrap();

        let loaded = store.get_agent("agent-1").unwrap().unwrap();
        assert_eq!(loaded.status, LifecycleState::Idle);
        assert_eq!(loaded.performance.tasks_completed, 1);
        assert_eq!(store.list_agents().unwrap().len(), 1);

        assert!(matches!(
            store.update_agent_status("nobody", LifecycleState::Idle),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.remove_agent("agent-1").unwrap());
        assert!(store.get_agent("agent-1").unwrap().is_none());
    }

    #[test]
    fn test_take_hint_is_single_delivery() {
        let (store, _dir) = test_store();

        let hint = BlackboardHint::new("build-done", json!({ "ok": true }), "builder", None);
        store.put_hint(&hint).unwrap();
        assert_eq!(store.list_hints().unwrap().len(), 1);

        assert_eq!(store.take_hint(&hint.id).unwrap(), Some(hint.clone()));
        assert_eq!(store.take_hint(&hint.id).unwrap(), None);
        assert!(store.list_hints().unwrap().is_empty());
    }

    #[test]
    fn test_sessions_and_checkpoints() {
        let (store, _dir) = test_store();

        let session = SessionRecord::new("fleet");
        store.put_session(&session).unwrap();
        assert_eq!(store.get_session(&session.id).unwrap(), Some(session));

        store
            .put_checkpoint(&WorkflowCheckpoint::new("wf", 1, json!({ "step": 1 })))
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
        store
            .put_checkpoint(&WorkflowCheckpoint::new("wf", 2, json!({ "step": 2 })))
            .unwrap();
        store
            .put_checkpoint(&WorkflowCheckpoint::new("other", 9, json!(null)))
            .unwrap();

        assert_eq!(store.list_checkpoints("wf").unwrap().len(), 2);
        assert_eq!(store.latest_checkpoint("wf").unwrap().unwrap().step, 2);
        assert!(store.latest_checkpoint("none").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_writers_same_key() {
        let (store, _dir) = test_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..20 {
                        store
                            .store(
                                "contended",
                                json!({ "writer": n, "i": i }),
                                StoreOptions::default().with_ttl(Duration::from_secs(60)),
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let value = store
            .retrieve("contended", RetrieveOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(value["i"], 19);
        // Overwrites leave a single row and no stale expiry.
        let stats = store.stats().unwrap();
        assert_eq!(stats.entries, 1);
    }
}
