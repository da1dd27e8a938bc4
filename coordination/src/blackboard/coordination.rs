//! Blackboard hint exchange
//!
//! Hints are written to the state store before they are announced, so the
//! store is the source of truth and the `blackboard:hint-posted` event is only
//! a wake-up. A waiter subscribes to the bus first and scans the store second,
//! which closes the window where a hint posted during setup would be missed.
//! Delivery goes through [`StateStore::take_hint`](crate::state::StateStore::take_hint),
//! so each hint is handed to at most one waiter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::events::{event_types, EventBusError, EventBusExt, EventFilter, SharedEventBus};
use crate::state::{BlackboardHint, SharedStateStore, StoreError};

/// Error type for blackboard operations
#[derive(Debug, thiserror::Error)]
pub enum BlackboardError {
    #[error("Invalid hint: {0}")]
    InvalidHint(String),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for blackboard operations
pub type BlackboardResult<T> = Result<T, BlackboardError>;

/// Which hints a waiter is interested in
#[derive(Clone)]
pub enum HintMatcher {
    /// Exact key
    Key(String),
    /// Key prefix
    Prefix(String),
    /// Arbitrary predicate over the whole hint
    Predicate(Arc<dyn Fn(&BlackboardHint) -> bool + Send + Sync>),
}

impl HintMatcher {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&BlackboardHint) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    pub fn matches(&self, hint: &BlackboardHint) -> bool {
        match self {
            Self::Key(key) => hint.key == *key,
            Self::Prefix(prefix) => hint.key.starts_with(prefix.as_str()),
            Self::Predicate(predicate) => predicate(hint),
        }
    }
}

impl fmt::Debug for HintMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Self::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Asynchronous hint exchange between agents.
pub struct BlackboardCoordination {
    bus: SharedEventBus,
    store: SharedStateStore,
    default_ttl: Option<Duration>,
}

impl BlackboardCoordination {
    pub fn new(bus: SharedEventBus, store: SharedStateStore) -> Self {
        Self {
            bus,
            store,
            default_ttl: None,
        }
    }

    /// TTL applied to hints posted without one. Zero means no expiry.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl).filter(|t| !t.is_zero());
        self
    }

    /// Durably record a hint, then announce it.
    ///
    /// Once the hint is stored the post has succeeded: a failed announcement
    /// is logged, and waiters still find the hint when they scan the store.
    pub fn post_hint(
        &self,
        key: &str,
        payload: serde_json::Value,
        posted_by: &str,
        ttl: Option<Duration>,
    ) -> BlackboardResult<BlackboardHint> {
        if key.is_empty() {
            return Err(BlackboardError::InvalidHint("key must not be empty".to_string()));
        }

        let hint = BlackboardHint::new(key, payload, posted_by, ttl.or(self.default_ttl));
        self.store.put_hint(&hint)?;

        match serde_json::to_value(&hint) {
            Ok(announcement) => {
                if let Err(e) = self.bus.emit(event_types::HINT_POSTED, announcement, posted_by) {
                    warn!(hint_id = %hint.id, key, error = %e, "Stored hint not announced");
                }
            }
            Err(e) => warn!(hint_id = %hint.id, key, error = %e, "Hint announcement not encoded"),
        }

        debug!(hint_id = %hint.id, key, posted_by, "Hint posted");
        Ok(hint)
    }

    /// Live hints matching `matcher`, oldest first, without consuming them
    pub fn read_hints(&self, matcher: &HintMatcher) -> BlackboardResult<Vec<BlackboardHint>> {
        Ok(self
            .store
            .list_hints()?
            .into_iter()
            .filter(|h| matcher.matches(h))
            .collect())
    }

    /// Wait for a hint matching `matcher` and consume it.
    ///
    /// Returns `None` if nothing matching was recorded before `timeout`.
    /// A hint recorded before the timer fires is always delivered.
    pub async fn await_hint(
        &self,
        matcher: &HintMatcher,
        timeout: Duration,
    ) -> BlackboardResult<Option<BlackboardHint>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self
            .bus
            .subscribe_filtered(EventFilter::new().types(&[event_types::HINT_POSTED]));

        if let Some(hint) = self.take_first_match(matcher)? {
            return Ok(Some(hint));
        }

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(event)) => {
                    let hint: BlackboardHint = match event.decode() {
                        Ok(hint) => hint,
                        Err(e) => {
                            warn!(event_id = %event.id, error = %e, "Malformed hint announcement");
                            continue;
                        }
                    };
                    if !matcher.matches(&hint) {
                        continue;
                    }
                    if let Some(hint) = self.store.take_hint(&hint.id)? {
                        self.consumed(&hint);
                        return Ok(Some(hint));
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!(skipped, "Hint waiter lagged; rescanning store");
                    if let Some(hint) = self.take_first_match(matcher)? {
                        return Ok(Some(hint));
                    }
                }
                Ok(Err(RecvError::Closed)) | Err(_) => {
                    // Anything recorded before the timer fired still counts.
                    let last_chance = self.take_first_match(matcher)?;
                    if last_chance.is_none() {
                        debug!(?matcher, ?timeout, "No matching hint before timeout");
                    }
                    return Ok(last_chance);
                }
            }
        }
    }

    /// Remove expired hints. Returns the number removed.
    pub fn purge_expired(&self) -> BlackboardResult<usize> {
        Ok(self.store.purge_expired_hints()?)
    }

    fn take_first_match(&self, matcher: &HintMatcher) -> BlackboardResult<Option<BlackboardHint>> {
        for candidate in self.read_hints(matcher)? {
            if let Some(hint) = self.store.take_hint(&candidate.id)? {
                self.consumed(&hint);
                return Ok(Some(hint));
            }
        }
        Ok(None)
    }

    fn consumed(&self, hint: &BlackboardHint) {
        debug!(hint_id = %hint.id, key = %hint.key, "Hint consumed");
        let payload = json!({ "hint_id": hint.id, "key": hint.key });
        if let Err(e) = self.bus.emit(event_types::HINT_CONSUMED, payload, "blackboard") {
            warn!(hint_id = %hint.id, error = %e, "Failed to announce hint consumption");
        }
    }
}
