//! Fleet manager: the top-level orchestrator
//!
//! Owns the agent registry (one [`AgentLifecycleManager`] per agent) and runs
//! three background loops while the fleet itself is `active`:
//!
//! - health: flags agents that stopped heartbeating
//! - autoscale: grows or shrinks the fleet from load and a cooldown
//! - gc: sweeps expired rows out of the state store
//!
//! Each loop iteration does its work and then waits for whichever comes
//! first: a change of the fleet's lifecycle state, a relevant bus event, or
//! its period. A loop exits as soon as the fleet leaves `active`.
//!
//! Agent lifecycle managers report through a callback that captures only the
//! bus and the store, never the manager.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::agent::{AgentId, AgentInfo, AgentSpec, FleetAgent};
use super::scaling::{AutoScaler, LoadSignal, ScaleDecision};
use crate::config::{FleetConfig, HealthPolicy};
use crate::events::{
    event_types, EventBus, EventBusError, EventBusExt, EventFilter, FilteredReceiver,
    SharedEventBus,
};
use crate::lifecycle::{
    AgentLifecycleManager, LifecycleError, LifecycleState, StatusCallback, StatusChange,
};
use crate::state::{
    AgentPerformance, AgentRecord, PerformanceMetric, SessionRecord, SharedStateStore, StateStore,
    StoreError, StoredEvent,
};

/// Shortest period any loop sleeps for
const MIN_LOOP_PERIOD: Duration = Duration::from_millis(10);

/// Error type for fleet operations
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Fleet is not running (state: {0})")]
    NotRunning(LifecycleState),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Fleet is at capacity ({max} agents)")]
    CapacityExceeded { max: usize },

    #[error("Agent {0} has no task in progress")]
    NoTaskInProgress(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

/// Result type for fleet operations
pub type FleetResult<T> = Result<T, FleetError>;

/// Point-in-time view of the fleet, derived from the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub fleet_state: LifecycleState,
    /// Live agents (not terminating or terminated)
    pub total_agents: usize,
    pub by_state: BTreeMap<String, usize>,
    pub unhealthy: usize,
    pub load: LoadSignal,
    /// What the scaler would do right now
    pub pending_decision: ScaleDecision,
    pub agents: Vec<AgentInfo>,
    pub taken_at: DateTime<Utc>,
}

/// Status callback that broadcasts a transition and persists it
fn status_callback(
    bus: SharedEventBus,
    store: SharedStateStore,
    event_ttl: Option<Duration>,
    persist_status: bool,
) -> StatusCallback {
    Arc::new(move |change: &StatusChange| {
        let payload = json!({
            "agent_id": change.agent_id,
            "from": change.from,
            "to": change.to,
            "reason": change.reason,
        });

        if let Err(e) = bus.emit(event_types::AGENT_STATUS_CHANGED, payload.clone(), &change.agent_id) {
            debug!(agent_id = %change.agent_id, error = %e, "Status change not broadcast");
        }

        let stored = StoredEvent::new(event_types::AGENT_STATUS_CHANGED, payload, &change.agent_id)
            .with_ttl(event_ttl);
        if let Err(e) = store.store_event(&stored) {
            warn!(agent_id = %change.agent_id, error = %e, "Failed to persist status change");
        }
        if persist_status {
            if let Err(e) = store.update_agent_status(&change.agent_id, change.to) {
                warn!(agent_id = %change.agent_id, error = %e, "Failed to update agent row");
            }
        }
    })
}

struct FleetInner {
    id: String,
    config: FleetConfig,
    bus: SharedEventBus,
    store: SharedStateStore,
    lifecycle: Arc<AgentLifecycleManager>,
    agents: RwLock<HashMap<AgentId, Arc<FleetAgent>>>,
    scaler: Mutex<AutoScaler>,
    queued: AtomicUsize,
    session: Mutex<Option<SessionRecord>>,
}

impl FleetInner {
    fn agents(&self) -> RwLockReadGuard<'_, HashMap<AgentId, Arc<FleetAgent>>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn agents_mut(&self) -> RwLockWriteGuard<'_, HashMap<AgentId, Arc<FleetAgent>>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }

    fn agent(&self, agent_id: &str) -> FleetResult<Arc<FleetAgent>> {
        self.agents()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| FleetError::AgentNotFound(agent_id.to_string()))
    }

    fn agent_list(&self) -> Vec<Arc<FleetAgent>> {
        let mut agents: Vec<Arc<FleetAgent>> = self.agents().values().cloned().collect();
        agents.sort_by(|a, b| a.id().cmp(b.id()));
        agents
    }

    fn announce(&self, event_type: &str, payload: serde_json::Value) {
        if let Err(e) = self.bus.emit(event_type, payload, &self.id) {
            debug!(event_type, error = %e, "Fleet event dropped");
        }
    }

    fn ensure_running(&self) -> FleetResult<()> {
        match self.lifecycle.current_state() {
            LifecycleState::Idle | LifecycleState::Active => Ok(()),
            other => Err(FleetError::NotRunning(other)),
        }
    }

    fn load_signal(&self) -> LoadSignal {
        let mut load = LoadSignal {
            queued: self.queued.load(Ordering::Relaxed),
            ..LoadSignal::default()
        };
        for agent in self.agents().values() {
            match agent.state() {
                LifecycleState::Terminating | LifecycleState::Terminated => {}
                LifecycleState::Busy => {
                    load.agents += 1;
                    load.busy += 1;
                }
                _ => load.agents += 1,
            }
        }
        load
    }

    fn spawn(&self, spec: AgentSpec) -> FleetResult<AgentId> {
        self.ensure_running()?;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", spec.agent_type, &suffix[..8]);
        let record = AgentRecord::new(&id, &spec.agent_type)
            .with_capabilities(spec.capabilities.clone());
        let lifecycle = Arc::new(AgentLifecycleManager::with_callback(
            &id,
            status_callback(
                self.bus.clone(),
                self.store.clone(),
                self.config.event_ttl(),
                true,
            ),
        ));
        let agent = Arc::new(FleetAgent::new(id.clone(), spec, lifecycle));

        {
            let mut agents = self.agents_mut();
            let max = self.config.autoscale.max_agents;
            let live = agents.values().filter(|a| !a.state().is_terminal()).count();
            if live >= max {
                return Err(FleetError::CapacityExceeded { max });
            }
            agents.insert(id.clone(), agent.clone());
        }

        if let Err(e) = self.store.register_agent(&record) {
            self.agents_mut().remove(&id);
            return Err(e.into());
        }
        agent
            .lifecycle()
            .transition_to(LifecycleState::Idle, Some("spawned"))?;

        info!(agent_id = %id, agent_type = %agent.agent_type(), "Agent spawned");
        self.announce(
            event_types::AGENT_SPAWNED,
            json!({
                "agent_id": id,
                "agent_type": agent.agent_type(),
                "capabilities": agent.spec().capabilities,
            }),
        );
        Ok(id)
    }

    fn despawn(&self, agent_id: &str, reason: &str) -> FleetResult<()> {
        let agent = self
            .agents_mut()
            .remove(agent_id)
            .ok_or_else(|| FleetError::AgentNotFound(agent_id.to_string()))?;

        agent.lifecycle().terminate(reason)?;
        self.store.remove_agent(agent_id)?;

        info!(agent_id, reason, "Agent despawned");
        self.announce(
            event_types::AGENT_TERMINATED,
            json!({ "agent_id": agent_id, "reason": reason }),
        );
        Ok(())
    }

    fn check_health(&self) {
        let now = Utc::now();
        let timeout = self.config.heartbeat_timeout();

        for agent in self.agent_list() {
            if matches!(
                agent.state(),
                LifecycleState::Terminating | LifecycleState::Terminated
            ) {
                continue;
            }
            let silent = agent.silent_for(now);
            if silent <= timeout || !agent.mark_unhealthy() {
                continue;
            }

            let silent_ms = silent.as_millis() as u64;
            warn!(agent_id = %agent.id(), silent_ms, "Agent missed heartbeats");
            self.announce(
                event_types::AGENT_UNHEALTHY,
                json!({
                    "agent_id": agent.id(),
                    "silent_ms": silent_ms,
                    "policy": self.config.health_policy,
                }),
            );

            if self.config.health_policy == HealthPolicy::Terminate {
                if let Err(e) = agent.lifecycle().fail("heartbeat timeout") {
                    debug!(agent_id = %agent.id(), error = %e, "Could not move agent to error");
                }
                if let Err(e) = self.despawn(agent.id(), "heartbeat timeout") {
                    warn!(agent_id = %agent.id(), error = %e, "Failed to despawn unhealthy agent");
                }
            }
        }
    }

    fn autoscale_tick(&self) {
        if !self.config.autoscale.enabled {
            return;
        }

        let load = self.load_signal();
        let now = Instant::now();
        let decision = {
            let mut scaler = self.scaler.lock().unwrap_or_else(|e| e.into_inner());
            let decision = scaler.decide(&load, now);
            if decision.is_action() {
                scaler.record(now);
            }
            decision
        };

        match decision {
            ScaleDecision::NoAction => return,
            ScaleDecision::Grow(count) => {
                let agent_type = self.config.autoscale.default_agent_type.clone();
                for _ in 0..count {
                    if let Err(e) = self.spawn(AgentSpec::new(agent_type.clone())) {
                        warn!(error = %e, "Scale-up spawn failed");
                        break;
                    }
                }
            }
            ScaleDecision::Shrink(count) => {
                let mut idle: Vec<Arc<FleetAgent>> = self
                    .agent_list()
                    .into_iter()
                    .filter(|a| a.state() == LifecycleState::Idle && a.current_task().is_none())
                    .collect();
                idle.sort_by_key(|a| std::cmp::Reverse(a.info().spawned_at));
                for agent in idle.into_iter().take(count) {
                    if let Err(e) = self.despawn(agent.id(), "scaled down") {
                        warn!(agent_id = %agent.id(), error = %e, "Scale-down despawn failed");
                    }
                }
            }
        }

        let after = self.load_signal().agents;
        info!(
            ?decision,
            before = load.agents,
            after,
            utilization = load.utilization(),
            "Applied scaling decision"
        );
        self.announce(
            event_types::FLEET_SCALED,
            json!({ "decision": decision, "before": load.agents, "after": after }),
        );
    }

    fn gc_tick(&self) {
        match self.store.purge_expired() {
            Ok(removed) => debug!(removed, "Garbage collection pass finished"),
            Err(e) => warn!(error = %e, "Garbage collection pass failed"),
        }
    }

    fn set_session_phase(&self, phase: &str) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let record = session.get_or_insert_with(|| SessionRecord::new("fleet"));
        record.phase = phase.to_string();
        record.updated_at = Utc::now();
        if let Err(e) = self.store.put_session(record) {
            warn!(session_id = %record.id, error = %e, "Failed to persist session");
        }
    }
}

async fn next_event(events: &mut Option<FilteredReceiver>) {
    match events {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Run `work` repeatedly while the fleet is active
fn spawn_loop<F>(
    inner: Arc<FleetInner>,
    name: &'static str,
    period: Duration,
    wake_on: &[&str],
    mut work: F,
) -> JoinHandle<()>
where
    F: FnMut(&FleetInner) + Send + 'static,
{
    let mut fleet_state = inner.lifecycle.subscribe();
    let mut events = (!wake_on.is_empty())
        .then(|| inner.bus.subscribe_filtered(EventFilter::new().types(wake_on)));
    let period = period.max(MIN_LOOP_PERIOD);

    tokio::spawn(async move {
        debug!(loop_name = name, ?period, "Fleet loop started");
        loop {
            if *fleet_state.borrow_and_update() != LifecycleState::Active {
                break;
            }
            work(inner.as_ref());

            tokio::select! {
                changed = fleet_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = next_event(&mut events) => {}
                _ = tokio::time::sleep(period) => {}
            }
        }
        debug!(loop_name = name, "Fleet loop stopped");
    })
}

/// Top-level orchestrator for a fleet of agents.
pub struct FleetManager {
    inner: Arc<FleetInner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl FleetManager {
    /// Build a fleet over an existing bus and store.
    pub fn new(config: FleetConfig, bus: SharedEventBus, store: SharedStateStore) -> Self {
        let id = "fleet".to_string();
        let lifecycle = Arc::new(AgentLifecycleManager::with_callback(
            &id,
            status_callback(bus.clone(), store.clone(), config.event_ttl(), false),
        ));
        let scaler = AutoScaler::new(config.autoscale.clone());

        Self {
            inner: Arc::new(FleetInner {
                id,
                config,
                bus,
                store,
                lifecycle,
                agents: RwLock::new(HashMap::new()),
                scaler: Mutex::new(scaler),
                queued: AtomicUsize::new(0),
                session: Mutex::new(None),
            }),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Build a fleet with its own bus and store, as described by `config`.
    pub fn from_config(config: FleetConfig) -> Self {
        let bus = EventBus::with_retention(config.event_retention).shared();
        let store = StateStore::new(config.state_path.clone()).shared();
        Self::new(config, bus, store)
    }

    /// Open the bus and store, spawn the initial agents, go `active` and
    /// start the background loops. Must run inside a Tokio runtime.
    /// Calling it on an active fleet is a no-op.
    pub fn initialize(&self) -> FleetResult<()> {
        match self.inner.lifecycle.current_state() {
            LifecycleState::Active => return Ok(()),
            LifecycleState::Initializing => {}
            other => return Err(FleetError::NotRunning(other)),
        }

        self.inner.bus.initialize();
        self.inner.store.initialize()?;
        self.inner
            .lifecycle
            .transition_to(LifecycleState::Idle, Some("initialized"))?;
        self.inner.set_session_phase("starting");

        let mut spawned = Vec::new();
        let started = self.spawn_initial(&mut spawned).and_then(|()| {
            self.inner
                .lifecycle
                .transition_to(LifecycleState::Active, Some("started"))?;
            Ok(())
        });
        if let Err(e) = started {
            self.roll_back_start(&spawned, &e);
            return Err(e);
        }
        self.inner.set_session_phase("active");
        self.start_loops();

        info!(
            fleet_id = %self.inner.id,
            agents = self.agent_count(),
            "Fleet started"
        );
        Ok(())
    }

    fn spawn_initial(&self, spawned: &mut Vec<AgentId>) -> FleetResult<()> {
        for group in &self.inner.config.initial_agents {
            for _ in 0..group.count {
                spawned.push(self.inner.spawn(
                    AgentSpec::new(group.agent_type.clone())
                        .with_capabilities(group.capabilities.clone()),
                )?);
            }
        }
        Ok(())
    }

    /// Undo a partial start so `initialize` can be retried.
    fn roll_back_start(&self, spawned: &[AgentId], error: &FleetError) {
        warn!(
            fleet_id = %self.inner.id,
            spawned = spawned.len(),
            error = %error,
            "Fleet start failed, rolling back"
        );
        for id in spawned {
            if let Err(e) = self.inner.despawn(id, "fleet start failed") {
                warn!(agent_id = %id, error = %e, "Failed to despawn agent during rollback");
            }
        }

        let lifecycle = &self.inner.lifecycle;
        let reset = lifecycle
            .fail(&error.to_string())
            .and_then(|_| lifecycle.transition_to(LifecycleState::Initializing, Some("retry")));
        if let Err(e) = reset {
            warn!(fleet_id = %self.inner.id, error = %e, "Failed to reset fleet lifecycle");
        }
        self.inner.set_session_phase("failed");
    }

    fn start_loops(&self) {
        let inner = &self.inner;
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        loops.push(spawn_loop(
            inner.clone(),
            "health",
            inner.config.heartbeat_interval(),
            &[],
            |fleet| fleet.check_health(),
        ));
        loops.push(spawn_loop(
            inner.clone(),
            "autoscale",
            inner.config.autoscale.cooldown(),
            &[event_types::AGENT_STATUS_CHANGED, event_types::TASK_COMPLETED],
            |fleet| fleet.autoscale_tick(),
        ));
        loops.push(spawn_loop(
            inner.clone(),
            "gc",
            inner.config.gc_interval(),
            &[],
            |fleet| fleet.gc_tick(),
        ));
    }

    /// Stop the loops, terminate every agent, then close the bus and store.
    /// Calling it on a terminated fleet is a no-op.
    pub async fn shutdown(&self) -> FleetResult<()> {
        let state = self.inner.lifecycle.current_state();
        if state.is_terminal() {
            return Ok(());
        }
        if state != LifecycleState::Terminating {
            self.inner
                .lifecycle
                .transition_to(LifecycleState::Terminating, Some("shutdown"))?;
        }

        let handles = std::mem::take(&mut *self.loops.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Fleet loop ended abnormally");
            }
        }

        let agents: Vec<Arc<FleetAgent>> =
            self.inner.agents_mut().drain().map(|(_, agent)| agent).collect();
        for agent in &agents {
            match agent.lifecycle().terminate("fleet shutdown") {
                Ok(()) => self.inner.announce(
                    event_types::AGENT_TERMINATED,
                    json!({ "agent_id": agent.id(), "reason": "fleet shutdown" }),
                ),
                Err(e) => warn!(agent_id = %agent.id(), error = %e, "Agent did not terminate"),
            }
        }

        self.inner.set_session_phase("stopped");
        self.inner
            .lifecycle
            .transition_to(LifecycleState::Terminated, Some("shutdown"))?;
        self.inner.bus.close();
        self.inner.store.close()?;

        info!(fleet_id = %self.inner.id, agents = agents.len(), "Fleet stopped");
        Ok(())
    }

    /// Spawn an agent and bring it to `idle`. Returns its id.
    pub fn spawn_agent(&self, spec: AgentSpec) -> FleetResult<AgentId> {
        self.inner.spawn(spec)
    }

    /// Terminate an agent and drop it from the registry.
    pub fn despawn_agent(&self, agent_id: &str, reason: &str) -> FleetResult<()> {
        self.inner.despawn(agent_id, reason)
    }

    /// Record that an agent is alive. Clears its unhealthy flag.
    pub fn record_heartbeat(&self, agent_id: &str) -> FleetResult<()> {
        let agent = self.inner.agent(agent_id)?;
        if agent.heartbeat() {
            info!(agent_id, "Agent recovered");
        }
        Ok(())
    }

    /// Hand a task to a ready agent, moving it to `busy`.
    pub fn begin_task(&self, agent_id: &str, task_id: &str) -> FleetResult<()> {
        let agent = self.inner.agent(agent_id)?;
        agent
            .lifecycle()
            .transition_to(LifecycleState::Busy, Some(task_id))?;
        agent.start_task(task_id);
        agent.heartbeat();
        debug!(agent_id, task_id, "Task started");
        Ok(())
    }

    /// Close the agent's running task and return it to `idle`. Returns the
    /// updated performance counters.
    pub fn complete_task(&self, agent_id: &str, success: bool) -> FleetResult<AgentPerformance> {
        let agent = self.inner.agent(agent_id)?;
        let (task_id, elapsed, performance) = agent
            .finish_task(success)
            .ok_or_else(|| FleetError::NoTaskInProgress(agent_id.to_string()))?;
        agent.heartbeat();

        let reason = if success { "task completed" } else { "task failed" };
        agent
            .lifecycle()
            .transition_to(LifecycleState::Idle, Some(reason))?;

        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        self.inner
            .store
            .update_agent_performance(agent_id, &performance)?;
        self.inner.store.store_performance_metric(
            &PerformanceMetric::new("task_duration", duration_ms, "ms")
                .for_agent(agent_id)
                .with_ttl(self.inner.config.event_ttl()),
        )?;

        self.inner.announce(
            event_types::TASK_COMPLETED,
            json!({
                "agent_id": agent_id,
                "task_id": task_id,
                "success": success,
                "duration_ms": duration_ms,
            }),
        );
        Ok(performance)
    }

    /// Report work waiting for an agent; feeds the scaler
    pub fn set_queue_depth(&self, queued: usize) {
        self.inner.queued.store(queued, Ordering::Relaxed);
    }

    /// Wait for an agent to reach `target`
    pub async fn wait_for_agent(
        &self,
        agent_id: &str,
        target: LifecycleState,
        timeout: Duration,
    ) -> FleetResult<LifecycleState> {
        let agent = self.inner.agent(agent_id)?;
        Ok(agent.lifecycle().wait_for_status(target, timeout).await?)
    }

    /// Recompute the fleet view from the registry
    pub fn snapshot(&self) -> FleetSnapshot {
        let agents: Vec<AgentInfo> = self.inner.agent_list().iter().map(|a| a.info()).collect();

        let mut by_state = BTreeMap::new();
        for agent in &agents {
            *by_state.entry(agent.state.as_str().to_string()).or_insert(0) += 1;
        }

        let load = self.inner.load_signal();
        let pending_decision = if self.inner.config.autoscale.enabled {
            self.inner
                .scaler
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .decide(&load, Instant::now())
        } else {
            ScaleDecision::NoAction
        };

        FleetSnapshot {
            fleet_state: self.inner.lifecycle.current_state(),
            total_agents: load.agents,
            by_state,
            unhealthy: agents.iter().filter(|a| a.unhealthy).count(),
            load,
            pending_decision,
            agents,
            taken_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.current_state()
    }

    /// The fleet's own lifecycle
    pub fn lifecycle(&self) -> &Arc<AgentLifecycleManager> {
        &self.inner.lifecycle
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.inner.bus
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.inner.store
    }

    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<FleetAgent>> {
        self.inner.agent(agent_id).ok()
    }

    /// Ids of registered agents, sorted
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.inner
            .agent_list()
            .iter()
            .map(|a| a.id().to_string())
            .collect()
    }

    /// Live agents (not terminating or terminated)
    pub fn agent_count(&self) -> usize {
        self.inner.load_signal().agents
    }
}

impl Drop for FleetManager {
    fn drop(&mut self) {
        let loops = self.loops.get_mut().unwrap_or_else(|e| e.into_inner());
        for handle in loops.drain(..) {
            handle.abort();
        }
    }
}
