//! Registry handle for one fleet agent

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::{AgentLifecycleManager, LifecycleState};
use crate::state::AgentPerformance;

pub type AgentId = String;

/// What to spawn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Opaque configuration handed to the agent implementation
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AgentSpec {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            capabilities: Vec::new(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone)]
struct RunningTask {
    task_id: String,
    started: Instant,
}

#[derive(Debug)]
struct AgentHealth {
    last_heartbeat: DateTime<Utc>,
    unhealthy: bool,
    task: Option<RunningTask>,
    performance: AgentPerformance,
}

/// A live agent. The lifecycle manager is the only way its state changes.
#[derive(Debug)]
pub struct FleetAgent {
    id: AgentId,
    spec: AgentSpec,
    spawned_at: DateTime<Utc>,
    lifecycle: Arc<AgentLifecycleManager>,
    health: Mutex<AgentHealth>,
}

/// Serializable view of an agent for snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub state: LifecycleState,
    pub last_heartbeat: DateTime<Utc>,
    pub unhealthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub performance: AgentPerformance,
    pub spawned_at: DateTime<Utc>,
}

impl FleetAgent {
    pub(crate) fn new(id: AgentId, spec: AgentSpec, lifecycle: Arc<AgentLifecycleManager>) -> Self {
        let now = Utc::now();
        Self {
            id,
            spec,
            spawned_at: now,
            lifecycle,
            health: Mutex::new(AgentHealth {
                last_heartbeat: now,
                unhealthy: false,
                task: None,
                performance: AgentPerformance::default(),
            }),
        }
    }

    fn health(&self) -> MutexGuard<'_, AgentHealth> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_type(&self) -> &str {
        &self.spec.agent_type
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    pub fn lifecycle(&self) -> &Arc<AgentLifecycleManager> {
        &self.lifecycle
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.current_state()
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.health().last_heartbeat
    }

    pub fn is_unhealthy(&self) -> bool {
        self.health().unhealthy
    }

    pub fn performance(&self) -> AgentPerformance {
        self.health().performance.clone()
    }

    pub fn current_task(&self) -> Option<String> {
        self.health().task.as_ref().map(|t| t.task_id.clone())
    }

    /// Record a heartbeat. Returns true if this clears an unhealthy flag.
    pub(crate) fn heartbeat(&self) -> bool {
        let mut health = self.health();
        health.last_heartbeat = Utc::now();
        std::mem::replace(&mut health.unhealthy, false)
    }

    /// How long the agent has been silent at `now`
    pub fn silent_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Flag the agent unhealthy. Returns true only on the first flag.
    pub(crate) fn mark_unhealthy(&self) -> bool {
        !std::mem::replace(&mut self.health().unhealthy, true)
    }

    pub(crate) fn start_task(&self, task_id: &str) {
        self.health().task = Some(RunningTask {
            task_id: task_id.to_string(),
            started: Instant::now(),
        });
    }

    /// Close the running task. Returns its id, duration and the updated
    /// counters, or `None` if no task was running.
    pub(crate) fn finish_task(&self, success: bool) -> Option<(String, Duration, AgentPerformance)> {
        let mut health = self.health();
        let task = health.task.take()?;
        let elapsed = task.started.elapsed();
        health.performance.record(success, elapsed);
        Some((task.task_id, elapsed, health.performance.clone()))
    }

    pub fn info(&self) -> AgentInfo {
        let state = self.state();
        let health = self.health();
        AgentInfo {
            id: self.id.clone(),
            agent_type: self.spec.agent_type.clone(),
            capabilities: self.spec.capabilities.clone(),
            state,
            last_heartbeat: health.last_heartbeat,
            unhealthy: health.unhealthy,
            current_task: health.task.as_ref().map(|t| t.task_id.clone()),
            performance: health.performance.clone(),
            spawned_at: self.spawned_at,
        }
    }
}
