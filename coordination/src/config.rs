//! Fleet configuration
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file, `FLEET_*` environment variables. The `fleetd` binary applies its
//! command-line flags on top.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// What the health monitor does with an agent that stopped heartbeating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthPolicy {
    /// Flag it and emit `agent:unhealthy`
    #[default]
    Report,
    /// Flag it, move it to `error` and despawn it
    Terminate,
}

impl FromStr for HealthPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "terminate" => Ok(Self::Terminate),
            other => bail!("unknown health policy '{}'", other),
        }
    }
}

/// Auto-scaling limits and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub min_agents: usize,
    /// Also the hard cap for explicit spawns
    pub max_agents: usize,
    /// Utilization at or above which the fleet grows
    pub scale_up_threshold: f64,
    /// Utilization at or below which the fleet shrinks
    pub scale_down_threshold: f64,
    pub cooldown_ms: u64,
    /// Agents added or removed per decision
    pub step: usize,
    /// Type given to agents the scaler spawns
    pub default_agent_type: String,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_agents: 1,
            max_agents: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            cooldown_ms: 30_000,
            step: 1,
            default_agent_type: "worker".to_string(),
        }
    }
}

impl AutoscaleConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// A group of agents spawned when the fleet starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentGroup {
    pub agent_type: String,
    #[serde(default = "default_group_count")]
    pub count: usize,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_group_count() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub default_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackboardConfig {
    /// TTL for hints posted without one; 0 keeps them until consumed
    pub default_hint_ttl_ms: u64,
}

/// Top-level configuration of a fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// RocksDB directory
    pub state_path: PathBuf,
    /// Events kept by the bus for `get_recent`
    pub event_retention: usize,
    pub heartbeat_interval_ms: u64,
    /// Silence after which an agent is flagged unhealthy
    pub heartbeat_timeout_ms: u64,
    pub health_policy: HealthPolicy,
    pub gc_interval_ms: u64,
    /// TTL of persisted lifecycle events and metrics; 0 keeps them
    pub event_ttl_ms: u64,
    pub autoscale: AutoscaleConfig,
    pub initial_agents: Vec<AgentGroup>,
    pub consensus: ConsensusConfig,
    pub blackboard: BlackboardConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("./fleet-state"),
            event_retention: crate::events::DEFAULT_RETENTION,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            health_policy: HealthPolicy::Report,
            gc_interval_ms: 60_000,
            event_ttl_ms: 86_400_000,
            autoscale: AutoscaleConfig::default(),
            initial_agents: Vec::new(),
            consensus: ConsensusConfig::default(),
            blackboard: BlackboardConfig::default(),
        }
    }
}

fn parse_env<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    target: &mut T,
) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(var) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", var, e))?;
    }
    Ok(())
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl FleetConfig {
    /// Defaults, then `path` if given, then the environment. Validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Override fields from `FLEET_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Override fields from an arbitrary variable lookup
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("FLEET_STATE_PATH") {
            self.state_path = PathBuf::from(path);
        }
        parse_env(&lookup, "FLEET_EVENT_RETENTION", &mut self.event_retention)?;
        parse_env(&lookup, "FLEET_HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval_ms)?;
        parse_env(&lookup, "FLEET_HEARTBEAT_TIMEOUT_MS", &mut self.heartbeat_timeout_ms)?;
        parse_env(&lookup, "FLEET_HEALTH_POLICY", &mut self.health_policy)?;
        parse_env(&lookup, "FLEET_GC_INTERVAL_MS", &mut self.gc_interval_ms)?;
        parse_env(&lookup, "FLEET_EVENT_TTL_MS", &mut self.event_ttl_ms)?;

        if let Some(raw) = lookup("FLEET_AUTOSCALE_ENABLED") {
            self.autoscale.enabled = parse_bool(&raw);
        }
        parse_env(&lookup, "FLEET_MIN_AGENTS", &mut self.autoscale.min_agents)?;
        parse_env(&lookup, "FLEET_MAX_AGENTS", &mut self.autoscale.max_agents)?;
        parse_env(&lookup, "FLEET_SCALE_UP_THRESHOLD", &mut self.autoscale.scale_up_threshold)?;
        parse_env(
            &lookup,
            "FLEET_SCALE_DOWN_THRESHOLD",
            &mut self.autoscale.scale_down_threshold,
        )?;
        parse_env(&lookup, "FLEET_SCALE_COOLDOWN_MS", &mut self.autoscale.cooldown_ms)?;
        if let Some(agent_type) = lookup("FLEET_DEFAULT_AGENT_TYPE") {
            self.autoscale.default_agent_type = agent_type;
        }

        parse_env(
            &lookup,
            "FLEET_CONSENSUS_TIMEOUT_MS",
            &mut self.consensus.default_timeout_ms,
        )?;
        parse_env(&lookup, "FLEET_HINT_TTL_MS", &mut self.blackboard.default_hint_ttl_ms)?;
        Ok(())
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let scale = &self.autoscale;
        if scale.min_agents > scale.max_agents {
            bail!(
                "autoscale.min_agents ({}) exceeds autoscale.max_agents ({})",
                scale.min_agents,
                scale.max_agents
            );
        }
        for (name, value) in [
            ("scale_up_threshold", scale.scale_up_threshold),
            ("scale_down_threshold", scale.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("autoscale.{} must be within [0, 1], got {}", name, value);
            }
        }
        if scale.scale_down_threshold >= scale.scale_up_threshold {
            bail!("autoscale.scale_down_threshold must be below scale_up_threshold");
        }
        if scale.step == 0 {
            bail!("autoscale.step must be at least 1");
        }
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("gc_interval_ms", self.gc_interval_ms),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.event_retention == 0 {
            bail!("event_retention must be greater than zero");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    /// `None` when persisted events are kept forever
    pub fn event_ttl(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.event_ttl_ms)).filter(|d| !d.is_zero())
    }

    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus.default_timeout_ms)
    }

    /// `None` when hints are kept until consumed
    pub fn hint_ttl(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.blackboard.default_hint_ttl_ms)).filter(|d| !d.is_zero())
    }
}
