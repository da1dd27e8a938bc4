//! Auto-scaling decisions
//!
//! Pure decision logic: given the current load and the time of the last
//! applied decision, say whether to grow, shrink or hold. Applying the
//! decision is the fleet manager's job.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::AutoscaleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "count", rename_all = "snake_case")]
pub enum ScaleDecision {
    Grow(usize),
    Shrink(usize),
    NoAction,
}

impl ScaleDecision {
    pub fn is_action(self) -> bool {
        self != Self::NoAction
    }
}

/// Load signals the scaler looks at
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSignal {
    /// Live agents (not terminating or terminated)
    pub agents: usize,
    /// Agents executing a task
    pub busy: usize,
    /// Work waiting for an agent, as reported by the caller
    pub queued: usize,
}

impl LoadSignal {
    /// Demand over capacity. An empty fleet with queued work is fully loaded.
    pub fn utilization(&self) -> f64 {
        let demand = (self.busy + self.queued) as f64;
        if self.agents == 0 {
            return if demand > 0.0 { 1.0 } else { 0.0 };
        }
        (demand / self.agents as f64).min(1.0)
    }
}

#[derive(Debug, Clone)]
pub struct AutoScaler {
    config: AutoscaleConfig,
    last_action: Option<Instant>,
}

impl AutoScaler {
    pub fn new(config: AutoscaleConfig) -> Self {
        Self {
            config,
            last_action: None,
        }
    }

    pub fn config(&self) -> &AutoscaleConfig {
        &self.config
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.last_action
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.cooldown())
    }

    /// Decide without changing any state.
    ///
    /// Bounds are enforced regardless of cooldown; threshold-driven moves
    /// wait for the cooldown and never cross the bounds.
    pub fn decide(&self, load: &LoadSignal, now: Instant) -> ScaleDecision {
        let cfg = &self.config;

        if load.agents < cfg.min_agents {
            return ScaleDecision::Grow(cfg.min_agents - load.agents);
        }
        if load.agents > cfg.max_agents {
            return ScaleDecision::Shrink(load.agents - cfg.max_agents);
        }
        if self.in_cooldown(now) {
            return ScaleDecision::NoAction;
        }

        let utilization = load.utilization();
        if utilization >= cfg.scale_up_threshold && load.agents < cfg.max_agents {
            return ScaleDecision::Grow(cfg.step.min(cfg.max_agents - load.agents));
        }
        if utilization <= cfg.scale_down_threshold && load.agents > cfg.min_agents {
            return ScaleDecision::Shrink(cfg.step.min(load.agents - cfg.min_agents));
        }
        ScaleDecision::NoAction
    }

    /// Note that a decision was applied at `now`; starts the cooldown.
    pub fn record(&mut self, now: Instant) {
        self.last_action = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scaler() -> AutoScaler {
        AutoScaler::new(AutoscaleConfig {
            enabled: true,
            min_agents: 1,
            max_agents: 4,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            cooldown_ms: 1_000,
            step: 2,
            default_agent_type: "worker".into(),
        })
    }

    fn load(agents: usize, busy: usize, queued: usize) -> LoadSignal {
        LoadSignal {
            agents,
            busy,
            queued,
        }
    }

    #[test]
    fn test_bounds_ignore_cooldown() {
        let mut scaler = scaler();
        let now = Instant::now();
        scaler.record(now);

        assert_eq!(scaler.decide(&load(0, 0, 0), now), ScaleDecision::Grow(1));
        assert_eq!(scaler.decide(&load(6, 0, 0), now), ScaleDecision::Shrink(2));
    }

    #[test]
    fn test_thresholds() {
        let scaler = scaler();
        let now = Instant::now();

        assert_eq!(scaler.decide(&load(2, 2, 0), now), ScaleDecision::Grow(2));
        assert_eq!(scaler.decide(&load(3, 3, 5), now), ScaleDecision::Grow(1));
        assert_eq!(scaler.decide(&load(4, 0, 0), now), ScaleDecision::Shrink(2));
        assert_eq!(scaler.decide(&load(2, 1, 0), now), ScaleDecision::NoAction);
        assert_eq!(scaler.decide(&load(4, 4, 0), now), ScaleDecision::NoAction);
        assert_eq!(scaler.decide(&load(1, 0, 0), now), ScaleDecision::NoAction);
    }

    #[test]
    fn test_cooldown() {
        let mut scaler = scaler();
        let start = Instant::now();
        scaler.record(start);

        assert!(scaler.in_cooldown(start + Duration::from_millis(500)));
        assert_eq!(
            scaler.decide(&load(2, 2, 0), start + Duration::from_millis(500)),
            ScaleDecision::NoAction
        );
        assert_eq!(
            scaler.decide(&load(2, 2, 0), start + Duration::from_millis(1_500)),
            ScaleDecision::Grow(2)
        );
    }

    #[test]
    fn test_utilization() {
        assert_eq!(load(0, 0, 0).utilization(), 0.0);
        assert_eq!(load(0, 0, 3).utilization(), 1.0);
        assert_eq!(load(4, 1, 1).utilization(), 0.5);
        assert_eq!(load(2, 2, 9).utilization(), 1.0);
    }
}
