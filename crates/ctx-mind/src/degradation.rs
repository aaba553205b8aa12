use chrono::{DateTime, Duration, Utc};
use ctx_core::memory_contracts::{
    CircuitState, DegradationLevel, Dependency, DependencyHealth, HotSource,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 60_000,
            max_cooldown_ms: 15 * 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure(String),
}

/// Read-only view served to the health surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub level: DegradationLevel,
    pub hot_source: Option<HotSource>,
    pub reasoning: DependencyHealth,
    pub archive: DependencyHealth,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug)]
struct MonitorState {
    reasoning: DependencyHealth,
    archive: DependencyHealth,
}

impl MonitorState {
    fn health_mut(&mut self, dependency: Dependency) -> &mut DependencyHealth {
        match dependency {
            Dependency::Reasoning => &mut self.reasoning,
            Dependency::Archive => &mut self.archive,
        }
    }

    fn health(&self, dependency: Dependency) -> &DependencyHealth {
        match dependency {
            Dependency::Reasoning => &self.reasoning,
            Dependency::Archive => &self.archive,
        }
    }
}

/// Per-dependency circuit breakers. Cloning yields another handle to the same
/// health records. The degradation level is never stored; it is derived from
/// the records on every read.
#[derive(Debug, Clone)]
pub struct DegradationMonitor {
    config: CircuitConfig,
    state: Arc<Mutex<MonitorState>>,
}

impl DegradationMonitor {
    pub fn new(config: CircuitConfig) -> Self {
        let state = MonitorState {
            reasoning: DependencyHealth::new(Dependency::Reasoning, config.cooldown_ms),
            archive: DependencyHealth::new(Dependency::Archive, config.cooldown_ms),
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn config(&self) -> CircuitConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a call to `dependency` may proceed now. An open circuit whose
    /// cooldown has elapsed moves to half-open and hands out the single trial call.
    pub fn guard(&self, dependency: Dependency, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        let health = state.health_mut(dependency);
        match health.circuit_state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let Some(opened_at) = health.opened_at else {
                    health.opened_at = Some(now);
                    return false;
                };
                let reopen_at = opened_at + duration_ms(health.cooldown_ms);
                if now < reopen_at {
                    return false;
                }
                health.circuit_state = CircuitState::HalfOpen;
                health.trial_in_flight = true;
                info!(
                    event = "circuit_half_open",
                    dependency = %dependency,
                    cooldown_ms = health.cooldown_ms
                );
                true
            }
            CircuitState::HalfOpen => {
                if health.trial_in_flight {
                    return false;
                }
                health.trial_in_flight = true;
                true
            }
        }
    }

    pub fn report(&self, dependency: Dependency, outcome: CallOutcome, now: DateTime<Utc>) {
        let config = self.config;
        let mut state = self.lock();
        let health = state.health_mut(dependency);

        match outcome {
            CallOutcome::Success => {
                let previous = health.circuit_state;
                health.consecutive_failures = 0;
                health.last_success_at = Some(now);
                health.last_error = None;
                health.circuit_state = CircuitState::Closed;
                health.opened_at = None;
                health.trial_in_flight = false;
                health.cooldown_ms = config.cooldown_ms;
                if previous != CircuitState::Closed {
                    info!(
                        event = "circuit_closed",
                        dependency = %dependency,
                        previous = previous.as_str()
                    );
                }
            }
            CallOutcome::Failure(error) => {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                health.last_failure_at = Some(now);
                health.last_error = Some(error.clone());

                match health.circuit_state {
                    CircuitState::HalfOpen => {
                        health.cooldown_ms = health
                            .cooldown_ms
                            .saturating_mul(2)
                            .min(config.max_cooldown_ms.max(config.cooldown_ms));
                        health.circuit_state = CircuitState::Open;
                        health.opened_at = Some(now);
                        health.trial_in_flight = false;
                        warn!(
                            event = "circuit_reopened",
                            dependency = %dependency,
                            cooldown_ms = health.cooldown_ms,
                            error = %error
                        );
                    }
                    CircuitState::Closed
                        if health.consecutive_failures >= config.failure_threshold.max(1) =>
                    {
                        health.circuit_state = CircuitState::Open;
                        health.opened_at = Some(now);
                        warn!(
                            event = "circuit_opened",
                            dependency = %dependency,
                            consecutive_failures = health.consecutive_failures,
                            cooldown_ms = health.cooldown_ms,
                            error = %error
                        );
                    }
                    _ => {}
                }
            }
        }
    }

    pub fn health(&self, dependency: Dependency) -> DependencyHealth {
        self.lock().health(dependency).clone()
    }

    pub fn level(&self, hot_source: Option<HotSource>) -> DegradationLevel {
        let state = self.lock();
        DegradationLevel::derive(&state.reasoning, &state.archive, hot_source)
    }

    pub fn snapshot(&self, hot_source: Option<HotSource>, now: DateTime<Utc>) -> HealthSnapshot {
        let state = self.lock();
        HealthSnapshot {
            level: DegradationLevel::derive(&state.reasoning, &state.archive, hot_source),
            hot_source,
            reasoning: state.reasoning.clone(),
            archive: state.archive.clone(),
            captured_at: now,
        }
    }
}

fn duration_ms(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(i64::MAX as u64) as i64)
}
