//! Restart budgets for supervised components.
//!
//! A component that fails is restarted in place as long as it has not failed
//! more than `max_restarts` times within the sliding `window`. Past that the
//! failure escalates and the process shuts down.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::{Error, Result};

/// Restart limits for a supervised component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed inside one window.
    pub max_restarts: usize,
    /// Length of the sliding window.
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart the component; `attempt` counts restarts in the current window.
    Restart { attempt: usize },
    /// The budget is spent.
    Escalate { restarts: usize },
}

/// Sliding-window failure counter for one component.
#[derive(Debug)]
pub struct RestartBudget {
    component: String,
    policy: RestartPolicy,
    failures: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(component: impl Into<String>, policy: RestartPolicy) -> Self {
        Self {
            component: component.into(),
            policy,
            failures: VecDeque::new(),
        }
    }

    /// Record a failure now and decide whether to restart.
    pub fn record_failure(&mut self) -> RestartDecision {
        self.record_failure_at(Instant::now())
    }

    /// Record a failure at `now`.
    pub fn record_failure_at(&mut self, now: Instant) -> RestartDecision {
        let window = self.policy.window;
        self.failures
            .retain(|at| now.saturating_duration_since(*at) < window);
        self.failures.push_back(now);

        let restarts = self.failures.len();
        if restarts > self.policy.max_restarts {
            RestartDecision::Escalate { restarts }
        } else {
            RestartDecision::Restart { attempt: restarts }
        }
    }

    /// Record a failure, turning an escalation into an error.
    pub fn try_restart(&mut self) -> Result<usize> {
        match self.record_failure() {
            RestartDecision::Restart { attempt } => {
                metrics::counter!("supervisor_restarts_total", "component" => self.component.clone())
                    .increment(1);
                Ok(attempt)
            }
            RestartDecision::Escalate { restarts } => {
                tracing::error!(
                    component = %self.component,
                    restarts,
                    window = ?self.policy.window,
                    "Restart budget exhausted, escalating"
                );
                Err(Error::RestartBudgetExhausted {
                    component: self.component.clone(),
                    restarts,
                    window: self.policy.window,
                })
            }
        }
    }

    /// Failures currently inside the window.
    pub fn recent_failures(&self) -> usize {
        self.failures.len()
    }
}
