//! Per-server circuit breaker state machine.
//!
//! Owned exclusively by the health monitor; other components observe it
//! through `HealthMonitor::can_execute` and write to it only through
//! outcome recording. Timing goes through the [`Clock`] seam so recovery
//! windows can be driven deterministically in tests.

use crate::clock::Clock;
use crate::config::HealthConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Cap on stored transition log entries per breaker.
const MAX_TRANSITIONS: usize = 100;
/// Cap on stored outcomes in the rolling error window per breaker.
const MAX_WINDOW_ENTRIES: usize = 100;
/// Minimum window population before the rolling error rate may trip the
/// breaker on its own; below this only consecutive failures count.
const MIN_WINDOW_SAMPLES: usize = 10;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// One logged state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at_millis: u64,
    pub reason: String,
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub rolling_error_rate: f64,
    pub avg_response_time: Duration,
    pub transition_count: usize,
}

/// Circuit breaker for a single backend server.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_time: Duration,
    monitoring_window: Duration,
    /// A half-open probe token older than this is considered abandoned
    /// (its holder was admitted but never sent), and admission reopens.
    probe_token_ttl: Duration,

    total_requests: u64,
    success_count: u64,
    failure_count: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<u64>,
    last_success_at: Option<u64>,
    opened_at: Option<u64>,
    avg_response_time: Duration,

    /// `(at_millis, success)` outcomes inside the monitoring window.
    window: VecDeque<(u64, bool)>,
    transitions: VecDeque<BreakerTransition>,
    probe_taken_at: Option<u64>,

    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: &HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            recovery_time: config.recovery_time(),
            monitoring_window: config.monitoring_window(),
            probe_token_ttl: config.timeout(),
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            avg_response_time: Duration::ZERO,
            window: VecDeque::new(),
            transitions: VecDeque::new(),
            probe_taken_at: None,
            clock,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a request may be sent to this server right now.
    ///
    /// Closed always admits. Open admits nothing until `recovery_time` has
    /// elapsed since the last failure, at which point the breaker moves to
    /// HalfOpen as a side effect of the query. HalfOpen admits one probe at
    /// a time; callers that race the probe token may let a small burst
    /// through, which the recovery accounting tolerates.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                let now = self.clock.now_millis();
                match self.probe_taken_at {
                    Some(taken)
                        if now.saturating_sub(taken)
                            < self.probe_token_ttl.as_millis() as u64 =>
                    {
                        false
                    }
                    _ => {
                        self.probe_taken_at = Some(now);
                        true
                    }
                }
            }
            BreakerState::Open => {
                let now = self.clock.now_millis();
                // Manual opens have no failure timestamp; fall back to the
                // moment the breaker opened.
                let reference = match (self.last_failure_at, self.opened_at) {
                    (Some(f), Some(o)) => f.max(o),
                    (Some(f), None) => f,
                    (None, Some(o)) => o,
                    (None, None) => now,
                };
                if now.saturating_sub(reference) >= self.recovery_time.as_millis() as u64 {
                    self.transition(BreakerState::HalfOpen, "recovery timeout elapsed");
                    self.probe_taken_at = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Fold in one request outcome and evaluate the transition table.
    pub fn record(&mut self, success: bool, response_time: Duration) {
        let now = self.clock.now_millis();
        self.total_requests += 1;
        self.push_window(now, success);

        if self.total_requests == 1 {
            self.avg_response_time = response_time;
        } else {
            let alpha = 0.1;
            let prev = self.avg_response_time.as_secs_f64();
            self.avg_response_time =
                Duration::from_secs_f64(prev * (1.0 - alpha) + response_time.as_secs_f64() * alpha);
        }

        if success {
            self.success_count += 1;
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.last_success_at = Some(now);

            if self.state == BreakerState::HalfOpen {
                self.probe_taken_at = None;
                if self.consecutive_successes >= self.success_threshold {
                    self.transition(BreakerState::Closed, "recovery confirmed");
                }
            }
        } else {
            self.failure_count += 1;
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            self.last_failure_at = Some(now);

            match self.state {
                BreakerState::HalfOpen => {
                    self.probe_taken_at = None;
                    self.transition(BreakerState::Open, "failed during recovery");
                }
                BreakerState::Closed => {
                    let window_tripped = self.window.len() >= MIN_WINDOW_SAMPLES
                        && self.rolling_error_rate() > 0.5;
                    if self.consecutive_failures >= self.failure_threshold || window_tripped {
                        self.transition(BreakerState::Open, "failure threshold exceeded");
                    }
                }
                BreakerState::Open => {}
            }
        }
    }

    /// Failure ratio of outcomes inside the monitoring window.
    pub fn rolling_error_rate(&self) -> f64 {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(self.monitoring_window.as_millis() as u64);
        let mut total = 0usize;
        let mut failures = 0usize;
        for &(at, success) in &self.window {
            if at >= cutoff {
                total += 1;
                if !success {
                    failures += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        }
    }

    /// Force the breaker into a state for maintenance or tests.
    ///
    /// Forcing the current state is idempotent: it appends a log entry and
    /// nothing else.
    pub fn force_state(&mut self, state: BreakerState) {
        if self.state == state {
            self.log_transition(state, state, "Manual override");
            return;
        }
        self.transition_with_reason(state, "Manual override");
    }

    /// Reset to Closed, clearing counters. Used by the recovery loop.
    pub fn reset(&mut self, reason: &str) {
        let from = self.state;
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.probe_taken_at = None;
        self.opened_at = None;
        self.log_transition(from, BreakerState::Closed, reason);
    }

    pub fn transitions(&self) -> impl Iterator<Item = &BreakerTransition> {
        self.transitions.iter()
    }

    pub fn last_transition(&self) -> Option<&BreakerTransition> {
        self.transitions.back()
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.state,
            total_requests: self.total_requests,
            success_count: self.success_count,
            failure_count: self.failure_count,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            rolling_error_rate: self.rolling_error_rate(),
            avg_response_time: self.avg_response_time,
            transition_count: self.transitions.len(),
        }
    }

    fn transition(&mut self, to: BreakerState, reason: &str) {
        self.transition_with_reason(to, reason);
    }

    fn transition_with_reason(&mut self, to: BreakerState, reason: &str) {
        let from = self.state;
        self.state = to;
        // Consecutive counters reset on every state change.
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        if to == BreakerState::Open {
            self.opened_at = Some(self.clock.now_millis());
        }
        if to != BreakerState::HalfOpen {
            self.probe_taken_at = None;
        }
        self.log_transition(from, to, reason);
        tracing::info!(from = ?from, to = ?to, reason, "circuit breaker transition");
    }

    fn log_transition(&mut self, from: BreakerState, to: BreakerState, reason: &str) {
        if self.transitions.len() >= MAX_TRANSITIONS {
            self.transitions.pop_front();
        }
        self.transitions.push_back(BreakerTransition {
            from,
            to,
            at_millis: self.clock.now_millis(),
            reason: reason.to_string(),
        });
    }

    fn push_window(&mut self, at: u64, success: bool) {
        let cutoff = at.saturating_sub(self.monitoring_window.as_millis() as u64);
        while matches!(self.window.front(), Some(&(t, _)) if t < cutoff) {
            self.window.pop_front();
        }
        if self.window.len() >= MAX_WINDOW_ENTRIES {
            self.window.pop_front();
        }
        self.window.push_back((at, success));
    }
}
