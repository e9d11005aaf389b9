//! Per-server health monitoring: the probe loop, the admission contract,
//! and outcome recording.
//!
//! The monitor is the single owner of every circuit breaker. Other
//! components ask `can_execute` before dispatching and report outcomes
//! through `record_request`; the probe loop feeds `record_probe`. Probe
//! outcomes deliberately do not touch the per-server request counters, so a
//! quiet server's `server_success_rate` reflects real traffic only.

use crate::breaker::{BreakerState, BreakerStats, CircuitBreaker};
use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::events::{EventBus, FailoverTrigger, MuxEvent};
use crate::registry::{ServerRegistry, ServerSnapshot, ServerState};
use crate::types::ResourceMetrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How the monitor reaches a server. The pool manager implements this over
/// its live connections; tests swap in scripted probes.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Send a `ping`; return the observed round-trip on a `"pong"` reply.
    async fn ping(&self, server: &ServerSnapshot) -> Result<Duration, crate::MuxError>;

    /// Fetch `system/metrics`, if the server answers it. A `None` here is
    /// not a health failure.
    async fn fetch_metrics(&self, _server: &ServerSnapshot) -> Option<ResourceMetrics> {
        None
    }
}

/// Per-server health monitor and circuit-breaker owner.
pub struct HealthMonitor {
    registry: Arc<ServerRegistry>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor").field("config", &self.config).finish()
    }
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        config: HealthConfig,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            breakers: Mutex::new(HashMap::new()),
            config,
            clock,
            events,
        }
    }

    /// Start tracking a server. Idempotent.
    pub fn watch(&self, id: &str) {
        let mut breakers = self.breakers.lock().expect("health lock poisoned");
        breakers
            .entry(id.to_string())
            .or_insert_with(|| CircuitBreaker::new(&self.config, Arc::clone(&self.clock)));
    }

    /// Stop tracking a server, discarding its breaker.
    pub fn unwatch(&self, id: &str) {
        self.breakers.lock().expect("health lock poisoned").remove(id);
    }

    /// Admission contract: may a request be sent to `id` right now?
    ///
    /// Closed and HalfOpen admit (HalfOpen one probe at a time); Open admits
    /// once the recovery window has elapsed, flipping to HalfOpen as a side
    /// effect of the query.
    pub fn can_execute(&self, id: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("health lock poisoned");
        match breakers.get_mut(id) {
            Some(breaker) => breaker.can_execute(),
            None => false,
        }
    }

    /// Record the outcome of a caller request. Feeds the breaker, the
    /// registry counters, and the liveness mapping.
    pub fn record_request(&self, id: &str, success: bool, response_time: Duration) {
        self.record_inner(id, success, response_time, true);
    }

    /// Record the outcome of a health probe. Feeds the breaker and liveness
    /// but not the request counters.
    pub fn record_probe(&self, id: &str, success: bool, response_time: Duration) {
        self.record_inner(id, success, response_time, false);
    }

    fn record_inner(&self, id: &str, success: bool, response_time: Duration, is_request: bool) {
        let (state_after, consecutive_failures, newly_opened) = {
            let mut breakers = self.breakers.lock().expect("health lock poisoned");
            let breaker = breakers
                .entry(id.to_string())
                .or_insert_with(|| CircuitBreaker::new(&self.config, Arc::clone(&self.clock)));
            if breaker.state() == BreakerState::Open {
                // Give the time-driven Open → HalfOpen transition a chance,
                // so a successful probe after the recovery window counts
                // toward recovery instead of vanishing into an open breaker.
                let _ = breaker.can_execute();
            }
            let before = breaker.state();
            breaker.record(success, response_time);
            let after = breaker.state();
            (
                after,
                breaker.stats().consecutive_failures,
                before != BreakerState::Open && after == BreakerState::Open,
            )
        };

        let liveness = self.liveness_for(state_after, consecutive_failures);
        let mut previous = None;
        self.registry.update(id, |record| {
            previous = Some(record.state);
            record.state = liveness;
            if is_request {
                record.record_outcome(success, response_time);
            } else {
                record.last_health_check = Some(Instant::now());
            }
        });

        if newly_opened {
            tracing::warn!(server_id = id, "circuit breaker opened");
            self.events.emit(MuxEvent::ServerFailure {
                server_id: id.to_string(),
                trigger: FailoverTrigger::CircuitBreaker,
            });
        }
        if liveness == ServerState::Healthy
            && matches!(previous, Some(ServerState::Degraded | ServerState::Unhealthy))
        {
            tracing::info!(server_id = id, "server recovered");
            self.events.emit(MuxEvent::ServerRecovery { server_id: id.to_string() });
        }
    }

    /// Liveness mapping from breaker state plus recent failure pressure.
    fn liveness_for(&self, breaker: BreakerState, consecutive_failures: u32) -> ServerState {
        let degraded_after = (self.config.failure_threshold / 2).max(1);
        match breaker {
            BreakerState::Open => ServerState::Unhealthy,
            BreakerState::HalfOpen => ServerState::Degraded,
            BreakerState::Closed if consecutive_failures >= degraded_after => ServerState::Degraded,
            BreakerState::Closed => ServerState::Healthy,
        }
    }

    /// Force a breaker into a state for maintenance or tests. The log
    /// records the reason `"Manual override"`. Returns false for unknown ids.
    pub fn force_state(&self, id: &str, state: BreakerState) -> bool {
        let changed = {
            let mut breakers = self.breakers.lock().expect("health lock poisoned");
            match breakers.get_mut(id) {
                Some(breaker) => {
                    breaker.force_state(state);
                    true
                }
                None => false,
            }
        };
        if changed {
            let liveness = self.liveness_for(state, 0);
            self.registry.update(id, |record| record.state = liveness);
        }
        changed
    }

    /// Reset a breaker to Closed (used by the recovery loop before a fresh
    /// probe). Returns false for unknown ids.
    pub fn reset_breaker(&self, id: &str, reason: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("health lock poisoned");
        match breakers.get_mut(id) {
            Some(breaker) => {
                breaker.reset(reason);
                true
            }
            None => false,
        }
    }

    pub fn breaker_state(&self, id: &str) -> Option<BreakerState> {
        self.breakers.lock().expect("health lock poisoned").get(id).map(|b| b.state())
    }

    pub fn breaker_stats(&self, id: &str) -> Option<BreakerStats> {
        self.breakers.lock().expect("health lock poisoned").get(id).map(|b| b.stats())
    }

    /// Stats for every tracked server, ordered by id.
    pub fn dashboard(&self) -> Vec<(String, BreakerStats)> {
        let breakers = self.breakers.lock().expect("health lock poisoned");
        let mut rows: Vec<(String, BreakerStats)> =
            breakers.iter().map(|(id, b)| (id.clone(), b.stats())).collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Probe every registered server once, concurrently.
    pub async fn probe_once(self: &Arc<Self>, probe: Arc<dyn Probe>) {
        let servers = self.registry.snapshot();
        let mut tasks = tokio::task::JoinSet::new();
        for server in servers {
            let monitor = Arc::clone(self);
            let probe = Arc::clone(&probe);
            tasks.spawn(async move {
                monitor.probe_server(probe.as_ref(), &server).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn probe_server(&self, probe: &dyn Probe, server: &ServerSnapshot) {
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.timeout(), probe.ping(server)).await;
        match outcome {
            Ok(Ok(rtt)) => {
                self.record_probe(&server.id, true, rtt);
                if let Some(metrics) = probe.fetch_metrics(server).await {
                    self.registry.update(&server.id, |record| record.resources = metrics);
                }
            }
            Ok(Err(err)) => {
                tracing::debug!(server_id = %server.id, error = %err, "health probe failed");
                self.record_probe(&server.id, false, started.elapsed());
            }
            Err(_) => {
                tracing::debug!(server_id = %server.id, "health probe timed out");
                self.record_probe(&server.id, false, started.elapsed());
            }
        }
    }

    /// Spawn the periodic probe loop. The task exits when `shutdown` flips.
    pub fn spawn_probe_loop(
        self: Arc<Self>,
        probe: Arc<dyn Probe>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let interval = self.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.probe_once(Arc::clone(&probe)).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
