//! Multiplexer façade: composes the registry, health monitor, balancer,
//! pool, and router; drives failover, recovery, and metrics loops; and
//! exposes the public execute/status/subscribe surface.

use crate::balance::{LoadBalancer, SelectionContext, StrategyKind};
use crate::config::MuxConfig;
use crate::error::MuxError;
use crate::events::{
    EventBus, EventHandler, EventKind, FailoverRecord, FailoverTrigger, MuxEvent, SubscriptionId,
};
use crate::health::HealthMonitor;
use crate::pool::{PoolManager, RequestDispatcher};
use crate::registry::{ServerRegistry, ServerState};
use crate::router::{Router, ServerExecutor};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::types::{RagRequest, RagResponse, RouteAttempt, ServerConfig};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Failover records kept for inspection.
const FAILOVER_HISTORY_CAP: usize = 50;
/// Window for caller-facing error rate, throughput, and latency.
const STATUS_WINDOW: Duration = Duration::from_secs(300);
/// Cadence of the `MetricsUpdated` event.
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_SHUT_DOWN: u8 = 2;

/// Aggregate status snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuxStatus {
    pub is_healthy: bool,
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub degraded_servers: usize,
    pub unhealthy_servers: usize,
    pub current_strategy: StrategyKind,
    pub queue_size: usize,
    pub avg_response_time_ms: u64,
    /// Completed requests per second over the status window.
    pub throughput: f64,
    /// Failed fraction of requests over the status window.
    pub error_rate: f64,
    pub uptime_ms: u64,
}

/// Rolling record of caller-facing request outcomes.
#[derive(Debug, Default)]
struct RequestWindow {
    entries: Mutex<VecDeque<(Instant, bool, Duration)>>,
}

impl RequestWindow {
    fn record(&self, success: bool, duration: Duration) {
        let mut entries = self.entries.lock().expect("request window lock poisoned");
        if let Some(cutoff) = Instant::now().checked_sub(STATUS_WINDOW) {
            while matches!(entries.front(), Some(&(at, _, _)) if at < cutoff) {
                entries.pop_front();
            }
        }
        entries.push_back((Instant::now(), success, duration));
    }

    /// `(error_rate, throughput_per_sec, avg_latency)` over the window.
    fn summarise(&self, uptime: Duration) -> (f64, f64, Duration) {
        let entries = self.entries.lock().expect("request window lock poisoned");
        let cutoff = Instant::now().checked_sub(STATUS_WINDOW);
        let live: Vec<&(Instant, bool, Duration)> = entries
            .iter()
            .filter(|(at, _, _)| cutoff.map_or(true, |c| *at >= c))
            .collect();
        if live.is_empty() {
            return (0.0, 0.0, Duration::ZERO);
        }
        let failures = live.iter().filter(|(_, success, _)| !success).count();
        let total_latency: Duration = live.iter().map(|(_, _, d)| *d).sum();
        let span = STATUS_WINDOW.min(uptime).max(Duration::from_secs(1));
        (
            failures as f64 / live.len() as f64,
            live.len() as f64 / span.as_secs_f64(),
            total_latency / live.len() as u32,
        )
    }
}

/// The dispatch seam installed into the pool: routes one queued request,
/// records every attempt's outcome, and keeps the failover ledger.
struct DispatchCore {
    registry: Arc<ServerRegistry>,
    health: Arc<HealthMonitor>,
    balancer: Arc<LoadBalancer>,
    router: Option<Arc<Router>>,
    pool: Arc<PoolManager>,
    config: MuxConfig,
    events: Arc<EventBus>,
    sleeper: Arc<dyn Sleeper>,
    failover_history: Arc<Mutex<VecDeque<FailoverRecord>>>,
    /// `request_id → (failed server, when)` while a failover is mid-flight.
    pending_failover: Mutex<HashMap<String, (String, FailoverTrigger, Instant)>>,
}

impl DispatchCore {
    fn trigger_for(err: &MuxError) -> FailoverTrigger {
        if err.is_timeout() {
            FailoverTrigger::Timeout
        } else {
            FailoverTrigger::ServerFailure
        }
    }

    fn push_failover(&self, record: FailoverRecord) {
        {
            let mut history =
                self.failover_history.lock().expect("failover history lock poisoned");
            if history.len() >= FAILOVER_HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        self.events.emit(MuxEvent::FailoverTriggered { record });
    }

    /// Failover loop used when intelligent routing is disabled: eligible
    /// set intersection, balancer pick, exclusion on failure.
    async fn balanced_route(
        &self,
        request: &RagRequest,
        request_id: &str,
    ) -> Result<RagResponse, MuxError> {
        let max_attempts = if self.config.failover.enabled {
            self.config.failover.max_failover_attempts.max(1)
        } else {
            1
        };
        let mut history: Vec<RouteAttempt> = Vec::new();
        let mut excluded: HashSet<String> = HashSet::new();
        let caps = request.required_capabilities();

        for attempt in 0..max_attempts {
            let eligible: Vec<_> = self
                .registry
                .snapshot()
                .into_iter()
                .filter(|s| {
                    s.is_eligible(
                        self.config.pool.max_requests_per_server,
                        self.config.pool.circuit_breaker_threshold,
                    ) && !excluded.contains(&s.id)
                        && self.health.can_execute(&s.id)
                })
                .collect();
            let ctx = SelectionContext::new(
                self.config.balance.response_time_ceiling(),
                self.config.pool.max_requests_per_server,
            )
            .with_capabilities(caps.clone());

            let decision = match self.balancer.select(&eligible, &ctx) {
                Ok(decision) => decision,
                Err(err) if history.is_empty() => return Err(err),
                Err(_) => {
                    let last_server =
                        history.last().map(|a| a.server_id.clone()).unwrap_or_default();
                    return Err(MuxError::FailoverExhausted {
                        attempts: attempt as usize,
                        last_server,
                        history,
                    });
                }
            };

            match self
                .execute_on(&decision.server_id, request, request_id, Some(&decision))
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) => {
                    history.push(RouteAttempt::failure(&decision.server_id, err.to_string()));
                    excluded.insert(decision.server_id.clone());
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    if attempt + 1 >= max_attempts {
                        return Err(MuxError::FailoverExhausted {
                            attempts: (attempt + 1) as usize,
                            last_server: decision.server_id,
                            history,
                        });
                    }
                    let delay = self.config.failover.failover_delay() * (attempt + 1);
                    self.sleeper.sleep(delay).await;
                }
            }
        }
        unreachable!("failover loop returns before exhausting attempts")
    }
}

#[async_trait]
impl ServerExecutor for DispatchCore {
    /// One attempt on one server, with outcome recording ordered before any
    /// later selection can read the stats.
    async fn execute_on(
        &self,
        server_id: &str,
        request: &RagRequest,
        request_id: &str,
        decision: Option<&crate::balance::BalanceDecision>,
    ) -> Result<RagResponse, MuxError> {
        let started = Instant::now();
        let result = self.pool.send_to(server_id, request, request_id).await;
        let elapsed = started.elapsed();

        let health_success = match &result {
            Ok(_) => true,
            Err(err) => !err.counts_against_health(),
        };
        self.health.record_request(server_id, health_success, elapsed);
        if let Some(decision) = decision {
            self.balancer.record_outcome(decision, result.is_ok(), elapsed);
        }

        match &result {
            Ok(_) => {
                let pending = self
                    .pending_failover
                    .lock()
                    .expect("pending failover lock poisoned")
                    .remove(request_id);
                if let Some((from_server, trigger, failed_at)) = pending {
                    self.push_failover(FailoverRecord {
                        timestamp_millis: FailoverRecord::now_millis(),
                        trigger,
                        from_server,
                        to_server: Some(server_id.to_string()),
                        request_id: request_id.to_string(),
                        success: true,
                        recovery_time_ms: failed_at.elapsed().as_millis() as u64,
                    });
                }
            }
            Err(err) if err.counts_against_health() => {
                tracing::warn!(server_id, request_id, error = %err, "server attempt failed");
                self.pending_failover
                    .lock()
                    .expect("pending failover lock poisoned")
                    .insert(
                        request_id.to_string(),
                        (server_id.to_string(), Self::trigger_for(err), Instant::now()),
                    );
            }
            Err(_) => {}
        }
        result
    }
}

#[async_trait]
impl RequestDispatcher for DispatchCore {
    async fn dispatch(
        &self,
        request: &RagRequest,
        request_id: &str,
    ) -> Result<RagResponse, MuxError> {
        let result = match &self.router {
            Some(router) => router.route(request, request_id, self).await,
            None => self.balanced_route(request, request_id).await,
        };

        // A failover that never found a working server is still a failover.
        if result.is_err() {
            let pending = self
                .pending_failover
                .lock()
                .expect("pending failover lock poisoned")
                .remove(request_id);
            if let Some((from_server, trigger, failed_at)) = pending {
                self.push_failover(FailoverRecord {
                    timestamp_millis: FailoverRecord::now_millis(),
                    trigger,
                    from_server,
                    to_server: None,
                    request_id: request_id.to_string(),
                    success: false,
                    recovery_time_ms: failed_at.elapsed().as_millis() as u64,
                });
            }
        }
        result
    }
}

/// Public façade over the multiplexing fabric.
pub struct Multiplexer {
    config: MuxConfig,
    registry: Arc<ServerRegistry>,
    health: Arc<HealthMonitor>,
    balancer: Arc<LoadBalancer>,
    router: Option<Arc<Router>>,
    pool: Arc<PoolManager>,
    events: Arc<EventBus>,
    window: Arc<RequestWindow>,
    failover_history: Arc<Mutex<VecDeque<FailoverRecord>>>,
    state: AtomicU8,
    started_at: Mutex<Option<Instant>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("servers", &self.registry.len())
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

impl Multiplexer {
    /// Build an uninitialised multiplexer. Fails on invalid configuration;
    /// advisory findings are logged and kept going.
    pub fn new(config: MuxConfig) -> Result<Self, MuxError> {
        Self::with_sleeper(config, Arc::new(TokioSleeper))
    }

    /// As [`Multiplexer::new`], with the sleep seam swapped (tests drive
    /// failover backoff without real delays).
    pub fn with_sleeper(config: MuxConfig, sleeper: Arc<dyn Sleeper>) -> Result<Self, MuxError> {
        for warning in config.validate()? {
            tracing::warn!(field = %warning.field, "{}", warning.message);
        }

        let events = Arc::new(EventBus::new());
        let registry = Arc::new(ServerRegistry::new(
            config.pool.max_requests_per_server,
            config.balance.response_time_ceiling(),
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            config.health.clone(),
            Arc::new(crate::clock::MonotonicClock::default()),
            Arc::clone(&events),
        ));
        let balancer = Arc::new(LoadBalancer::new(&config.balance, Arc::clone(&events)));
        let pool = Arc::new(PoolManager::new(
            Arc::clone(&registry),
            config.pool.clone(),
            config.health.timeout(),
            Arc::clone(&events),
            Arc::clone(&sleeper),
        ));
        let router = config.intelligent_routing.then(|| {
            Arc::new(Router::new(
                Arc::clone(&registry),
                Arc::clone(&health),
                Arc::clone(&balancer),
                Arc::clone(&sleeper),
                config.pool.max_requests_per_server,
                config.pool.circuit_breaker_threshold,
                config.balance.response_time_ceiling(),
                config.failover.max_failover_attempts.max(1),
            ))
        });

        let failover_history = Arc::new(Mutex::new(VecDeque::new()));
        let core = Arc::new(DispatchCore {
            registry: Arc::clone(&registry),
            health: Arc::clone(&health),
            balancer: Arc::clone(&balancer),
            router: router.clone(),
            pool: Arc::clone(&pool),
            config: config.clone(),
            events: Arc::clone(&events),
            sleeper,
            failover_history: Arc::clone(&failover_history),
            pending_failover: Mutex::new(HashMap::new()),
        });
        pool.set_dispatcher(core);

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            registry,
            health,
            balancer,
            router,
            pool,
            events,
            window: Arc::new(RequestWindow::default()),
            failover_history,
            state: AtomicU8::new(STATE_CREATED),
            started_at: Mutex::new(None),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register the initial servers, connect, probe once, and start every
    /// background loop. A second call fails.
    pub async fn initialize(
        self: &Arc<Self>,
        servers: Vec<ServerConfig>,
    ) -> Result<(), MuxError> {
        self.state
            .compare_exchange(STATE_CREATED, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| match actual {
                STATE_RUNNING => MuxError::Configuration("already initialized".into()),
                _ => MuxError::Shutdown,
            })?;

        if servers.len() < self.config.pool.min_servers {
            tracing::warn!(
                got = servers.len(),
                min = self.config.pool.min_servers,
                "starting below the configured minimum pool size"
            );
        }
        if servers.len() > self.config.pool.max_servers {
            return Err(MuxError::Configuration(format!(
                "{} servers exceed pool.maxServers ({})",
                servers.len(),
                self.config.pool.max_servers
            )));
        }

        let server_count = servers.len();
        for cfg in servers {
            let id = cfg.id();
            self.registry.add(cfg)?;
            self.health.watch(&id);
        }

        self.pool.connect_all().await;
        // First probe pass so healthy servers are eligible immediately.
        self.health.probe_once(self.probe()).await;

        {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.push(
                Arc::clone(&self.pool).spawn_dispatch_loop(self.shutdown_tx.subscribe()),
            );
            tasks.push(
                Arc::clone(&self.pool).spawn_autoscale_loop(self.shutdown_tx.subscribe()),
            );
            tasks.push(
                Arc::clone(&self.health)
                    .spawn_probe_loop(self.probe(), self.shutdown_tx.subscribe()),
            );
            tasks.push(
                Arc::clone(&self.balancer).spawn_adaptation_loop(self.shutdown_tx.subscribe()),
            );
            if self.config.failover.auto_recovery {
                tasks.push(Arc::clone(self).spawn_recovery_loop(self.shutdown_tx.subscribe()));
            }
            tasks.push(Arc::clone(self).spawn_metrics_loop(self.shutdown_tx.subscribe()));
        }

        *self.started_at.lock().expect("started_at lock poisoned") = Some(Instant::now());
        tracing::info!(servers = server_count, "multiplexer initialized");
        self.events.emit(MuxEvent::Initialized { server_count });
        Ok(())
    }

    fn probe(&self) -> Arc<PoolManager> {
        Arc::clone(&self.pool)
    }

    fn ensure_running(&self) -> Result<(), MuxError> {
        match self.state.load(Ordering::Acquire) {
            STATE_RUNNING => Ok(()),
            STATE_CREATED => Err(MuxError::Configuration("not initialized".into())),
            _ => Err(MuxError::Shutdown),
        }
    }

    /// Execute a request at its own declared priority.
    pub async fn execute(&self, request: RagRequest) -> Result<RagResponse, MuxError> {
        let priority = request.priority.weight();
        self.execute_with_priority(request, priority).await
    }

    /// Execute a request at an explicit queue priority.
    pub async fn execute_with_priority(
        &self,
        request: RagRequest,
        priority: i32,
    ) -> Result<RagResponse, MuxError> {
        self.ensure_running()?;
        let started = Instant::now();
        let deadline = request.timeout_override().map(|t| started + t);
        let request_id = uuid::Uuid::new_v4().to_string();

        let receiver = self.pool.submit(request, priority, deadline, request_id.clone())?;
        let result = receiver.await.unwrap_or(Err(MuxError::Shutdown));

        let duration = started.elapsed();
        self.window.record(result.is_ok(), duration);
        self.events.emit(MuxEvent::RequestCompleted {
            request_id,
            duration,
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    /// Add a server to the running pool.
    pub async fn add_server(&self, cfg: ServerConfig) -> Result<(), MuxError> {
        self.ensure_running()?;
        if self.registry.len() >= self.config.pool.max_servers {
            return Err(MuxError::Configuration(format!(
                "pool is at maxServers ({})",
                self.config.pool.max_servers
            )));
        }
        let id = cfg.id();
        self.registry.add(cfg)?;
        self.health.watch(&id);
        self.health.probe_once(self.probe()).await;
        tracing::info!(server_id = %id, "server added");
        self.events.emit(MuxEvent::ServerAdded { server_id: id });
        Ok(())
    }

    /// Drain and remove a server from the pool.
    pub async fn remove_server(&self, id: &str) -> Result<(), MuxError> {
        self.ensure_running()?;
        if !self.registry.contains(id) {
            return Err(MuxError::Configuration(format!("unknown server id: {id}")));
        }
        self.pool.drain_server(id).await;
        self.registry.remove(id)?;
        self.health.unwatch(id);
        if let Some(router) = &self.router {
            router.forget_server(id);
        }
        tracing::info!(server_id = %id, "server removed");
        self.events.emit(MuxEvent::ServerRemoved { server_id: id.to_string() });
        Ok(())
    }

    /// Force a server's breaker open, recording a manual failover.
    pub fn force_failover(&self, id: &str, reason: &str) -> Result<(), MuxError> {
        self.ensure_running()?;
        if !self.health.force_state(id, crate::breaker::BreakerState::Open) {
            return Err(MuxError::Configuration(format!("unknown server id: {id}")));
        }
        tracing::warn!(server_id = %id, reason, "manual failover forced");
        let record = FailoverRecord {
            timestamp_millis: FailoverRecord::now_millis(),
            trigger: FailoverTrigger::Manual,
            from_server: id.to_string(),
            to_server: None,
            request_id: String::new(),
            success: true,
            recovery_time_ms: 0,
        };
        {
            let mut history =
                self.failover_history.lock().expect("failover history lock poisoned");
            if history.len() >= FAILOVER_HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        self.events.emit(MuxEvent::ServerFailure {
            server_id: id.to_string(),
            trigger: FailoverTrigger::Manual,
        });
        self.events.emit(MuxEvent::FailoverTriggered { record });
        Ok(())
    }

    /// Stop loops and drain: balancer and health die with the shutdown
    /// signal, then the pool drains and rejects what is left.
    pub async fn shutdown(&self) {
        let was = self.state.swap(STATE_SHUT_DOWN, Ordering::AcqRel);
        if was == STATE_SHUT_DOWN {
            return;
        }
        tracing::info!("multiplexer shutting down");
        let _ = self.shutdown_tx.send(true);
        self.pool.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task list lock poisoned"));
        for task in tasks {
            task.abort();
        }
    }

    /// Aggregate status snapshot.
    pub fn status(&self) -> MuxStatus {
        let snapshot = self.registry.snapshot();
        let healthy = snapshot.iter().filter(|s| s.state == ServerState::Healthy).count();
        let degraded = snapshot.iter().filter(|s| s.state == ServerState::Degraded).count();
        let unhealthy = snapshot.iter().filter(|s| s.state == ServerState::Unhealthy).count();

        let uptime = self
            .started_at
            .lock()
            .expect("started_at lock poisoned")
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        let (error_rate, throughput, avg_latency) = self.window.summarise(uptime);

        MuxStatus {
            is_healthy: self.state.load(Ordering::Acquire) == STATE_RUNNING && healthy > 0,
            total_servers: snapshot.len(),
            healthy_servers: healthy,
            degraded_servers: degraded,
            unhealthy_servers: unhealthy,
            current_strategy: self.balancer.current_strategy(),
            queue_size: self.pool.queue_size(),
            avg_response_time_ms: avg_latency.as_millis() as u64,
            throughput,
            error_rate,
            uptime_ms: uptime.as_millis() as u64,
        }
    }

    /// Subscribe to one event kind.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: EventHandler,
    ) -> Result<SubscriptionId, MuxError> {
        self.events.subscribe(kind, handler)
    }

    /// Subscribe to every event kind.
    pub fn subscribe_all(&self, handler: EventHandler) -> Result<SubscriptionId, MuxError> {
        self.events.subscribe_all(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Recent failovers, oldest first.
    pub fn failover_history(&self) -> Vec<FailoverRecord> {
        self.failover_history
            .lock()
            .expect("failover history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// The rule engine, when intelligent routing is enabled.
    pub fn router(&self) -> Option<&Arc<Router>> {
        self.router.as_ref()
    }

    /// Snapshot of every registered server.
    pub fn servers(&self) -> Vec<crate::registry::ServerSnapshot> {
        self.registry.snapshot()
    }

    /// Health dashboard rows `(server_id, breaker stats)`.
    pub fn health_dashboard(&self) -> Vec<(String, crate::breaker::BreakerStats)> {
        self.health.dashboard()
    }

    /// Per-strategy balancer statistics.
    pub fn strategy_reports(&self) -> Vec<crate::balance::StrategyReport> {
        self.balancer.strategy_reports()
    }

    /// Recovery loop: reset breakers of unhealthy servers and re-probe.
    fn spawn_recovery_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let interval = self.config.failover.recovery_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let unhealthy: Vec<String> = self
                            .registry
                            .snapshot()
                            .into_iter()
                            .filter(|s| s.state == ServerState::Unhealthy)
                            .map(|s| s.id)
                            .collect();
                        if unhealthy.is_empty() {
                            continue;
                        }
                        for id in &unhealthy {
                            tracing::info!(server_id = %id, "attempting recovery");
                            self.health.reset_breaker(id, "recovery loop reset");
                        }
                        self.health.probe_once(self.probe()).await;
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

    fn spawn_metrics_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let status = self.status();
                        self.events.emit(MuxEvent::MetricsUpdated { status });
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
