//! Pool manager: owns server connections and the request queue, executes
//! one request on one chosen server, and raises autoscale signals.
//!
//! Selection and failover live above the pool, behind the
//! [`RequestDispatcher`] seam the multiplexer installs; the pool's job is
//! admission, pacing, per-item retries, and the wire itself.

mod connection;
mod queue;

pub use connection::ServerConnection;
pub use queue::{QueueItem, RequestQueue};

use crate::backoff::RetryBackoff;
use crate::config::PoolConfig;
use crate::error::MuxError;
use crate::events::{EventBus, MuxEvent};
use crate::health::Probe;
use crate::jitter::Jitter;
use crate::protocol::{self, RagQueryResult, METHOD_METRICS, METHOD_PING, METHOD_RAG_QUERY};
use crate::registry::{ServerRegistry, ServerSnapshot};
use crate::sleeper::Sleeper;
use crate::types::{RagRequest, RagResponse, ResourceMetrics, ResponseMetadata};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Queue poll period.
const DISPATCH_TICK: Duration = Duration::from_millis(100);
/// Bounded wait for in-flight requests during shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);
/// Bounded wait for in-flight requests when removing a single server.
const REMOVAL_DRAIN: Duration = Duration::from_secs(5);

/// Runs one queued request to completion: server selection, the attempt
/// itself, and any failover. Installed by the multiplexer.
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        request: &RagRequest,
        request_id: &str,
    ) -> Result<RagResponse, MuxError>;
}

type SharedConnection = Arc<tokio::sync::Mutex<ServerConnection>>;

/// Connection owner, request queue, and pacing loop.
pub struct PoolManager {
    registry: Arc<ServerRegistry>,
    config: PoolConfig,
    queue: Arc<RequestQueue>,
    /// Request connections, one per server, serialised by an async mutex.
    connections: Mutex<HashMap<String, SharedConnection>>,
    /// Probe connections are kept apart so a busy request stream never
    /// makes a healthy server look deaf.
    probe_connections: Mutex<HashMap<String, SharedConnection>>,
    probe_timeout: Duration,
    dispatcher: OnceLock<Arc<dyn RequestDispatcher>>,
    backoff: RetryBackoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    events: Arc<EventBus>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("queue_len", &self.queue.len())
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl PoolManager {
    pub fn new(
        registry: Arc<ServerRegistry>,
        config: PoolConfig,
        probe_timeout: Duration,
        events: Arc<EventBus>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let backoff = RetryBackoff::new(
            config.retry_policy.backoff_strategy,
            Duration::from_millis(config.retry_policy.initial_delay_ms),
            Duration::from_millis(config.retry_policy.max_delay_ms),
        );
        let jitter = config.retry_policy.jitter;
        Self {
            registry,
            queue: Arc::new(RequestQueue::new(config.queue_capacity)),
            config,
            connections: Mutex::new(HashMap::new()),
            probe_connections: Mutex::new(HashMap::new()),
            probe_timeout,
            dispatcher: OnceLock::new(),
            backoff,
            jitter,
            sleeper,
            events,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Install the dispatch seam. Set once, before the loop starts; later
    /// calls are ignored.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn RequestDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    /// Enqueue a request under the caller's request id. The receiver
    /// resolves when the request completes, fails terminally, or is evicted.
    pub fn submit(
        &self,
        request: RagRequest,
        priority: i32,
        deadline: Option<Instant>,
        request_id: String,
    ) -> Result<oneshot::Receiver<Result<RagResponse, MuxError>>, MuxError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(MuxError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();
        let item = QueueItem {
            id: request_id,
            request,
            priority,
            seq: 0,
            enqueued_at: Instant::now(),
            deadline,
            retry_count: 0,
            responder: tx,
        };
        self.queue.enqueue(item).map_err(|_rejected| {
            if self.queue.is_accepting() {
                MuxError::QueueFull { capacity: self.queue.capacity() }
            } else {
                MuxError::Shutdown
            }
        })?;
        Ok(rx)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn backpressure_level(&self) -> f64 {
        self.queue.backpressure_level()
    }

    /// Sum of in-flight requests across the pool.
    pub fn total_active(&self) -> usize {
        self.registry.snapshot().iter().map(|s| s.active_requests).sum()
    }

    /// Servers the pacing loop counts capacity for: registry-eligible and
    /// not past the pool's consecutive-failure cutoff.
    fn capacity_eligible_ids(&self) -> Vec<String> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|s| {
                s.is_eligible(
                    self.config.max_requests_per_server,
                    self.config.circuit_breaker_threshold,
                ) && s.consecutive_failures < self.config.max_consecutive_failures
            })
            .map(|s| s.id)
            .collect()
    }

    /// One pacing tick: evict expired items, then dispatch as many queued
    /// items as the pool has free capacity for.
    pub async fn pump(self: &Arc<Self>) {
        let now = Instant::now();
        for item in self.queue.take_expired(now) {
            let missed_by = item
                .deadline
                .map(|d| now.saturating_duration_since(d))
                .unwrap_or_default();
            tracing::debug!(request_id = %item.id, ?missed_by, "evicting expired queue item");
            let request_id = item.id.clone();
            item.complete(Err(MuxError::DeadlineExceeded { request_id, missed_by }));
        }

        let eligible = self.capacity_eligible_ids();
        if eligible.is_empty() {
            // Zero eligible servers: dispatch anyway so every queued item
            // fails fast with NoServersAvailable instead of sitting in the
            // queue waiting for a pool that may never come back.
            for item in self.queue.pop_ready(usize::MAX) {
                let pool = Arc::clone(self);
                tokio::spawn(async move {
                    pool.run_item(item).await;
                });
            }
            return;
        }

        let capacity = self.registry.available_capacity(&eligible);
        if capacity == 0 {
            return;
        }
        for item in self.queue.pop_ready(capacity) {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.run_item(item).await;
            });
        }
    }

    async fn run_item(self: Arc<Self>, mut item: QueueItem) {
        let Some(dispatcher) = self.dispatcher.get().cloned() else {
            item.complete(Err(MuxError::Configuration(
                "no request dispatcher installed".into(),
            )));
            return;
        };

        match dispatcher.dispatch(&item.request, &item.id).await {
            Ok(response) => item.complete(Ok(response)),
            Err(err)
                if err.is_retryable() && item.retry_count < self.config.retry_policy.max_retries =>
            {
                item.retry_count += 1;
                let delay = self.jitter.apply(self.backoff.delay(item.retry_count as usize));
                tracing::debug!(
                    request_id = %item.id,
                    retry = item.retry_count,
                    ?delay,
                    error = %err,
                    "requeueing failed request"
                );
                self.sleeper.sleep(delay).await;
                if let Err(rejected) = self.queue.requeue_front(item) {
                    rejected.complete(Err(MuxError::Shutdown));
                }
            }
            Err(err) => item.complete(Err(err)),
        }
    }

    /// Spawn the 100 ms pacing loop.
    pub fn spawn_dispatch_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DISPATCH_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.pump().await;
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

    fn connection_from(
        map: &Mutex<HashMap<String, SharedConnection>>,
        server: &ServerSnapshot,
        connect_timeout: Duration,
    ) -> SharedConnection {
        let mut connections = map.lock().expect("connection map lock poisoned");
        Arc::clone(connections.entry(server.id.clone()).or_insert_with(|| {
            Arc::new(tokio::sync::Mutex::new(ServerConnection::new(
                server.host.clone(),
                server.port,
                connect_timeout,
            )))
        }))
    }

    fn request_connection(&self, server: &ServerSnapshot) -> SharedConnection {
        Self::connection_from(&self.connections, server, self.config.connection_timeout())
    }

    fn probe_connection(&self, server: &ServerSnapshot) -> SharedConnection {
        Self::connection_from(&self.probe_connections, server, self.config.connection_timeout())
    }

    /// Eagerly establish request connections to every registered server.
    /// Individual failures are logged, not fatal; the health monitor will
    /// keep score from here.
    pub async fn connect_all(&self) {
        for server in self.registry.snapshot() {
            let conn = self.request_connection(&server);
            let mut guard = conn.lock().await;
            if let Err(err) = guard.ensure_connected().await {
                tracing::warn!(server_id = %server.id, error = %err, "initial connection failed");
            }
        }
    }

    /// Execute one `rag/query` on one server. The in-flight slot is held by
    /// an RAII guard, so the counter drops on every path out of here.
    pub async fn send_to(
        &self,
        server_id: &str,
        request: &RagRequest,
        request_id: &str,
    ) -> Result<RagResponse, MuxError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(MuxError::Shutdown);
        }
        let server = self.registry.get(server_id).ok_or_else(|| MuxError::NoServersAvailable {
            reason: format!("server {server_id} is no longer registered"),
        })?;
        let guard = self.registry.begin_request(server_id)?;

        let timeout = request.timeout_override().unwrap_or(self.config.request_timeout());
        let started = Instant::now();
        let conn = self.request_connection(&server);
        let value = {
            let mut conn = conn.lock().await;
            conn.call(METHOD_RAG_QUERY, protocol::rag_query_params(request), timeout).await?
        };

        let payload: RagQueryResult =
            serde_json::from_value(value).map_err(|e| MuxError::Protocol {
                server_id: server_id.to_string(),
                detail: format!("malformed rag/query result: {e}"),
            })?;

        drop(guard);
        Ok(RagResponse {
            metadata: ResponseMetadata {
                total_results: payload.results.len(),
                processing_time_ms: started.elapsed().as_millis() as u64,
                source: payload.source,
                query_id: request_id.to_string(),
                server_id: server_id.to_string(),
            },
            results: payload.results,
        })
    }

    /// One autoscale evaluation. Emits at most one signal.
    pub fn autoscale_check(&self) {
        if !self.config.autoscaling.enabled {
            return;
        }
        let servers = self.registry.len();
        if servers == 0 {
            return;
        }
        let capacity = servers * self.config.max_requests_per_server;
        let utilisation = self.total_active() as f64 / capacity as f64;

        if utilisation > self.config.autoscaling.scale_up_threshold
            && servers < self.config.max_servers
        {
            tracing::info!(utilisation, servers, "scale-up signal");
            self.events.emit(MuxEvent::ScaleUpNeeded { utilisation, servers });
        } else if utilisation < self.config.autoscaling.scale_down_threshold
            && servers > self.config.min_servers
        {
            tracing::info!(utilisation, servers, "scale-down signal");
            self.events.emit(MuxEvent::ScaleDownNeeded { utilisation, servers });
        }
    }

    /// Spawn the autoscale evaluation loop (one check per cooldown period).
    pub fn spawn_autoscale_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let period = self.config.cooldown_period();
        let enabled = self.config.autoscaling.enabled;
        tokio::spawn(async move {
            if !enabled {
                return;
            }
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick; scaling decisions want a full
            // cooldown of observations.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.autoscale_check();
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

    /// Drain one server's in-flight requests (bounded) and drop its
    /// connections. The registry record is the caller's to remove.
    pub async fn drain_server(&self, id: &str) {
        let deadline = Instant::now() + REMOVAL_DRAIN;
        loop {
            let active = self.registry.get(id).map(|s| s.active_requests).unwrap_or(0);
            if active == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.connections.lock().expect("connection map lock poisoned").remove(id);
        self.probe_connections.lock().expect("connection map lock poisoned").remove(id);
    }

    /// Graceful shutdown: refuse new work, drain in-flight requests for up
    /// to 30 s, reject whatever is still queued, drop every connection.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.queue.close();

        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while self.total_active() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let leftover = self.queue.drain_all();
        if !leftover.is_empty() {
            tracing::warn!(count = leftover.len(), "rejecting queued requests at shutdown");
        }
        for item in leftover {
            item.complete(Err(MuxError::Shutdown));
        }

        self.connections.lock().expect("connection map lock poisoned").clear();
        self.probe_connections.lock().expect("connection map lock poisoned").clear();
    }
}

#[async_trait]
impl Probe for PoolManager {
    async fn ping(&self, server: &ServerSnapshot) -> Result<Duration, MuxError> {
        let conn = self.probe_connection(server);
        let started = Instant::now();
        let value = {
            let mut conn = conn.lock().await;
            conn.call(METHOD_PING, serde_json::json!({}), self.probe_timeout).await?
        };
        protocol::expect_pong(&server.id, &value)?;
        Ok(started.elapsed())
    }

    async fn fetch_metrics(&self, server: &ServerSnapshot) -> Option<ResourceMetrics> {
        let conn = self.probe_connection(server);
        let value = {
            let mut conn = conn.lock().await;
            conn.call(METHOD_METRICS, serde_json::json!({}), self.probe_timeout).await.ok()?
        };
        serde_json::from_value(value).ok()
    }
}
