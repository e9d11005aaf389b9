//! Server registry: the source of truth for backend server records.
//!
//! All mutations are serialised behind one lock; readers take immutable
//! snapshots so that long scoring loops never observe partial updates.
//! Pool sizes are small (≤ 32), so copy-on-read is the simple and correct
//! trade.

use crate::error::MuxError;
use crate::types::{ResourceMetrics, ServerConfig};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Liveness state of one backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ServerState {
    /// Registered but not yet probed.
    Initializing,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Mutable per-server record. Counters are written only by the pool manager
/// and the health monitor, through [`ServerRegistry::update`].
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub config: ServerConfig,
    pub state: ServerState,
    pub active_requests: usize,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_health_check: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    /// Exponential moving average, α = 0.1.
    pub avg_response_time: Duration,
    pub resources: ResourceMetrics,
    pub registered_at: Instant,
}

impl ServerRecord {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: ServerState::Initializing,
            active_requests: 0,
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_health_check: None,
            last_success: None,
            last_failure: None,
            avg_response_time: Duration::ZERO,
            resources: ResourceMetrics::default(),
            registered_at: Instant::now(),
        }
    }

    pub fn id(&self) -> String {
        self.config.id()
    }

    /// Lifetime success ratio. A server with no history counts as perfect
    /// so that fresh servers are not excluded before their first request.
    pub fn server_success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.success_count as f64 / self.total_requests as f64
        }
    }

    /// Fold one request outcome into the counters and the latency EMA.
    pub fn record_outcome(&mut self, success: bool, response_time: Duration) {
        self.total_requests += 1;
        if success {
            self.success_count += 1;
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.last_success = Some(Instant::now());
        } else {
            self.failure_count += 1;
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            self.last_failure = Some(Instant::now());
        }

        if self.total_requests == 1 {
            self.avg_response_time = response_time;
        } else {
            let alpha = 0.1;
            let prev = self.avg_response_time.as_secs_f64();
            let next = prev * (1.0 - alpha) + response_time.as_secs_f64() * alpha;
            self.avg_response_time = Duration::from_secs_f64(next);
        }
    }
}

/// Immutable view of one server, produced by [`ServerRegistry::snapshot`].
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub capabilities: BTreeSet<String>,
    pub state: ServerState,
    pub active_requests: usize,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub avg_response_time: Duration,
    pub server_success_rate: f64,
    /// Derived utilisation/latency/failure score in `[0, 1]`; lower is better.
    pub load_score: f64,
    pub resources: ResourceMetrics,
    pub uptime: Duration,
}

impl ServerSnapshot {
    /// Whether this server may be handed a request, ignoring the circuit
    /// breaker (the health monitor layers that on separately).
    pub fn is_eligible(&self, max_requests_per_server: usize, circuit_breaker_threshold: f64) -> bool {
        matches!(self.state, ServerState::Healthy | ServerState::Degraded)
            && self.server_success_rate >= circuit_breaker_threshold
            && self.active_requests < max_requests_per_server
    }

    /// Whether this server advertises every capability in `required`.
    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Scoring inputs fixed at registry construction.
#[derive(Debug, Clone, Copy)]
struct ScoringLimits {
    max_requests_per_server: usize,
    response_time_ceiling: Duration,
}

/// Registry of backend servers.
#[derive(Debug)]
pub struct ServerRegistry {
    records: RwLock<HashMap<String, ServerRecord>>,
    limits: ScoringLimits,
}

impl ServerRegistry {
    pub fn new(max_requests_per_server: usize, response_time_ceiling: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            limits: ScoringLimits {
                max_requests_per_server: max_requests_per_server.max(1),
                response_time_ceiling: response_time_ceiling.max(Duration::from_millis(1)),
            },
        }
    }

    /// Register a server in `Initializing`. Duplicate ids are rejected.
    pub fn add(&self, config: ServerConfig) -> Result<(), MuxError> {
        let id = config.id();
        let mut records = self.records.write().expect("registry lock poisoned");
        if records.contains_key(&id) {
            return Err(MuxError::Configuration(format!("duplicate server id: {id}")));
        }
        records.insert(id, ServerRecord::new(config));
        Ok(())
    }

    /// Remove a server record. Connection teardown happens in the pool.
    pub fn remove(&self, id: &str) -> Result<ServerConfig, MuxError> {
        let mut records = self.records.write().expect("registry lock poisoned");
        records
            .remove(id)
            .map(|r| r.config)
            .ok_or_else(|| MuxError::Configuration(format!("unknown server id: {id}")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.read().expect("registry lock poisoned").contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> =
            self.records.read().expect("registry lock poisoned").keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Serialised in-place mutation. Returns false for unknown ids.
    pub fn update<F>(&self, id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut ServerRecord),
    {
        let mut records = self.records.write().expect("registry lock poisoned");
        match records.get_mut(id) {
            Some(record) => {
                mutate(record);
                true
            }
            None => false,
        }
    }

    /// Immutable copy of the current set, ordered by id for determinism.
    pub fn snapshot(&self) -> Vec<ServerSnapshot> {
        let records = self.records.read().expect("registry lock poisoned");
        let mut snaps: Vec<ServerSnapshot> =
            records.values().map(|r| self.snap_one(r)).collect();
        snaps.sort_by(|a, b| a.id.cmp(&b.id));
        snaps
    }

    /// Snapshot of a single server.
    pub fn get(&self, id: &str) -> Option<ServerSnapshot> {
        let records = self.records.read().expect("registry lock poisoned");
        records.get(id).map(|r| self.snap_one(r))
    }

    fn snap_one(&self, record: &ServerRecord) -> ServerSnapshot {
        let utilisation =
            record.active_requests as f64 / self.limits.max_requests_per_server as f64;
        let latency_ratio = (record.avg_response_time.as_secs_f64()
            / self.limits.response_time_ceiling.as_secs_f64())
        .min(1.0);
        let failure_ratio = 1.0 - record.server_success_rate();
        let load_score =
            (0.5 * utilisation.min(1.0) + 0.3 * latency_ratio + 0.2 * failure_ratio).clamp(0.0, 1.0);

        ServerSnapshot {
            id: record.id(),
            host: record.config.host.clone(),
            port: record.config.port,
            capabilities: record.config.capabilities.iter().cloned().collect(),
            state: record.state,
            active_requests: record.active_requests,
            total_requests: record.total_requests,
            success_count: record.success_count,
            failure_count: record.failure_count,
            consecutive_failures: record.consecutive_failures,
            consecutive_successes: record.consecutive_successes,
            avg_response_time: record.avg_response_time,
            server_success_rate: record.server_success_rate(),
            load_score,
            resources: record.resources,
            uptime: record.registered_at.elapsed(),
        }
    }

    /// Reserve one in-flight slot on `id`. Fails when the server is unknown
    /// or already at `max_requests_per_server`; on success the returned
    /// guard releases the slot on every exit path.
    pub fn begin_request(self: &Arc<Self>, id: &str) -> Result<ActiveGuard, MuxError> {
        let mut records = self.records.write().expect("registry lock poisoned");
        let record = records.get_mut(id).ok_or_else(|| MuxError::NoServersAvailable {
            reason: format!("server {id} is no longer registered"),
        })?;
        if record.active_requests >= self.limits.max_requests_per_server {
            return Err(MuxError::NoServersAvailable {
                reason: format!("server {id} is at capacity"),
            });
        }
        record.active_requests += 1;
        Ok(ActiveGuard { registry: Arc::clone(self), id: id.to_string() })
    }

    fn release_request(&self, id: &str) {
        self.update(id, |record| {
            record.active_requests = record.active_requests.saturating_sub(1);
        });
    }

    /// Sum of free request slots across the given eligible servers.
    pub fn available_capacity(&self, eligible_ids: &[String]) -> usize {
        let records = self.records.read().expect("registry lock poisoned");
        eligible_ids
            .iter()
            .filter_map(|id| records.get(id))
            .map(|r| self.limits.max_requests_per_server.saturating_sub(r.active_requests))
            .sum()
    }
}

/// RAII guard for one in-flight request slot.
#[derive(Debug)]
pub struct ActiveGuard {
    registry: Arc<ServerRegistry>,
    id: String,
}

impl ActiveGuard {
    pub fn server_id(&self) -> &str {
        &self.id
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.registry.release_request(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Arc<ServerRegistry> {
        Arc::new(ServerRegistry::new(2, Duration::from_secs(5)))
    }

    fn cfg(port: u16) -> ServerConfig {
        ServerConfig::new("localhost", port)
    }

    #[test]
    fn add_and_snapshot_starts_initializing() {
        let registry = test_registry();
        registry.add(cfg(3001)).unwrap();

        let snaps = registry.snapshot();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].id, "localhost:3001");
        assert_eq!(snaps[0].state, ServerState::Initializing);
        assert_eq!(snaps[0].server_success_rate, 1.0);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let registry = test_registry();
        registry.add(cfg(3001)).unwrap();
        let err = registry.add(cfg(3001)).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn remove_unknown_id_fails() {
        let registry = test_registry();
        assert!(registry.remove("localhost:9999").is_err());
    }

    #[test]
    fn snapshot_is_ordered_by_id() {
        let registry = test_registry();
        registry.add(cfg(3003)).unwrap();
        registry.add(cfg(3001)).unwrap();
        registry.add(cfg(3002)).unwrap();

        let ids: Vec<String> = registry.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["localhost:3001", "localhost:3002", "localhost:3003"]);
    }

    #[test]
    fn active_guard_releases_on_drop() {
        let registry = test_registry();
        registry.add(cfg(3001)).unwrap();

        let guard = registry.begin_request("localhost:3001").unwrap();
        assert_eq!(registry.get("localhost:3001").unwrap().active_requests, 1);
        drop(guard);
        assert_eq!(registry.get("localhost:3001").unwrap().active_requests, 0);
    }

    #[test]
    fn begin_request_enforces_capacity() {
        let registry = test_registry();
        registry.add(cfg(3001)).unwrap();

        let _a = registry.begin_request("localhost:3001").unwrap();
        let _b = registry.begin_request("localhost:3001").unwrap();
        let err = registry.begin_request("localhost:3001").unwrap_err();
        assert!(err.is_no_servers());
    }

    #[test]
    fn outcome_counters_stay_consistent() {
        let registry = test_registry();
        registry.add(cfg(3001)).unwrap();

        registry.update("localhost:3001", |r| r.record_outcome(true, Duration::from_millis(100)));
        registry.update("localhost:3001", |r| r.record_outcome(false, Duration::from_millis(200)));
        registry.update("localhost:3001", |r| r.record_outcome(true, Duration::from_millis(100)));

        let snap = registry.get("localhost:3001").unwrap();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.success_count + snap.failure_count, snap.total_requests);
        assert_eq!(snap.consecutive_successes, 1);
        assert_eq!(snap.consecutive_failures, 0);
        assert!((snap.server_success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn ema_tracks_toward_new_latency() {
        let mut record = ServerRecord::new(cfg(3001));
        record.record_outcome(true, Duration::from_millis(100));
        assert_eq!(record.avg_response_time, Duration::from_millis(100));

        record.record_outcome(true, Duration::from_millis(200));
        // 100 * 0.9 + 200 * 0.1 = 110
        assert_eq!(record.avg_response_time.as_millis(), 110);
    }

    #[test]
    fn eligibility_requires_state_and_headroom() {
        let registry = test_registry();
        registry.add(cfg(3001)).unwrap();

        let snap = registry.get("localhost:3001").unwrap();
        assert!(!snap.is_eligible(2, 0.3), "initializing servers are not eligible");

        registry.update("localhost:3001", |r| r.state = ServerState::Healthy);
        assert!(registry.get("localhost:3001").unwrap().is_eligible(2, 0.3));

        let _a = registry.begin_request("localhost:3001").unwrap();
        let _b = registry.begin_request("localhost:3001").unwrap();
        assert!(
            !registry.get("localhost:3001").unwrap().is_eligible(2, 0.3),
            "a full server is not eligible"
        );
    }

    #[test]
    fn load_score_grows_with_utilisation() {
        let registry = test_registry();
        registry.add(cfg(3001)).unwrap();
        registry.update("localhost:3001", |r| r.state = ServerState::Healthy);

        let idle = registry.get("localhost:3001").unwrap().load_score;
        let _guard = registry.begin_request("localhost:3001").unwrap();
        let busy = registry.get("localhost:3001").unwrap().load_score;
        assert!(busy > idle);
    }

    #[test]
    fn available_capacity_sums_free_slots() {
        let registry = test_registry();
        registry.add(cfg(3001)).unwrap();
        registry.add(cfg(3002)).unwrap();

        let ids = registry.ids();
        assert_eq!(registry.available_capacity(&ids), 4);

        let _guard = registry.begin_request("localhost:3001").unwrap();
        assert_eq!(registry.available_capacity(&ids), 3);
    }

    #[test]
    fn capability_superset_check() {
        let registry = test_registry();
        registry
            .add(cfg(3001).with_capabilities(["vector_search", "graph_query"]))
            .unwrap();

        let snap = registry.get("localhost:3001").unwrap();
        let mut required = BTreeSet::new();
        required.insert("vector_search".to_string());
        assert!(snap.has_capabilities(&required));

        required.insert("advanced_processing".to_string());
        assert!(!snap.has_capabilities(&required));
    }
}
