//! Server selection strategies.
//!
//! Each strategy is a pure function over an eligible-set snapshot; ties are
//! broken by server id so selection is deterministic under test. The
//! adaptive meta-strategy lives in the parent module because it needs the
//! per-strategy statistics.

use crate::registry::{ServerSnapshot, ServerState};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Strategy identifiers, also used in configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    LeastConnections,
    WeightedResponseTime,
    ResourceAware,
    CapabilityBased,
    Predictive,
    Adaptive,
}

impl StrategyKind {
    /// Base confidence reported for decisions made by this strategy.
    pub fn base_confidence(self) -> f64 {
        match self {
            StrategyKind::RoundRobin => 0.7,
            StrategyKind::LeastConnections => 0.8,
            StrategyKind::WeightedResponseTime => 0.85,
            StrategyKind::ResourceAware => 0.9,
            StrategyKind::CapabilityBased => 0.85,
            StrategyKind::Predictive => 0.7,
            StrategyKind::Adaptive => 0.7,
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::LeastConnections => "least_connections",
            StrategyKind::WeightedResponseTime => "weighted_response_time",
            StrategyKind::ResourceAware => "resource_aware",
            StrategyKind::CapabilityBased => "capability_based",
            StrategyKind::Predictive => "predictive",
            StrategyKind::Adaptive => "adaptive",
        };
        f.write_str(name)
    }
}

/// Per-call inputs a strategy may consult beyond the snapshot itself.
#[derive(Debug, Clone)]
pub struct SelectionContext {
    pub required_capabilities: BTreeSet<String>,
    pub response_time_ceiling: Duration,
    pub max_requests_per_server: usize,
}

impl SelectionContext {
    pub fn new(response_time_ceiling: Duration, max_requests_per_server: usize) -> Self {
        Self {
            required_capabilities: BTreeSet::new(),
            response_time_ceiling: response_time_ceiling.max(Duration::from_millis(1)),
            max_requests_per_server: max_requests_per_server.max(1),
        }
    }

    pub fn with_capabilities(mut self, caps: BTreeSet<String>) -> Self {
        self.required_capabilities = caps;
        self
    }
}

/// Health weighting shared by the scoring strategies and the router.
pub(crate) fn health_score(state: ServerState) -> f64 {
    match state {
        ServerState::Healthy => 1.0,
        ServerState::Degraded => 0.6,
        ServerState::Unhealthy => 0.1,
        ServerState::Initializing => 0.0,
    }
}

/// Pick by the given non-adaptive strategy. Returns the chosen server id
/// and the decision confidence, or `None` on an empty eligible set.
pub(crate) fn select_with(
    kind: StrategyKind,
    eligible: &[ServerSnapshot],
    ctx: &SelectionContext,
    round_robin_counter: &AtomicUsize,
) -> Option<(String, f64)> {
    if eligible.is_empty() {
        return None;
    }
    match kind {
        StrategyKind::RoundRobin => round_robin(eligible, round_robin_counter),
        StrategyKind::LeastConnections => least_connections(eligible),
        StrategyKind::WeightedResponseTime => weighted_response_time(eligible, ctx),
        StrategyKind::ResourceAware => resource_aware(eligible, ctx),
        StrategyKind::CapabilityBased => capability_based(eligible, ctx),
        StrategyKind::Predictive => predictive(eligible, ctx),
        // Adaptive is resolved by the balancer before reaching here.
        StrategyKind::Adaptive => least_connections(eligible),
    }
}

fn round_robin(eligible: &[ServerSnapshot], counter: &AtomicUsize) -> Option<(String, f64)> {
    let idx = counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
    Some((eligible[idx].id.clone(), StrategyKind::RoundRobin.base_confidence()))
}

fn least_connections(eligible: &[ServerSnapshot]) -> Option<(String, f64)> {
    eligible
        .iter()
        .min_by(|a, b| {
            a.active_requests
                .cmp(&b.active_requests)
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|s| (s.id.clone(), StrategyKind::LeastConnections.base_confidence()))
}

fn weighted_response_time(
    eligible: &[ServerSnapshot],
    _ctx: &SelectionContext,
) -> Option<(String, f64)> {
    argmax(eligible, |s| {
        // A server with no latency history scores as if it answered in 1 ms.
        let avg_secs = s.avg_response_time.as_secs_f64().max(0.001);
        let health = if s.state == ServerState::Healthy { 1.0 } else { 0.5 };
        (1.0 / avg_secs) * (1.0 / (1.0 + s.load_score)) * health
    })
    .map(|id| (id, StrategyKind::WeightedResponseTime.base_confidence()))
}

fn resource_aware(eligible: &[ServerSnapshot], ctx: &SelectionContext) -> Option<(String, f64)> {
    argmax(eligible, |s| {
        let cpu = s.resources.cpu_usage.unwrap_or(0.5).clamp(0.0, 1.0);
        let mem = s.resources.memory_usage.unwrap_or(0.5).clamp(0.0, 1.0);
        let utilisation =
            (s.active_requests as f64 / ctx.max_requests_per_server as f64).clamp(0.0, 1.0);
        0.3 * (1.0 - cpu) + 0.3 * (1.0 - mem) + 0.3 * (1.0 - utilisation)
            + 0.1 * health_score(s.state)
    })
    .map(|id| (id, StrategyKind::ResourceAware.base_confidence()))
}

fn capability_based(eligible: &[ServerSnapshot], ctx: &SelectionContext) -> Option<(String, f64)> {
    let capable: Vec<&ServerSnapshot> = eligible
        .iter()
        .filter(|s| s.has_capabilities(&ctx.required_capabilities))
        .collect();

    if capable.is_empty() {
        // No server advertises the full set; fall back to least connections
        // over the unfiltered eligible set, at reduced confidence.
        return least_connections(eligible).map(|(id, _)| (id, 0.7));
    }

    capable
        .iter()
        .map(|s| {
            let breadth = (s.capabilities.len() as f64 / 10.0).min(1.0);
            let score = 0.3 * breadth + 0.7 * (1.0 - s.load_score);
            (s.id.clone(), score)
        })
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.0.cmp(&a.0)))
        .map(|(id, _)| (id, StrategyKind::CapabilityBased.base_confidence()))
}

fn predictive(eligible: &[ServerSnapshot], ctx: &SelectionContext) -> Option<(String, f64)> {
    let ceiling = ctx.response_time_ceiling.as_secs_f64();
    argmax(eligible, |s| {
        let predicted = s.avg_response_time.as_secs_f64() * (1.0 + 0.3 * s.load_score);
        0.6 * (1.0 - (predicted / ceiling).min(1.0)) + 0.4 * s.server_success_rate
    })
    .map(|id| (id, StrategyKind::Predictive.base_confidence()))
}

/// Argmax over a score function; equal scores resolve to the lowest id.
fn argmax<F>(eligible: &[ServerSnapshot], score: F) -> Option<String>
where
    F: Fn(&ServerSnapshot) -> f64,
{
    eligible
        .iter()
        .map(|s| (s, score(s)))
        .max_by(|(a, sa), (b, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|(s, _)| s.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServerRegistry;
    use crate::types::ServerConfig;
    use std::sync::Arc;

    fn snapshots(n: u16) -> Vec<ServerSnapshot> {
        let registry = Arc::new(ServerRegistry::new(10, Duration::from_secs(5)));
        for port in 0..n {
            registry.add(ServerConfig::new("localhost", 3001 + port)).unwrap();
            registry.update(&format!("localhost:{}", 3001 + port), |r| {
                r.state = ServerState::Healthy;
            });
        }
        registry.snapshot()
    }

    fn ctx() -> SelectionContext {
        SelectionContext::new(Duration::from_secs(5), 10)
    }

    #[test]
    fn round_robin_cycles_through_servers() {
        let servers = snapshots(3);
        let counter = AtomicUsize::new(0);

        let picks: Vec<String> = (0..6)
            .map(|_| {
                select_with(StrategyKind::RoundRobin, &servers, &ctx(), &counter).unwrap().0
            })
            .collect();
        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_ne!(picks[0], picks[1]);
        assert_ne!(picks[1], picks[2]);
    }

    #[test]
    fn least_connections_picks_idle_server_with_id_tiebreak() {
        let mut servers = snapshots(3);
        servers[0].active_requests = 3;
        servers[1].active_requests = 1;
        servers[2].active_requests = 1;

        let counter = AtomicUsize::new(0);
        let (id, confidence) =
            select_with(StrategyKind::LeastConnections, &servers, &ctx(), &counter).unwrap();
        assert_eq!(id, "localhost:3002", "tie resolves to the lower id");
        assert!((confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn weighted_response_time_prefers_fast_servers() {
        let mut servers = snapshots(2);
        servers[0].avg_response_time = Duration::from_millis(500);
        servers[1].avg_response_time = Duration::from_millis(50);

        let counter = AtomicUsize::new(0);
        let (id, _) =
            select_with(StrategyKind::WeightedResponseTime, &servers, &ctx(), &counter).unwrap();
        assert_eq!(id, "localhost:3002");
    }

    #[test]
    fn weighted_response_time_penalises_degraded_state() {
        let mut servers = snapshots(2);
        servers[0].avg_response_time = Duration::from_millis(100);
        servers[1].avg_response_time = Duration::from_millis(100);
        servers[0].state = ServerState::Degraded;

        let counter = AtomicUsize::new(0);
        let (id, _) =
            select_with(StrategyKind::WeightedResponseTime, &servers, &ctx(), &counter).unwrap();
        assert_eq!(id, "localhost:3002");
    }

    #[test]
    fn resource_aware_avoids_loaded_cpu() {
        let mut servers = snapshots(2);
        servers[0].resources.cpu_usage = Some(0.95);
        servers[1].resources.cpu_usage = Some(0.10);

        let counter = AtomicUsize::new(0);
        let (id, confidence) =
            select_with(StrategyKind::ResourceAware, &servers, &ctx(), &counter).unwrap();
        assert_eq!(id, "localhost:3002");
        assert!((confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn capability_based_filters_to_superset_holders() {
        let registry = Arc::new(ServerRegistry::new(10, Duration::from_secs(5)));
        registry
            .add(ServerConfig::new("localhost", 3001).with_capabilities(["vector_search"]))
            .unwrap();
        registry
            .add(ServerConfig::new("localhost", 3002).with_capabilities(["graph_query"]))
            .unwrap();
        for id in registry.ids() {
            registry.update(&id, |r| r.state = ServerState::Healthy);
        }
        let servers = registry.snapshot();

        let mut required = BTreeSet::new();
        required.insert("graph_query".to_string());
        let ctx = ctx().with_capabilities(required);

        let counter = AtomicUsize::new(0);
        let (id, confidence) =
            select_with(StrategyKind::CapabilityBased, &servers, &ctx, &counter).unwrap();
        assert_eq!(id, "localhost:3002");
        assert!((confidence - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn capability_based_falls_back_when_nothing_matches() {
        let servers = snapshots(2);
        let mut required = BTreeSet::new();
        required.insert("nonexistent".to_string());
        let ctx = ctx().with_capabilities(required);

        let counter = AtomicUsize::new(0);
        let (id, confidence) =
            select_with(StrategyKind::CapabilityBased, &servers, &ctx, &counter).unwrap();
        assert_eq!(id, "localhost:3001", "least-connections over the unfiltered set");
        assert!(confidence < 0.85, "fallback reduces confidence");
    }

    #[test]
    fn predictive_blends_latency_and_success_rate() {
        let mut servers = snapshots(2);
        // Fast but failing vs. slower but reliable.
        servers[0].avg_response_time = Duration::from_millis(50);
        servers[0].server_success_rate = 0.2;
        servers[1].avg_response_time = Duration::from_millis(300);
        servers[1].server_success_rate = 1.0;

        let counter = AtomicUsize::new(0);
        let (id, _) = select_with(StrategyKind::Predictive, &servers, &ctx(), &counter).unwrap();
        assert_eq!(id, "localhost:3002");
    }

    #[test]
    fn empty_eligible_set_returns_none() {
        let counter = AtomicUsize::new(0);
        assert!(select_with(StrategyKind::RoundRobin, &[], &ctx(), &counter).is_none());
    }

    #[test]
    fn strategy_kind_serde_names() {
        assert_eq!(
            serde_json::to_string(&StrategyKind::WeightedResponseTime).unwrap(),
            "\"weighted_response_time\""
        );
        let kind: StrategyKind = serde_json::from_str("\"resource_aware\"").unwrap();
        assert_eq!(kind, StrategyKind::ResourceAware);
    }
}
