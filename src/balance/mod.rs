//! Load balancer: strategy dispatch, per-strategy effectiveness tracking,
//! and the self-adapting strategy switch.
//!
//! Two success signals live near each other here and must not be mixed:
//! `strategy_effectiveness` is the per-strategy EMA blend that drives
//! adaptation; `server_success_rate` is the per-server lifetime ratio kept
//! by the registry and only read by scoring.

mod strategies;

pub use strategies::{SelectionContext, StrategyKind};
pub(crate) use strategies::health_score;

use crate::config::BalanceConfig;
use crate::error::MuxError;
use crate::events::{EventBus, MuxEvent};
use crate::registry::ServerSnapshot;
use arc_swap::ArcSwap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Decisions kept for trend analysis, per strategy.
const TREND_WINDOW: usize = 50;
/// Decisions a strategy must have before adaptation will consider it.
const MIN_DECISIONS_FOR_ADAPTATION: u64 = 10;
/// Effectiveness a strategy must reach before adaptation switches to it.
const ADAPTATION_EFFECTIVENESS_FLOOR: f64 = 0.8;
/// Sub-strategies the adaptive meta-strategy arbitrates between.
const ADAPTIVE_CANDIDATES: [StrategyKind; 3] = [
    StrategyKind::LeastConnections,
    StrategyKind::WeightedResponseTime,
    StrategyKind::ResourceAware,
];

/// Direction a strategy's recent success rate is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// One selection outcome, fed back through [`LoadBalancer::record_outcome`].
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceDecision {
    pub server_id: String,
    pub strategy: StrategyKind,
    pub confidence: f64,
}

/// Rolling statistics for one strategy.
#[derive(Debug, Default)]
struct StrategyStats {
    total_decisions: u64,
    successful_decisions: u64,
    /// EMA, α = 0.1.
    avg_response_time: Duration,
    recent: VecDeque<bool>,
}

impl StrategyStats {
    fn record(&mut self, success: bool, response_time: Duration) {
        self.total_decisions += 1;
        if success {
            self.successful_decisions += 1;
        }
        if self.total_decisions == 1 {
            self.avg_response_time = response_time;
        } else {
            let alpha = 0.1;
            let prev = self.avg_response_time.as_secs_f64();
            self.avg_response_time =
                Duration::from_secs_f64(prev * (1.0 - alpha) + response_time.as_secs_f64() * alpha);
        }
        if self.recent.len() >= TREND_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
    }

    fn success_rate(&self) -> f64 {
        if self.total_decisions == 0 {
            0.0
        } else {
            self.successful_decisions as f64 / self.total_decisions as f64
        }
    }

    /// `strategy_effectiveness`: the adaptation signal. A strategy with no
    /// observations sits at a neutral 0.5 prior.
    fn effectiveness(&self, rt_ceiling: Duration) -> f64 {
        if self.total_decisions == 0 {
            return 0.5;
        }
        let latency_part =
            (1.0 - self.avg_response_time.as_secs_f64() / rt_ceiling.as_secs_f64()).max(0.0);
        0.7 * self.success_rate() + 0.3 * latency_part
    }

    fn trend(&self) -> Trend {
        if self.recent.len() < 10 {
            return Trend::Stable;
        }
        let half = self.recent.len() / 2;
        let rate = |slice: &[bool]| {
            slice.iter().filter(|&&s| s).count() as f64 / slice.len() as f64
        };
        let (older, newer) = {
            let v: Vec<bool> = self.recent.iter().copied().collect();
            (rate(&v[..half]), rate(&v[half..]))
        };
        if newer > older + 0.05 {
            Trend::Improving
        } else if newer < older - 0.05 {
            Trend::Degrading
        } else {
            Trend::Stable
        }
    }
}

/// Public view of one strategy's statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StrategyReport {
    pub strategy: StrategyKind,
    pub total_decisions: u64,
    pub successful_decisions: u64,
    pub avg_response_time_ms: u64,
    pub effectiveness: f64,
    pub trend: Trend,
}

/// Stateless-per-call server selector with adaptive strategy switching.
pub struct LoadBalancer {
    active: ArcSwap<StrategyKind>,
    adaptive_enabled: bool,
    rt_ceiling: Duration,
    adaptation_interval: Duration,
    stats: Mutex<HashMap<StrategyKind, StrategyStats>>,
    round_robin_counter: AtomicUsize,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("active", &self.current_strategy())
            .field("adaptive_enabled", &self.adaptive_enabled)
            .finish()
    }
}

impl LoadBalancer {
    pub fn new(config: &BalanceConfig, events: Arc<EventBus>) -> Self {
        Self {
            active: ArcSwap::from_pointee(config.strategy),
            adaptive_enabled: config.adaptive_enabled,
            rt_ceiling: config.response_time_ceiling(),
            adaptation_interval: config.adaptation_interval(),
            stats: Mutex::new(HashMap::new()),
            round_robin_counter: AtomicUsize::new(0),
            events,
        }
    }

    /// Strategy currently answering selections.
    pub fn current_strategy(&self) -> StrategyKind {
        **self.active.load()
    }

    /// Pick one server from the eligible set.
    pub fn select(
        &self,
        eligible: &[ServerSnapshot],
        ctx: &SelectionContext,
    ) -> Result<BalanceDecision, MuxError> {
        if eligible.is_empty() {
            return Err(MuxError::NoServersAvailable {
                reason: "eligible set is empty".into(),
            });
        }

        self.select_with_strategy(self.current_strategy(), eligible, ctx)
    }

    /// Pick one server using an explicit strategy (rules override the
    /// active one).
    pub fn select_with_strategy(
        &self,
        kind: StrategyKind,
        eligible: &[ServerSnapshot],
        ctx: &SelectionContext,
    ) -> Result<BalanceDecision, MuxError> {
        if eligible.is_empty() {
            return Err(MuxError::NoServersAvailable {
                reason: "eligible set is empty".into(),
            });
        }
        let decision = if kind == StrategyKind::Adaptive {
            self.adaptive_select(eligible, ctx)
        } else {
            strategies::select_with(kind, eligible, ctx, &self.round_robin_counter).map(
                |(server_id, confidence)| BalanceDecision {
                    server_id,
                    strategy: kind,
                    confidence,
                },
            )
        };

        decision.ok_or_else(|| MuxError::NoServersAvailable {
            reason: "strategy produced no candidate".into(),
        })
    }

    /// The adaptive meta-strategy: delegate to whichever candidate strategy
    /// currently tracks the highest `strategy_effectiveness`.
    fn adaptive_select(
        &self,
        eligible: &[ServerSnapshot],
        ctx: &SelectionContext,
    ) -> Option<BalanceDecision> {
        let best = {
            let stats = self.stats.lock().expect("balance stats lock poisoned");
            ADAPTIVE_CANDIDATES
                .into_iter()
                .map(|kind| {
                    let eff = stats
                        .get(&kind)
                        .map(|s| s.effectiveness(self.rt_ceiling))
                        .unwrap_or(0.5);
                    (kind, eff)
                })
                .max_by(|a, b| {
                    a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
                })?
        };

        let (kind, effectiveness) = best;
        strategies::select_with(kind, eligible, ctx, &self.round_robin_counter).map(
            |(server_id, confidence)| BalanceDecision {
                server_id,
                strategy: kind,
                confidence: (confidence * effectiveness).clamp(0.0, 1.0),
            },
        )
    }

    /// Feed one request outcome back into the deciding strategy's stats.
    pub fn record_outcome(&self, decision: &BalanceDecision, success: bool, response_time: Duration) {
        let mut stats = self.stats.lock().expect("balance stats lock poisoned");
        stats.entry(decision.strategy).or_default().record(success, response_time);
    }

    /// One adaptation pass: switch to a proven better strategy, if any.
    /// Returns the switch that happened, if one did.
    pub fn adapt(&self) -> Option<(StrategyKind, StrategyKind)> {
        let current = self.current_strategy();
        let candidate = {
            let stats = self.stats.lock().expect("balance stats lock poisoned");
            stats
                .iter()
                .filter(|(kind, s)| {
                    **kind != current
                        && s.total_decisions >= MIN_DECISIONS_FOR_ADAPTATION
                        && s.effectiveness(self.rt_ceiling) >= ADAPTATION_EFFECTIVENESS_FLOOR
                })
                .max_by(|a, b| {
                    a.1.effectiveness(self.rt_ceiling)
                        .partial_cmp(&b.1.effectiveness(self.rt_ceiling))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(kind, _)| *kind)
        }?;

        self.active.store(Arc::new(candidate));
        tracing::info!(from = %current, to = %candidate, "load balancing strategy switched");
        self.events.emit(MuxEvent::StrategyChanged { from: current, to: candidate });
        Some((current, candidate))
    }

    /// Statistics for every strategy that has made at least one decision.
    pub fn strategy_reports(&self) -> Vec<StrategyReport> {
        let stats = self.stats.lock().expect("balance stats lock poisoned");
        let mut reports: Vec<StrategyReport> = stats
            .iter()
            .map(|(kind, s)| StrategyReport {
                strategy: *kind,
                total_decisions: s.total_decisions,
                successful_decisions: s.successful_decisions,
                avg_response_time_ms: s.avg_response_time.as_millis() as u64,
                effectiveness: s.effectiveness(self.rt_ceiling),
                trend: s.trend(),
            })
            .collect();
        reports.sort_by_key(|r| r.strategy.to_string());
        reports
    }

    /// Spawn the periodic adaptation loop. No-op task when adaptation is
    /// disabled in configuration.
    pub fn spawn_adaptation_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let interval = self.adaptation_interval;
        let enabled = self.adaptive_enabled;
        tokio::spawn(async move {
            if !enabled {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.adapt();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ServerRegistry, ServerState};
    use crate::types::ServerConfig;

    fn balancer(strategy: StrategyKind) -> LoadBalancer {
        let config = BalanceConfig {
            strategy,
            adaptive_enabled: true,
            adaptation_interval_ms: 60_000,
            ..BalanceConfig::default()
        };
        LoadBalancer::new(&config, Arc::new(EventBus::new()))
    }

    fn eligible(n: u16) -> Vec<ServerSnapshot> {
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

    fn drive(balancer: &LoadBalancer, strategy: StrategyKind, successes: usize, failures: usize) {
        let decision = BalanceDecision {
            server_id: "localhost:3001".into(),
            strategy,
            confidence: 0.8,
        };
        for _ in 0..successes {
            balancer.record_outcome(&decision, true, Duration::from_millis(50));
        }
        for _ in 0..failures {
            balancer.record_outcome(&decision, false, Duration::from_millis(50));
        }
    }

    #[test]
    fn empty_set_is_no_servers_available() {
        let lb = balancer(StrategyKind::RoundRobin);
        let err = lb.select(&[], &ctx()).unwrap_err();
        assert!(err.is_no_servers());
    }

    #[test]
    fn select_reports_the_deciding_strategy() {
        let lb = balancer(StrategyKind::LeastConnections);
        let decision = lb.select(&eligible(2), &ctx()).unwrap();
        assert_eq!(decision.strategy, StrategyKind::LeastConnections);
        assert!((decision.confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn adaptive_delegates_to_most_effective_candidate() {
        let lb = balancer(StrategyKind::Adaptive);

        // Make ResourceAware clearly the best-tracked candidate.
        drive(&lb, StrategyKind::ResourceAware, 20, 0);
        drive(&lb, StrategyKind::LeastConnections, 2, 18);

        let decision = lb.select(&eligible(2), &ctx()).unwrap();
        assert_eq!(decision.strategy, StrategyKind::ResourceAware);
        assert!(
            decision.confidence <= 0.9,
            "confidence is scaled by effectiveness"
        );
    }

    #[test]
    fn adaptation_switches_to_proven_strategy() {
        let lb = balancer(StrategyKind::WeightedResponseTime);
        drive(&lb, StrategyKind::LeastConnections, 20, 0);

        let switched = lb.adapt().expect("should switch");
        assert_eq!(switched, (StrategyKind::WeightedResponseTime, StrategyKind::LeastConnections));
        assert_eq!(lb.current_strategy(), StrategyKind::LeastConnections);
    }

    #[test]
    fn adaptation_ignores_thin_evidence() {
        let lb = balancer(StrategyKind::WeightedResponseTime);
        drive(&lb, StrategyKind::LeastConnections, 5, 0);
        assert!(lb.adapt().is_none(), "fewer than {MIN_DECISIONS_FOR_ADAPTATION} decisions");
        assert_eq!(lb.current_strategy(), StrategyKind::WeightedResponseTime);
    }

    #[test]
    fn adaptation_ignores_weak_strategies() {
        let lb = balancer(StrategyKind::WeightedResponseTime);
        drive(&lb, StrategyKind::LeastConnections, 6, 6);
        assert!(lb.adapt().is_none(), "effectiveness below the floor");
    }

    #[test]
    fn adaptation_emits_strategy_changed_event() {
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            events
                .subscribe(
                    crate::events::EventKind::StrategyChanged,
                    Arc::new(move |_| {
                        seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }
        let config = BalanceConfig {
            strategy: StrategyKind::RoundRobin,
            ..BalanceConfig::default()
        };
        let lb = LoadBalancer::new(&config, events);
        drive(&lb, StrategyKind::LeastConnections, 20, 0);
        lb.adapt();
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn effectiveness_is_monotonic_in_success_rate() {
        let rt_ceiling = Duration::from_secs(5);
        let mut weak = StrategyStats::default();
        let mut strong = StrategyStats::default();
        for i in 0..20 {
            weak.record(i % 2 == 0, Duration::from_millis(100));
            strong.record(true, Duration::from_millis(100));
        }
        assert!(strong.effectiveness(rt_ceiling) > weak.effectiveness(rt_ceiling));
    }

    #[test]
    fn trend_detects_improvement() {
        let mut stats = StrategyStats::default();
        for _ in 0..20 {
            stats.record(false, Duration::from_millis(50));
        }
        for _ in 0..20 {
            stats.record(true, Duration::from_millis(50));
        }
        assert_eq!(stats.trend(), Trend::Improving);
    }

    #[test]
    fn trend_detects_degradation() {
        let mut stats = StrategyStats::default();
        for _ in 0..20 {
            stats.record(true, Duration::from_millis(50));
        }
        for _ in 0..20 {
            stats.record(false, Duration::from_millis(50));
        }
        assert_eq!(stats.trend(), Trend::Degrading);
    }

    #[test]
    fn trend_is_stable_with_little_data() {
        let mut stats = StrategyStats::default();
        for _ in 0..5 {
            stats.record(true, Duration::from_millis(50));
        }
        assert_eq!(stats.trend(), Trend::Stable);
    }

    #[test]
    fn reports_cover_observed_strategies() {
        let lb = balancer(StrategyKind::RoundRobin);
        drive(&lb, StrategyKind::RoundRobin, 3, 1);
        drive(&lb, StrategyKind::Predictive, 1, 0);

        let reports = lb.strategy_reports();
        assert_eq!(reports.len(), 2);
        let rr = reports.iter().find(|r| r.strategy == StrategyKind::RoundRobin).unwrap();
        assert_eq!(rr.total_decisions, 4);
        assert_eq!(rr.successful_decisions, 3);
    }
}
