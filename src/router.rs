//! Rule-driven request routing with multi-factor scoring and per-request
//! failover that excludes already-failed servers.
//!
//! Rules are consulted in descending priority; the first match picks the
//! candidate sub-pool and may suggest a strategy and retry budget. Scoring
//! always runs, feeding decision confidence, expected latency/cost, and the
//! alternatives list.

use crate::balance::{health_score, BalanceDecision, LoadBalancer, SelectionContext, StrategyKind};
use crate::error::MuxError;
use crate::health::HealthMonitor;
use crate::registry::{ServerRegistry, ServerSnapshot};
use crate::sleeper::Sleeper;
use crate::types::{Priority, RagRequest, RagResponse, RouteAttempt};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outcomes remembered per server for the history factor.
const HISTORY_WINDOW: usize = 10;
/// Cap on the failover backoff sleep.
const MAX_FAILOVER_SLEEP: Duration = Duration::from_secs(30);
/// Flat cost of dispatching any query.
const BASE_QUERY_COST: f64 = 0.001;
/// Additional cost per unit of estimated complexity.
const COMPLEXITY_UNIT_COST: f64 = 0.01;

/// Executes one attempt on one concrete server. Implemented by the
/// multiplexer over the pool, with health and balancer recording wired in.
#[async_trait]
pub trait ServerExecutor: Send + Sync {
    async fn execute_on(
        &self,
        server_id: &str,
        request: &RagRequest,
        request_id: &str,
        decision: Option<&BalanceDecision>,
    ) -> Result<RagResponse, MuxError>;
}

/// Predicate deciding whether a rule applies to a request.
#[derive(Clone)]
pub enum RulePredicate {
    /// Matches requests carrying the given caller priority.
    PriorityIs(Priority),
    /// Matches when the query or context contains any fragment
    /// (case-insensitive).
    QueryContainsAny(Vec<String>),
    /// Matches long queries or large requested result sets.
    ComplexQuery { min_query_len: usize, min_results: u32 },
    /// Always matches.
    Always,
    /// Caller-supplied predicate.
    Custom(Arc<dyn Fn(&RagRequest) -> bool + Send + Sync>),
}

impl std::fmt::Debug for RulePredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RulePredicate::PriorityIs(p) => write!(f, "PriorityIs({p:?})"),
            RulePredicate::QueryContainsAny(words) => write!(f, "QueryContainsAny({words:?})"),
            RulePredicate::ComplexQuery { min_query_len, min_results } => {
                write!(f, "ComplexQuery(len>{min_query_len} or results>{min_results})")
            }
            RulePredicate::Always => write!(f, "Always"),
            RulePredicate::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl RulePredicate {
    pub fn matches(&self, request: &RagRequest) -> bool {
        match self {
            RulePredicate::PriorityIs(priority) => request.priority == *priority,
            RulePredicate::QueryContainsAny(fragments) => {
                let text = match &request.context {
                    Some(ctx) => format!("{} {}", request.query, ctx).to_lowercase(),
                    None => request.query.to_lowercase(),
                };
                fragments.iter().any(|f| text.contains(f.as_str()))
            }
            RulePredicate::ComplexQuery { min_query_len, min_results } => {
                request.query.len() > *min_query_len
                    || request.effective_max_results() > *min_results
            }
            RulePredicate::Always => true,
            RulePredicate::Custom(predicate) => predicate(request),
        }
    }
}

/// One routing rule.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub id: String,
    pub name: String,
    pub predicate: RulePredicate,
    pub priority: i32,
    /// Restrict candidates to these servers when present.
    pub target_servers: Option<Vec<String>>,
    /// Strategy override for candidate selection.
    pub strategy: Option<StrategyKind>,
    /// Failover budget override for requests matched by this rule.
    pub max_retries: Option<u32>,
    /// Per-attempt timeout override.
    pub timeout: Option<Duration>,
}

/// What the router decided for one attempt, for observability.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub server_id: String,
    /// Rule that matched, or `None` for the least-loaded fallback.
    pub rule_id: Option<String>,
    pub strategy: Option<StrategyKind>,
    pub confidence: f64,
    pub expected_latency: Duration,
    pub expected_cost: f64,
    pub reasoning: Vec<String>,
    /// Runner-up servers, best first.
    pub alternatives: Vec<String>,
}

/// Per-rule statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleStats {
    pub rule_id: String,
    pub name: String,
    pub priority: i32,
    pub matches: u64,
    /// EMA (α = 0.1) over attempt success.
    pub effectiveness: f64,
}

#[derive(Debug, Default)]
struct RuleTracking {
    matches: u64,
    effectiveness: Option<f64>,
}

/// Failure bookkeeping for one `route` call.
#[derive(Debug, Default)]
pub struct RouteState {
    history: Vec<RouteAttempt>,
    non_protocol_failures: HashMap<String, u32>,
    protocol_failures: HashMap<String, u32>,
}

impl RouteState {
    /// A server with any hard failure is out; a protocol failure grants one
    /// more chance before the error surfaces.
    fn is_excluded(&self, server_id: &str) -> bool {
        self.non_protocol_failures.get(server_id).copied().unwrap_or(0) > 0
            || self.protocol_failures.get(server_id).copied().unwrap_or(0) >= 2
    }

    fn note_failure(&mut self, server_id: &str, err: &MuxError) {
        if matches!(err, MuxError::Protocol { .. }) {
            *self.protocol_failures.entry(server_id.to_string()).or_insert(0) += 1;
        } else {
            *self.non_protocol_failures.entry(server_id.to_string()).or_insert(0) += 1;
        }
        self.history.push(RouteAttempt::failure(server_id, err.to_string()));
    }
}

/// Rule-driven router.
pub struct Router {
    registry: Arc<ServerRegistry>,
    health: Arc<HealthMonitor>,
    balancer: Arc<LoadBalancer>,
    rules: Mutex<HashMap<String, RoutingRule>>,
    tracking: Mutex<HashMap<String, RuleTracking>>,
    server_history: Mutex<HashMap<String, VecDeque<bool>>>,
    sleeper: Arc<dyn Sleeper>,
    max_requests_per_server: usize,
    circuit_breaker_threshold: f64,
    response_time_ceiling: Duration,
    default_max_retries: u32,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("rules", &self.rules.lock().expect("router lock poisoned").len())
            .finish()
    }
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ServerRegistry>,
        health: Arc<HealthMonitor>,
        balancer: Arc<LoadBalancer>,
        sleeper: Arc<dyn Sleeper>,
        max_requests_per_server: usize,
        circuit_breaker_threshold: f64,
        response_time_ceiling: Duration,
        default_max_retries: u32,
    ) -> Self {
        let router = Self {
            registry,
            health,
            balancer,
            rules: Mutex::new(HashMap::new()),
            tracking: Mutex::new(HashMap::new()),
            server_history: Mutex::new(HashMap::new()),
            sleeper,
            max_requests_per_server,
            circuit_breaker_threshold,
            response_time_ceiling,
            default_max_retries: default_max_retries.max(1),
        };
        router.seed_default_rules();
        router
    }

    fn seed_default_rules(&self) {
        self.add_rule(RoutingRule {
            id: "high_priority".into(),
            name: "High priority requests".into(),
            predicate: RulePredicate::PriorityIs(Priority::High),
            priority: 100,
            target_servers: None,
            strategy: Some(StrategyKind::LeastConnections),
            max_retries: Some(5),
            timeout: None,
        });
        self.add_rule(RoutingRule {
            id: "vector_search".into(),
            name: "Vector similarity queries".into(),
            predicate: RulePredicate::QueryContainsAny(vec![
                "vector".into(),
                "similarity".into(),
            ]),
            priority: 80,
            target_servers: None,
            strategy: Some(StrategyKind::WeightedResponseTime),
            max_retries: None,
            timeout: None,
        });
        self.add_rule(RoutingRule {
            id: "complex_query".into(),
            name: "Long or wide queries".into(),
            predicate: RulePredicate::ComplexQuery { min_query_len: 500, min_results: 10 },
            priority: 60,
            target_servers: None,
            strategy: Some(StrategyKind::WeightedResponseTime),
            max_retries: None,
            timeout: None,
        });
        self.add_rule(RoutingRule {
            id: "load_balance".into(),
            name: "Default load balancing".into(),
            predicate: RulePredicate::Always,
            priority: 1,
            target_servers: None,
            strategy: Some(StrategyKind::WeightedResponseTime),
            max_retries: None,
            timeout: None,
        });
    }

    /// Install or replace a rule.
    pub fn add_rule(&self, rule: RoutingRule) {
        self.rules.lock().expect("router lock poisoned").insert(rule.id.clone(), rule);
    }

    /// Remove a rule. Returns whether it existed.
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        self.rules.lock().expect("router lock poisoned").remove(rule_id).is_some()
    }

    pub fn rule_stats(&self) -> Vec<RuleStats> {
        let rules = self.rules.lock().expect("router lock poisoned");
        let tracking = self.tracking.lock().expect("router lock poisoned");
        let mut stats: Vec<RuleStats> = rules
            .values()
            .map(|rule| {
                let t = tracking.get(&rule.id);
                RuleStats {
                    rule_id: rule.id.clone(),
                    name: rule.name.clone(),
                    priority: rule.priority,
                    matches: t.map(|t| t.matches).unwrap_or(0),
                    effectiveness: t.and_then(|t| t.effectiveness).unwrap_or(0.5),
                }
            })
            .collect();
        stats.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.rule_id.cmp(&b.rule_id)));
        stats
    }

    /// Route the request and drive it to completion, failing over to
    /// alternative servers on retryable errors.
    pub async fn route(
        &self,
        request: &RagRequest,
        request_id: &str,
        executor: &dyn ServerExecutor,
    ) -> Result<RagResponse, MuxError> {
        let mut state = RouteState::default();
        let mut max_retries = self.default_max_retries;

        for attempt in 0..u32::MAX {
            let decision = match self.decide(request, &state) {
                Ok(decision) => decision,
                Err(err) => {
                    // Nothing eligible: terminal unless earlier attempts make
                    // this an exhaustion with history worth reporting.
                    return Err(self.finish_error(err, attempt, state));
                }
            };
            if let Some(rule_retries) = self.rule_retry_budget(&decision) {
                max_retries = rule_retries;
            }

            tracing::debug!(
                request_id,
                server_id = %decision.server_id,
                rule = decision.rule_id.as_deref().unwrap_or("fallback"),
                confidence = decision.confidence,
                "routing decision"
            );

            let balance_decision = decision.strategy.map(|strategy| BalanceDecision {
                server_id: decision.server_id.clone(),
                strategy,
                confidence: decision.confidence,
            });

            // A rule timeout applies unless the caller set a tighter one.
            let adjusted = match self.rule_timeout(&decision) {
                Some(timeout) if request.metadata.timeout_ms.is_none() => {
                    let mut shorter = request.clone();
                    shorter.metadata.timeout_ms = Some(timeout.as_millis() as u64);
                    Some(shorter)
                }
                _ => None,
            };
            let attempt_request = adjusted.as_ref().unwrap_or(request);

            match executor
                .execute_on(&decision.server_id, attempt_request, request_id, balance_decision.as_ref())
                .await
            {
                Ok(response) => {
                    self.note_outcome(&decision, true);
                    return Ok(response);
                }
                Err(err) => {
                    self.note_outcome(&decision, false);
                    let surfaced_protocol = matches!(&err, MuxError::Protocol { .. })
                        && state
                            .protocol_failures
                            .get(&decision.server_id)
                            .copied()
                            .unwrap_or(0)
                            >= 1;
                    state.note_failure(&decision.server_id, &err);

                    if !err.is_retryable() || surfaced_protocol {
                        return Err(err);
                    }
                    if attempt + 1 >= max_retries {
                        return Err(MuxError::FailoverExhausted {
                            attempts: (attempt + 1) as usize,
                            last_server: decision.server_id,
                            history: state.history,
                        });
                    }

                    let sleep = Duration::from_millis(
                        1_000u64.saturating_mul(1u64 << attempt.min(16)),
                    )
                    .min(MAX_FAILOVER_SLEEP);
                    tracing::debug!(request_id, ?sleep, "failover backoff");
                    self.sleeper.sleep(sleep).await;
                }
            }
        }
        unreachable!("failover loop returns before exhausting u32")
    }

    fn finish_error(&self, err: MuxError, attempts: u32, state: RouteState) -> MuxError {
        if attempts == 0 || state.history.is_empty() {
            return err;
        }
        let last_server = state
            .history
            .last()
            .map(|a| a.server_id.clone())
            .unwrap_or_default();
        MuxError::FailoverExhausted {
            attempts: attempts as usize,
            last_server,
            history: state.history,
        }
    }

    fn rule_retry_budget(&self, decision: &RoutingDecision) -> Option<u32> {
        let rule_id = decision.rule_id.as_deref()?;
        self.rules
            .lock()
            .expect("router lock poisoned")
            .get(rule_id)
            .and_then(|r| r.max_retries)
    }

    fn rule_timeout(&self, decision: &RoutingDecision) -> Option<Duration> {
        let rule_id = decision.rule_id.as_deref()?;
        self.rules
            .lock()
            .expect("router lock poisoned")
            .get(rule_id)
            .and_then(|r| r.timeout)
    }

    /// Drop per-server routing history when a server leaves the pool.
    pub fn forget_server(&self, server_id: &str) {
        self.server_history.lock().expect("router lock poisoned").remove(server_id);
    }

    /// One routing decision over the current eligible set.
    pub fn decide(
        &self,
        request: &RagRequest,
        state: &RouteState,
    ) -> Result<RoutingDecision, MuxError> {
        let eligible: Vec<ServerSnapshot> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|s| {
                s.is_eligible(self.max_requests_per_server, self.circuit_breaker_threshold)
                    && !state.is_excluded(&s.id)
                    && self.health.can_execute(&s.id)
            })
            .collect();
        if eligible.is_empty() {
            return Err(MuxError::NoServersAvailable {
                reason: "no eligible servers after health and exclusion filters".into(),
            });
        }

        let matched = self.first_matching_rule(request);
        let (candidates, rule_id, strategy) = match &matched {
            Some(rule) => {
                let candidates = match &rule.target_servers {
                    Some(targets) => {
                        let filtered: Vec<ServerSnapshot> = eligible
                            .iter()
                            .filter(|s| targets.contains(&s.id))
                            .cloned()
                            .collect();
                        if filtered.is_empty() {
                            eligible.clone()
                        } else {
                            filtered
                        }
                    }
                    None => eligible.clone(),
                };
                (candidates, Some(rule.id.clone()), rule.strategy)
            }
            None => (eligible.clone(), None, None),
        };

        let complexity = request.estimated_complexity();
        let required_caps = request.required_capabilities();

        // Hard capability filter ahead of strategy selection. When nothing
        // advertises the full set, fall back to least-connections over the
        // unfiltered candidates at reduced confidence.
        let mut capability_fallback = false;
        let (candidates, strategy) = if required_caps.is_empty() {
            (candidates, strategy)
        } else {
            let capable: Vec<ServerSnapshot> = candidates
                .iter()
                .filter(|s| s.has_capabilities(&required_caps))
                .cloned()
                .collect();
            if capable.is_empty() {
                capability_fallback = true;
                (candidates, Some(StrategyKind::LeastConnections))
            } else {
                (capable, strategy)
            }
        };

        let mut scored: Vec<(f64, &ServerSnapshot)> = candidates
            .iter()
            .map(|s| (self.score(s, &required_caps), s))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.id.cmp(&b.1.id))
        });

        let mut reasoning = Vec::new();
        if capability_fallback {
            reasoning.push(format!(
                "no server offers {required_caps:?}; least-connections fallback"
            ));
        }
        let (chosen_id, mut confidence) = match strategy {
            Some(kind) => {
                let ctx = SelectionContext::new(
                    self.response_time_ceiling,
                    self.max_requests_per_server,
                )
                .with_capabilities(required_caps.clone());
                let decision = self.balancer.select_with_strategy(kind, &candidates, &ctx)?;
                reasoning.push(format!("strategy {kind} over {} candidates", candidates.len()));
                (decision.server_id, decision.confidence)
            }
            None => {
                // Least-loaded fallback: the scoring already folds load in,
                // so take the top-scored server and let the score itself be
                // the confidence.
                let (score, server) = scored.first().expect("candidates are non-empty");
                reasoning.push(format!(
                    "fallback least-loaded over {} candidates",
                    candidates.len()
                ));
                (server.id.clone(), score.clamp(0.0, 1.0))
            }
        };
        match &matched {
            Some(rule) => reasoning.insert(0, format!("rule {} matched", rule.id)),
            None => reasoning.insert(0, "no rule matched".to_string()),
        }
        if capability_fallback {
            confidence = (confidence * 0.8).clamp(0.0, 1.0);
        }

        let chosen = candidates
            .iter()
            .find(|s| s.id == chosen_id)
            .or_else(|| eligible.iter().find(|s| s.id == chosen_id))
            .expect("chosen server comes from the candidate set");
        let expected_latency = self.expected_latency(chosen, complexity);
        let expected_cost = BASE_QUERY_COST + complexity * COMPLEXITY_UNIT_COST;
        let alternatives: Vec<String> = scored
            .iter()
            .map(|(_, s)| s.id.clone())
            .filter(|id| *id != chosen_id)
            .take(3)
            .collect();

        if let Some(rule_id) = &rule_id {
            self.tracking
                .lock()
                .expect("router lock poisoned")
                .entry(rule_id.clone())
                .or_default()
                .matches += 1;
        }

        Ok(RoutingDecision {
            server_id: chosen_id,
            rule_id,
            strategy,
            confidence,
            expected_latency,
            expected_cost,
            reasoning,
            alternatives,
        })
    }

    fn first_matching_rule(&self, request: &RagRequest) -> Option<RoutingRule> {
        let rules = self.rules.lock().expect("router lock poisoned");
        let mut ordered: Vec<&RoutingRule> = rules.values().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        ordered.into_iter().find(|r| r.predicate.matches(request)).cloned()
    }

    /// Multi-factor server score in `[0, 1]`.
    fn score(
        &self,
        server: &ServerSnapshot,
        required_caps: &std::collections::BTreeSet<String>,
    ) -> f64 {
        let performance = (1.0
            - server.avg_response_time.as_secs_f64() / self.response_time_ceiling.as_secs_f64())
        .clamp(0.0, 1.0);
        let load_inv =
            1.0 - (server.active_requests as f64 / self.max_requests_per_server as f64).min(1.0);
        let capability = if required_caps.is_empty() {
            1.0
        } else {
            let matched = required_caps.iter().filter(|c| server.capabilities.contains(*c)).count();
            matched as f64 / required_caps.len() as f64
        };
        let history = self.history_score(&server.id);

        0.30 * health_score(server.state)
            + 0.25 * performance
            + 0.20 * load_inv
            + 0.15 * capability
            + 0.10 * history
    }

    fn history_score(&self, server_id: &str) -> f64 {
        let history = self.server_history.lock().expect("router lock poisoned");
        match history.get(server_id) {
            Some(outcomes) if !outcomes.is_empty() => {
                outcomes.iter().filter(|&&s| s).count() as f64 / outcomes.len() as f64
            }
            _ => 0.5,
        }
    }

    fn expected_latency(&self, server: &ServerSnapshot, complexity: f64) -> Duration {
        let expected = server.avg_response_time.as_secs_f64()
            * (1.0 + 0.5 * complexity)
            * (1.0 + 0.3 * server.load_score);
        Duration::from_secs_f64(expected).max(Duration::from_millis(100))
    }

    fn note_outcome(&self, decision: &RoutingDecision, success: bool) {
        {
            let mut history = self.server_history.lock().expect("router lock poisoned");
            let entry = history.entry(decision.server_id.clone()).or_default();
            if entry.len() >= HISTORY_WINDOW {
                entry.pop_front();
            }
            entry.push_back(success);
        }
        if let Some(rule_id) = &decision.rule_id {
            let mut tracking = self.tracking.lock().expect("router lock poisoned");
            let entry = tracking.entry(rule_id.clone()).or_default();
            let observed = if success { 1.0 } else { 0.0 };
            entry.effectiveness = Some(match entry.effectiveness {
                Some(current) => current * 0.9 + observed * 0.1,
                None => observed,
            });
        }
    }
}
