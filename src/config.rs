//! Configuration surface for the fabric: pool, health, balancing, and
//! failover knobs, plus named presets for common deployments.
//!
//! All durations are carried as milliseconds so configurations round-trip
//! through JSON untouched; `Duration` accessors are provided where the
//! fabric consumes them.

use crate::backoff::BackoffStrategy;
use crate::balance::StrategyKind;
use crate::error::MuxError;
use crate::jitter::Jitter;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Autoscaling signal thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoscalingConfig {
    pub enabled: bool,
    /// Utilisation above which `ScaleUpNeeded` fires.
    pub scale_up_threshold: f64,
    /// Utilisation below which `ScaleDownNeeded` fires.
    pub scale_down_threshold: f64,
    /// Minimum spacing between autoscale evaluations.
    pub cooldown_period_ms: u64,
}

impl Default for AutoscalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown_period_ms: 300_000,
        }
    }
}

/// Retry policy for queued requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub backoff_strategy: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: Jitter,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter: Jitter::Full,
        }
    }
}

/// Server pool knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    pub min_servers: usize,
    pub max_servers: usize,
    pub health_check_interval_ms: u64,
    pub max_consecutive_failures: u32,
    pub connection_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_requests_per_server: usize,
    /// Minimum lifetime success rate a server needs to stay eligible.
    pub circuit_breaker_threshold: f64,
    pub queue_capacity: usize,
    pub autoscaling: AutoscalingConfig,
    pub retry_policy: RetryPolicyConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_servers: 1,
            max_servers: 10,
            health_check_interval_ms: 10_000,
            max_consecutive_failures: 5,
            connection_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            max_requests_per_server: 10,
            circuit_breaker_threshold: 0.3,
            queue_capacity: 1_000,
            autoscaling: AutoscalingConfig::default(),
            retry_policy: RetryPolicyConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn cooldown_period(&self) -> Duration {
        Duration::from_millis(self.autoscaling.cooldown_period_ms)
    }
}

/// Health monitor and circuit breaker knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Probe reply deadline.
    pub timeout_ms: u64,
    /// How long an open breaker waits before probing recovery.
    pub recovery_time_ms: u64,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// Window for the rolling error rate.
    pub monitoring_window_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 10_000,
            recovery_time_ms: 60_000,
            success_threshold: 2,
            monitoring_window_ms: 300_000,
            health_check_interval_ms: 10_000,
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn recovery_time(&self) -> Duration {
        Duration::from_millis(self.recovery_time_ms)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Ceilings the balancer scores against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceThresholds {
    /// Response-time ceiling used by latency-derived scores, in ms.
    pub max_response_time_ms: u64,
    pub max_error_rate: f64,
    pub max_utilization: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            max_response_time_ms: 5_000,
            max_error_rate: 0.5,
            max_utilization: 0.8,
        }
    }
}

/// Load-balancing knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BalanceConfig {
    pub strategy: StrategyKind,
    pub adaptive_enabled: bool,
    pub adaptation_interval_ms: u64,
    pub performance_thresholds: PerformanceThresholds,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::WeightedResponseTime,
            adaptive_enabled: true,
            adaptation_interval_ms: 60_000,
            performance_thresholds: PerformanceThresholds::default(),
        }
    }
}

impl BalanceConfig {
    pub fn adaptation_interval(&self) -> Duration {
        Duration::from_millis(self.adaptation_interval_ms)
    }

    pub fn response_time_ceiling(&self) -> Duration {
        Duration::from_millis(self.performance_thresholds.max_response_time_ms)
    }
}

/// Failover and recovery knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailoverConfig {
    pub enabled: bool,
    pub max_failover_attempts: u32,
    pub failover_delay_ms: u64,
    pub auto_recovery: bool,
    pub recovery_check_interval_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failover_attempts: 3,
            failover_delay_ms: 1_000,
            auto_recovery: true,
            recovery_check_interval_ms: 30_000,
        }
    }
}

impl FailoverConfig {
    pub fn failover_delay(&self) -> Duration {
        Duration::from_millis(self.failover_delay_ms)
    }

    pub fn recovery_check_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_check_interval_ms)
    }
}

/// A non-fatal finding from [`MuxConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
}

impl ConfigWarning {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self { field: field.to_string(), message: message.into() }
    }
}

/// Complete fabric configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MuxConfig {
    pub pool: PoolConfig,
    pub health: HealthConfig,
    pub balance: BalanceConfig,
    pub failover: FailoverConfig,
    /// Route through the rule engine instead of the bare balancer.
    pub intelligent_routing: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            health: HealthConfig::default(),
            balance: BalanceConfig::default(),
            failover: FailoverConfig::default(),
            intelligent_routing: true,
        }
    }
}

impl MuxConfig {
    /// Local development: one server, fast feedback, no adaptation noise.
    pub fn development() -> Self {
        Self {
            pool: PoolConfig {
                min_servers: 1,
                max_servers: 3,
                health_check_interval_ms: 5_000,
                request_timeout_ms: 30_000,
                queue_capacity: 100,
                ..PoolConfig::default()
            },
            health: HealthConfig {
                failure_threshold: 3,
                health_check_interval_ms: 5_000,
                ..HealthConfig::default()
            },
            balance: BalanceConfig {
                strategy: StrategyKind::RoundRobin,
                adaptive_enabled: false,
                ..BalanceConfig::default()
            },
            failover: FailoverConfig {
                max_failover_attempts: 2,
                ..FailoverConfig::default()
            },
            intelligent_routing: true,
        }
    }

    /// Small production pool on the stock defaults.
    pub fn production_small() -> Self {
        Self {
            pool: PoolConfig {
                min_servers: 2,
                max_servers: 5,
                ..PoolConfig::default()
            },
            ..Self::default()
        }
    }

    /// Large production pool: more concurrency, deeper queue, resource-aware
    /// placement, autoscaling signals on.
    pub fn production_large() -> Self {
        Self {
            pool: PoolConfig {
                min_servers: 5,
                max_servers: 32,
                max_requests_per_server: 50,
                queue_capacity: 10_000,
                autoscaling: AutoscalingConfig { enabled: true, ..AutoscalingConfig::default() },
                ..PoolConfig::default()
            },
            balance: BalanceConfig {
                strategy: StrategyKind::ResourceAware,
                ..BalanceConfig::default()
            },
            ..Self::default()
        }
    }

    /// Availability over everything: tight probes, fast recovery, generous
    /// failover budget, adaptive strategy selection.
    pub fn high_availability() -> Self {
        Self {
            pool: PoolConfig {
                min_servers: 3,
                max_servers: 16,
                health_check_interval_ms: 5_000,
                autoscaling: AutoscalingConfig { enabled: true, ..AutoscalingConfig::default() },
                ..PoolConfig::default()
            },
            health: HealthConfig {
                failure_threshold: 3,
                recovery_time_ms: 30_000,
                success_threshold: 3,
                health_check_interval_ms: 5_000,
                ..HealthConfig::default()
            },
            balance: BalanceConfig {
                strategy: StrategyKind::Adaptive,
                ..BalanceConfig::default()
            },
            failover: FailoverConfig {
                max_failover_attempts: 5,
                failover_delay_ms: 500,
                ..FailoverConfig::default()
            },
            intelligent_routing: true,
        }
    }

    /// Fewest warm servers that still serve: aggressive scale-down, lenient
    /// probes, least-connections packing.
    pub fn cost_optimized() -> Self {
        Self {
            pool: PoolConfig {
                min_servers: 1,
                max_servers: 3,
                health_check_interval_ms: 30_000,
                autoscaling: AutoscalingConfig {
                    enabled: true,
                    scale_up_threshold: 0.9,
                    scale_down_threshold: 0.2,
                    cooldown_period_ms: 600_000,
                },
                ..PoolConfig::default()
            },
            health: HealthConfig {
                health_check_interval_ms: 30_000,
                ..HealthConfig::default()
            },
            balance: BalanceConfig {
                strategy: StrategyKind::LeastConnections,
                adaptive_enabled: false,
                ..BalanceConfig::default()
            },
            ..Self::default()
        }
    }

    /// Latency over cost: tight request deadline, predictive placement,
    /// quick adaptation.
    pub fn performance_optimized() -> Self {
        Self {
            pool: PoolConfig {
                min_servers: 3,
                max_servers: 16,
                request_timeout_ms: 10_000,
                max_requests_per_server: 20,
                ..PoolConfig::default()
            },
            balance: BalanceConfig {
                strategy: StrategyKind::Predictive,
                adaptation_interval_ms: 30_000,
                performance_thresholds: PerformanceThresholds {
                    max_response_time_ms: 2_000,
                    ..PerformanceThresholds::default()
                },
                ..BalanceConfig::default()
            },
            failover: FailoverConfig {
                failover_delay_ms: 200,
                ..FailoverConfig::default()
            },
            ..Self::default()
        }
    }

    /// Deterministic, tiny timeouts for integration tests.
    pub fn testing() -> Self {
        Self {
            pool: PoolConfig {
                min_servers: 1,
                max_servers: 4,
                health_check_interval_ms: 1_000,
                connection_timeout_ms: 1_000,
                request_timeout_ms: 2_000,
                queue_capacity: 100,
                retry_policy: RetryPolicyConfig {
                    max_retries: 1,
                    initial_delay_ms: 10,
                    max_delay_ms: 50,
                    jitter: Jitter::None,
                    ..RetryPolicyConfig::default()
                },
                ..PoolConfig::default()
            },
            health: HealthConfig {
                failure_threshold: 2,
                timeout_ms: 1_000,
                recovery_time_ms: 1_000,
                success_threshold: 1,
                monitoring_window_ms: 10_000,
                health_check_interval_ms: 1_000,
            },
            balance: BalanceConfig {
                strategy: StrategyKind::RoundRobin,
                adaptive_enabled: false,
                adaptation_interval_ms: 1_000,
                ..BalanceConfig::default()
            },
            failover: FailoverConfig {
                max_failover_attempts: 2,
                failover_delay_ms: 10,
                recovery_check_interval_ms: 1_000,
                ..FailoverConfig::default()
            },
            intelligent_routing: true,
        }
    }

    /// Check hard constraints and collect advisory warnings.
    ///
    /// Hard violations come back as `MuxError::Configuration`; the fabric
    /// refuses to start on them. Warnings describe configurations that are
    /// legal but likely mistakes.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, MuxError> {
        if self.pool.min_servers == 0 {
            return Err(MuxError::Configuration("pool.minServers must be >= 1".into()));
        }
        if self.pool.max_servers < self.pool.min_servers {
            return Err(MuxError::Configuration(format!(
                "pool.maxServers ({}) must be >= pool.minServers ({})",
                self.pool.max_servers, self.pool.min_servers
            )));
        }
        if self.pool.max_requests_per_server == 0 {
            return Err(MuxError::Configuration("pool.maxRequestsPerServer must be >= 1".into()));
        }
        if self.pool.queue_capacity == 0 {
            return Err(MuxError::Configuration("pool.queueCapacity must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.pool.circuit_breaker_threshold) {
            return Err(MuxError::Configuration(
                "pool.circuitBreakerThreshold must be within [0, 1]".into(),
            ));
        }
        if self.pool.retry_policy.initial_delay_ms > self.pool.retry_policy.max_delay_ms {
            return Err(MuxError::Configuration(
                "pool.retryPolicy.initialDelayMs must be <= maxDelayMs".into(),
            ));
        }
        if self.pool.autoscaling.scale_up_threshold <= self.pool.autoscaling.scale_down_threshold {
            return Err(MuxError::Configuration(
                "pool.autoscaling.scaleUpThreshold must exceed scaleDownThreshold".into(),
            ));
        }
        if self.health.failure_threshold == 0 || self.health.success_threshold == 0 {
            return Err(MuxError::Configuration(
                "health thresholds must be >= 1".into(),
            ));
        }
        if self.failover.enabled && self.failover.max_failover_attempts == 0 {
            return Err(MuxError::Configuration(
                "failover.maxFailoverAttempts must be >= 1 when failover is enabled".into(),
            ));
        }

        let mut warnings = Vec::new();
        if self.pool.request_timeout_ms > 60_000 {
            warnings.push(ConfigWarning::new(
                "pool.requestTimeoutMs",
                format!("{} ms is a long time to hold a caller", self.pool.request_timeout_ms),
            ));
        }
        if self.health.timeout_ms > 30_000 {
            warnings.push(ConfigWarning::new(
                "health.timeoutMs",
                format!("{} ms probes delay failure detection", self.health.timeout_ms),
            ));
        }
        if !self.failover.enabled {
            warnings.push(ConfigWarning::new(
                "failover.enabled",
                "failover is disabled; a single server failure will surface to callers",
            ));
        }
        if self.health.timeout_ms > self.health.health_check_interval_ms {
            warnings.push(ConfigWarning::new(
                "health.timeoutMs",
                "probe timeout exceeds the probe interval; probes may overlap",
            ));
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        let warnings = MuxConfig::default().validate().unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
    }

    #[test]
    fn all_presets_validate() {
        for (name, preset) in [
            ("development", MuxConfig::development()),
            ("production_small", MuxConfig::production_small()),
            ("production_large", MuxConfig::production_large()),
            ("high_availability", MuxConfig::high_availability()),
            ("cost_optimized", MuxConfig::cost_optimized()),
            ("performance_optimized", MuxConfig::performance_optimized()),
            ("testing", MuxConfig::testing()),
        ] {
            preset.validate().unwrap_or_else(|e| panic!("preset {name} invalid: {e}"));
        }
    }

    #[test]
    fn zero_min_servers_is_rejected() {
        let mut cfg = MuxConfig::default();
        cfg.pool.min_servers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_below_min_is_rejected() {
        let mut cfg = MuxConfig::default();
        cfg.pool.min_servers = 5;
        cfg.pool.max_servers = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_retry_delays_are_rejected() {
        let mut cfg = MuxConfig::default();
        cfg.pool.retry_policy.initial_delay_ms = 20_000;
        cfg.pool.retry_policy.max_delay_ms = 1_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let mut cfg = MuxConfig::default();
        cfg.pool.circuit_breaker_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn long_timeout_warns_but_passes() {
        let mut cfg = MuxConfig::default();
        cfg.pool.request_timeout_ms = 120_000;
        let warnings = cfg.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "pool.requestTimeoutMs"));
    }

    #[test]
    fn disabled_failover_warns() {
        let mut cfg = MuxConfig::default();
        cfg.failover.enabled = false;
        let warnings = cfg.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "failover.enabled"));
    }

    #[test]
    fn preset_round_trips_through_json() {
        for preset in [
            MuxConfig::development(),
            MuxConfig::production_large(),
            MuxConfig::high_availability(),
            MuxConfig::testing(),
        ] {
            let json = serde_json::to_string(&preset).unwrap();
            let back: MuxConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(back, preset);
        }
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: MuxConfig =
            serde_json::from_str(r#"{"pool": {"minServers": 2, "maxServers": 8}}"#).unwrap();
        assert_eq!(cfg.pool.min_servers, 2);
        assert_eq!(cfg.pool.max_servers, 8);
        assert_eq!(cfg.pool.request_timeout_ms, 30_000);
        assert_eq!(cfg.health.failure_threshold, 5);
    }
}
