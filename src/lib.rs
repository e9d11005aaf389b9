#![forbid(unsafe_code)]

//! # ragmux
//!
//! A multiplexing fabric for MCP retrieval backends: health-checked server
//! pooling, adaptive load balancing, and transparent failover over
//! newline-delimited JSON TCP.
//!
//! ## Features
//!
//! - **Server pool** with a priority request queue, per-item retries, and
//!   autoscale signals
//! - **Circuit breakers** per server, with half-open recovery probing
//! - **Seven balancing strategies** plus a self-adapting meta-strategy
//! - **Rule-driven routing** with multi-factor scoring and per-request
//!   failover that excludes already-failed servers
//! - **Bounded event surface** for observability integrations
//!
//! ## Quick Start
//!
//! ```no_run
//! use ragmux::{Multiplexer, MuxConfig, RagRequest, ServerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ragmux::MuxError> {
//!     let mux = Arc::new(Multiplexer::new(MuxConfig::production_small())?);
//!     mux.initialize(vec![
//!         ServerConfig::new("localhost", 3001).with_capabilities(["vector_search"]),
//!         ServerConfig::new("localhost", 3002).with_capabilities(["graph_query"]),
//!     ])
//!     .await?;
//!
//!     let response = mux
//!         .execute(RagRequest::new("vector similarity search for rust crates"))
//!         .await?;
//!     println!(
//!         "{} results from {}",
//!         response.metadata.total_results, response.metadata.server_id
//!     );
//!
//!     mux.shutdown().await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod balance;
mod breaker;
mod clock;
mod config;
mod error;
mod events;
mod health;
mod jitter;
mod mux;
mod pool;
pub mod protocol;
mod registry;
mod router;
mod sleeper;
mod types;

// Re-exports
pub use backoff::{BackoffStrategy, RetryBackoff};
pub use balance::{
    BalanceDecision, LoadBalancer, SelectionContext, StrategyKind, StrategyReport, Trend,
};
pub use breaker::{BreakerState, BreakerStats, BreakerTransition, CircuitBreaker};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    AutoscalingConfig, BalanceConfig, ConfigWarning, FailoverConfig, HealthConfig, MuxConfig,
    PerformanceThresholds, PoolConfig, RetryPolicyConfig,
};
pub use error::MuxError;
pub use events::{
    EventBus, EventHandler, EventKind, FailoverRecord, FailoverTrigger, MuxEvent, SubscriptionId,
    MAX_SUBSCRIBERS,
};
pub use health::{HealthMonitor, Probe};
pub use jitter::Jitter;
pub use mux::{Multiplexer, MuxStatus};
pub use pool::{PoolManager, QueueItem, RequestDispatcher, RequestQueue, ServerConnection};
pub use registry::{ActiveGuard, ServerRecord, ServerRegistry, ServerSnapshot, ServerState};
pub use router::{
    RouteState, Router, RoutingDecision, RoutingRule, RulePredicate, RuleStats, ServerExecutor,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use types::{
    Priority, RagRequest, RagResponse, RagResult, RagSource, RequestConstraints, ResourceMetrics,
    ResponseMetadata, RouteAttempt, ServerConfig, CAP_ADVANCED_PROCESSING, CAP_GRAPH_QUERY,
    CAP_VECTOR_SEARCH,
};

pub mod prelude;
