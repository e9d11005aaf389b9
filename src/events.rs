//! Fabric events and the subscription surface.
//!
//! Every interesting state change is published as a [`MuxEvent`] on a
//! bounded, synchronous [`EventBus`]. Handlers run on the emitting task and
//! must be cheap; anything expensive should hand off internally. The
//! subscriber list is capped, never unbounded.

use crate::balance::StrategyKind;
use crate::mux::MuxStatus;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Hard cap on concurrent subscribers.
pub const MAX_SUBSCRIBERS: usize = 64;

/// What tripped a failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverTrigger {
    ServerFailure,
    CircuitBreaker,
    Timeout,
    Manual,
}

/// One failover occurrence, ring-buffered by the multiplexer (last 50).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverRecord {
    pub timestamp_millis: u64,
    pub trigger: FailoverTrigger,
    pub from_server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_server: Option<String>,
    pub request_id: String,
    pub success: bool,
    pub recovery_time_ms: u64,
}

impl FailoverRecord {
    pub fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Discriminant used for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Initialized,
    ServerAdded,
    ServerRemoved,
    ServerFailure,
    ServerRecovery,
    StrategyChanged,
    FailoverTriggered,
    RequestCompleted,
    MetricsUpdated,
    ScaleUpNeeded,
    ScaleDownNeeded,
}

/// Events published by the fabric.
#[derive(Debug, Clone)]
pub enum MuxEvent {
    /// The multiplexer finished initialization.
    Initialized { server_count: usize },
    /// A server joined the pool.
    ServerAdded { server_id: String },
    /// A server left the pool.
    ServerRemoved { server_id: String },
    /// A server failed a request or probe badly enough to matter.
    ServerFailure {
        server_id: String,
        trigger: FailoverTrigger,
    },
    /// A previously unhealthy server passed recovery.
    ServerRecovery { server_id: String },
    /// The adaptive balancer switched strategies.
    StrategyChanged {
        from: StrategyKind,
        to: StrategyKind,
    },
    /// A failover took place.
    FailoverTriggered { record: FailoverRecord },
    /// A caller-facing request finished.
    RequestCompleted {
        request_id: String,
        duration: Duration,
        success: bool,
        error: Option<String>,
    },
    /// Periodic status refresh.
    MetricsUpdated { status: MuxStatus },
    /// Pool utilisation crossed the scale-up threshold. The fabric never
    /// creates servers itself; an external supervisor consumes this.
    ScaleUpNeeded { utilisation: f64, servers: usize },
    /// Pool utilisation fell below the scale-down threshold.
    ScaleDownNeeded { utilisation: f64, servers: usize },
}

impl MuxEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MuxEvent::Initialized { .. } => EventKind::Initialized,
            MuxEvent::ServerAdded { .. } => EventKind::ServerAdded,
            MuxEvent::ServerRemoved { .. } => EventKind::ServerRemoved,
            MuxEvent::ServerFailure { .. } => EventKind::ServerFailure,
            MuxEvent::ServerRecovery { .. } => EventKind::ServerRecovery,
            MuxEvent::StrategyChanged { .. } => EventKind::StrategyChanged,
            MuxEvent::FailoverTriggered { .. } => EventKind::FailoverTriggered,
            MuxEvent::RequestCompleted { .. } => EventKind::RequestCompleted,
            MuxEvent::MetricsUpdated { .. } => EventKind::MetricsUpdated,
            MuxEvent::ScaleUpNeeded { .. } => EventKind::ScaleUpNeeded,
            MuxEvent::ScaleDownNeeded { .. } => EventKind::ScaleDownNeeded,
        }
    }
}

/// Handler invoked synchronously on the emitting task.
pub type EventHandler = Arc<dyn Fn(&MuxEvent) + Send + Sync>;

/// Identifier returned by `subscribe`, usable for `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: EventHandler,
}

/// Bounded synchronous event fan-out.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("subscribers", &self.subscriber_count()).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind. Fails when the subscriber cap is hit.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: EventHandler,
    ) -> Result<SubscriptionId, crate::MuxError> {
        self.add(Some(kind), handler)
    }

    /// Subscribe to every event kind.
    pub fn subscribe_all(&self, handler: EventHandler) -> Result<SubscriptionId, crate::MuxError> {
        self.add(None, handler)
    }

    fn add(
        &self,
        kind: Option<EventKind>,
        handler: EventHandler,
    ) -> Result<SubscriptionId, crate::MuxError> {
        let mut subs = self.subscribers.lock().expect("EventBus.add: mutex poisoned");
        if subs.len() >= MAX_SUBSCRIBERS {
            return Err(crate::MuxError::Configuration(format!(
                "event subscriber limit reached ({MAX_SUBSCRIBERS})"
            )));
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        subs.push(Subscription { id, kind, handler });
        Ok(id)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock().expect("EventBus.unsubscribe: mutex poisoned");
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("EventBus.subscriber_count: mutex poisoned").len()
    }

    /// Deliver an event to every matching subscriber, synchronously.
    pub fn emit(&self, event: MuxEvent) {
        tracing::debug!(kind = ?event.kind(), "fabric event");
        let subs = self.subscribers.lock().expect("EventBus.emit: mutex poisoned");
        for sub in subs.iter() {
            if sub.kind.is_none() || sub.kind == Some(event.kind()) {
                (sub.handler)(&event);
            }
        }
    }
}
