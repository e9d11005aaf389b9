//! Error types for the multiplexing fabric.

use crate::types::RouteAttempt;
use std::time::Duration;
use thiserror::Error;

/// Unified error type surfaced by every fabric operation.
///
/// Errors are classified by kind, not identity: two `Connection` errors from
/// different sockets are the same kind of failure to the retry machinery.
/// Transport-level failures (`Connection`, `Timeout`, `Protocol`) count
/// against a server's health; application-level failures do not.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Invalid configuration, rejected at initialization. Never retried.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Zero eligible servers for this request. Retry is the caller's choice.
    #[error("no servers available: {reason}")]
    NoServersAvailable { reason: String },

    /// TCP establishment or I/O failure talking to a server.
    #[error("connection to {server_id} failed: {detail}")]
    Connection { server_id: String, detail: String },

    /// A request or health probe exceeded its deadline.
    #[error("request to {server_id} timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout {
        server_id: String,
        elapsed: Duration,
        timeout: Duration,
    },

    /// Malformed or unmatched reply frame from a server.
    #[error("protocol violation from {server_id}: {detail}")]
    Protocol { server_id: String, detail: String },

    /// The backend answered with an `error` object. Not a health failure.
    #[error("backend {server_id} returned an error: {message}")]
    Application { server_id: String, message: String },

    /// Every failover attempt failed; carries the full routing history.
    #[error("failover exhausted after {attempts} attempts (last server: {last_server})")]
    FailoverExhausted {
        attempts: usize,
        last_server: String,
        history: Vec<RouteAttempt>,
    },

    /// A queued request's explicit deadline passed before dispatch.
    #[error("deadline exceeded for request {request_id} ({missed_by:?} past deadline)")]
    DeadlineExceeded {
        request_id: String,
        missed_by: Duration,
    },

    /// The request queue is at capacity; nothing was enqueued.
    #[error("request queue full ({capacity} items)")]
    QueueFull { capacity: usize },

    /// The multiplexer was shut down before or during this request.
    #[error("multiplexer is shut down")]
    Shutdown,
}

impl MuxError {
    /// Whether the failure is worth another attempt on a different server
    /// or after a backoff. `NoServersAvailable` is deliberately excluded:
    /// whether to wait for recovery is the caller's decision.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Protocol { .. }
        )
    }

    /// Whether this failure counts against the failing server's health.
    /// Application-level errors (the backend answered, just unhappily) do not.
    pub fn counts_against_health(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Protocol { .. }
        )
    }

    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error reports zero eligible servers.
    pub fn is_no_servers(&self) -> bool {
        matches!(self, Self::NoServersAvailable { .. })
    }

    /// Check if this error is failover exhaustion.
    pub fn is_failover_exhausted(&self) -> bool {
        matches!(self, Self::FailoverExhausted { .. })
    }

    /// Check if this error is a missed queue deadline.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// The server this failure is attributed to, if any.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Connection { server_id, .. }
            | Self::Timeout { server_id, .. }
            | Self::Protocol { server_id, .. }
            | Self::Application { server_id, .. } => Some(server_id),
            Self::FailoverExhausted { last_server, .. } => Some(last_server),
            _ => None,
        }
    }

    /// Routing history attached to failover exhaustion, if present.
    pub fn routing_history(&self) -> Option<&[RouteAttempt]> {
        match self {
            Self::FailoverExhausted { history, .. } => Some(history.as_slice()),
            _ => None,
        }
    }
}
