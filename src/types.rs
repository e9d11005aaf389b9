//! Request/response model for the RAG fabric, plus the request analysis
//! (capability inference, complexity estimation) the router scores with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Capability tag for servers that answer vector/similarity queries.
pub const CAP_VECTOR_SEARCH: &str = "vector_search";
/// Capability tag for servers that answer graph/relationship queries.
pub const CAP_GRAPH_QUERY: &str = "graph_query";
/// Capability tag for servers that handle large or complex result sets.
pub const CAP_ADVANCED_PROCESSING: &str = "advanced_processing";

/// Caller-declared request priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Numeric weight used for queue ordering when the caller passes no
    /// explicit priority to `execute`.
    pub fn weight(self) -> i32 {
        match self {
            Priority::Low => -10,
            Priority::Normal => 0,
            Priority::High => 10,
        }
    }
}

/// Optional caller constraints attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestConstraints {
    /// Per-request timeout override in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Upper bound on the expected cost of serving this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    /// Lower bound on result quality the caller will accept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_quality: Option<f64>,
}

/// A retrieval query submitted to the fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RagRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub metadata: RequestConstraints,
}

impl RagRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            context: None,
            max_results: None,
            threshold: None,
            priority: Priority::default(),
            metadata: RequestConstraints::default(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Effective result cap, defaulting to the wire protocol's 5.
    pub fn effective_max_results(&self) -> u32 {
        self.max_results.unwrap_or(5)
    }

    /// Per-request timeout override, if the caller set one.
    pub fn timeout_override(&self) -> Option<Duration> {
        self.metadata.timeout_ms.map(Duration::from_millis)
    }

    /// Capabilities this request needs, inferred from its text and shape.
    ///
    /// The inference is intentionally coarse: it looks for the vocabulary
    /// that distinguishes the backend families, not for query semantics.
    pub fn required_capabilities(&self) -> BTreeSet<String> {
        let mut caps = BTreeSet::new();
        let text = match &self.context {
            Some(ctx) => format!("{} {}", self.query, ctx).to_lowercase(),
            None => self.query.to_lowercase(),
        };

        if text.contains("vector") || text.contains("similarity") {
            caps.insert(CAP_VECTOR_SEARCH.to_string());
        }
        if text.contains("graph") || text.contains("relationship") {
            caps.insert(CAP_GRAPH_QUERY.to_string());
        }
        if text.contains("complex") || self.effective_max_results() > 10 {
            caps.insert(CAP_ADVANCED_PROCESSING.to_string());
        }
        caps
    }

    /// Complexity estimate in `[0, 1]` from query length, context length,
    /// and requested result count.
    pub fn estimated_complexity(&self) -> f64 {
        let query_part = (self.query.len() as f64 / 1000.0).min(0.5);
        let context_part = self
            .context
            .as_ref()
            .map(|c| (c.len() as f64 / 2000.0).min(0.3))
            .unwrap_or(0.0);
        let results_part = (f64::from(self.effective_max_results()) / 20.0).min(0.2);

        (0.1 + query_part + context_part + results_part).min(1.0)
    }
}

/// Which backend family produced a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RagSource {
    Vector,
    Graph,
    Hybrid,
}

/// One ranked retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagResult {
    pub content: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Fabric-side metadata attached to every response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub total_results: usize,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<RagSource>,
    pub query_id: String,
    pub server_id: String,
}

/// A retrieval response as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagResponse {
    pub results: Vec<RagResult>,
    pub metadata: ResponseMetadata,
}

/// Static description of one backend server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Stable server identity.
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Self-reported server resources from `system/metrics`. All fields are
/// optional; servers report what they know.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceMetrics {
    pub memory_usage: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub connection_count: Option<u32>,
    pub queue_size: Option<u32>,
}

/// One attempt in a request's routing history. Append-only; the router
/// never re-selects a server that appears here with `success == false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteAttempt {
    pub server_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RouteAttempt {
    pub fn success(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failure(server_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}
