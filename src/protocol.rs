//! Newline-delimited JSON wire protocol spoken to MCP servers.
//!
//! One request per line, one reply per line. Replies are matched to requests
//! by `id`; unsolicited frames are the reader's problem (the connection drops
//! them). Only three methods are consumed by the fabric: `ping`,
//! `system/metrics`, and `rag/query`.

use crate::error::MuxError;
use crate::types::{RagRequest, RagResult, RagSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METHOD_PING: &str = "ping";
pub const METHOD_METRICS: &str = "system/metrics";
pub const METHOD_RAG_QUERY: &str = "rag/query";

/// Outgoing request frame: `{"method": ..., "params": ..., "id": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub method: String,
    pub params: Value,
    pub id: String,
}

impl WireRequest {
    pub fn ping(id: impl Into<String>) -> Self {
        Self {
            method: METHOD_PING.to_string(),
            params: Value::Object(serde_json::Map::new()),
            id: id.into(),
        }
    }

    pub fn metrics(id: impl Into<String>) -> Self {
        Self {
            method: METHOD_METRICS.to_string(),
            params: Value::Object(serde_json::Map::new()),
            id: id.into(),
        }
    }

    pub fn rag_query(request: &RagRequest, id: impl Into<String>) -> Self {
        Self {
            method: METHOD_RAG_QUERY.to_string(),
            params: rag_query_params(request),
            id: id.into(),
        }
    }

    /// Serialise to a single newline-terminated line.
    pub fn encode_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"));
        line.push('\n');
        line
    }
}

/// Build the `rag/query` parameter object for a request.
pub fn rag_query_params(request: &RagRequest) -> Value {
    let params = RagQueryParams {
        query: request.query.clone(),
        context: request.context.clone(),
        max_results: request.max_results,
        threshold: request.threshold,
    };
    serde_json::to_value(params).unwrap_or(Value::Null)
}

/// `rag/query` parameter object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RagQueryParams {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
}

/// Error object inside a reply frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
}

/// Incoming reply frame: `{"id": ..., "result": ...}` or
/// `{"id": ..., "error": {"message": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireReply {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl WireReply {
    /// Parse one reply line. A frame that is not valid JSON, or that lacks
    /// both `result` and `error`, is a protocol violation.
    pub fn decode_line(server_id: &str, line: &str) -> Result<Self, MuxError> {
        let reply: WireReply =
            serde_json::from_str(line.trim()).map_err(|e| MuxError::Protocol {
                server_id: server_id.to_string(),
                detail: format!("unparseable reply frame: {e}"),
            })?;
        if reply.result.is_none() && reply.error.is_none() {
            return Err(MuxError::Protocol {
                server_id: server_id.to_string(),
                detail: "reply frame has neither result nor error".to_string(),
            });
        }
        Ok(reply)
    }

    /// Extract the `result`, converting a backend `error` object into
    /// `MuxError::Application`.
    pub fn into_result(self, server_id: &str) -> Result<Value, MuxError> {
        if let Some(err) = self.error {
            return Err(MuxError::Application {
                server_id: server_id.to_string(),
                message: err.message,
            });
        }
        self.result.ok_or_else(|| MuxError::Protocol {
            server_id: server_id.to_string(),
            detail: "reply frame has neither result nor error".to_string(),
        })
    }
}

/// `rag/query` result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagQueryResult {
    #[serde(default)]
    pub results: Vec<RagResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RagSource>,
}

/// Interpret a `ping` result. Anything but the literal `"pong"` fails.
pub fn expect_pong(server_id: &str, result: &Value) -> Result<(), MuxError> {
    match result.as_str() {
        Some("pong") => Ok(()),
        _ => Err(MuxError::Protocol {
            server_id: server_id.to_string(),
            detail: format!("expected \"pong\", got {result}"),
        }),
    }
}
