//! In-process mock MCP server speaking the newline-delimited JSON protocol.
//!
//! Behavior is switchable at runtime so tests can make a server fail, go
//! silent, or recover mid-scenario.

#![allow(dead_code)]

use ragmux::protocol::WireRequest;
use ragmux::ServerConfig;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// How the server treats incoming requests.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Answer everything normally.
    Ok,
    /// Close the connection when a query arrives; pings still work.
    QueryReset,
    /// Reply to queries with a backend error object.
    QueryError(String),
    /// Never answer queries; pings still work.
    QuerySilent,
    /// Answer nothing at all.
    Dark,
}

pub struct MockMcpServer {
    port: u16,
    mode: Arc<Mutex<Mode>>,
    queries: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

impl MockMcpServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mode = Arc::new(Mutex::new(Mode::Ok));
        let queries = Arc::new(AtomicUsize::new(0));
        let pings = Arc::new(AtomicUsize::new(0));

        {
            let mode = Arc::clone(&mode);
            let queries = Arc::clone(&queries);
            let pings = Arc::clone(&pings);
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        break;
                    };
                    let mode = Arc::clone(&mode);
                    let queries = Arc::clone(&queries);
                    let pings = Arc::clone(&pings);
                    tokio::spawn(handle_connection(socket, mode, queries, pings));
                }
            });
        }

        Self { port, mode, queries, pings }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn config(&self, caps: &[&str]) -> ServerConfig {
        ServerConfig::new("127.0.0.1", self.port).with_capabilities(caps.iter().copied())
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Number of `rag/query` requests seen.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of `ping` requests seen.
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    mode: Arc<Mutex<Mode>>,
    queries: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if line.trim().is_empty() {
            continue;
        }
        let Ok(request) = serde_json::from_str::<WireRequest>(line.trim()) else {
            continue;
        };
        let current = mode.lock().unwrap().clone();

        let reply = match (request.method.as_str(), &current) {
            (_, Mode::Dark) => continue,
            ("ping", _) => {
                pings.fetch_add(1, Ordering::SeqCst);
                Some(json!({"id": request.id, "result": "pong"}))
            }
            ("system/metrics", _) => Some(json!({
                "id": request.id,
                "result": {"memoryUsage": 0.4, "cpuUsage": 0.2, "connectionCount": 1}
            })),
            ("rag/query", Mode::Ok) => {
                queries.fetch_add(1, Ordering::SeqCst);
                Some(json!({
                    "id": request.id,
                    "result": {
                        "results": [{"content": "x", "score": 0.9}],
                        "source": "vector"
                    }
                }))
            }
            ("rag/query", Mode::QueryReset) => {
                queries.fetch_add(1, Ordering::SeqCst);
                return;
            }
            ("rag/query", Mode::QueryError(message)) => {
                queries.fetch_add(1, Ordering::SeqCst);
                Some(json!({"id": request.id, "error": {"message": message}}))
            }
            ("rag/query", Mode::QuerySilent) => {
                queries.fetch_add(1, Ordering::SeqCst);
                None
            }
            _ => None,
        };

        if let Some(reply) = reply {
            let mut frame = reply.to_string();
            frame.push('\n');
            if write_half.write_all(frame.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
