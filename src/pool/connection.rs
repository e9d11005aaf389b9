//! One TCP JSON-line connection to one MCP server.
//!
//! A connection carries at most one in-flight request; callers serialise
//! through an async mutex in the pool. Replies are matched strictly by `id`
//! and unsolicited frames are dropped. After any transport fault the socket
//! is discarded and re-established on next use.

use crate::error::MuxError;
use crate::protocol::{WireReply, WireRequest};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

struct ConnectionIo {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Duplex line-framed channel to one server.
pub struct ServerConnection {
    server_id: String,
    host: String,
    port: u16,
    connect_timeout: Duration,
    io: Option<ConnectionIo>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("server_id", &self.server_id)
            .field("connected", &self.io.is_some())
            .finish()
    }
}

impl ServerConnection {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        let host = host.into();
        Self {
            server_id: format!("{host}:{port}"),
            host,
            port,
            connect_timeout,
            io: None,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    /// Establish the TCP stream if it is not already up.
    pub async fn ensure_connected(&mut self) -> Result<(), MuxError> {
        if self.io.is_some() {
            return Ok(());
        }
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| MuxError::Timeout {
                server_id: self.server_id.clone(),
                elapsed: self.connect_timeout,
                timeout: self.connect_timeout,
            })?
            .map_err(|e| MuxError::Connection {
                server_id: self.server_id.clone(),
                detail: e.to_string(),
            })?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        self.io = Some(ConnectionIo { reader: BufReader::new(read_half), writer: write_half });
        tracing::debug!(server_id = %self.server_id, "connection established");
        Ok(())
    }

    pub fn close(&mut self) {
        if self.io.take().is_some() {
            tracing::debug!(server_id = %self.server_id, "connection closed");
        }
    }

    /// Send one request and wait for the reply matching its id.
    ///
    /// On timeout the socket is dropped, which is also the best-effort
    /// cancellation of the outstanding id. An application-level `error`
    /// reply leaves the connection healthy.
    pub async fn call(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, MuxError> {
        self.ensure_connected().await?;
        let request = WireRequest {
            method: method.to_string(),
            params,
            id: uuid::Uuid::new_v4().to_string(),
        };

        let started = Instant::now();
        let result =
            tokio::time::timeout(timeout, self.call_inner(&request)).await;
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                // Application errors keep the stream; everything else is a
                // transport fault and the stream cannot be trusted.
                if !matches!(e, MuxError::Application { .. }) {
                    self.close();
                }
                Err(e)
            }
            Err(_) => {
                self.close();
                Err(MuxError::Timeout {
                    server_id: self.server_id.clone(),
                    elapsed: started.elapsed(),
                    timeout,
                })
            }
        }
    }

    async fn call_inner(&mut self, request: &WireRequest) -> Result<Value, MuxError> {
        let io = self.io.as_mut().expect("call_inner after ensure_connected");

        io.writer
            .write_all(request.encode_line().as_bytes())
            .await
            .map_err(|e| MuxError::Connection {
                server_id: self.server_id.clone(),
                detail: format!("write failed: {e}"),
            })?;

        let mut line = String::new();
        loop {
            line.clear();
            let n = io.reader.read_line(&mut line).await.map_err(|e| MuxError::Connection {
                server_id: self.server_id.clone(),
                detail: format!("read failed: {e}"),
            })?;
            if n == 0 {
                return Err(MuxError::Connection {
                    server_id: self.server_id.clone(),
                    detail: "connection closed by server".into(),
                });
            }
            if line.trim().is_empty() {
                continue;
            }

            let reply = WireReply::decode_line(&self.server_id, &line)?;
            if reply.id != request.id {
                tracing::debug!(
                    server_id = %self.server_id,
                    got = %reply.id,
                    expected = %request.id,
                    "dropping unsolicited reply frame"
                );
                continue;
            }
            return reply.into_result(&self.server_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// One-shot mock server: reads a line, answers with `make_reply(frame)`.
    async fn spawn_one_shot<F>(make_reply: F) -> u16
    where
        F: Fn(WireRequest) -> String + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request: WireRequest =
                serde_json::from_slice(&buf[..n]).expect("well-formed request frame");
            socket.write_all(make_reply(request).as_bytes()).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn call_round_trips_matching_id() {
        let port = spawn_one_shot(|req| {
            format!(r#"{{"id":"{}","result":"pong"}}"#, req.id) + "\n"
        })
        .await;

        let mut conn = ServerConnection::new("127.0.0.1", port, Duration::from_secs(1));
        let result = conn
            .call("ping", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("pong"));
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn unsolicited_frames_are_dropped() {
        let port = spawn_one_shot(|req| {
            let stale = r#"{"id":"someone-else","result":"stale"}"#;
            let real = format!(r#"{{"id":"{}","result":"pong"}}"#, req.id);
            format!("{stale}\n{real}\n")
        })
        .await;

        let mut conn = ServerConnection::new("127.0.0.1", port, Duration::from_secs(1));
        let result = conn
            .call("ping", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("pong"));
    }

    #[tokio::test]
    async fn backend_error_object_surfaces_as_application_error() {
        let port = spawn_one_shot(|req| {
            format!(r#"{{"id":"{}","error":{{"message":"no index loaded"}}}}"#, req.id) + "\n"
        })
        .await;

        let mut conn = ServerConnection::new("127.0.0.1", port, Duration::from_secs(1));
        let err = conn
            .call("rag/query", serde_json::json!({"query": "x"}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Application { .. }));
        assert!(conn.is_connected(), "application errors keep the stream");
    }

    #[tokio::test]
    async fn garbage_reply_is_protocol_error_and_drops_stream() {
        let port = spawn_one_shot(|_req| "not json\n".to_string()).await;

        let mut conn = ServerConnection::new("127.0.0.1", port, Duration::from_secs(1));
        let err = conn
            .call("ping", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Protocol { .. }));
        assert!(!conn.is_connected(), "stream discarded after framing fault");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut conn = ServerConnection::new("127.0.0.1", port, Duration::from_secs(1));
        let err = conn
            .call("ping", serde_json::json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn refused_connection_is_connection_error() {
        // Bind then drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut conn = ServerConnection::new("127.0.0.1", port, Duration::from_secs(1));
        let err = conn
            .call("ping", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Connection { .. }));
    }

    #[tokio::test]
    async fn server_eof_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut conn = ServerConnection::new("127.0.0.1", port, Duration::from_secs(1));
        let err = conn
            .call("ping", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Connection { .. }));
    }
}
