//! HTTP/1.1 client for the agent process inside a sandbox.
//!
//! The daemon backend reaches the agent over a filesystem socket; the
//! runner backend over TCP. Both speak the same protocol: `GET /health`
//! for readiness, `POST /execute` for the streaming event protocol, and
//! `POST /exec` / `POST /exec/binary` for command execution.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::{TcpStream, UnixStream};

use crate::error::{Result, WorkspaceError};
use crate::sandbox::Endpoint;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const EXEC_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct ExecResponse {
    exit_code: i64,
    #[serde(default)]
    output: String,
}

/// Client bound to one sandbox's agent endpoint.
#[derive(Clone)]
pub struct AgentClient {
    endpoint: Endpoint,
}

impl AgentClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Whether the agent answers its health endpoint.
    pub async fn health(&self) -> bool {
        let request = match self.build_request(Method::GET, "/health", None) {
            Ok(r) => r,
            Err(_) => return false,
        };
        match tokio::time::timeout(HEALTH_TIMEOUT, self.send(request)).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }

    /// Open the streaming execute call. The returned response body yields
    /// the agent's event frames; the caller owns read pacing and timeouts.
    pub async fn execute_stream(&self, body: &serde_json::Value) -> Result<Response<Incoming>> {
        let request = self.build_request(Method::POST, "/execute", Some(body))?;
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(WorkspaceError::AgentCrashed {
                reason: format!("agent returned {} for /execute", response.status()),
            });
        }
        Ok(response)
    }

    /// Run a command via the agent, returning `(exit_code, output)`.
    pub async fn exec(&self, cmd: &[String], timeout_secs: u64) -> Result<(i64, String)> {
        let body = serde_json::json!({ "cmd": cmd, "timeout": timeout_secs });
        let request = self.build_request(Method::POST, "/exec", Some(&body))?;
        let response = tokio::time::timeout(EXEC_TIMEOUT, self.send(request))
            .await
            .map_err(|_| WorkspaceError::AgentTimeout {
                timeout: EXEC_TIMEOUT,
            })??;

        let status = response.status();
        let bytes = collect_body(response).await?;
        if !status.is_success() {
            return Ok((
                -1,
                format!("HTTP {}: {}", status, String::from_utf8_lossy(&bytes)),
            ));
        }
        let parsed: ExecResponse =
            serde_json::from_slice(&bytes).map_err(|e| WorkspaceError::AgentCrashed {
                reason: format!("bad /exec response: {e}"),
            })?;
        Ok((parsed.exit_code, parsed.output))
    }

    /// Binary-output variant of [`exec`](Self::exec). The exit code travels
    /// in the `X-Exit-Code` response header.
    pub async fn exec_binary(&self, cmd: &[String], timeout_secs: u64) -> Result<(i64, Vec<u8>)> {
        let body = serde_json::json!({ "cmd": cmd, "timeout": timeout_secs });
        let request = self.build_request(Method::POST, "/exec/binary", Some(&body))?;
        let response = tokio::time::timeout(EXEC_TIMEOUT, self.send(request))
            .await
            .map_err(|_| WorkspaceError::AgentTimeout {
                timeout: EXEC_TIMEOUT,
            })??;

        let exit_code = response
            .headers()
            .get("x-exit-code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);
        let bytes = collect_body(response).await?;
        Ok((exit_code, bytes.to_vec()))
    }

    fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Request<Full<Bytes>>> {
        let host = match &self.endpoint {
            Endpoint::Unix(_) => "localhost".to_string(),
            Endpoint::Tcp(addr) => addr.clone(),
        };
        let payload = match body {
            Some(value) => Bytes::from(serde_json::to_vec(value).map_err(|e| {
                WorkspaceError::Internal {
                    reason: format!("request serialization: {e}"),
                }
            })?),
            None => Bytes::new(),
        };
        Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, host)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|e| WorkspaceError::Internal {
                reason: format!("request build: {e}"),
            })
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        match &self.endpoint {
            Endpoint::Unix(path) => {
                let stream =
                    UnixStream::connect(path)
                        .await
                        .map_err(|e| WorkspaceError::AgentCrashed {
                            reason: format!("connect {path}: {e}"),
                        })?;
                request_over(TokioIo::new(stream), request).await
            }
            Endpoint::Tcp(addr) => {
                let stream =
                    TcpStream::connect(addr)
                        .await
                        .map_err(|e| WorkspaceError::AgentCrashed {
                            reason: format!("connect {addr}: {e}"),
                        })?;
                request_over(TokioIo::new(stream), request).await
            }
        }
    }
}

async fn request_over<I>(io: I, request: Request<Full<Bytes>>) -> Result<Response<Incoming>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| WorkspaceError::AgentCrashed {
                reason: format!("handshake: {e}"),
            })?;

    // The connection task must outlive the response body; it is dropped
    // when the body (and sender) are gone.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("Agent connection closed: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| WorkspaceError::AgentCrashed {
            reason: format!("request failed: {e}"),
        })
}

/// Collect a response body into memory.
pub async fn collect_body(response: Response<Incoming>) -> Result<Bytes> {
    response
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| WorkspaceError::AgentCrashed {
            reason: format!("body read: {e}"),
        })
}
