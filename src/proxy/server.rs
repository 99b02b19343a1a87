//! Per-sandbox egress proxy.
//!
//! All outbound HTTP from a sandbox funnels through one of these. The
//! daemon backend listens on a filesystem socket bind-mounted into the
//! container; the runner backend runs the same proxy as a sidecar on a TCP
//! port. Responsibilities:
//!
//! - enforce the domain allowlist on both CONNECT and forward paths,
//! - inject SigV4 signatures for the cloud model endpoint so credentials
//!   never enter the sandbox,
//! - audit every request.
//!
//! ```text
//! sandbox ──HTTP_PROXY──► EgressProxy ──► allowlist ──► sign? ──► target
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::RwLock;

use crate::audit;
use crate::error::{Result, WorkspaceError};
use crate::metrics::metrics;
use crate::proxy::allowlist::{DomainAllowlist, extract_host};
use crate::proxy::dns_cache::{DEFAULT_TTL, DnsCache};
use crate::proxy::sigv4::{AwsCredentials, sign_request};
use crate::sandbox::Endpoint;

/// Host substring that routes a request through the signer.
const MODEL_ENDPOINT_MARKER: &str = "bedrock-runtime";

/// Idle ceiling on CONNECT tunnels so every tunnel task terminates even if
/// the remote peer hangs.
const TUNNEL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// State shared across proxy connections.
struct ProxyState {
    container_id: String,
    allowlist: DomainAllowlist,
    dns_cache: DnsCache,
    credentials: AwsCredentials,
    http_client: reqwest::Client,
    log_all_requests: bool,
    request_count: AtomicU64,
    running: AtomicBool,
}

/// Per-sandbox HTTP forward/CONNECT proxy.
pub struct EgressProxy {
    state: Arc<ProxyState>,
    endpoint: Endpoint,
    shutdown_tx: RwLock<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl EgressProxy {
    pub fn new(
        container_id: &str,
        endpoint: Endpoint,
        allowlist: DomainAllowlist,
        credentials: AwsCredentials,
        log_all_requests: bool,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(20)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            state: Arc::new(ProxyState {
                container_id: container_id.to_string(),
                allowlist,
                dns_cache: DnsCache::new(DEFAULT_TTL),
                credentials,
                http_client,
                log_all_requests,
                request_count: AtomicU64::new(0),
                running: AtomicBool::new(false),
            }),
            endpoint,
            shutdown_tx: RwLock::new(None),
        }
    }

    /// The endpoint this proxy listens on. For TCP with port 0 the bound
    /// port is reflected here after `start()`.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u64 {
        self.state.request_count.load(Ordering::SeqCst)
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(&mut self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        *self.shutdown_tx.write().await = Some(shutdown_tx);
        self.state.running.store(true, Ordering::SeqCst);

        match self.endpoint.clone() {
            Endpoint::Unix(path) => {
                if let Some(parent) = std::path::Path::new(&path).parent() {
                    tokio::fs::create_dir_all(parent).await.ok();
                }
                // Remove a stale socket left by a previous incarnation.
                let _ = tokio::fs::remove_file(&path).await;

                let listener =
                    UnixListener::bind(&path).map_err(|e| WorkspaceError::ProxyUnavailable {
                        reason: format!("failed to bind {path}: {e}"),
                    })?;
                tracing::info!("Egress proxy listening on unix://{}", path);
                spawn_accept_loop_unix(listener, self.state.clone(), shutdown_rx);
            }
            Endpoint::Tcp(addr) => {
                let listener =
                    TcpListener::bind(&addr)
                        .await
                        .map_err(|e| WorkspaceError::ProxyUnavailable {
                            reason: format!("failed to bind {addr}: {e}"),
                        })?;
                let local = listener
                    .local_addr()
                    .map_err(|e| WorkspaceError::ProxyUnavailable {
                        reason: format!("failed to read local addr: {e}"),
                    })?;
                self.endpoint = Endpoint::Tcp(local.to_string());
                tracing::info!("Egress proxy listening on tcp://{}", local);
                spawn_accept_loop_tcp(listener, self.state.clone(), shutdown_rx);
            }
        }
        Ok(())
    }

    /// Stop accepting connections and clean up the socket file.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        if let Endpoint::Unix(path) = &self.endpoint {
            let _ = tokio::fs::remove_file(path).await;
        }
        self.state.running.store(false, Ordering::SeqCst);
        tracing::info!("Egress proxy for {} stopped", self.state.container_id);
    }
}

fn spawn_accept_loop_unix(
    listener: UnixListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => spawn_serve(TokioIo::new(stream), state.clone()),
                        Err(e) => tracing::error!("Proxy accept error: {}", e),
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
        state.running.store(false, Ordering::SeqCst);
    });
}

fn spawn_accept_loop_tcp(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => spawn_serve(TokioIo::new(stream), state.clone()),
                        Err(e) => tracing::error!("Proxy accept error: {}", e),
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
        state.running.store(false, Ordering::SeqCst);
    });
}

/// One task per accepted connection.
fn spawn_serve<I>(io: I, state: Arc<ProxyState>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let service = service_fn(move |req| {
            let state = state.clone();
            async move { handle_request(req, state).await }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            tracing::debug!("Proxy connection error: {}", e);
        }
    });
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ProxyState>,
) -> std::result::Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    state.request_count.fetch_add(1, Ordering::SeqCst);

    if req.method() == Method::CONNECT {
        return Ok(handle_connect(req, state).await);
    }

    let method = req.method().to_string();
    let url = req.uri().to_string();
    let started = std::time::Instant::now();

    // Forward-proxy requests carry an absolute URL.
    if req.uri().scheme().is_none() {
        tracing::warn!("Proxy: non-absolute URL: {}", url);
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            "Invalid URL".to_string(),
        ));
    }

    if !state.allowlist.is_allowed(&url) {
        metrics().proxy_blocked_total.inc();
        audit::proxy_request_blocked(
            &state.container_id,
            &method,
            &url,
            "domain_not_in_whitelist",
        );
        if state.log_all_requests {
            tracing::warn!("Proxy: blocked {} {}", method, url);
        }
        return Ok(error_response(
            StatusCode::FORBIDDEN,
            "Domain not in whitelist".to_string(),
        ));
    }

    let mut headers: Vec<(String, String)> = Vec::new();
    for (name, value) in req.headers() {
        if !is_hop_by_hop_header(name.as_str())
            && let Ok(v) = value.to_str()
        {
            headers.push((name.as_str().to_string(), v.to_string()));
        }
    }

    // Body length is bounded by Content-Length; hyper enforces it.
    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::error!("Proxy: failed to read request body: {}", e);
            return Ok(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read body".to_string(),
            ));
        }
    };

    // The model endpoint gets a signature; the sandbox never sees the keys.
    if extract_host(&url).is_some_and(|h| h.contains(MODEL_ENDPOINT_MARKER)) {
        headers = match sign_request(&state.credentials, &method, &url, &headers, &body, "bedrock")
        {
            Ok(signed) => signed,
            Err(e) => {
                tracing::error!("Proxy: signing failed for {}: {}", url, e);
                return Ok(error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Signing failed".to_string(),
                ));
            }
        };
    }

    if state.log_all_requests {
        tracing::info!("Proxy: forwarding {} {}", method, url);
    }

    let response = forward_request(&state, &method, &url, headers, body).await;

    let duration = started.elapsed();
    metrics()
        .proxy_request_duration_seconds
        .with_label_values(&[method.as_str()])
        .observe(duration.as_secs_f64());
    audit::proxy_request_allowed(
        &state.container_id,
        &method,
        &url,
        response.status().as_u16(),
        duration.as_millis() as u64,
    );

    Ok(response)
}

/// CONNECT: verify the host, answer 200 Connection Established, then splice
/// bytes both ways until either side half-closes. TLS passes through
/// untouched; no credential injection is possible on this path.
async fn handle_connect(
    req: Request<hyper::body::Incoming>,
    state: Arc<ProxyState>,
) -> Response<BoxBody<Bytes, Infallible>> {
    let authority = match req.uri().authority() {
        Some(a) => a.clone(),
        None => {
            return error_response(StatusCode::BAD_REQUEST, "Missing host".to_string());
        }
    };

    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);

    if !state.allowlist.is_host_allowed(&host) {
        metrics().proxy_blocked_total.inc();
        audit::proxy_request_blocked(
            &state.container_id,
            "CONNECT",
            &format!("https://{host}/"),
            "domain_not_in_whitelist",
        );
        tracing::warn!("Proxy: blocked CONNECT {}", authority);
        return error_response(
            StatusCode::FORBIDDEN,
            "Domain not in whitelist".to_string(),
        );
    }

    audit::proxy_request_allowed(
        &state.container_id,
        "CONNECT",
        &format!("https://{host}/"),
        StatusCode::OK.as_u16(),
        0,
    );
    tracing::debug!("Proxy: allowing CONNECT to {}", authority);

    let target_host = host.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client_stream = TokioIo::new(upgraded);

                let connected = match state.dns_cache.resolve(&target_host).await {
                    Ok(addrs) if !addrs.is_empty() => {
                        TcpStream::connect(std::net::SocketAddr::new(addrs[0], port)).await
                    }
                    Ok(_) | Err(_) => TcpStream::connect((target_host.as_str(), port)).await,
                };

                match connected {
                    Ok(mut server_stream) => {
                        match tokio::time::timeout(
                            TUNNEL_TIMEOUT,
                            tokio::io::copy_bidirectional(&mut client_stream, &mut server_stream),
                        )
                        .await
                        {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => {
                                tracing::debug!("Proxy: tunnel to {} closed: {}", target_host, e);
                            }
                            Err(_) => {
                                tracing::info!(
                                    "Proxy: tunnel to {} timed out, closing",
                                    target_host
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            "Proxy: failed to connect to {}:{}: {}",
                            target_host,
                            port,
                            e
                        );
                    }
                }
            }
            Err(e) => {
                tracing::error!("Proxy: upgrade failed for {}: {}", target_host, e);
            }
        }
    });

    make_response(StatusCode::OK, empty_body())
}

/// Forward through the shared HTTP client, copying status/headers/body back.
async fn forward_request(
    state: &ProxyState,
    method: &str,
    url: &str,
    headers: Vec<(String, String)>,
    body: Bytes,
) -> Response<BoxBody<Bytes, Infallible>> {
    let reqwest_method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            return error_response(StatusCode::BAD_REQUEST, "Invalid method".to_string());
        }
    };

    let mut builder = state.http_client.request(reqwest_method, url);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    if !body.is_empty() {
        builder = builder.body(body.to_vec());
    }

    match builder.send().await {
        Ok(response) => {
            let status = response.status();
            let response_headers = response.headers().clone();
            match response.bytes().await {
                Ok(bytes) => {
                    let mut resp_builder = Response::builder().status(status.as_u16());
                    for (name, value) in response_headers.iter() {
                        if !is_hop_by_hop_header(name.as_str()) {
                            resp_builder = resp_builder.header(name.as_str(), value.as_bytes());
                        }
                    }
                    make_response_from_builder(resp_builder, full_body(bytes))
                }
                Err(e) => {
                    tracing::error!("Proxy: failed to read response body: {}", e);
                    error_response(StatusCode::BAD_GATEWAY, "Bad Gateway".to_string())
                }
            }
        }
        Err(e) if e.is_timeout() => {
            tracing::error!("Proxy: timeout forwarding {} {}", method, url);
            error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout".to_string())
        }
        Err(e) => {
            tracing::error!("Proxy: forward failed {} {}: {}", method, url, e);
            error_response(StatusCode::BAD_GATEWAY, "Bad Gateway".to_string())
        }
    }
}

/// Headers that must not cross the proxy boundary.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn make_response(
    status: StatusCode,
    body: BoxBody<Bytes, Infallible>,
) -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(status)
        .body(body)
        .unwrap_or_else(|_| {
            let mut resp = Response::new(full_body(Bytes::from("Internal error")));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
}

fn make_response_from_builder(
    builder: hyper::http::response::Builder,
    body: BoxBody<Bytes, Infallible>,
) -> Response<BoxBody<Bytes, Infallible>> {
    builder.body(body).unwrap_or_else(|_| {
        let mut resp = Response::new(full_body(Bytes::from("Response build error")));
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        resp
    })
}

fn error_response(status: StatusCode, message: String) -> Response<BoxBody<Bytes, Infallible>> {
    make_response_from_builder(
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain"),
        full_body(Bytes::from(message)),
    )
}

fn empty_body() -> BoxBody<Bytes, Infallible> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(bytes: Bytes) -> BoxBody<Bytes, Infallible> {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
