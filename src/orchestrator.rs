//! Per-conversation sandbox orchestration.
//!
//! Binds conversations to sandboxes (creating from the warm pool when
//! needed), runs the credential-injecting proxy next to each sandbox,
//! streams execute calls, and recovers from crashes mid-stream.
//!
//! The execute path splits into two halves bridged by a bounded channel:
//! a reader task consumes the agent's frame stream (with a per-read
//! silence cap), and the relay re-sequences frames toward the caller with
//! the event-timeout safety net. A caller disconnect only detaches the
//! caller half; the execution half runs to completion so file sync and
//! metadata capture still happen.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;

use crate::agent::AgentClient;
use crate::audit;
use crate::backend::ContainerBackend;
use crate::config::Settings;
use crate::error::{Result, WorkspaceError};
use crate::events::{Event, RawFrame, SequenceCounter, container_recovered_event, done_event, error_event, kind};
use crate::lock::DistributedLock;
use crate::metrics::metrics;
use crate::pool::WarmPool;
use crate::proxy::{AwsCredentials, DomainAllowlist, EgressProxy};
use crate::sandbox::{Endpoint, Sandbox, SandboxState};
use crate::shutdown::ShutdownManager;
use crate::store::Store;
use crate::sync::FileSync;

/// Tool names whose results trigger an opportunistic file sync.
const FILE_TOOL_NAMES: &[&str] = &[
    "write_file",
    "create_file",
    "edit_file",
    "replace_file",
    "Write",
    "Edit",
    "write",
    "create",
    "save_file",
];

/// Minimum spacing between opportunistic mid-stream syncs.
const SYNC_DEBOUNCE: Duration = Duration::from_secs(10);
/// How long post-processing waits for outstanding opportunistic syncs.
const SYNC_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One execute call from the facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub conversation_id: String,
    pub tenant_id: String,
    pub model_id: String,
    pub workspace_enabled: bool,
    pub user_input: String,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub preferred_skills: Vec<String>,
    /// Agent session to resume, if the conversation has one.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Accounting hook fed from the trailing `result` event. Usage metering
/// itself is a collaborator's concern.
#[async_trait]
pub trait UsageReporter: Send + Sync {
    async fn record(&self, request: &ExecuteRequest, result_data: &serde_json::Value);
}

/// Default hook: log and move on.
pub struct NoopUsageReporter;

#[async_trait]
impl UsageReporter for NoopUsageReporter {
    async fn record(&self, request: &ExecuteRequest, result_data: &serde_json::Value) {
        tracing::debug!(
            "Usage for {}: {}",
            request.conversation_id,
            result_data.get("usage").unwrap_or(&serde_json::Value::Null)
        );
    }
}

/// Async callback handed to the garbage collector so it can stop the
/// proxy of any sandbox it reaps.
pub type ProxyStopFn =
    Arc<dyn Fn(String) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// What the relay observed by the time the stream ended.
#[derive(Debug, Default)]
pub(crate) struct RelayOutcome {
    /// Payload of the trailing `result` event, for the accounting hook.
    pub result_data: Option<serde_json::Value>,
    /// The failure that ended the stream, if any.
    pub error: Option<WorkspaceError>,
    /// Whether the caller went away mid-stream.
    pub caller_gone: bool,
}

/// The central state machine.
#[derive(Clone)]
pub struct Orchestrator {
    backend: Arc<dyn ContainerBackend>,
    store: Store,
    pool: Arc<WarmPool>,
    lock: DistributedLock,
    file_sync: Arc<FileSync>,
    proxies: Arc<RwLock<HashMap<String, Arc<EgressProxy>>>>,
    shutdown: Arc<ShutdownManager>,
    usage: Arc<dyn UsageReporter>,
    allowlist: DomainAllowlist,
    credentials: AwsCredentials,
    execution_timeout: Duration,
    event_timeout: Duration,
    grace_period: Duration,
    lock_ttl: Duration,
    lock_wait_budget: Duration,
    proxy_log_all: bool,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        store: Store,
        pool: Arc<WarmPool>,
        file_sync: Arc<FileSync>,
        shutdown: Arc<ShutdownManager>,
        settings: &Settings,
    ) -> Self {
        Self {
            backend,
            lock: DistributedLock::for_conversations(store.connection()),
            store,
            pool,
            file_sync,
            proxies: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            usage: Arc::new(NoopUsageReporter),
            allowlist: DomainAllowlist::new(&settings.proxy.domain_whitelist),
            credentials: AwsCredentials::from_config(&settings.aws),
            execution_timeout: settings.container.execution_timeout,
            event_timeout: settings.container.event_timeout,
            grace_period: settings.container.grace_period,
            lock_ttl: settings.lock.ttl,
            lock_wait_budget: settings.lock.wait_budget,
            proxy_log_all: settings.proxy.log_all_requests,
        }
    }

    /// Replace the accounting hook.
    pub fn with_usage_reporter(mut self, usage: Arc<dyn UsageReporter>) -> Self {
        self.usage = usage;
        self
    }

    /// Resolve or create the sandbox bound to a conversation.
    ///
    /// A healthy existing binding is refreshed and returned; an unhealthy
    /// one is torn down and replaced from the warm pool.
    pub async fn get_or_create(&self, conversation_id: &str) -> Result<Sandbox> {
        if let Some(mut existing) = self.store.load_binding(conversation_id).await? {
            if self.backend.is_healthy(&existing.id).await {
                existing.touch();
                self.store.refresh_binding(&existing).await?;
                tracing::info!(
                    "Reusing sandbox {} for conversation {}",
                    existing.id,
                    conversation_id
                );
                return Ok(existing);
            }
            tracing::warn!(
                "Unhealthy sandbox {} for conversation {}, recreating",
                existing.id,
                conversation_id
            );
            self.cleanup_sandbox(&existing).await;
        }

        let startup_start = std::time::Instant::now();
        let mut sandbox = self.pool.acquire().await?;
        sandbox.conversation_id = Some(conversation_id.to_string());
        sandbox.state = SandboxState::Ready;
        sandbox.touch();

        self.start_proxy(&sandbox).await?;
        self.store.save_binding(&sandbox).await?;

        let startup = startup_start.elapsed();
        metrics()
            .container_startup_seconds
            .observe(startup.as_secs_f64());
        metrics().active_containers.inc();

        tracing::info!(
            "Bound sandbox {} to conversation {} in {:?}",
            sandbox.id,
            conversation_id,
            startup
        );
        audit::container_created(
            &sandbox.id,
            conversation_id,
            "",
            "warm_pool",
            startup.as_millis() as u64,
        );
        Ok(sandbox)
    }

    /// Run one execute call, returning the caller's event stream.
    ///
    /// The conversation lock is held for the whole call. Execution runs on
    /// a tracked background task, so dropping the receiver (client
    /// disconnect) does not cancel it.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ReceiverStream<Event>> {
        let token = match self
            .lock
            .acquire(&request.conversation_id, self.lock_ttl, self.lock_wait_budget)
            .await
        {
            Ok(token) => token,
            Err(WorkspaceError::LockAcquisitionTimeout { .. }) => {
                tracing::warn!(
                    "Conversation {} is locked by another request",
                    request.conversation_id
                );
                return Err(WorkspaceError::ConversationLocked {
                    conversation_id: request.conversation_id.clone(),
                });
            }
            Err(e) => return Err(e),
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let orchestrator = self.clone();
        self.shutdown.spawn(async move {
            let conversation_id = request.conversation_id.clone();
            orchestrator.run_execute(request, tx).await;
            // The deferred release: runs on every exit path of the call.
            orchestrator.lock.release(&conversation_id, &token).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    /// Destroy the sandbox bound to a conversation, if any.
    pub async fn destroy(&self, conversation_id: &str) -> Result<()> {
        let Some(sandbox) = self.store.load_binding(conversation_id).await? else {
            return Ok(());
        };
        self.cleanup_sandbox(&sandbox).await;
        tracing::info!("Destroyed sandbox for conversation {}", conversation_id);
        Ok(())
    }

    /// Stop every proxy, destroy every listed sandbox, drain the pool.
    pub async fn destroy_all(&self) {
        tracing::info!("Destroying all sandboxes");

        let proxies: Vec<_> = self.proxies.write().await.drain().collect();
        for (sandbox_id, proxy) in proxies {
            tracing::debug!("Stopping proxy for {}", sandbox_id);
            proxy.stop().await;
        }

        match self.backend.list_workspace_sandboxes().await {
            Ok(listed) => {
                let mut destroyed = 0;
                for entry in listed {
                    if let Err(e) = self
                        .backend
                        .destroy_sandbox(&entry.id, Duration::from_secs(5))
                        .await
                    {
                        tracing::warn!("Destroy of {} failed: {}", entry.id, e);
                    } else {
                        destroyed += 1;
                    }
                    if let Some(conversation_id) = entry.conversation_id {
                        let _ = self.store.delete_binding(&conversation_id, &entry.id).await;
                    }
                }
                tracing::info!("Destroyed {} sandbox(es)", destroyed);
            }
            Err(e) => tracing::error!("Listing sandboxes for destroy_all failed: {}", e),
        }

        if let Err(e) = self.pool.drain().await {
            tracing::error!("Warm pool drain failed: {}", e);
        }
    }

    /// On startup, reconcile live sandboxes against the store: bound ones
    /// keep serving, unbound ones are left for the GC to reap.
    pub async fn reconcile_on_startup(&self) {
        match self.backend.list_workspace_sandboxes().await {
            Ok(listed) => {
                let mut bound = 0;
                let mut orphaned = 0;
                for entry in &listed {
                    match self.store.load_reverse_binding(&entry.id).await {
                        Ok(Some(_)) => bound += 1,
                        _ => orphaned += 1,
                    }
                }
                tracing::info!(
                    "Startup reconciliation: {} live sandbox(es), {} bound, {} left to GC",
                    listed.len(),
                    bound,
                    orphaned
                );
            }
            Err(e) => tracing::warn!("Startup reconciliation failed: {}", e),
        }
    }

    /// Callback the GC uses to stop the proxy of a sandbox it destroys.
    pub fn proxy_stop_callback(&self) -> ProxyStopFn {
        let proxies = self.proxies.clone();
        Arc::new(move |sandbox_id: String| {
            let proxies = proxies.clone();
            Box::pin(async move {
                let proxy = proxies.write().await.remove(&sandbox_id);
                if let Some(proxy) = proxy {
                    proxy.stop().await;
                }
            })
        })
    }

    // ---- execute internals ----

    async fn run_execute(&self, request: ExecuteRequest, tx: mpsc::Sender<Event>) {
        let started = std::time::Instant::now();
        let mut seq = SequenceCounter::new();

        let mut sandbox = match self.get_or_create(&request.conversation_id).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                tracing::error!(
                    "No sandbox for conversation {}: {}",
                    request.conversation_id,
                    e
                );
                audit::agent_execution_failed(
                    "",
                    &request.conversation_id,
                    &request.tenant_id,
                    &e.to_string(),
                    e.kind(),
                );
                metrics().requests_total.with_label_values(&["error"]).inc();
                let _ = tx
                    .send(error_event(seq.next(), e.kind(), &e.to_string(), false))
                    .await;
                let _ = tx
                    .send(done_event(
                        seq.next(),
                        "error",
                        started.elapsed().as_millis() as u64,
                    ))
                    .await;
                return;
            }
        };

        audit::agent_execution_started(
            &sandbox.id,
            &request.conversation_id,
            &request.tenant_id,
            &request.model_id,
        );

        if request.workspace_enabled {
            if let Some(session_id) = &request.session_id
                && let Err(e) = self
                    .file_sync
                    .restore_session_file(
                        &request.tenant_id,
                        &request.conversation_id,
                        &sandbox,
                        session_id,
                    )
                    .await
            {
                tracing::error!("Session restore failed: {}", e);
            }

            if let Err(e) = self
                .file_sync
                .sync_to_sandbox(&request.tenant_id, &request.conversation_id, &sandbox)
                .await
            {
                tracing::error!("Sync to sandbox failed: {}", e);
            }
        }

        sandbox.state = SandboxState::Running;
        sandbox.touch();
        if let Err(e) = self.store.refresh_binding(&sandbox).await {
            tracing::error!("Binding refresh failed: {}", e);
        }

        let mut sync_tasks = JoinSet::new();
        let outcome = self
            .stream_from_sandbox(&request, &sandbox, &mut seq, &tx, &mut sync_tasks)
            .await;

        // Let outstanding opportunistic syncs settle before the final one.
        let drain = async {
            while sync_tasks.join_next().await.is_some() {}
        };
        let _ = tokio::time::timeout(SYNC_DRAIN_TIMEOUT, drain).await;

        let mut recovered = false;
        match outcome.error {
            None => {
                if request.workspace_enabled {
                    if let Err(e) = self
                        .file_sync
                        .sync_from_sandbox(&request.tenant_id, &request.conversation_id, &sandbox)
                        .await
                    {
                        tracing::error!("Sync from sandbox failed: {}", e);
                    }
                    if let Some(session_id) = &request.session_id
                        && let Err(e) = self
                            .file_sync
                            .save_session_file(
                                &request.tenant_id,
                                &request.conversation_id,
                                &sandbox,
                                session_id,
                            )
                            .await
                    {
                        tracing::error!("Session save failed: {}", e);
                    }
                }

                if let Some(result_data) = &outcome.result_data {
                    self.usage.record(&request, result_data).await;
                    let usage = result_data.get("usage").cloned().unwrap_or_default();
                    audit::agent_execution_completed(
                        &sandbox.id,
                        &request.conversation_id,
                        &request.tenant_id,
                        started.elapsed().as_millis() as u64,
                        usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                        usage
                            .get("output_tokens")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0),
                    );
                }

                metrics()
                    .requests_total
                    .with_label_values(&["success"])
                    .inc();
                if !outcome.caller_gone {
                    let _ = tx
                        .send(done_event(
                            seq.next(),
                            "success",
                            started.elapsed().as_millis() as u64,
                        ))
                        .await;
                }
            }
            Some(error) => {
                recovered = self
                    .handle_stream_failure(&request, &sandbox, error, &mut seq, &tx)
                    .await;
            }
        }

        if !recovered {
            sandbox.state = SandboxState::Idle;
            sandbox.touch();
            if let Err(e) = self.store.refresh_binding(&sandbox).await {
                tracing::error!("Binding refresh failed: {}", e);
            }
        }
    }

    /// Open the streaming call and relay events until the stream ends.
    async fn stream_from_sandbox(
        &self,
        request: &ExecuteRequest,
        sandbox: &Sandbox,
        seq: &mut SequenceCounter,
        tx: &mpsc::Sender<Event>,
        sync_tasks: &mut JoinSet<()>,
    ) -> RelayOutcome {
        let agent_request = json!({
            "conversation_id": request.conversation_id,
            "tenant_id": request.tenant_id,
            "model_id": request.model_id,
            "workspace_enabled": request.workspace_enabled,
            "user_input": request.user_input,
            "executor": request.executor,
            "preferred_skills": request.preferred_skills,
            "session_id": request.session_id,
            "cwd": "/workspace",
        });

        let (frame_tx, frame_rx) = mpsc::channel::<Result<RawFrame>>(EVENT_CHANNEL_CAPACITY);
        let agent = AgentClient::new(sandbox.agent_endpoint.clone());
        let execution_timeout = self.execution_timeout;

        let reader = tokio::spawn(async move {
            let response = match agent.execute_stream(&agent_request).await {
                Ok(response) => response,
                Err(e) => {
                    // A connect-phase failure points at the proxy/socket
                    // plumbing rather than a crashed agent.
                    let _ = frame_tx
                        .send(Err(WorkspaceError::ProxyUnavailable {
                            reason: e.to_string(),
                        }))
                        .await;
                    return;
                }
            };

            let mut body = response.into_body();
            let mut parser = crate::events::FrameParser::new();
            loop {
                match tokio::time::timeout(execution_timeout, body.frame()).await {
                    Err(_) => {
                        let _ = frame_tx
                            .send(Err(WorkspaceError::AgentTimeout {
                                timeout: execution_timeout,
                            }))
                            .await;
                        return;
                    }
                    Ok(None) => return,
                    Ok(Some(Err(e))) => {
                        let _ = frame_tx
                            .send(Err(WorkspaceError::AgentCrashed {
                                reason: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                    Ok(Some(Ok(frame))) => {
                        if let Ok(data) = frame.into_data() {
                            for raw in parser.push(&data) {
                                if frame_tx.send(Ok(raw)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        let mut last_sync: Option<tokio::time::Instant> = None;
        let file_sync = self.file_sync.clone();
        let workspace_enabled = request.workspace_enabled;
        let tenant_id = request.tenant_id.clone();
        let sync_conversation_id = request.conversation_id.clone();
        let sandbox_for_sync = sandbox.clone();

        relay_frames(
            frame_rx,
            tx,
            seq,
            self.event_timeout,
            Some(reader.abort_handle()),
            &request.conversation_id,
            move |tasks: &mut JoinSet<()>| {
                if !workspace_enabled {
                    return;
                }
                let now = tokio::time::Instant::now();
                // Debounce, and keep at most a couple of syncs in flight.
                if last_sync.is_some_and(|t| now.duration_since(t) < SYNC_DEBOUNCE)
                    || tasks.len() >= 2
                {
                    return;
                }
                last_sync = Some(now);
                let file_sync = file_sync.clone();
                let tenant_id = tenant_id.clone();
                let conversation_id = sync_conversation_id.clone();
                let sandbox = sandbox_for_sync.clone();
                tasks.spawn(async move {
                    if let Err(e) = file_sync
                        .sync_from_sandbox(&tenant_id, &conversation_id, &sandbox)
                        .await
                    {
                        tracing::error!("Opportunistic sync failed: {}", e);
                    }
                });
            },
            sync_tasks,
        )
        .await
    }

    /// Failure ladder: an idle timeout tears the sandbox down; a proxy
    /// connection error first attempts a proxy-only restart; anything else
    /// recreates the sandbox. Returns true when a replacement sandbox was
    /// bound (the binding no longer points at `sandbox`).
    async fn handle_stream_failure(
        &self,
        request: &ExecuteRequest,
        sandbox: &Sandbox,
        error: WorkspaceError,
        seq: &mut SequenceCounter,
        tx: &mpsc::Sender<Event>,
    ) -> bool {
        match error {
            WorkspaceError::AgentTimeout { timeout } => {
                metrics()
                    .requests_total
                    .with_label_values(&["timeout"])
                    .inc();
                tracing::error!(
                    "Agent in {} produced no bytes for {:?}, tearing down",
                    sandbox.id,
                    timeout
                );
                let _ = tx
                    .send(error_event(
                        seq.next(),
                        "timeout_error",
                        "Execution timeout",
                        true,
                    ))
                    .await;

                // The stuck agent may still be running; the sandbox cannot
                // be trusted for another request.
                match self.recover(request, sandbox).await {
                    Ok(replacement) => {
                        tracing::info!(
                            "Recovered conversation {} onto sandbox {}",
                            request.conversation_id,
                            replacement.id
                        );
                        let _ = tx.send(container_recovered_event(seq.next())).await;
                        true
                    }
                    Err(e) => {
                        tracing::error!("Recovery failed: {}", e);
                        false
                    }
                }
            }
            WorkspaceError::ProxyUnavailable { reason } => {
                metrics().requests_total.with_label_values(&["error"]).inc();
                tracing::warn!(
                    "Proxy connection error for {} ({}), restarting proxy",
                    sandbox.id,
                    reason
                );
                let _ = tx
                    .send(error_event(
                        seq.next(),
                        "proxy_unavailable",
                        "Container execution failed",
                        true,
                    ))
                    .await;

                if self.restart_proxy(sandbox).await.is_ok() {
                    let _ = tx.send(container_recovered_event(seq.next())).await;
                    return false;
                }

                tracing::error!("Proxy restart failed, recreating sandbox {}", sandbox.id);
                metrics().container_crashes_total.inc();
                audit::container_crashed(
                    &sandbox.id,
                    &request.conversation_id,
                    &request.tenant_id,
                    &reason,
                );
                match self.recover(request, sandbox).await {
                    Ok(_) => {
                        let _ = tx.send(container_recovered_event(seq.next())).await;
                        true
                    }
                    Err(e) => {
                        tracing::error!("Recovery failed: {}", e);
                        false
                    }
                }
            }
            error => {
                metrics().requests_total.with_label_values(&["error"]).inc();
                metrics().container_crashes_total.inc();
                tracing::error!("Stream error for sandbox {}: {}", sandbox.id, error);
                audit::container_crashed(
                    &sandbox.id,
                    &request.conversation_id,
                    &request.tenant_id,
                    &error.to_string(),
                );
                let _ = tx
                    .send(error_event(
                        seq.next(),
                        error.kind(),
                        "Container execution failed",
                        true,
                    ))
                    .await;

                match self.recover(request, sandbox).await {
                    Ok(replacement) => {
                        tracing::info!(
                            "Recovered conversation {} onto sandbox {}",
                            request.conversation_id,
                            replacement.id
                        );
                        let _ = tx.send(container_recovered_event(seq.next())).await;
                        true
                    }
                    Err(e) => {
                        tracing::error!("Recovery failed: {}", e);
                        false
                    }
                }
            }
        }
    }

    /// Tear down a broken sandbox and bind a fresh one.
    async fn recover(&self, request: &ExecuteRequest, old: &Sandbox) -> Result<Sandbox> {
        self.cleanup_sandbox(old).await;
        self.get_or_create(&request.conversation_id).await
    }

    // ---- proxy management ----

    /// Start (or adopt) the egress proxy for a sandbox and verify it
    /// accepts connections.
    async fn start_proxy(&self, sandbox: &Sandbox) -> Result<()> {
        match &sandbox.proxy_endpoint {
            Endpoint::Unix(_) => {
                let mut proxy = EgressProxy::new(
                    &sandbox.id,
                    sandbox.proxy_endpoint.clone(),
                    self.allowlist.clone(),
                    self.credentials.clone(),
                    self.proxy_log_all,
                );
                proxy.start().await?;
                self.proxies
                    .write()
                    .await
                    .insert(sandbox.id.clone(), Arc::new(proxy));
            }
            Endpoint::Tcp(_) => {
                // Runner backend: the proxy is a sidecar in the task.
            }
        }

        self.verify_proxy_ready(sandbox).await;
        Ok(())
    }

    async fn stop_proxy(&self, sandbox_id: &str) {
        let proxy = self.proxies.write().await.remove(sandbox_id);
        if let Some(proxy) = proxy {
            proxy.stop().await;
        }
    }

    async fn restart_proxy(&self, sandbox: &Sandbox) -> Result<()> {
        tracing::warn!("Restarting proxy for sandbox {}", sandbox.id);
        self.stop_proxy(&sandbox.id).await;
        self.start_proxy(sandbox).await
    }

    /// Confirm the proxy endpoint accepts a trivial connection. Failure is
    /// logged but not fatal; the agent retries on first use.
    async fn verify_proxy_ready(&self, sandbox: &Sandbox) {
        let attempt = async {
            match &sandbox.proxy_endpoint {
                Endpoint::Unix(path) => tokio::net::UnixStream::connect(path).await.map(|_| ()),
                Endpoint::Tcp(addr) => tokio::net::TcpStream::connect(addr).await.map(|_| ()),
            }
        };
        match tokio::time::timeout(Duration::from_secs(5), attempt).await {
            Ok(Ok(())) => {
                tracing::debug!("Proxy for {} accepts connections", sandbox.id);
            }
            Ok(Err(e)) => {
                tracing::error!(
                    "Proxy verification failed for {} at {}: {}",
                    sandbox.id,
                    sandbox.proxy_endpoint,
                    e
                );
            }
            Err(_) => {
                tracing::error!(
                    "Proxy verification timed out for {} at {}",
                    sandbox.id,
                    sandbox.proxy_endpoint
                );
            }
        }
    }

    /// Stop the proxy, destroy the container, and remove both binding
    /// keys.
    async fn cleanup_sandbox(&self, sandbox: &Sandbox) {
        self.stop_proxy(&sandbox.id).await;

        if let Err(e) = self
            .backend
            .destroy_sandbox(&sandbox.id, self.grace_period)
            .await
        {
            tracing::error!("Destroy of sandbox {} failed: {}", sandbox.id, e);
        }

        let conversation_id = sandbox.conversation_id.clone().unwrap_or_default();
        if let Err(e) = self.store.delete_binding(&conversation_id, &sandbox.id).await {
            tracing::error!("Binding delete failed for {}: {}", sandbox.id, e);
        }

        metrics().active_containers.dec();
        audit::container_destroyed(&sandbox.id, &conversation_id, "", "cleanup");
    }
}

/// Whether a `tool_result` payload came from a file-writing tool.
fn is_file_tool_result(data: &serde_json::Value) -> bool {
    data.get("tool_name")
        .and_then(|v| v.as_str())
        .is_some_and(|name| FILE_TOOL_NAMES.contains(&name))
}

/// Relay frames from the reader toward the caller, stamping sequence
/// numbers. The event-timeout branch is the safety net for a reader stuck
/// past its own read timeout. A closed caller channel flips `caller_gone`
/// and the relay keeps draining so execution side effects still complete.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn relay_frames(
    mut frame_rx: mpsc::Receiver<Result<RawFrame>>,
    tx: &mpsc::Sender<Event>,
    seq: &mut SequenceCounter,
    event_timeout: Duration,
    reader_abort: Option<tokio::task::AbortHandle>,
    conversation_id: &str,
    mut on_file_tool: impl FnMut(&mut JoinSet<()>),
    sync_tasks: &mut JoinSet<()>,
) -> RelayOutcome {
    let mut outcome = RelayOutcome::default();

    loop {
        match tokio::time::timeout(event_timeout, frame_rx.recv()).await {
            Err(_) => {
                if let Some(abort) = reader_abort {
                    abort.abort();
                }
                outcome.error = Some(WorkspaceError::AgentTimeout {
                    timeout: event_timeout,
                });
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                outcome.error = Some(e);
                break;
            }
            Ok(Some(Ok(raw))) => {
                if raw.event == kind::RESULT {
                    outcome.result_data = Some(raw.data.clone());
                }
                let file_tool = raw.event == kind::TOOL_RESULT && is_file_tool_result(&raw.data);

                let event = Event::new(seq.next(), &raw.event, raw.data);
                if !outcome.caller_gone && tx.send(event).await.is_err() {
                    outcome.caller_gone = true;
                    tracing::info!(
                        "Client disconnected, background execution continues for {}",
                        conversation_id
                    );
                }

                if file_tool {
                    on_file_tool(sync_tasks);
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(event: &str, data: serde_json::Value) -> Result<RawFrame> {
        Ok(RawFrame {
            event: event.to_string(),
            data,
        })
    }

    async fn run_relay(
        frames: Vec<Result<RawFrame>>,
        capacity: usize,
        event_timeout: Duration,
        drop_receiver_after: Option<usize>,
    ) -> (RelayOutcome, Vec<Event>) {
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (tx, mut rx) = mpsc::channel(capacity);
        let mut seq = SequenceCounter::new();
        let mut sync_tasks = JoinSet::new();

        let feeder = tokio::spawn(async move {
            for f in frames {
                if frame_tx.send(f).await.is_err() {
                    return;
                }
            }
        });

        let collector = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
                if let Some(n) = drop_receiver_after
                    && events.len() >= n
                {
                    break;
                }
            }
            events
        });

        let outcome = relay_frames(
            frame_rx,
            &tx,
            &mut seq,
            event_timeout,
            None,
            "conv-test",
            |_| {},
            &mut sync_tasks,
        )
        .await;
        drop(tx);

        feeder.await.unwrap();
        let events = collector.await.unwrap();
        (outcome, events)
    }

    #[tokio::test]
    async fn test_relay_stamps_monotone_sequence() {
        let frames = vec![
            frame(kind::SESSION_START, json!({})),
            frame(kind::TEXT_DELTA, json!({"text": "a"})),
            frame(kind::TEXT_DELTA, json!({"text": "b"})),
        ];
        let (outcome, events) = run_relay(frames, 16, Duration::from_secs(1), None).await;

        assert!(outcome.error.is_none());
        assert!(!outcome.caller_gone);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(events[0].event, kind::SESSION_START);
    }

    #[tokio::test]
    async fn test_relay_captures_trailing_result() {
        let frames = vec![
            frame(kind::TEXT_DELTA, json!({"text": "a"})),
            frame(
                kind::RESULT,
                json!({"usage": {"input_tokens": 10, "output_tokens": 5}}),
            ),
        ];
        let (outcome, _) = run_relay(frames, 16, Duration::from_secs(1), None).await;

        let result = outcome.result_data.expect("result captured");
        assert_eq!(result["usage"]["input_tokens"], 10);
    }

    #[tokio::test]
    async fn test_relay_surfaces_reader_error() {
        let frames = vec![
            frame(kind::TEXT_DELTA, json!({"text": "a"})),
            Err(WorkspaceError::AgentCrashed {
                reason: "connection reset".to_string(),
            }),
        ];
        let (outcome, events) = run_relay(frames, 16, Duration::from_secs(1), None).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            outcome.error,
            Some(WorkspaceError::AgentCrashed { .. })
        ));
    }

    #[tokio::test]
    async fn test_relay_times_out_on_silence() {
        let (frame_tx, frame_rx) = mpsc::channel::<Result<RawFrame>>(4);
        let (tx, _rx) = mpsc::channel(4);
        let mut seq = SequenceCounter::new();
        let mut sync_tasks = JoinSet::new();

        // Keep the sender alive without sending anything.
        let outcome = relay_frames(
            frame_rx,
            &tx,
            &mut seq,
            Duration::from_millis(50),
            None,
            "conv-test",
            |_| {},
            &mut sync_tasks,
        )
        .await;
        drop(frame_tx);

        assert!(matches!(
            outcome.error,
            Some(WorkspaceError::AgentTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_relay_continues_after_caller_disconnect() {
        let frames = vec![
            frame(kind::TEXT_DELTA, json!({"text": "a"})),
            frame(kind::TEXT_DELTA, json!({"text": "b"})),
            frame(kind::RESULT, json!({"usage": {}})),
        ];
        // Receiver goes away after the first event.
        let (outcome, events) = run_relay(frames, 1, Duration::from_secs(1), Some(1)).await;

        assert_eq!(events.len(), 1);
        assert!(outcome.caller_gone);
        // Execution side effects survive the disconnect: the result event
        // is still captured for accounting.
        assert!(outcome.result_data.is_some());
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_relay_triggers_file_tool_hook() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (tx, mut rx) = mpsc::channel(8);
        let mut seq = SequenceCounter::new();
        let mut sync_tasks = JoinSet::new();
        let drainer = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        frame_tx
            .send(frame(
                kind::TOOL_RESULT,
                json!({"tool_name": "write_file", "output": "ok"}),
            ))
            .await
            .unwrap();
        frame_tx
            .send(frame(
                kind::TOOL_RESULT,
                json!({"tool_name": "web_search", "output": "ok"}),
            ))
            .await
            .unwrap();
        drop(frame_tx);

        let mut hook_calls = 0;
        let outcome = relay_frames(
            frame_rx,
            &tx,
            &mut seq,
            Duration::from_secs(1),
            None,
            "conv-test",
            |_| hook_calls += 1,
            &mut sync_tasks,
        )
        .await;
        drop(tx);
        drainer.await.unwrap();

        assert!(outcome.error.is_none());
        assert_eq!(hook_calls, 1, "only file tools trigger the sync hook");
    }

    #[test]
    fn test_is_file_tool_result() {
        assert!(is_file_tool_result(&json!({"tool_name": "Write"})));
        assert!(is_file_tool_result(&json!({"tool_name": "edit_file"})));
        assert!(!is_file_tool_result(&json!({"tool_name": "web_search"})));
        assert!(!is_file_tool_result(&json!({})));
    }
}
