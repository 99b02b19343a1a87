//! End-to-end lifecycle scenarios against a mock backend and a scripted
//! agent. These need a live Redis at `REDIS_URL` (default local), so they
//! are gated behind the `integration` feature:
//!
//! ```text
//! cargo test --features integration --test lifecycle
//! ```
#![cfg(feature = "integration")]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use workspaced::backend::{ContainerBackend, ListedSandbox};
use workspaced::config::Settings;
use workspaced::error::{Result, WorkspaceError};
use workspaced::events::kind;
use workspaced::gc::GarbageCollector;
use workspaced::orchestrator::{ExecuteRequest, Orchestrator};
use workspaced::pool::WarmPool;
use workspaced::sandbox::{Endpoint, Sandbox, SandboxState};
use workspaced::shutdown::ShutdownManager;
use workspaced::store::Store;
use workspaced::sync::{FileRecordStore, FileSync};
use workspaced::sync::blob::{BlobEntry, BlobStore};

// ---- scripted agent ----

/// What the mock agent does with one `/execute` call.
#[derive(Clone, Copy, Debug)]
enum AgentScript {
    /// Stream a normal session and finish cleanly.
    Normal,
    /// Stream one delta, then drop the connection mid-body.
    CrashMidStream,
    /// Stream one delta, then go silent without closing.
    Hang,
}

/// Minimal raw-HTTP agent: `/health` plus scripted `/execute` responses.
struct MockAgent {
    addr: String,
    script: Arc<std::sync::Mutex<AgentScript>>,
}

impl MockAgent {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let script = Arc::new(std::sync::Mutex::new(AgentScript::Normal));
        let script_clone = script.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let script = *script_clone.lock().unwrap();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut request = Vec::new();
                    loop {
                        let Ok(n) = stream.read(&mut buf).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        request.extend_from_slice(&buf[..n]);
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&request).into_owned();

                    if request.starts_with("GET /health") {
                        let body = br#"{"status":"ok"}"#;
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                            body.len()
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.write_all(body).await;
                        return;
                    }

                    let frames = |events: &[(&str, serde_json::Value)]| {
                        events
                            .iter()
                            .map(|(event, data)| format!("event: {event}\ndata: {data}\n\n"))
                            .collect::<String>()
                    };

                    match script {
                        AgentScript::Normal => {
                            let body = frames(&[
                                (kind::SESSION_START, json!({"session_id": "s-1"})),
                                (kind::TEXT_DELTA, json!({"text": "hello"})),
                                (kind::TEXT_DELTA, json!({"text": " world"})),
                                (
                                    kind::RESULT,
                                    json!({"usage": {"input_tokens": 12, "output_tokens": 4}}),
                                ),
                            ]);
                            let response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\n\r\n{}",
                                body.len(),
                                body
                            );
                            let _ = stream.write_all(response.as_bytes()).await;
                        }
                        AgentScript::CrashMidStream => {
                            let partial = frames(&[(kind::TEXT_DELTA, json!({"text": "par"}))]);
                            // Promise more bytes than are sent, then die.
                            let response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\n\r\n{}",
                                partial.len() + 512,
                                partial
                            );
                            let _ = stream.write_all(response.as_bytes()).await;
                            let _ = stream.shutdown().await;
                        }
                        AgentScript::Hang => {
                            let partial = frames(&[(kind::TEXT_DELTA, json!({"text": "stuck"}))]);
                            let response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\n\r\n{}",
                                partial.len() + 512,
                                partial
                            );
                            let _ = stream.write_all(response.as_bytes()).await;
                            // Keep the socket open, send nothing more.
                            tokio::time::sleep(Duration::from_secs(600)).await;
                        }
                    }
                });
            }
        });

        Self { addr, script }
    }

    fn set_script(&self, script: AgentScript) {
        *self.script.lock().unwrap() = script;
    }
}

// ---- mock backend ----

#[derive(Default)]
struct MockState {
    alive: HashMap<String, bool>,
    conversations: HashMap<String, Option<String>>,
    files: HashMap<String, Vec<u8>>,
}

struct MockBackend {
    agent_addr: String,
    state: Mutex<MockState>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl MockBackend {
    fn new(agent_addr: &str) -> Self {
        Self {
            agent_addr: agent_addr.to_string(),
            state: Mutex::new(MockState::default()),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    async fn is_alive(&self, sandbox_id: &str) -> bool {
        self.state.lock().await.alive.contains_key(sandbox_id)
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn create_sandbox(&self, conversation_id: Option<&str>) -> Result<Sandbox> {
        let id = Sandbox::new_id();
        let mut state = self.state.lock().await;
        state.alive.insert(id.clone(), true);
        state
            .conversations
            .insert(id.clone(), conversation_id.map(str::to_string));
        self.created.fetch_add(1, Ordering::SeqCst);

        let now = chrono::Utc::now();
        Ok(Sandbox {
            id,
            backend: "docker".to_string(),
            agent_endpoint: Endpoint::Tcp(self.agent_addr.clone()),
            // The mock agent doubles as something that accepts proxy
            // verification connections.
            proxy_endpoint: Endpoint::Tcp(self.agent_addr.clone()),
            conversation_id: conversation_id.map(str::to_string),
            created_at: now,
            last_active_at: now,
            state: if conversation_id.is_some() {
                SandboxState::Ready
            } else {
                SandboxState::Warm
            },
            task_ref: String::new(),
        })
    }

    async fn destroy_sandbox(&self, sandbox_id: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.alive.remove(sandbox_id);
        state.conversations.remove(sandbox_id);
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self, sandbox_id: &str) -> bool {
        self.state
            .lock()
            .await
            .alive
            .get(sandbox_id)
            .copied()
            .unwrap_or(false)
    }

    async fn list_workspace_sandboxes(&self) -> Result<Vec<ListedSandbox>> {
        let state = self.state.lock().await;
        Ok(state
            .alive
            .keys()
            .map(|id| ListedSandbox {
                id: id.clone(),
                conversation_id: state.conversations.get(id).cloned().flatten(),
                running: true,
                task_ref: String::new(),
            })
            .collect())
    }

    async fn wait_for_agent_ready(&self, _sandbox: &Sandbox, _timeout: Duration) -> bool {
        true
    }

    async fn exec(&self, _sandbox: &Sandbox, cmd: &[String]) -> Result<(i64, String)> {
        if cmd.first().map(String::as_str) == Some("find") {
            let state = self.state.lock().await;
            let listing = state
                .files
                .keys()
                .map(|path| path.trim_start_matches("/workspace/").to_string())
                .collect::<Vec<_>>()
                .join("\n");
            return Ok((0, listing));
        }
        Ok((0, String::new()))
    }

    async fn exec_binary(&self, _sandbox: &Sandbox, _cmd: &[String]) -> Result<(i64, Vec<u8>)> {
        Ok((0, Vec::new()))
    }

    async fn write_file(&self, _sandbox: &Sandbox, dest_path: &str, data: &[u8]) -> Result<()> {
        self.state
            .lock()
            .await
            .files
            .insert(dest_path.to_string(), data.to_vec());
        Ok(())
    }

    async fn read_file(&self, _sandbox: &Sandbox, src_path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().await.files.get(src_path).cloned())
    }

    async fn logs(&self, _sandbox_id: &str, _tail: usize) -> String {
        "<mock>".to_string()
    }
}

/// Blob store stub: everything succeeds, nothing is stored.
struct NullBlobStore;

#[async_trait]
impl BlobStore for NullBlobStore {
    async fn upload(&self, _: &str, _: &str, _: &str, _: Vec<u8>) -> Result<()> {
        Ok(())
    }
    async fn download(&self, _: &str, _: &str, path: &str) -> Result<Vec<u8>> {
        Err(WorkspaceError::NotFound {
            resource: format!("blob {path}"),
        })
    }
    async fn list(&self, _: &str, _: &str) -> Result<Vec<BlobEntry>> {
        Ok(Vec::new())
    }
    async fn delete(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
    async fn exists(&self, _: &str, _: &str, _: &str) -> Result<bool> {
        Ok(false)
    }
}

// ---- harness ----

struct Harness {
    orchestrator: Orchestrator,
    backend: Arc<MockBackend>,
    pool: Arc<WarmPool>,
    store: Store,
    agent: MockAgent,
    settings: Settings,
    shutdown: Arc<ShutdownManager>,
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    // Tight hierarchy so timeout scenarios run in test time:
    // execution (1s) < event (2s) < lock ttl (10s).
    settings.container.execution_timeout = Duration::from_secs(1);
    settings.container.event_timeout = Duration::from_secs(2);
    settings.lock.ttl = Duration::from_secs(10);
    settings.lock.wait_budget = Duration::from_millis(300);
    settings.container.grace_period = Duration::from_secs(1);
    settings.pool.min_size = 2;
    settings.pool.max_size = 4;
    settings.validate().expect("test settings valid");
    settings
}

async fn harness() -> Harness {
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
    let con = workspaced::store::connect(&redis_url)
        .await
        .expect("integration tests need a live Redis");
    let store = Store::new(con.clone());

    let agent = MockAgent::start().await;
    let backend = Arc::new(MockBackend::new(&agent.addr));
    let settings = test_settings();
    let shutdown = Arc::new(ShutdownManager::new(Duration::from_secs(5)));

    let pool = Arc::new(WarmPool::new(
        backend.clone(),
        store.clone(),
        shutdown.clone(),
        settings.pool.min_size,
        settings.pool.max_size,
    ));
    let file_sync = Arc::new(FileSync::new(
        Arc::new(NullBlobStore),
        FileRecordStore::new(con),
        backend.clone(),
    ));
    let orchestrator = Orchestrator::new(
        backend.clone(),
        store.clone(),
        pool.clone(),
        file_sync,
        shutdown.clone(),
        &settings,
    );

    Harness {
        orchestrator,
        backend,
        pool,
        store,
        agent,
        settings,
        shutdown,
    }
}

fn request(conversation_id: &str) -> ExecuteRequest {
    ExecuteRequest {
        conversation_id: conversation_id.to_string(),
        tenant_id: "tenant-1".to_string(),
        model_id: "model-1".to_string(),
        workspace_enabled: false,
        user_input: "hi".to_string(),
        executor: None,
        preferred_skills: Vec::new(),
        session_id: None,
    }
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

async fn collect_events(
    mut stream: tokio_stream::wrappers::ReceiverStream<workspaced::events::Event>,
) -> Vec<workspaced::events::Event> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

// ---- scenarios ----

/// Warm-path execute produces a session, deltas, and a terminal done;
/// the binding exists afterwards and the pool refills to its floor.
#[tokio::test]
async fn test_warm_path_execute() {
    let h = harness().await;
    h.pool.replenish().await.unwrap();

    let conversation = unique("conv-s1");
    let rx = h.orchestrator.execute(request(&conversation)).await.unwrap();
    let events = collect_events(rx).await;

    assert_eq!(events[0].event, kind::SESSION_START);
    assert!(events.iter().any(|e| e.event == kind::TEXT_DELTA));
    assert_eq!(events.last().unwrap().event, kind::DONE);
    assert_eq!(events.last().unwrap().data["status"], "success");

    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted, "sequence numbers are monotone");

    let binding = h.store.load_binding(&conversation).await.unwrap();
    assert!(binding.is_some(), "binding persists after the call");

    // Refill is asynchronous; give it a moment to restore the floor.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.pool.size().await.unwrap() >= h.settings.pool.min_size);

    h.shutdown.graceful_shutdown().await;
}

/// Binding symmetry: forward and reverse keys agree after binding.
#[tokio::test]
async fn test_binding_symmetry() {
    let h = harness().await;
    let conversation = unique("conv-sym");

    let sandbox = h.orchestrator.get_or_create(&conversation).await.unwrap();
    let forward = h.store.load_binding(&conversation).await.unwrap().unwrap();
    let reverse = h.store.load_reverse_binding(&sandbox.id).await.unwrap();
    assert_eq!(forward.id, sandbox.id);
    assert_eq!(reverse.as_deref(), Some(conversation.as_str()));

    h.orchestrator.destroy(&conversation).await.unwrap();
    assert!(h.store.load_binding(&conversation).await.unwrap().is_none());
    assert!(
        h.store
            .load_reverse_binding(&sandbox.id)
            .await
            .unwrap()
            .is_none()
    );

    h.shutdown.graceful_shutdown().await;
}

/// Reusing a conversation keeps the same sandbox.
#[tokio::test]
async fn test_get_or_create_reuses_healthy_sandbox() {
    let h = harness().await;
    let conversation = unique("conv-reuse");

    let first = h.orchestrator.get_or_create(&conversation).await.unwrap();
    let second = h.orchestrator.get_or_create(&conversation).await.unwrap();
    assert_eq!(first.id, second.id);

    h.shutdown.graceful_shutdown().await;
}

/// Two concurrent executes on one conversation; exactly one runs, the
/// other fails with ConversationLocked within its wait budget.
#[tokio::test]
async fn test_concurrent_executes_single_writer() {
    let h = harness().await;
    h.agent.set_script(AgentScript::Hang);
    let conversation = unique("conv-s3");

    // First caller acquires the lock and stays busy (hung agent).
    let first = h.orchestrator.execute(request(&conversation)).await;
    assert!(first.is_ok());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Second caller exhausts its wait budget.
    let second = h.orchestrator.execute(request(&conversation)).await;
    match second {
        Err(WorkspaceError::ConversationLocked { .. }) => {}
        other => panic!("expected ConversationLocked, got {other:?}"),
    }

    let events = collect_events(first.unwrap()).await;
    assert!(events.iter().any(|e| e.event == kind::ERROR));

    h.shutdown.graceful_shutdown().await;
}

/// Agent connection drops mid-stream; caller sees delta, error, then
/// container_recovered last, and the conversation points at a new sandbox.
#[tokio::test]
async fn test_crash_mid_stream_recovers() {
    let h = harness().await;
    h.agent.set_script(AgentScript::CrashMidStream);
    let conversation = unique("conv-s4");

    let rx = h.orchestrator.execute(request(&conversation)).await.unwrap();
    let events = collect_events(rx).await;

    assert!(events.iter().any(|e| e.event == kind::TEXT_DELTA));
    let error_pos = events.iter().position(|e| e.event == kind::ERROR).unwrap();
    let recovered_pos = events
        .iter()
        .position(|e| e.event == kind::CONTAINER_RECOVERED)
        .expect("container_recovered emitted");
    assert!(error_pos < recovered_pos);
    assert_eq!(recovered_pos, events.len() - 1, "recovery event is last");
    assert_eq!(events[recovered_pos].data["recovered"], true);
    assert_eq!(events[recovered_pos].data["retry_recommended"], true);

    let binding = h.store.load_binding(&conversation).await.unwrap().unwrap();
    assert!(
        h.backend.is_alive(&binding.id).await,
        "replacement sandbox is live"
    );

    h.shutdown.graceful_shutdown().await;
}

/// Silent agent trips the read timeout; the caller gets a recoverable
/// timeout error and the stuck sandbox is destroyed and replaced.
#[tokio::test]
async fn test_idle_timeout_tears_down_and_recovers() {
    let h = harness().await;
    h.agent.set_script(AgentScript::Hang);
    let conversation = unique("conv-s5");

    let rx = h.orchestrator.execute(request(&conversation)).await.unwrap();
    let events = collect_events(rx).await;

    let error = events
        .iter()
        .find(|e| e.event == kind::ERROR)
        .expect("timeout error event");
    assert_eq!(error.data["error_type"], "timeout_error");
    assert_eq!(error.data["recoverable"], true);
    assert!(
        events.iter().any(|e| e.event == kind::CONTAINER_RECOVERED),
        "a fresh sandbox is bound for the next request"
    );

    let binding = h.store.load_binding(&conversation).await.unwrap().unwrap();
    assert!(h.backend.is_alive(&binding.id).await);

    h.shutdown.graceful_shutdown().await;
}

/// The caller disconnects mid-stream but execution finishes in the
/// background and the binding stays fresh.
#[tokio::test]
async fn test_caller_disconnect_execution_continues() {
    let h = harness().await;
    let conversation = unique("conv-s6");

    let mut stream = h.orchestrator.execute(request(&conversation)).await.unwrap();
    let first = stream.next().await.expect("first event");
    assert_eq!(first.event, kind::SESSION_START);
    drop(stream);

    // Background execution must complete and release the lock.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let relock = h.orchestrator.execute(request(&conversation)).await;
    assert!(relock.is_ok(), "lock released after background completion");
    collect_events(relock.unwrap()).await;

    let binding = h.store.load_binding(&conversation).await.unwrap();
    assert!(binding.is_some());

    h.shutdown.graceful_shutdown().await;
}

/// An idle sandbox past its inactive TTL is reaped and both binding
/// keys removed.
#[tokio::test]
async fn test_gc_reaps_idle_sandbox() {
    let h = harness().await;
    let conversation = unique("conv-s7");

    let mut sandbox = h.orchestrator.get_or_create(&conversation).await.unwrap();
    // Age the binding past the inactive TTL.
    sandbox.last_active_at = chrono::Utc::now() - chrono::Duration::seconds(7200);
    h.store.save_binding(&sandbox).await.unwrap();

    let gc = GarbageCollector::new(
        h.backend.clone(),
        h.store.clone(),
        h.orchestrator.proxy_stop_callback(),
        &h.settings,
    );
    let destroyed = gc.collect().await.unwrap();
    assert!(destroyed >= 1);

    assert!(h.store.load_binding(&conversation).await.unwrap().is_none());
    assert!(
        h.store
            .load_reverse_binding(&sandbox.id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(!h.backend.is_alive(&sandbox.id).await);

    h.shutdown.graceful_shutdown().await;
}

/// GC safety: a binding refreshed within the inactive TTL survives the
/// cycle.
#[tokio::test]
async fn test_gc_spares_recently_active_sandbox() {
    let h = harness().await;
    let conversation = unique("conv-gc-live");

    let sandbox = h.orchestrator.get_or_create(&conversation).await.unwrap();

    let gc = GarbageCollector::new(
        h.backend.clone(),
        h.store.clone(),
        h.orchestrator.proxy_stop_callback(),
        &h.settings,
    );
    gc.collect().await.unwrap();

    assert!(h.backend.is_alive(&sandbox.id).await);
    assert!(h.store.load_binding(&conversation).await.unwrap().is_some());

    h.shutdown.graceful_shutdown().await;
}

/// Lock fencing: a holder whose lock was taken over cannot release or
/// extend the new holder's lock.
#[tokio::test]
async fn test_lock_fencing() {
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
    let con = workspaced::store::connect(&redis_url).await.unwrap();
    let lock = workspaced::lock::DistributedLock::for_conversations(con);
    let resource = unique("fence");

    // First holder's lock expires quickly.
    let stale = lock
        .acquire(&resource, Duration::from_millis(100), Duration::from_secs(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Second holder takes over.
    let fresh = lock
        .acquire(&resource, Duration::from_secs(5), Duration::from_secs(1))
        .await
        .unwrap();
    assert_ne!(stale, fresh);

    assert!(!lock.release(&resource, &stale).await);
    assert!(!lock.extend(&resource, &stale, Duration::from_secs(5)).await);
    assert!(lock.is_locked(&resource).await.unwrap());

    assert!(lock.release(&resource, &fresh).await);
    assert!(!lock.is_locked(&resource).await.unwrap());
}

/// Warm-pool floor: after a burst of acquires the pool returns to
/// `min_size` within a bounded number of refill rounds.
#[tokio::test]
async fn test_warm_pool_floor_restored() {
    let h = harness().await;
    h.pool.replenish().await.unwrap();
    let floor = h.settings.pool.min_size;

    for _ in 0..3 {
        let sandbox = h.pool.acquire().await.unwrap();
        h.backend
            .destroy_sandbox(&sandbox.id, Duration::from_secs(1))
            .await
            .unwrap();
    }

    let mut size = 0;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        size = h.pool.size().await.unwrap();
        if size >= floor {
            break;
        }
    }
    assert!(size >= floor, "pool returned to {size}, floor {floor}");

    h.pool.drain().await.unwrap();
    h.shutdown.graceful_shutdown().await;
}
