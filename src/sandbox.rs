//! Sandbox data model: one isolated container hosting an agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the orchestrator reaches a service inside (or beside) a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    /// Filesystem socket path (daemon backend).
    Unix(String),
    /// `host:port` (runner backend).
    Tcp(String),
}

impl Endpoint {
    /// Serialize to the stored string form. Unix paths are stored as-is;
    /// TCP endpoints carry a `tcp://` prefix so the two cannot collide.
    pub fn to_store_string(&self) -> String {
        match self {
            Endpoint::Unix(path) => path.clone(),
            Endpoint::Tcp(addr) => format!("tcp://{addr}"),
        }
    }

    pub fn from_store_string(raw: &str) -> Self {
        match raw.strip_prefix("tcp://") {
            Some(addr) => Endpoint::Tcp(addr.to_string()),
            None => Endpoint::Unix(raw.to_string()),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{path}"),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Sandbox lifecycle state.
///
/// Transitions are monotone except `Warm -> Ready` and the
/// `Ready <-> Running <-> Idle` oscillation; `Draining` and `Destroyed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Waiting in the warm pool, unbound.
    Warm,
    /// Bound to a conversation, waiting for a request.
    Ready,
    /// Serving a request.
    Running,
    /// Between requests.
    Idle,
    /// Marked for destruction; rejects new requests.
    Draining,
    /// Container gone and bindings removed.
    Destroyed,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Warm => "warm",
            SandboxState::Ready => "ready",
            SandboxState::Running => "running",
            SandboxState::Idle => "idle",
            SandboxState::Draining => "draining",
            SandboxState::Destroyed => "destroyed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "warm" => Some(SandboxState::Warm),
            "ready" => Some(SandboxState::Ready),
            "running" => Some(SandboxState::Running),
            "idle" => Some(SandboxState::Idle),
            "draining" => Some(SandboxState::Draining),
            "destroyed" => Some(SandboxState::Destroyed),
            _ => None,
        }
    }
}

/// Snapshot of one sandbox, persisted in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    /// Backend that owns the container: "docker" or "runner".
    pub backend: String,
    pub agent_endpoint: Endpoint,
    pub proxy_endpoint: Endpoint,
    /// Set once the sandbox leaves the warm pool.
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub state: SandboxState,
    /// Runner-backend task reference; empty for the daemon backend.
    pub task_ref: String,
}

impl Sandbox {
    /// Generate a fresh sandbox id.
    pub fn new_id() -> String {
        format!("ws-{}", &Uuid::new_v4().simple().to_string()[..12])
    }

    /// Update the activity timestamp.
    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    /// Serialize to field/value pairs for a store hash.
    pub fn to_store_hash(&self) -> Vec<(String, String)> {
        vec![
            ("container_id".to_string(), self.id.clone()),
            ("backend".to_string(), self.backend.clone()),
            (
                "conversation_id".to_string(),
                self.conversation_id.clone().unwrap_or_default(),
            ),
            (
                "agent_endpoint".to_string(),
                self.agent_endpoint.to_store_string(),
            ),
            (
                "proxy_endpoint".to_string(),
                self.proxy_endpoint.to_store_string(),
            ),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            (
                "last_active_at".to_string(),
                self.last_active_at.to_rfc3339(),
            ),
            ("state".to_string(), self.state.as_str().to_string()),
            ("task_ref".to_string(), self.task_ref.clone()),
        ]
    }

    /// Deserialize from a store hash. Missing or malformed fields fall back
    /// to safe defaults so snapshots written by older replicas still load.
    pub fn from_store_hash(data: &std::collections::HashMap<String, String>) -> Option<Self> {
        let id = data.get("container_id")?.clone();
        if id.is_empty() {
            return None;
        }

        let now = Utc::now();
        let parse_ts = |key: &str| {
            data.get(key)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(now)
        };

        Some(Self {
            id,
            backend: data
                .get("backend")
                .cloned()
                .unwrap_or_else(|| "docker".to_string()),
            agent_endpoint: Endpoint::from_store_string(
                data.get("agent_endpoint").map(String::as_str).unwrap_or(""),
            ),
            proxy_endpoint: Endpoint::from_store_string(
                data.get("proxy_endpoint").map(String::as_str).unwrap_or(""),
            ),
            conversation_id: data
                .get("conversation_id")
                .filter(|v| !v.is_empty())
                .cloned(),
            created_at: parse_ts("created_at"),
            last_active_at: parse_ts("last_active_at"),
            state: data
                .get("state")
                .and_then(|raw| SandboxState::parse(raw))
                .unwrap_or(SandboxState::Ready),
            task_ref: data.get("task_ref").cloned().unwrap_or_default(),
        })
    }
}
