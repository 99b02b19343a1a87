//! Container backends: polymorphic sandbox lifecycle operations.
//!
//! Two implementations exist side by side and are selected by
//! configuration at startup: the local Docker daemon and the cloud task
//! runner. They differ only in transport and in how logs are retrieved.

pub mod docker;
pub mod runner;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::sandbox::Sandbox;

pub use docker::DockerBackend;
pub use runner::TaskRunnerBackend;

/// One live container as reported by the backend, independent of any
/// binding in the shared store. The GC reconciles these against bindings.
#[derive(Debug, Clone)]
pub struct ListedSandbox {
    pub id: String,
    /// Conversation label carried on the container, if any.
    pub conversation_id: Option<String>,
    pub running: bool,
    /// Runner task reference, empty for the daemon backend.
    pub task_ref: String,
}

/// Capability set every backend provides.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Backend name: "docker" or "runner".
    fn kind(&self) -> &'static str;

    /// Create and start a sandbox. `conversation_id` is `None` for warm
    /// pool entries.
    async fn create_sandbox(&self, conversation_id: Option<&str>) -> Result<Sandbox>;

    /// Gracefully stop and remove a sandbox. Absent containers are not an
    /// error.
    async fn destroy_sandbox(&self, sandbox_id: &str, grace_period: Duration) -> Result<()>;

    /// Whether the container runtime reports the sandbox healthy.
    async fn is_healthy(&self, sandbox_id: &str) -> bool;

    /// Every workspace-labelled container the backend knows about.
    async fn list_workspace_sandboxes(&self) -> Result<Vec<ListedSandbox>>;

    /// Poll the agent's health endpoint until it answers or the timeout
    /// elapses. On timeout a log tail is captured for diagnosis.
    async fn wait_for_agent_ready(&self, sandbox: &Sandbox, timeout: Duration) -> bool;

    /// Run a command inside the sandbox, returning `(exit_code, output)`.
    async fn exec(&self, sandbox: &Sandbox, cmd: &[String]) -> Result<(i64, String)>;

    /// Binary-output variant of [`exec`](Self::exec).
    async fn exec_binary(&self, sandbox: &Sandbox, cmd: &[String]) -> Result<(i64, Vec<u8>)>;

    /// Stream a file into the sandbox filesystem, creating parents.
    async fn write_file(&self, sandbox: &Sandbox, dest_path: &str, data: &[u8]) -> Result<()>;

    /// Stream a file out of the sandbox filesystem. `None` when absent.
    async fn read_file(&self, sandbox: &Sandbox, src_path: &str) -> Result<Option<Vec<u8>>>;

    /// Last `tail` lines of container logs, for diagnostics.
    async fn logs(&self, sandbox_id: &str, tail: usize) -> String;
}
