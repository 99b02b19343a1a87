//! Docker daemon backend.
//!
//! Sandboxes are hardened containers: no network namespace, read-only root
//! filesystem with small tmpfs mounts for the writable paths, all
//! capabilities dropped except what user-id switching needs, no new
//! privileges, a custom seccomp profile, optional AppArmor, and CPU /
//! memory / pid limits. The only mount is a per-sandbox host directory on
//! `/var/run/ws` carrying the agent and proxy sockets, and the only route
//! out is the egress proxy injected through the proxy environment.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use futures::StreamExt;

use crate::agent::AgentClient;
use crate::backend::{ContainerBackend, ListedSandbox};
use crate::config::ContainerConfig;
use crate::error::{Result, WorkspaceError};
use crate::sandbox::{Endpoint, Sandbox, SandboxState};

const WORKSPACE_LABEL: &str = "workspace";
const CONTAINER_ID_LABEL: &str = "workspace.container_id";
const CONVERSATION_ID_LABEL: &str = "workspace.conversation_id";

/// Daemon-backed sandbox lifecycle.
pub struct DockerBackend {
    docker: Docker,
    config: ContainerConfig,
    aws_region: String,
}

impl DockerBackend {
    /// Connect to the local daemon and verify it responds.
    pub async fn connect(config: ContainerConfig, aws_region: &str) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            WorkspaceError::ContainerUnavailable {
                reason: format!("docker connect: {e}"),
            }
        })?;
        docker
            .ping()
            .await
            .map_err(|e| WorkspaceError::ContainerUnavailable {
                reason: format!("docker ping: {e}"),
            })?;
        Ok(Self {
            docker,
            config,
            aws_region: aws_region.to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_docker(docker: Docker, config: ContainerConfig, aws_region: &str) -> Self {
        Self {
            docker,
            config,
            aws_region: aws_region.to_string(),
        }
    }

    fn socket_dir(&self, container_id: &str) -> std::path::PathBuf {
        Path::new(&self.config.socket_base_path).join(container_id)
    }

    fn create_config(&self, container_id: &str, conversation_id: &str) -> Config<String> {
        let mut security_opt = vec!["no-new-privileges:true".to_string()];
        if let Some(path) = &self.config.seccomp_profile_path
            && let Some(profile) = load_seccomp_profile(path)
        {
            security_opt.push(format!("seccomp={profile}"));
        }
        if let Some(name) = &self.config.apparmor_profile_name {
            security_opt.push(format!("apparmor={name}"));
        }

        // The directory, not the socket files, is bind mounted: mounting the
        // files individually races against their creation.
        let host_socket_dir = format!(
            "{}/{}",
            self.config.resolved_socket_host_path(),
            container_id
        );

        let mut labels = HashMap::new();
        labels.insert(WORKSPACE_LABEL.to_string(), "true".to_string());
        labels.insert(CONTAINER_ID_LABEL.to_string(), container_id.to_string());
        labels.insert(
            CONVERSATION_ID_LABEL.to_string(),
            conversation_id.to_string(),
        );

        let mut tmpfs = HashMap::new();
        // /tmp stays executable: the agent uses it for script execution;
        // seccomp constrains what those scripts can do.
        tmpfs.insert("/tmp".to_string(), "rw,nosuid,size=512M".to_string());
        tmpfs.insert(
            "/var/tmp".to_string(),
            "rw,noexec,nosuid,size=256M".to_string(),
        );
        tmpfs.insert("/run".to_string(), "rw,noexec,nosuid,size=64M".to_string());
        tmpfs.insert(
            "/home/appuser/.cache".to_string(),
            "rw,noexec,nosuid,size=512M".to_string(),
        );
        tmpfs.insert(
            "/home/appuser".to_string(),
            "rw,noexec,nosuid,size=128M".to_string(),
        );
        // The workspace is tmpfs because the rootfs is read-only; blob-store
        // sync provides persistence.
        tmpfs.insert("/workspace".to_string(), "rw,nosuid,size=1G".to_string());

        Config {
            image: Some(self.config.image.clone()),
            user: Some("1000:1000".to_string()),
            env: Some(vec![
                // All outbound HTTP funnels through the egress proxy.
                "HTTP_PROXY=http://127.0.0.1:8080".to_string(),
                "HTTPS_PROXY=http://127.0.0.1:8080".to_string(),
                "NO_PROXY=localhost,127.0.0.1".to_string(),
                // The proxy signs model-endpoint requests; the agent skips
                // its own credential resolution.
                format!("AWS_REGION={}", self.aws_region),
                "BEDROCK_BASE_URL=http://127.0.0.1:8080".to_string(),
                "BEDROCK_SKIP_AUTH=1".to_string(),
                "PIP_REQUIRE_VIRTUALENV=true".to_string(),
            ]),
            labels: Some(labels),
            host_config: Some(HostConfig {
                network_mode: Some("none".to_string()),
                cpu_period: Some(100_000),
                cpu_quota: Some(self.config.cpu_quota),
                memory: Some(self.config.memory_limit_bytes),
                // Swap equal to memory disables swap.
                memory_swap: Some(self.config.memory_limit_bytes),
                pids_limit: Some(self.config.pids_limit),
                cap_drop: Some(vec!["ALL".to_string()]),
                cap_add: Some(vec![
                    "CHOWN".to_string(),
                    "SETUID".to_string(),
                    "SETGID".to_string(),
                    "DAC_OVERRIDE".to_string(),
                ]),
                security_opt: Some(security_opt),
                privileged: Some(false),
                readonly_rootfs: Some(true),
                ipc_mode: Some("private".to_string()),
                tmpfs: Some(tmpfs),
                binds: Some(vec![format!("{host_socket_dir}:/var/run/ws:rw")]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Load and compact the seccomp profile. The daemon API wants the JSON
/// inline, unlike the CLI which accepts a path. Cached for the process
/// lifetime.
fn load_seccomp_profile(path: &str) -> Option<String> {
    static CACHE: OnceLock<Option<String>> = OnceLock::new();
    CACHE
        .get_or_init(|| {
            let raw = match std::fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!("seccomp profile not readable at {}: {}", path, e);
                    return None;
                }
            };
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value) => {
                    tracing::info!("Loaded seccomp profile from {}", path);
                    Some(value.to_string())
                }
                Err(e) => {
                    tracing::warn!("seccomp profile at {} is not valid JSON: {}", path, e);
                    None
                }
            }
        })
        .clone()
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn create_sandbox(&self, conversation_id: Option<&str>) -> Result<Sandbox> {
        let container_id = Sandbox::new_id();
        let conversation = conversation_id.unwrap_or_default();

        let socket_dir = self.socket_dir(&container_id);
        tokio::fs::create_dir_all(&socket_dir).await.map_err(|e| {
            WorkspaceError::ContainerUnavailable {
                reason: format!("socket dir {}: {e}", socket_dir.display()),
            }
        })?;
        // The in-container agent runs as uid 1000 and must be able to
        // create its socket here.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&socket_dir, std::fs::Permissions::from_mode(0o777));
        }

        let agent_socket = socket_dir.join("agent.sock").to_string_lossy().into_owned();
        let proxy_socket = socket_dir.join("proxy.sock").to_string_lossy().into_owned();

        tracing::info!(
            "Creating sandbox {} (conversation: {:?}, image: {})",
            container_id,
            conversation_id,
            self.config.image
        );

        let config = self.create_config(&container_id, conversation);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_id.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| WorkspaceError::ContainerUnavailable {
                reason: format!("create container: {e}"),
            })?;
        self.docker
            .start_container::<String>(&container_id, None)
            .await
            .map_err(|e| WorkspaceError::ContainerUnavailable {
                reason: format!("start container: {e}"),
            })?;

        let now = chrono::Utc::now();
        let sandbox = Sandbox {
            id: container_id.clone(),
            backend: "docker".to_string(),
            agent_endpoint: Endpoint::Unix(agent_socket),
            proxy_endpoint: Endpoint::Unix(proxy_socket),
            conversation_id: conversation_id.map(str::to_string),
            created_at: now,
            last_active_at: now,
            state: if conversation_id.is_some() {
                SandboxState::Ready
            } else {
                SandboxState::Warm
            },
            task_ref: String::new(),
        };

        tracing::info!("Sandbox {} started", container_id);
        Ok(sandbox)
    }

    async fn destroy_sandbox(&self, sandbox_id: &str, grace_period: Duration) -> Result<()> {
        tracing::info!(
            "Destroying sandbox {} (grace {:?})",
            sandbox_id,
            grace_period
        );

        let stop_result = self
            .docker
            .stop_container(
                sandbox_id,
                Some(StopContainerOptions {
                    t: grace_period.as_secs() as i64,
                }),
            )
            .await;
        match stop_result {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 304,
                ..
            }) => {}
            Err(e) => {
                tracing::warn!("Stop failed for {}: {}", sandbox_id, e);
            }
        }

        let remove_result = self
            .docker
            .remove_container(
                sandbox_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        match remove_result {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                tracing::warn!("Sandbox {} already removed", sandbox_id);
            }
            Err(e) => {
                return Err(WorkspaceError::ContainerUnavailable {
                    reason: format!("remove container: {e}"),
                });
            }
        }

        // Best-effort cleanup of the host socket directory.
        let socket_dir = self.socket_dir(sandbox_id);
        if socket_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&socket_dir).await;
        }

        tracing::info!("Sandbox {} destroyed", sandbox_id);
        Ok(())
    }

    async fn is_healthy(&self, sandbox_id: &str) -> bool {
        match self.docker.inspect_container(sandbox_id, None).await {
            Ok(inspect) => {
                let state = inspect.state.unwrap_or_default();
                state.running.unwrap_or(false) && !state.oom_killed.unwrap_or(false)
            }
            Err(_) => false,
        }
    }

    async fn list_workspace_sandboxes(&self) -> Result<Vec<ListedSandbox>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{WORKSPACE_LABEL}=true")],
        );

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| WorkspaceError::ContainerUnavailable {
                reason: format!("list containers: {e}"),
            })?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let labels = summary.labels.unwrap_or_default();
                let id = labels.get(CONTAINER_ID_LABEL).cloned().or_else(|| {
                    summary
                        .names
                        .as_ref()
                        .and_then(|names| names.first())
                        .map(|name| name.trim_start_matches('/').to_string())
                })?;
                Some(ListedSandbox {
                    id,
                    conversation_id: labels
                        .get(CONVERSATION_ID_LABEL)
                        .filter(|v| !v.is_empty())
                        .cloned(),
                    running: summary.state.as_deref() == Some("running"),
                    task_ref: String::new(),
                })
            })
            .collect())
    }

    async fn wait_for_agent_ready(&self, sandbox: &Sandbox, timeout: Duration) -> bool {
        let client = AgentClient::new(sandbox.agent_endpoint.clone());
        let deadline = tokio::time::Instant::now() + timeout;

        while tokio::time::Instant::now() < deadline {
            if client.health().await {
                tracing::info!("Agent ready in sandbox {}", sandbox.id);
                return true;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let log_tail = self.logs(&sandbox.id, 80).await;
        tracing::error!(
            "Agent in sandbox {} not ready after {:?}; log tail:\n{}",
            sandbox.id,
            timeout,
            log_tail
        );
        false
    }

    async fn exec(&self, sandbox: &Sandbox, cmd: &[String]) -> Result<(i64, String)> {
        let (exit_code, bytes) = self.exec_binary(sandbox, cmd).await?;
        Ok((exit_code, String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn exec_binary(&self, sandbox: &Sandbox, cmd: &[String]) -> Result<(i64, Vec<u8>)> {
        let exec = self
            .docker
            .create_exec(
                &sandbox.id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| WorkspaceError::ContainerUnavailable {
                reason: format!("create exec: {e}"),
            })?;

        let mut stdout = Vec::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| WorkspaceError::ContainerUnavailable {
                reason: format!("start exec: {e}"),
            })? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.extend_from_slice(&message);
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stdout.extend_from_slice(&message);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("exec stream error in {}: {}", sandbox.id, e);
                            break;
                        }
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(|e| {
            WorkspaceError::ContainerUnavailable {
                reason: format!("inspect exec: {e}"),
            }
        })?;
        Ok((inspect.exit_code.unwrap_or(-1), stdout))
    }

    async fn write_file(&self, sandbox: &Sandbox, dest_path: &str, data: &[u8]) -> Result<()> {
        let parent = match dest_path.rfind('/') {
            Some(idx) if idx > 0 => &dest_path[..idx],
            _ => "/",
        };
        let file_name = dest_path.rsplit('/').next().unwrap_or(dest_path);

        self.exec(
            sandbox,
            &["mkdir".to_string(), "-p".to_string(), parent.to_string()],
        )
        .await?;

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_uid(1000);
        header.set_gid(1000);
        header.set_cksum();
        builder
            .append_data(&mut header, file_name, data)
            .map_err(|e| WorkspaceError::Internal {
                reason: format!("tar build: {e}"),
            })?;
        let archive = builder.into_inner().map_err(|e| WorkspaceError::Internal {
            reason: format!("tar finish: {e}"),
        })?;

        self.docker
            .upload_to_container(
                &sandbox.id,
                Some(bollard::container::UploadToContainerOptions {
                    path: parent.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| WorkspaceError::ContainerUnavailable {
                reason: format!("upload to container: {e}"),
            })
    }

    async fn read_file(&self, sandbox: &Sandbox, src_path: &str) -> Result<Option<Vec<u8>>> {
        let mut stream = self.docker.download_from_container(
            &sandbox.id,
            Some(bollard::container::DownloadFromContainerOptions {
                path: src_path.to_string(),
            }),
        );

        let mut archive_bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive_bytes.extend_from_slice(&bytes),
                Err(e) => {
                    tracing::debug!("Download of {} from {} failed: {}", src_path, sandbox.id, e);
                    return Ok(None);
                }
            }
        }

        let mut archive = tar::Archive::new(&archive_bytes[..]);
        let entries = archive.entries().map_err(|e| WorkspaceError::Internal {
            reason: format!("tar read: {e}"),
        })?;
        for entry in entries {
            let mut entry = entry.map_err(|e| WorkspaceError::Internal {
                reason: format!("tar entry: {e}"),
            })?;
            if entry.header().entry_type().is_file() {
                let mut contents = Vec::new();
                std::io::Read::read_to_end(&mut entry, &mut contents).map_err(|e| {
                    WorkspaceError::Internal {
                        reason: format!("tar extract: {e}"),
                    }
                })?;
                return Ok(Some(contents));
            }
        }
        Ok(None)
    }

    async fn logs(&self, sandbox_id: &str, tail: usize) -> String {
        let mut stream = self.docker.logs::<String>(
            sandbox_id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                Err(e) => {
                    return format!("<log capture failed: {e}>");
                }
            }
        }
        if out.is_empty() {
            "<empty>".to_string()
        } else {
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn backend() -> DockerBackend {
        let docker = Docker::connect_with_local_defaults().expect("client construction is local");
        DockerBackend::with_docker(docker, Settings::default().container, "us-west-2")
    }

    #[test]
    fn test_create_config_hardening() {
        let backend = backend();
        let config = backend.create_config("ws-test", "conv-1");
        let host = config.host_config.expect("host config");

        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.privileged, Some(false));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        let cap_add = host.cap_add.expect("cap add");
        assert!(cap_add.contains(&"SETUID".to_string()));
        assert!(!cap_add.contains(&"SYS_ADMIN".to_string()));
        assert!(
            host.security_opt
                .expect("security opt")
                .contains(&"no-new-privileges:true".to_string())
        );
        // Swap disabled: limit equals memory.
        assert_eq!(host.memory, host.memory_swap);
    }

    #[test]
    fn test_create_config_workspace_tmpfs() {
        let backend = backend();
        let config = backend.create_config("ws-test", "");
        let tmpfs = config.host_config.unwrap().tmpfs.expect("tmpfs");
        assert!(tmpfs.contains_key("/workspace"));
        assert!(tmpfs["/workspace"].contains("size=1G"));
    }

    #[test]
    fn test_create_config_proxy_env() {
        let backend = backend();
        let config = backend.create_config("ws-test", "");
        let env = config.env.expect("env");
        assert!(env.iter().any(|e| e == "HTTP_PROXY=http://127.0.0.1:8080"));
        assert!(env.iter().any(|e| e == "HTTPS_PROXY=http://127.0.0.1:8080"));
        assert!(env.iter().any(|e| e.starts_with("NO_PROXY=")));
    }

    #[test]
    fn test_create_config_labels_carry_conversation() {
        let backend = backend();
        let config = backend.create_config("ws-abc", "conv-9");
        let labels = config.labels.expect("labels");
        assert_eq!(labels.get("workspace").map(String::as_str), Some("true"));
        assert_eq!(
            labels.get("workspace.conversation_id").map(String::as_str),
            Some("conv-9")
        );
    }

    #[test]
    fn test_socket_dir_is_per_sandbox() {
        let backend = backend();
        assert_ne!(backend.socket_dir("ws-a"), backend.socket_dir("ws-b"));
    }
}
