//! Cloud task-runner backend.
//!
//! Each sandbox is one task: the agent container plus the egress proxy as
//! a sidecar in the same task, so the proxy endpoint is a TCP port on the
//! task's private IP rather than an in-process listener. Creation submits
//! a task and polls the description until the IP appears or the task
//! reports stopped; logs come from the provider's log store.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, CapacityProviderStrategyItem, DesiredStatus,
    NetworkConfiguration, Tag,
};

use crate::agent::AgentClient;
use crate::backend::{ContainerBackend, ListedSandbox};
use crate::config::RunnerConfig;
use crate::error::{Result, WorkspaceError};
use crate::sandbox::{Endpoint, Sandbox, SandboxState};
use crate::store::Store;

const IP_POLL_INTERVAL: Duration = Duration::from_secs(2);
const IP_POLL_TIMEOUT: Duration = Duration::from_secs(120);

const WORKSPACE_TAG: &str = "workspace";
const CONTAINER_ID_TAG: &str = "workspace.container_id";
const CONVERSATION_ID_TAG: &str = "workspace.conversation_id";

/// Task-runner-backed sandbox lifecycle.
pub struct TaskRunnerBackend {
    ecs: aws_sdk_ecs::Client,
    logs: aws_sdk_cloudwatchlogs::Client,
    store: Store,
    config: RunnerConfig,
}

impl TaskRunnerBackend {
    pub fn new(sdk_config: &aws_config::SdkConfig, store: Store, config: RunnerConfig) -> Self {
        Self {
            ecs: aws_sdk_ecs::Client::new(sdk_config),
            logs: aws_sdk_cloudwatchlogs::Client::new(sdk_config),
            store,
            config,
        }
    }

    /// Task definition family, stripped of revision and ARN prefix.
    fn family(&self) -> String {
        self.config
            .task_definition
            .rsplit('/')
            .next()
            .unwrap_or(&self.config.task_definition)
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    async fn resolve_task_ref(&self, sandbox_id: &str) -> Result<Option<String>> {
        self.store.load_runner_task(sandbox_id).await
    }

    async fn task_ip(&self, task_ref: &str) -> Result<Option<String>> {
        let described = self
            .ecs
            .describe_tasks()
            .cluster(&self.config.cluster)
            .tasks(task_ref)
            .send()
            .await
            .map_err(|e| WorkspaceError::ContainerUnavailable {
                reason: format!("describe task: {e}"),
            })?;

        let Some(task) = described.tasks().first() else {
            return Ok(None);
        };
        for attachment in task.attachments() {
            if attachment.r#type() == Some("ElasticNetworkInterface") {
                for detail in attachment.details() {
                    if detail.name() == Some("privateIPv4Address") {
                        return Ok(detail.value().map(str::to_string));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn task_status(&self, task_ref: &str) -> Result<Option<String>> {
        let described = self
            .ecs
            .describe_tasks()
            .cluster(&self.config.cluster)
            .tasks(task_ref)
            .send()
            .await
            .map_err(|e| WorkspaceError::ContainerUnavailable {
                reason: format!("describe task: {e}"),
            })?;
        Ok(described
            .tasks()
            .first()
            .and_then(|t| t.last_status())
            .map(str::to_string))
    }

    /// Poll until the task has an ENI with a private IP. Fails fast when
    /// the task stops before the IP is assigned.
    async fn wait_for_task_ip(&self, task_ref: &str) -> Result<String> {
        let deadline = tokio::time::Instant::now() + IP_POLL_TIMEOUT;

        while tokio::time::Instant::now() < deadline {
            if let Some(ip) = self.task_ip(task_ref).await? {
                return Ok(ip);
            }
            if self.task_status(task_ref).await?.as_deref() == Some("STOPPED") {
                return Err(WorkspaceError::ContainerUnavailable {
                    reason: format!("task {task_ref} stopped before IP assignment"),
                });
            }
            tokio::time::sleep(IP_POLL_INTERVAL).await;
        }

        Err(WorkspaceError::ContainerUnavailable {
            reason: format!("timed out waiting for IP of task {task_ref}"),
        })
    }
}

#[async_trait]
impl ContainerBackend for TaskRunnerBackend {
    fn kind(&self) -> &'static str {
        "runner"
    }

    async fn create_sandbox(&self, conversation_id: Option<&str>) -> Result<Sandbox> {
        let container_id = Sandbox::new_id();
        let conversation = conversation_id.unwrap_or_default();

        let vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.config.subnets.clone()))
            .set_security_groups(Some(self.config.security_groups.clone()))
            .assign_public_ip(AssignPublicIp::Disabled)
            .build()
            .map_err(|e| WorkspaceError::ContainerUnavailable {
                reason: format!("vpc configuration: {e}"),
            })?;

        let mut run_task = self
            .ecs
            .run_task()
            .cluster(&self.config.cluster)
            .task_definition(&self.config.task_definition)
            .count(1)
            .started_by(format!("workspaced/{container_id}"))
            .network_configuration(
                NetworkConfiguration::builder()
                    .awsvpc_configuration(vpc)
                    .build(),
            )
            .tags(tag(WORKSPACE_TAG, "true"))
            .tags(tag(CONTAINER_ID_TAG, &container_id))
            .tags(tag(CONVERSATION_ID_TAG, conversation));

        if let Some(provider) = &self.config.capacity_provider {
            run_task = run_task.capacity_provider_strategy(
                CapacityProviderStrategyItem::builder()
                    .capacity_provider(provider)
                    .weight(1)
                    .build()
                    .map_err(|e| WorkspaceError::ContainerUnavailable {
                        reason: format!("capacity provider: {e}"),
                    })?,
            );
        }

        tracing::info!(
            "Launching runner task for sandbox {} (cluster: {})",
            container_id,
            self.config.cluster
        );

        let response = run_task
            .send()
            .await
            .map_err(|e| WorkspaceError::ContainerUnavailable {
                reason: format!("run task: {e}"),
            })?;

        if !response.failures().is_empty() {
            let reasons: Vec<_> = response
                .failures()
                .iter()
                .map(|f| f.reason().unwrap_or("unknown").to_string())
                .collect();
            return Err(WorkspaceError::ContainerUnavailable {
                reason: format!("run task failures: {reasons:?}"),
            });
        }

        let task_ref = response
            .tasks()
            .first()
            .and_then(|t| t.task_arn())
            .ok_or_else(|| WorkspaceError::ContainerUnavailable {
                reason: "run task returned no tasks".to_string(),
            })?
            .to_string();

        self.store.save_runner_task(&container_id, &task_ref).await?;

        let task_ip = self.wait_for_task_ip(&task_ref).await?;

        let now = chrono::Utc::now();
        let sandbox = Sandbox {
            id: container_id.clone(),
            backend: "runner".to_string(),
            agent_endpoint: Endpoint::Tcp(format!("{task_ip}:{}", self.config.agent_port)),
            proxy_endpoint: Endpoint::Tcp(format!("{task_ip}:{}", self.config.proxy_port)),
            conversation_id: conversation_id.map(str::to_string),
            created_at: now,
            last_active_at: now,
            state: if conversation_id.is_some() {
                SandboxState::Ready
            } else {
                SandboxState::Warm
            },
            task_ref: task_ref.clone(),
        };

        tracing::info!(
            "Runner task for sandbox {} ready at {} ({})",
            container_id,
            task_ip,
            task_ref
        );
        Ok(sandbox)
    }

    async fn destroy_sandbox(&self, sandbox_id: &str, _grace_period: Duration) -> Result<()> {
        let Some(task_ref) = self.resolve_task_ref(sandbox_id).await? else {
            tracing::warn!("No task reference for sandbox {} (already gone)", sandbox_id);
            return Ok(());
        };

        let result = self
            .ecs
            .stop_task()
            .cluster(&self.config.cluster)
            .task(&task_ref)
            .reason(format!("sandbox {sandbox_id} destroyed"))
            .send()
            .await;

        if let Err(e) = result {
            let message = e.to_string();
            if message.to_lowercase().contains("not found")
                || message.contains("InvalidParameterException")
            {
                tracing::warn!("Task for sandbox {} already stopped", sandbox_id);
            } else {
                return Err(WorkspaceError::ContainerUnavailable {
                    reason: format!("stop task: {message}"),
                });
            }
        }

        self.store.delete_runner_task(sandbox_id).await?;
        tracing::info!("Runner task for sandbox {} stopped", sandbox_id);
        Ok(())
    }

    async fn is_healthy(&self, sandbox_id: &str) -> bool {
        let Ok(Some(task_ref)) = self.resolve_task_ref(sandbox_id).await else {
            return false;
        };
        matches!(
            self.task_status(&task_ref).await,
            Ok(Some(status)) if status == "RUNNING"
        )
    }

    async fn list_workspace_sandboxes(&self) -> Result<Vec<ListedSandbox>> {
        let family = self.family();
        let mut task_refs = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let listed = self
                .ecs
                .list_tasks()
                .cluster(&self.config.cluster)
                .family(&family)
                .desired_status(DesiredStatus::Running)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| WorkspaceError::ContainerUnavailable {
                    reason: format!("list tasks: {e}"),
                })?;
            task_refs.extend(listed.task_arns().iter().cloned());
            next_token = listed.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        let mut result = Vec::new();
        for batch in task_refs.chunks(100) {
            let described = self
                .ecs
                .describe_tasks()
                .cluster(&self.config.cluster)
                .set_tasks(Some(batch.to_vec()))
                .include(aws_sdk_ecs::types::TaskField::Tags)
                .send()
                .await
                .map_err(|e| WorkspaceError::ContainerUnavailable {
                    reason: format!("describe tasks: {e}"),
                })?;

            for task in described.tasks() {
                let mut id = None;
                let mut conversation_id = None;
                for t in task.tags() {
                    match t.key() {
                        Some(CONTAINER_ID_TAG) => id = t.value().map(str::to_string),
                        Some(CONVERSATION_ID_TAG) => {
                            conversation_id = t.value().filter(|v| !v.is_empty()).map(str::to_string)
                        }
                        _ => {}
                    }
                }
                let Some(id) = id else { continue };
                result.push(ListedSandbox {
                    id,
                    conversation_id,
                    running: task.last_status() == Some("RUNNING"),
                    task_ref: task.task_arn().unwrap_or_default().to_string(),
                });
            }
        }
        Ok(result)
    }

    async fn wait_for_agent_ready(&self, sandbox: &Sandbox, timeout: Duration) -> bool {
        let client = AgentClient::new(sandbox.agent_endpoint.clone());
        let deadline = tokio::time::Instant::now() + timeout;
        let mut poll_count = 0u32;

        while tokio::time::Instant::now() < deadline {
            // Every fifth poll, confirm the task has not stopped underneath us.
            if poll_count > 0
                && poll_count % 5 == 0
                && !sandbox.task_ref.is_empty()
                && let Ok(Some(status)) = self.task_status(&sandbox.task_ref).await
                && (status == "STOPPED" || status == "DEPROVISIONING")
            {
                let log_tail = self.logs(&sandbox.id, 80).await;
                tracing::error!(
                    "Task for sandbox {} stopped early ({}); log tail:\n{}",
                    sandbox.id,
                    status,
                    log_tail
                );
                return false;
            }

            if client.health().await {
                tracing::info!("Agent ready in sandbox {}", sandbox.id);
                return true;
            }

            poll_count += 1;
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
        AgentClient::new(sandbox.agent_endpoint.clone())
            .exec(cmd, 60)
            .await
    }

    async fn exec_binary(&self, sandbox: &Sandbox, cmd: &[String]) -> Result<(i64, Vec<u8>)> {
        AgentClient::new(sandbox.agent_endpoint.clone())
            .exec_binary(cmd, 60)
            .await
    }

    async fn write_file(&self, sandbox: &Sandbox, dest_path: &str, data: &[u8]) -> Result<()> {
        use base64::Engine;

        let parent = match dest_path.rfind('/') {
            Some(idx) if idx > 0 => &dest_path[..idx],
            _ => "/",
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let script = format!(
            "mkdir -p '{parent}' && printf '%s' '{encoded}' | base64 -d > '{dest_path}'"
        );
        let (exit_code, output) = self
            .exec(
                sandbox,
                &["sh".to_string(), "-c".to_string(), script],
            )
            .await?;
        if exit_code != 0 {
            return Err(WorkspaceError::ContainerUnavailable {
                reason: format!("write {dest_path} failed ({exit_code}): {output}"),
            });
        }
        Ok(())
    }

    async fn read_file(&self, sandbox: &Sandbox, src_path: &str) -> Result<Option<Vec<u8>>> {
        let (exit_code, bytes) = self
            .exec_binary(sandbox, &["cat".to_string(), src_path.to_string()])
            .await?;
        if exit_code != 0 {
            return Ok(None);
        }
        Ok(Some(bytes))
    }

    async fn logs(&self, sandbox_id: &str, tail: usize) -> String {
        let Ok(Some(task_ref)) = self.resolve_task_ref(sandbox_id).await else {
            return "<task not found>".to_string();
        };
        let task_id = task_ref.rsplit('/').next().unwrap_or(&task_ref);

        // awslogs driver naming: group /ecs/{family}, stream
        // {prefix}/{container-name}/{task-id}.
        let family = self.family();
        let log_group = format!("/ecs/{family}");
        let log_stream = format!("ecs/workspace-agent/{task_id}");

        match self
            .logs
            .get_log_events()
            .log_group_name(&log_group)
            .log_stream_name(&log_stream)
            .limit(tail as i32)
            .start_from_head(false)
            .send()
            .await
        {
            Ok(response) => {
                let lines: Vec<_> = response
                    .events()
                    .iter()
                    .filter_map(|e| e.message())
                    .map(str::to_string)
                    .collect();
                if lines.is_empty() {
                    "<empty>".to_string()
                } else {
                    lines.join("\n")
                }
            }
            Err(e) => format!("<log capture failed: {e}>"),
        }
    }
}

fn tag(key: &str, value: &str) -> Tag {
    Tag::builder().key(key).value(value).build()
}
