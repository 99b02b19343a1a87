//! Structured security audit events.
//!
//! Every event is emitted on the `audit` tracing target so the subscriber
//! can route it to a dedicated sink. The JSON subscriber supplies
//! `timestamp` and `level`; each helper supplies `service`, `event`, and
//! the event-specific fields (always including `container_id`,
//! `conversation_id`, and `tenant_id` where applicable).

pub const SERVICE_ORCHESTRATOR: &str = "workspace-orchestrator";
pub const SERVICE_PROXY: &str = "workspace-proxy";
pub const SERVICE_FILE_SYNC: &str = "workspace-file-sync";
pub const SERVICE_EXECUTOR: &str = "workspace-executor";

pub fn container_created(
    container_id: &str,
    conversation_id: &str,
    tenant_id: &str,
    source: &str,
    duration_ms: u64,
) {
    tracing::info!(
        target: "audit",
        service = SERVICE_ORCHESTRATOR,
        event = "container_created",
        container_id,
        conversation_id,
        tenant_id,
        source,
        network_mode = "none",
        duration_ms,
    );
}

pub fn container_destroyed(container_id: &str, conversation_id: &str, tenant_id: &str, reason: &str) {
    tracing::info!(
        target: "audit",
        service = SERVICE_ORCHESTRATOR,
        event = "container_destroyed",
        container_id,
        conversation_id,
        tenant_id,
        reason,
    );
}

pub fn container_crashed(container_id: &str, conversation_id: &str, tenant_id: &str, error: &str) {
    tracing::warn!(
        target: "audit",
        service = SERVICE_ORCHESTRATOR,
        event = "container_crashed",
        container_id,
        conversation_id,
        tenant_id,
        error,
    );
}

pub fn proxy_request_allowed(
    container_id: &str,
    method: &str,
    url: &str,
    status: u16,
    duration_ms: u64,
) {
    tracing::info!(
        target: "audit",
        service = SERVICE_PROXY,
        event = "proxy_request_allowed",
        container_id,
        method,
        url,
        status,
        duration_ms,
    );
}

pub fn proxy_request_blocked(container_id: &str, method: &str, url: &str, reason: &str) {
    tracing::warn!(
        target: "audit",
        service = SERVICE_PROXY,
        event = "proxy_request_blocked",
        container_id,
        method,
        url,
        reason,
    );
}

pub fn file_sync_to_container(
    container_id: &str,
    conversation_id: &str,
    tenant_id: &str,
    synced_count: usize,
    total_count: usize,
) {
    tracing::info!(
        target: "audit",
        service = SERVICE_FILE_SYNC,
        event = "file_sync_to_container",
        container_id,
        conversation_id,
        tenant_id,
        synced_count,
        total_count,
    );
}

pub fn file_sync_from_container(
    container_id: &str,
    conversation_id: &str,
    tenant_id: &str,
    synced_count: usize,
) {
    tracing::info!(
        target: "audit",
        service = SERVICE_FILE_SYNC,
        event = "file_sync_from_container",
        container_id,
        conversation_id,
        tenant_id,
        synced_count,
    );
}

pub fn agent_execution_started(
    container_id: &str,
    conversation_id: &str,
    tenant_id: &str,
    model_id: &str,
) {
    tracing::info!(
        target: "audit",
        service = SERVICE_EXECUTOR,
        event = "agent_execution_started",
        container_id,
        conversation_id,
        tenant_id,
        model_id,
    );
}

pub fn agent_execution_completed(
    container_id: &str,
    conversation_id: &str,
    tenant_id: &str,
    duration_ms: u64,
    input_tokens: u64,
    output_tokens: u64,
) {
    tracing::info!(
        target: "audit",
        service = SERVICE_EXECUTOR,
        event = "agent_execution_completed",
        container_id,
        conversation_id,
        tenant_id,
        duration_ms,
        input_tokens,
        output_tokens,
    );
}

pub fn agent_execution_failed(
    container_id: &str,
    conversation_id: &str,
    tenant_id: &str,
    error: &str,
    error_type: &str,
) {
    tracing::error!(
        target: "audit",
        service = SERVICE_EXECUTOR,
        event = "agent_execution_failed",
        container_id,
        conversation_id,
        tenant_id,
        error,
        error_type,
    );
}
