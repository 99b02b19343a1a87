//! Error types shared across the orchestration stack.

use std::time::Duration;

use thiserror::Error;

/// Result type for workspace operations.
pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Errors that can occur while serving a conversation.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The requested resource does not exist.
    #[error("not found: {resource}")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },

    /// Another request currently holds the conversation lock.
    #[error("conversation '{conversation_id}' is locked by another request")]
    ConversationLocked {
        /// Conversation whose lock could not be taken.
        conversation_id: String,
    },

    /// The lock could not be acquired within the wait budget.
    #[error("lock acquisition for '{resource}' timed out after {waited:?}")]
    LockAcquisitionTimeout {
        /// Lock resource identifier.
        resource: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// No sandbox could be created or bound.
    #[error("container unavailable: {reason}")]
    ContainerUnavailable {
        /// Reason the sandbox is unavailable.
        reason: String,
    },

    /// The egress proxy failed to start or accept connections.
    #[error("proxy unavailable: {reason}")]
    ProxyUnavailable {
        /// Reason for failure.
        reason: String,
    },

    /// Outbound request to a host outside the allowlist.
    #[error("domain '{host}' not in whitelist")]
    DomainBlocked {
        /// Host that was denied.
        host: String,
    },

    /// The sandbox agent produced no bytes within the configured window.
    #[error("agent timed out after {timeout:?}")]
    AgentTimeout {
        /// The window that elapsed.
        timeout: Duration,
    },

    /// The sandbox agent connection dropped mid-stream.
    #[error("agent crashed: {reason}")]
    AgentCrashed {
        /// Reason for the crash.
        reason: String,
    },

    /// Blob storage operation failed.
    #[error("blob store error: {reason}")]
    BlobStore {
        /// Reason for failure.
        reason: String,
    },

    /// Shared key/value store operation failed.
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Anything else.
    #[error("internal error: {reason}")]
    Internal {
        /// Reason for failure.
        reason: String,
    },
}

impl WorkspaceError {
    /// Short machine-readable kind tag, used in error events and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkspaceError::NotFound { .. } => "not_found",
            WorkspaceError::ConversationLocked { .. } => "conversation_locked",
            WorkspaceError::LockAcquisitionTimeout { .. } => "lock_acquisition_timeout",
            WorkspaceError::ContainerUnavailable { .. } => "container_unavailable",
            WorkspaceError::ProxyUnavailable { .. } => "proxy_unavailable",
            WorkspaceError::DomainBlocked { .. } => "domain_blocked",
            WorkspaceError::AgentTimeout { .. } => "agent_timeout",
            WorkspaceError::AgentCrashed { .. } => "agent_crashed",
            WorkspaceError::BlobStore { .. } => "blob_store_error",
            WorkspaceError::Store(_) => "store_error",
            WorkspaceError::Internal { .. } => "internal_error",
        }
    }

    /// Whether the caller should retry after recovery.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WorkspaceError::AgentTimeout { .. }
                | WorkspaceError::AgentCrashed { .. }
                | WorkspaceError::ProxyUnavailable { .. }
        )
    }
}

/// Errors produced while resolving configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is missing.
    #[error("missing required setting '{key}': {hint}")]
    MissingRequired {
        /// Environment variable name.
        key: String,
        /// How to fix it.
        hint: String,
    },

    /// A setting is present but malformed.
    #[error("invalid value for '{key}': {message}")]
    InvalidValue {
        /// Environment variable name.
        key: String,
        /// What is wrong with it.
        message: String,
    },
}
