//! Application configuration resolved from the environment.
//!
//! Each section owns its own `resolve()`; `Settings::from_env()` stitches
//! them together and validates cross-cutting invariants. The most important
//! one is the timeout hierarchy:
//!
//! ```text
//! container_execution_timeout < event_timeout < lock_ttl
//! ```
//!
//! The agent HTTP read timeout must fire before the event-queue safety net,
//! and both must fire before the distributed lock can expire under a live
//! execution. Configurations violating the ordering refuse to start.

pub mod helpers;

use std::time::Duration;

use crate::config::helpers::{
    optional_env, parse_bool_env, parse_optional_env, require_env, split_csv,
};
use crate::error::ConfigError;

/// Which container backend serves sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Local Docker daemon.
    Docker,
    /// Cloud task runner (one task per sandbox, proxy as sidecar).
    Runner,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Docker => "docker",
            BackendKind::Runner => "runner",
        }
    }
}

/// Shared key/value store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: String,
}

impl StoreConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            redis_url: optional_env("REDIS_URL")?
                .unwrap_or_else(|| "redis://localhost:6379/0".to_string()),
        })
    }
}

/// Sandbox container settings: image, limits, lifetimes.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub backend: BackendKind,
    pub image: String,
    /// CPU quota against a 100ms period (200_000 = 2 cores).
    pub cpu_quota: i64,
    pub memory_limit_bytes: i64,
    pub pids_limit: i64,
    /// Seconds of inactivity before the GC reaps a sandbox.
    pub inactive_ttl: Duration,
    /// Hard ceiling on sandbox age regardless of activity.
    pub absolute_ttl: Duration,
    /// Per-read silence cap on the agent stream.
    pub execution_timeout: Duration,
    /// Safety-net wait on the event relay queue.
    pub event_timeout: Duration,
    /// Seconds a sandbox gets to exit before force-kill.
    pub grace_period: Duration,
    pub gc_interval: Duration,
    /// Host directory under which each sandbox gets its socket directory.
    pub socket_base_path: String,
    /// Host path of the socket base as seen by the Docker daemon, when the
    /// orchestrator itself runs in a container.
    pub socket_host_path: Option<String>,
    pub seccomp_profile_path: Option<String>,
    pub apparmor_profile_name: Option<String>,
}

impl ContainerConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let backend = match optional_env("CONTAINER_BACKEND")?.as_deref() {
            None | Some("docker") => BackendKind::Docker,
            Some("runner") => BackendKind::Runner,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "CONTAINER_BACKEND".to_string(),
                    message: format!("must be 'docker' or 'runner', got '{other}'"),
                });
            }
        };

        Ok(Self {
            backend,
            image: optional_env("CONTAINER_IMAGE")?
                .unwrap_or_else(|| "workspace-base:latest".to_string()),
            cpu_quota: parse_optional_env("CONTAINER_CPU_QUOTA", 200_000)?,
            memory_limit_bytes: parse_optional_env(
                "CONTAINER_MEMORY_LIMIT",
                2 * 1024 * 1024 * 1024,
            )?,
            pids_limit: parse_optional_env("CONTAINER_PIDS_LIMIT", 256)?,
            inactive_ttl: Duration::from_secs(parse_optional_env("CONTAINER_INACTIVE_TTL", 3600)?),
            absolute_ttl: Duration::from_secs(parse_optional_env(
                "CONTAINER_ABSOLUTE_TTL",
                28800,
            )?),
            execution_timeout: Duration::from_secs(parse_optional_env(
                "CONTAINER_EXECUTION_TIMEOUT",
                600,
            )?),
            event_timeout: Duration::from_secs(parse_optional_env("EVENT_TIMEOUT", 720)?),
            grace_period: Duration::from_secs(parse_optional_env("CONTAINER_GRACE_PERIOD", 30)?),
            gc_interval: Duration::from_secs(parse_optional_env("CONTAINER_GC_INTERVAL", 60)?),
            socket_base_path: optional_env("WORKSPACE_SOCKET_BASE_PATH")?
                .unwrap_or_else(|| "/var/run/workspace-sockets".to_string()),
            socket_host_path: optional_env("WORKSPACE_SOCKET_HOST_PATH")?
                .filter(|s| !s.is_empty()),
            seccomp_profile_path: optional_env("SECCOMP_PROFILE_PATH")?.filter(|s| !s.is_empty()),
            apparmor_profile_name: optional_env("APPARMOR_PROFILE_NAME")?
                .filter(|s| !s.is_empty()),
        })
    }

    /// Socket base path as seen by the Docker daemon when bind-mounting.
    pub fn resolved_socket_host_path(&self) -> &str {
        self.socket_host_path
            .as_deref()
            .unwrap_or(&self.socket_base_path)
    }
}

/// Warm pool bounds.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
}

impl PoolConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            min_size: parse_optional_env("WARM_POOL_MIN_SIZE", 2)?,
            max_size: parse_optional_env("WARM_POOL_MAX_SIZE", 10)?,
        })
    }
}

/// Egress proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Hosts (or domain suffixes) sandboxes may reach.
    pub domain_whitelist: Vec<String>,
    pub log_all_requests: bool,
}

impl ProxyConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let default_whitelist = "pypi.org,files.pythonhosted.org,registry.npmjs.org,\
             api.anthropic.com,bedrock-runtime.us-east-1.amazonaws.com,\
             bedrock-runtime.us-west-2.amazonaws.com";
        let raw =
            optional_env("PROXY_DOMAIN_WHITELIST")?.unwrap_or_else(|| default_whitelist.into());
        Ok(Self {
            domain_whitelist: split_csv(&raw),
            log_all_requests: parse_bool_env("PROXY_LOG_ALL_REQUESTS", true)?,
        })
    }
}

/// Distributed lock settings.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Absolute TTL on held locks.
    pub ttl: Duration,
    /// How long an acquirer waits before giving up.
    pub wait_budget: Duration,
}

impl LockConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            ttl: Duration::from_secs(parse_optional_env("LOCK_TTL", 900)?),
            wait_budget: Duration::from_secs_f64(parse_optional_env("LOCK_WAIT_BUDGET", 5.0)?),
        })
    }
}

/// Cloud provider settings: signing credentials and blob storage.
#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_workspace_prefix: String,
}

impl AwsConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            region: optional_env("AWS_REGION")?.unwrap_or_else(|| "us-west-2".to_string()),
            access_key_id: optional_env("AWS_ACCESS_KEY_ID")?.filter(|s| !s.is_empty()),
            secret_access_key: optional_env("AWS_SECRET_ACCESS_KEY")?.filter(|s| !s.is_empty()),
            session_token: optional_env("AWS_SESSION_TOKEN")?.filter(|s| !s.is_empty()),
            s3_bucket: optional_env("S3_BUCKET_NAME")?.filter(|s| !s.is_empty()),
            s3_workspace_prefix: optional_env("S3_WORKSPACE_PREFIX")?
                .unwrap_or_else(|| "workspaces".to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

/// Task-runner backend settings. Only validated when that backend is active.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub cluster: String,
    pub task_definition: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub capacity_provider: Option<String>,
    pub agent_port: u16,
    pub proxy_port: u16,
}

impl RunnerConfig {
    fn resolve(required: bool) -> Result<Self, ConfigError> {
        let (cluster, task_definition) = if required {
            (
                require_env("RUNNER_CLUSTER", "set the task-runner cluster name")?,
                require_env(
                    "RUNNER_TASK_DEFINITION",
                    "set the workspace task definition reference",
                )?,
            )
        } else {
            (
                optional_env("RUNNER_CLUSTER")?.unwrap_or_default(),
                optional_env("RUNNER_TASK_DEFINITION")?.unwrap_or_default(),
            )
        };

        Ok(Self {
            cluster,
            task_definition,
            subnets: split_csv(&optional_env("RUNNER_SUBNETS")?.unwrap_or_default()),
            security_groups: split_csv(&optional_env("RUNNER_SECURITY_GROUPS")?.unwrap_or_default()),
            capacity_provider: optional_env("RUNNER_CAPACITY_PROVIDER")?.filter(|s| !s.is_empty()),
            agent_port: parse_optional_env("RUNNER_AGENT_PORT", 9000)?,
            proxy_port: parse_optional_env("RUNNER_PROXY_PORT", 8080)?,
        })
    }
}

/// Top-level settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub store: StoreConfig,
    pub container: ContainerConfig,
    pub pool: PoolConfig,
    pub proxy: ProxyConfig,
    pub lock: LockConfig,
    pub aws: AwsConfig,
    pub runner: RunnerConfig,
    pub shutdown_timeout: Duration,
}

impl Settings {
    /// Resolve settings from the environment and validate them.
    pub fn from_env() -> Result<Self, ConfigError> {
        let container = ContainerConfig::resolve()?;
        let runner = RunnerConfig::resolve(container.backend == BackendKind::Runner)?;
        let settings = Self {
            store: StoreConfig::resolve()?,
            container,
            pool: PoolConfig::resolve()?,
            proxy: ProxyConfig::resolve()?,
            lock: LockConfig::resolve()?,
            aws: AwsConfig::resolve()?,
            runner,
            shutdown_timeout: Duration::from_secs_f64(parse_optional_env(
                "SHUTDOWN_TIMEOUT",
                30.0,
            )?),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Cross-section invariants; a violating configuration refuses to start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.container.execution_timeout >= self.container.event_timeout {
            return Err(ConfigError::InvalidValue {
                key: "EVENT_TIMEOUT".to_string(),
                message: format!(
                    "event_timeout ({:?}) must be greater than container_execution_timeout ({:?})",
                    self.container.event_timeout, self.container.execution_timeout
                ),
            });
        }
        if self.container.event_timeout >= self.lock.ttl {
            return Err(ConfigError::InvalidValue {
                key: "LOCK_TTL".to_string(),
                message: format!(
                    "lock_ttl ({:?}) must be greater than event_timeout ({:?})",
                    self.lock.ttl, self.container.event_timeout
                ),
            });
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(ConfigError::InvalidValue {
                key: "WARM_POOL_MIN_SIZE".to_string(),
                message: format!(
                    "min_size ({}) must not exceed max_size ({})",
                    self.pool.min_size, self.pool.max_size
                ),
            });
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                redis_url: "redis://localhost:6379/0".to_string(),
            },
            container: ContainerConfig {
                backend: BackendKind::Docker,
                image: "workspace-base:latest".to_string(),
                cpu_quota: 200_000,
                memory_limit_bytes: 2 * 1024 * 1024 * 1024,
                pids_limit: 256,
                inactive_ttl: Duration::from_secs(3600),
                absolute_ttl: Duration::from_secs(28800),
                execution_timeout: Duration::from_secs(600),
                event_timeout: Duration::from_secs(720),
                grace_period: Duration::from_secs(30),
                gc_interval: Duration::from_secs(60),
                socket_base_path: "/var/run/workspace-sockets".to_string(),
                socket_host_path: None,
                seccomp_profile_path: None,
                apparmor_profile_name: None,
            },
            pool: PoolConfig {
                min_size: 2,
                max_size: 10,
            },
            proxy: ProxyConfig {
                domain_whitelist: vec!["files.example.com".to_string()],
                log_all_requests: true,
            },
            lock: LockConfig {
                ttl: Duration::from_secs(900),
                wait_budget: Duration::from_secs(5),
            },
            aws: AwsConfig {
                region: "us-west-2".to_string(),
                access_key_id: None,
                secret_access_key: None,
                session_token: None,
                s3_bucket: None,
                s3_workspace_prefix: "workspaces".to_string(),
            },
            runner: RunnerConfig {
                cluster: String::new(),
                task_definition: String::new(),
                subnets: vec![],
                security_groups: vec![],
                capacity_provider: None,
                agent_port: 9000,
                proxy_port: 8080,
            },
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_validate() {
        Settings::default().validate().expect("defaults are valid");
    }

    #[test]
    fn test_timeout_hierarchy_execution_vs_event() {
        let mut settings = Settings::default();
        settings.container.execution_timeout = Duration::from_secs(720);
        settings.container.event_timeout = Duration::from_secs(720);
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "EVENT_TIMEOUT"));
    }

    #[test]
    fn test_timeout_hierarchy_event_vs_lock() {
        let mut settings = Settings::default();
        settings.lock.ttl = Duration::from_secs(700);
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "LOCK_TTL"));
    }

    #[test]
    fn test_pool_bounds_checked() {
        let mut settings = Settings::default();
        settings.pool.min_size = 20;
        settings.pool.max_size = 10;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_resolved_socket_host_path_fallback() {
        let mut container = Settings::default().container;
        assert_eq!(
            container.resolved_socket_host_path(),
            "/var/run/workspace-sockets"
        );
        container.socket_host_path = Some("/host/sockets".to_string());
        assert_eq!(container.resolved_socket_host_path(), "/host/sockets");
    }
}
