//! Shared key/value store: conversation bindings, warm-pool bookkeeping,
//! and the runner-backend task mapping.
//!
//! This is the only mutable state shared across server replicas, so every
//! multi-step mutation here is expressed with atomic list primitives or is
//! tolerant of racing replicas. The binding invariant: `container:{conv}`
//! and `container_reverse:{sandbox}` exist together or not at all, and
//! carry the same TTL.

use std::collections::HashMap;
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::Result;
use crate::sandbox::Sandbox;

/// Key prefixes in the shared store.
pub mod keys {
    /// `workspace:container:{conversation_id}` -> sandbox snapshot hash.
    pub const CONTAINER: &str = "workspace:container";
    /// `workspace:container_reverse:{sandbox_id}` -> conversation_id.
    pub const CONTAINER_REVERSE: &str = "workspace:container_reverse";
    /// FIFO list of warm sandbox ids.
    pub const WARM_POOL: &str = "workspace:warm_pool";
    /// `workspace:warm_pool_info:{sandbox_id}` -> sandbox snapshot hash.
    pub const WARM_POOL_INFO: &str = "workspace:warm_pool_info";
    /// `workspace:files:{conversation_id}` -> path -> file record JSON.
    pub const FILES: &str = "workspace:files";
    /// `workspace:runner_task:{sandbox_id}` -> task reference.
    pub const RUNNER_TASK: &str = "workspace:runner_task";
}

/// Bounded absolute TTL on conversation bindings.
pub const BINDING_TTL: Duration = Duration::from_secs(3600);
/// TTL on warm pool info records.
pub const WARM_POOL_INFO_TTL: Duration = Duration::from_secs(1800);

/// Open a connection manager against the configured store.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    let con = client.get_connection_manager().await?;
    Ok(con)
}

/// Store operations for sandbox bindings and the warm pool.
#[derive(Clone)]
pub struct Store {
    con: ConnectionManager,
}

impl Store {
    pub fn new(con: ConnectionManager) -> Self {
        Self { con }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.con.clone()
    }

    // ---- Conversation bindings ----

    /// Persist both halves of a binding with the shared TTL.
    pub async fn save_binding(&self, sandbox: &Sandbox) -> Result<()> {
        let conversation_id = sandbox.conversation_id.as_deref().unwrap_or_default();
        let key = format!("{}:{}", keys::CONTAINER, conversation_id);
        let reverse_key = format!("{}:{}", keys::CONTAINER_REVERSE, sandbox.id);
        let ttl = BINDING_TTL.as_secs() as i64;

        let mut con = self.con.clone();
        let fields = sandbox.to_store_hash();
        let _: () = con.hset_multiple(&key, &fields).await?;
        let _: () = con.expire(&key, ttl).await?;
        let _: () = redis::cmd("SET")
            .arg(&reverse_key)
            .arg(conversation_id)
            .arg("EX")
            .arg(ttl)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    /// Load the sandbox bound to a conversation, if any.
    pub async fn load_binding(&self, conversation_id: &str) -> Result<Option<Sandbox>> {
        let key = format!("{}:{}", keys::CONTAINER, conversation_id);
        let mut con = self.con.clone();
        let data: HashMap<String, String> = con.hgetall(&key).await?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Sandbox::from_store_hash(&data))
    }

    /// Reverse lookup: sandbox id to conversation id.
    pub async fn load_reverse_binding(&self, sandbox_id: &str) -> Result<Option<String>> {
        let key = format!("{}:{}", keys::CONTAINER_REVERSE, sandbox_id);
        let mut con = self.con.clone();
        let value: Option<String> = con.get(&key).await?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    /// Refresh activity fields and reset the TTL on both binding keys.
    pub async fn refresh_binding(&self, sandbox: &Sandbox) -> Result<()> {
        let conversation_id = sandbox.conversation_id.as_deref().unwrap_or_default();
        let key = format!("{}:{}", keys::CONTAINER, conversation_id);
        let reverse_key = format!("{}:{}", keys::CONTAINER_REVERSE, sandbox.id);
        let ttl = BINDING_TTL.as_secs() as i64;

        let mut con = self.con.clone();
        let _: () = con
            .hset_multiple(
                &key,
                &[
                    (
                        "last_active_at".to_string(),
                        sandbox.last_active_at.to_rfc3339(),
                    ),
                    ("state".to_string(), sandbox.state.as_str().to_string()),
                ],
            )
            .await?;
        let _: () = con.expire(&key, ttl).await?;
        let _: () = con.expire(&reverse_key, ttl).await?;
        Ok(())
    }

    /// Overwrite just the state field of a binding.
    pub async fn mark_state(&self, conversation_id: &str, state: &str) -> Result<()> {
        let key = format!("{}:{}", keys::CONTAINER, conversation_id);
        let mut con = self.con.clone();
        let _: () = con.hset(&key, "state", state).await?;
        Ok(())
    }

    /// Remove both halves of a binding.
    pub async fn delete_binding(&self, conversation_id: &str, sandbox_id: &str) -> Result<()> {
        let key = format!("{}:{}", keys::CONTAINER, conversation_id);
        let reverse_key = format!("{}:{}", keys::CONTAINER_REVERSE, sandbox_id);
        let mut con = self.con.clone();
        let _: () = con.del(&key).await?;
        let _: () = con.del(&reverse_key).await?;
        Ok(())
    }

    // ---- Warm pool ----

    /// Atomically pop the oldest warm sandbox id, if any.
    pub async fn pool_pop(&self) -> Result<Option<String>> {
        let mut con = self.con.clone();
        let id: Option<String> = con.lpop(keys::WARM_POOL, None).await?;
        Ok(id.filter(|v| !v.is_empty()))
    }

    /// Append a warm sandbox id and persist its snapshot.
    pub async fn pool_push(&self, sandbox: &Sandbox) -> Result<()> {
        let info_key = format!("{}:{}", keys::WARM_POOL_INFO, sandbox.id);
        let mut con = self.con.clone();
        let fields = sandbox.to_store_hash();
        let _: () = con.hset_multiple(&info_key, &fields).await?;
        let _: () = con
            .expire(&info_key, WARM_POOL_INFO_TTL.as_secs() as i64)
            .await?;
        let _: () = con.rpush(keys::WARM_POOL, &sandbox.id).await?;
        Ok(())
    }

    pub async fn pool_len(&self) -> Result<usize> {
        let mut con = self.con.clone();
        let len: usize = con.llen(keys::WARM_POOL).await?;
        Ok(len)
    }

    pub async fn pool_info_load(&self, sandbox_id: &str) -> Result<Option<Sandbox>> {
        let info_key = format!("{}:{}", keys::WARM_POOL_INFO, sandbox_id);
        let mut con = self.con.clone();
        let data: HashMap<String, String> = con.hgetall(&info_key).await?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Sandbox::from_store_hash(&data))
    }

    pub async fn pool_info_delete(&self, sandbox_id: &str) -> Result<()> {
        let info_key = format!("{}:{}", keys::WARM_POOL_INFO, sandbox_id);
        let mut con = self.con.clone();
        let _: () = con.del(&info_key).await?;
        Ok(())
    }

    // ---- Runner task mapping ----

    /// Record sandbox id -> task reference for the runner backend. The TTL
    /// matches the sandbox absolute TTL so the mapping cannot outlive the
    /// task by much.
    pub async fn save_runner_task(&self, sandbox_id: &str, task_ref: &str) -> Result<()> {
        let key = format!("{}:{}", keys::RUNNER_TASK, sandbox_id);
        let mut con = self.con.clone();
        let _: () = con.set_ex(&key, task_ref, 28800).await?;
        Ok(())
    }

    pub async fn load_runner_task(&self, sandbox_id: &str) -> Result<Option<String>> {
        let key = format!("{}:{}", keys::RUNNER_TASK, sandbox_id);
        let mut con = self.con.clone();
        let value: Option<String> = con.get(&key).await?;
        Ok(value)
    }

    pub async fn delete_runner_task(&self, sandbox_id: &str) -> Result<()> {
        let key = format!("{}:{}", keys::RUNNER_TASK, sandbox_id);
        let mut con = self.con.clone();
        let _: () = con.del(&key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_schema_is_stable() {
        // GC and multi-replica coordination depend on these exact prefixes.
        assert_eq!(keys::CONTAINER, "workspace:container");
        assert_eq!(keys::CONTAINER_REVERSE, "workspace:container_reverse");
        assert_eq!(keys::WARM_POOL, "workspace:warm_pool");
        assert_eq!(keys::WARM_POOL_INFO, "workspace:warm_pool_info");
    }

    #[test]
    fn test_binding_ttls_match() {
        // Both binding keys must expire together.
        assert_eq!(BINDING_TTL, Duration::from_secs(3600));
        assert!(WARM_POOL_INFO_TTL < BINDING_TTL);
    }
}
