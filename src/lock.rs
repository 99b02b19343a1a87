//! Redis-backed per-conversation single-writer lock with fencing tokens.
//!
//! Acquisition is a SET NX PX loop bounded by a wait budget. Release and
//! extension run server-side Lua so a holder can only act on its own token:
//! a stale holder whose TTL expired and whose lock was re-acquired by
//! another replica cannot release or extend the new holder's lock.

use std::time::Duration;

use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::error::{Result, WorkspaceError};

/// Delete the key only if it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Extend the TTL only if the key still holds the caller's token.
const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Distributed lock manager scoped to one resource family.
#[derive(Clone)]
pub struct DistributedLock {
    con: ConnectionManager,
    key_prefix: String,
}

impl DistributedLock {
    /// `key_prefix` namespaces the lock keys, e.g. `"conversation:"`.
    pub fn new(con: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            con,
            key_prefix: key_prefix.to_string(),
        }
    }

    /// Lock manager for per-conversation locks (`lock:conversation:{id}`).
    pub fn for_conversations(con: ConnectionManager) -> Self {
        Self::new(con, "conversation:")
    }

    fn lock_key(&self, resource: &str) -> String {
        format!("lock:{}{}", self.key_prefix, resource)
    }

    /// Acquire the lock, retrying until the wait budget is exhausted.
    ///
    /// Returns the opaque fencing token the holder must present to
    /// [`release`](Self::release) and [`extend`](Self::extend).
    pub async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        wait_budget: Duration,
    ) -> Result<String> {
        let lock_key = self.lock_key(resource);
        let token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + wait_budget;
        let mut con = self.con.clone();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&lock_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut con)
                .await?;

            if acquired.is_some() {
                tracing::debug!("Acquired lock {} (ttl {:?})", lock_key, ttl);
                return Ok(token);
            }

            if tokio::time::Instant::now() + RETRY_INTERVAL > deadline {
                return Err(WorkspaceError::LockAcquisitionTimeout {
                    resource: resource.to_string(),
                    waited: wait_budget,
                });
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Release the lock. Returns false when the token no longer matches
    /// (expired, or stolen by another holder).
    pub async fn release(&self, resource: &str, token: &str) -> bool {
        let lock_key = self.lock_key(resource);
        let mut con = self.con.clone();
        let result: std::result::Result<i64, redis::RedisError> = redis::Script::new(RELEASE_SCRIPT)
            .key(&lock_key)
            .arg(token)
            .invoke_async(&mut con)
            .await;

        match result {
            Ok(1) => {
                tracing::debug!("Released lock {}", lock_key);
                true
            }
            Ok(_) => {
                tracing::warn!("Lock release refused for {} (token mismatch or expired)", lock_key);
                false
            }
            Err(e) => {
                tracing::error!("Lock release error for {}: {}", lock_key, e);
                false
            }
        }
    }

    /// Extend the lock's TTL. Same fencing rule as release.
    pub async fn extend(&self, resource: &str, token: &str, ttl: Duration) -> bool {
        let lock_key = self.lock_key(resource);
        let mut con = self.con.clone();
        let result: std::result::Result<i64, redis::RedisError> = redis::Script::new(EXTEND_SCRIPT)
            .key(&lock_key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut con)
            .await;

        match result {
            Ok(1) => true,
            Ok(_) => {
                tracing::warn!("Lock extend refused for {} (token mismatch or expired)", lock_key);
                false
            }
            Err(e) => {
                tracing::error!("Lock extend error for {}: {}", lock_key, e);
                false
            }
        }
    }

    /// Whether any holder currently owns the resource.
    pub async fn is_locked(&self, resource: &str) -> Result<bool> {
        use redis::AsyncCommands;
        let lock_key = self.lock_key(resource);
        let mut con = self.con.clone();
        let exists: bool = con.exists(&lock_key).await?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_schema() {
        // The key schema is part of the cross-replica contract.
        let prefix = "conversation:";
        assert_eq!(
            format!("lock:{}{}", prefix, "c1"),
            "lock:conversation:c1".to_string()
        );
    }

    #[test]
    fn test_tokens_are_unique_and_opaque() {
        let a = Uuid::new_v4().to_string();
        let b = Uuid::new_v4().to_string();
        assert_ne!(a, b);
    }

    #[test]
    fn test_scripts_guard_on_token_match() {
        // Both scripts must compare the stored value against ARGV[1] before
        // acting, otherwise fencing is broken.
        assert!(RELEASE_SCRIPT.contains(r#"redis.call("get", KEYS[1]) == ARGV[1]"#));
        assert!(EXTEND_SCRIPT.contains(r#"redis.call("get", KEYS[1]) == ARGV[1]"#));
        assert!(RELEASE_SCRIPT.contains(r#"redis.call("del", KEYS[1])"#));
        assert!(EXTEND_SCRIPT.contains(r#"redis.call("pexpire", KEYS[1], ARGV[2])"#));
    }
}
