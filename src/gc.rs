//! Background garbage collector for TTL-expired and orphaned sandboxes.
//!
//! Each cycle enumerates live sandboxes from the backend and reconciles
//! them against the shared store. TTL checks compare against the snapshot
//! read at the start of the cycle, so a binding refreshed by a concurrent
//! execute survives: destruction is conditional on the observed
//! `last_active_at`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::audit;
use crate::backend::ContainerBackend;
use crate::metrics::metrics;
use crate::orchestrator::ProxyStopFn;
use crate::sandbox::{Sandbox, SandboxState};
use crate::shutdown::ShutdownManager;
use crate::store::Store;

const ORPHAN_GRACE: Duration = Duration::from_secs(5);

/// Reaps sandboxes past their TTLs, in Draining state, or orphaned.
pub struct GarbageCollector {
    backend: Arc<dyn ContainerBackend>,
    store: Store,
    proxy_stop: ProxyStopFn,
    inactive_ttl: Duration,
    absolute_ttl: Duration,
    grace_period: Duration,
    interval: Duration,
}

impl GarbageCollector {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        store: Store,
        proxy_stop: ProxyStopFn,
        settings: &crate::config::Settings,
    ) -> Self {
        Self {
            backend,
            store,
            proxy_stop,
            inactive_ttl: settings.container.inactive_ttl,
            absolute_ttl: settings.container.absolute_ttl,
            grace_period: settings.container.grace_period,
            interval: settings.container.gc_interval,
        }
    }

    /// Run the GC loop on the shutdown manager until shutdown is signalled.
    pub fn start(self: Arc<Self>, shutdown: &ShutdownManager) {
        let mut shutdown_rx = shutdown.subscribe();
        let gc = self;
        tracing::info!("GC started (interval {:?})", gc.interval);
        let interval = gc.interval;
        shutdown.spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match gc.collect().await {
                            Ok(destroyed) => {
                                metrics()
                                    .gc_cycles_total
                                    .with_label_values(&["success"])
                                    .inc();
                                if destroyed > 0 {
                                    tracing::info!("GC cycle destroyed {} sandbox(es)", destroyed);
                                }
                            }
                            Err(e) => {
                                metrics()
                                    .gc_cycles_total
                                    .with_label_values(&["error"])
                                    .inc();
                                tracing::error!("GC cycle failed: {}", e);
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("GC stopped");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// One GC cycle. Returns the number of sandboxes destroyed.
    pub async fn collect(&self) -> crate::error::Result<usize> {
        let now = Utc::now();
        let mut destroyed = 0;

        for listed in self.backend.list_workspace_sandboxes().await? {
            let binding = match &listed.conversation_id {
                Some(conversation_id) => self.store.load_binding(conversation_id).await?,
                None => match self.store.load_reverse_binding(&listed.id).await? {
                    Some(conversation_id) => self.store.load_binding(&conversation_id).await?,
                    None => None,
                },
            };

            match binding {
                Some(sandbox) if sandbox.id == listed.id => {
                    if self.should_destroy(&sandbox, now) {
                        tracing::info!(
                            "GC: destroying {} (conversation {:?}, state {})",
                            sandbox.id,
                            sandbox.conversation_id,
                            sandbox.state.as_str()
                        );
                        self.graceful_destroy(&sandbox).await;
                        destroyed += 1;
                    }
                }
                _ => {
                    // No binding (or a stale one pointing elsewhere): an
                    // orphan. Only reap it once it is no longer running.
                    if !listed.running {
                        tracing::warn!("GC: destroying orphan {}", listed.id);
                        if let Err(e) = self
                            .backend
                            .destroy_sandbox(&listed.id, ORPHAN_GRACE)
                            .await
                        {
                            tracing::error!("GC: orphan destroy of {} failed: {}", listed.id, e);
                        } else {
                            metrics().gc_destroyed_total.inc();
                            audit::container_destroyed(&listed.id, "", "", "orphan");
                            destroyed += 1;
                        }
                    }
                }
            }
        }

        Ok(destroyed)
    }

    fn should_destroy(&self, sandbox: &Sandbox, now: DateTime<Utc>) -> bool {
        should_destroy(sandbox, now, self.inactive_ttl, self.absolute_ttl)
    }

    async fn graceful_destroy(&self, sandbox: &Sandbox) {
        let conversation_id = sandbox.conversation_id.clone().unwrap_or_default();

        // Mark Draining so a racing replica rejects new work on it.
        if let Err(e) = self
            .store
            .mark_state(&conversation_id, SandboxState::Draining.as_str())
            .await
        {
            tracing::error!("GC: draining mark failed for {}: {}", sandbox.id, e);
        }

        (*self.proxy_stop)(sandbox.id.clone()).await;

        if let Err(e) = self
            .backend
            .destroy_sandbox(&sandbox.id, self.grace_period)
            .await
        {
            tracing::error!("GC: destroy of {} failed: {}", sandbox.id, e);
            return;
        }

        if let Err(e) = self
            .store
            .delete_binding(&conversation_id, &sandbox.id)
            .await
        {
            tracing::error!("GC: binding delete failed for {}: {}", sandbox.id, e);
        }

        metrics().gc_destroyed_total.inc();
        metrics().active_containers.dec();
        audit::container_destroyed(&sandbox.id, &conversation_id, "", "cleanup");
    }
}

/// Destruction policy: inactive TTL exceeded, absolute TTL exceeded, or
/// explicitly Draining.
pub(crate) fn should_destroy(
    sandbox: &Sandbox,
    now: DateTime<Utc>,
    inactive_ttl: Duration,
    absolute_ttl: Duration,
) -> bool {
    let inactive = now.signed_duration_since(sandbox.last_active_at);
    if inactive.num_seconds() > inactive_ttl.as_secs() as i64 {
        return true;
    }

    let age = now.signed_duration_since(sandbox.created_at);
    if age.num_seconds() > absolute_ttl.as_secs() as i64 {
        return true;
    }

    sandbox.state == SandboxState::Draining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Endpoint;
    use chrono::Duration as ChronoDuration;

    const INACTIVE_TTL: Duration = Duration::from_secs(3600);
    const ABSOLUTE_TTL: Duration = Duration::from_secs(28800);

    fn sandbox(created_secs_ago: i64, active_secs_ago: i64, state: SandboxState) -> Sandbox {
        let now = Utc::now();
        Sandbox {
            id: "ws-test".to_string(),
            backend: "docker".to_string(),
            agent_endpoint: Endpoint::Unix("/tmp/agent.sock".to_string()),
            proxy_endpoint: Endpoint::Unix("/tmp/proxy.sock".to_string()),
            conversation_id: Some("conv-1".to_string()),
            created_at: now - ChronoDuration::seconds(created_secs_ago),
            last_active_at: now - ChronoDuration::seconds(active_secs_ago),
            state,
            task_ref: String::new(),
        }
    }

    fn reaped(s: &Sandbox) -> bool {
        should_destroy(s, Utc::now(), INACTIVE_TTL, ABSOLUTE_TTL)
    }

    #[test]
    fn test_fresh_sandbox_survives() {
        assert!(!reaped(&sandbox(60, 10, SandboxState::Idle)));
    }

    #[test]
    fn test_inactive_ttl_reaps() {
        assert!(reaped(&sandbox(4000, 3700, SandboxState::Idle)));
    }

    #[test]
    fn test_recently_active_survives_even_when_old() {
        // Activity within the inactive TTL keeps a sandbox alive until the
        // absolute TTL.
        assert!(!reaped(&sandbox(10_000, 30, SandboxState::Idle)));
    }

    #[test]
    fn test_absolute_ttl_reaps_regardless_of_activity() {
        assert!(reaped(&sandbox(30_000, 5, SandboxState::Idle)));
    }

    #[test]
    fn test_draining_reaps_immediately() {
        assert!(reaped(&sandbox(60, 10, SandboxState::Draining)));
    }

    #[test]
    fn test_activity_at_cycle_snapshot_is_honored() {
        // A binding touched just before the cycle's snapshot survives even
        // if the check itself runs later in the cycle.
        let snapshot = Utc::now();
        let s = sandbox(5000, 1, SandboxState::Running);
        assert!(!should_destroy(&s, snapshot, INACTIVE_TTL, ABSOLUTE_TTL));
    }
}
