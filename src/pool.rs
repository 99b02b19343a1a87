//! Warm pool: pre-created idle sandboxes ready for assignment.
//!
//! Acquire pops the head of the shared FIFO (atomic LPOP, so replicas do
//! not race), skipping unhealthy entries; an empty pool falls back to
//! synchronous creation so acquire never blocks on refill. Every
//! successful acquire schedules an asynchronous refill back to the floor.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::backend::ContainerBackend;
use crate::error::{Result, WorkspaceError};
use crate::metrics::metrics;
use crate::retry::{RetryConfig, retry_async};
use crate::sandbox::Sandbox;
use crate::shutdown::ShutdownManager;
use crate::store::Store;

const AGENT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const UNHEALTHY_GRACE: Duration = Duration::from_secs(5);

/// Pool of pre-created sandboxes.
#[derive(Clone)]
pub struct WarmPool {
    backend: Arc<dyn ContainerBackend>,
    store: Store,
    shutdown: Arc<ShutdownManager>,
    min_size: usize,
    max_size: usize,
    retry: RetryConfig,
}

impl WarmPool {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        store: Store,
        shutdown: Arc<ShutdownManager>,
        min_size: usize,
        max_size: usize,
    ) -> Self {
        Self {
            backend,
            store,
            shutdown,
            min_size,
            max_size,
            retry: RetryConfig::default(),
        }
    }

    /// Take a sandbox from the pool, creating one synchronously when the
    /// pool is empty. Unhealthy entries are discarded and destroyed in the
    /// background.
    pub async fn acquire(&self) -> Result<Sandbox> {
        while let Some(sandbox_id) = self.store.pool_pop().await? {
            let info = self.store.pool_info_load(&sandbox_id).await?;
            self.store.pool_info_delete(&sandbox_id).await?;

            if let Some(sandbox) = info
                && self.backend.is_healthy(&sandbox_id).await
            {
                tracing::info!("Warm pool: acquired {}", sandbox_id);
                self.spawn_replenish();
                self.update_size_gauge().await;
                return Ok(sandbox);
            }

            tracing::warn!("Warm pool: discarding unhealthy {}", sandbox_id);
            let backend = self.backend.clone();
            self.shutdown.spawn(async move {
                if let Err(e) = backend.destroy_sandbox(&sandbox_id, UNHEALTHY_GRACE).await {
                    tracing::error!("Warm pool: cleanup of {} failed: {}", sandbox_id, e);
                }
            });
        }

        tracing::info!("Warm pool empty, creating sandbox synchronously");
        self.spawn_replenish();
        self.create_ready(None).await
    }

    /// Current pool size as recorded in the shared store.
    pub async fn size(&self) -> Result<usize> {
        self.store.pool_len().await
    }

    /// Bring the pool back up to `min_size`, never past `max_size`.
    pub async fn replenish(&self) -> Result<()> {
        let current = self.store.pool_len().await?;
        let needed = self.min_size.saturating_sub(current);
        if needed == 0 {
            return Ok(());
        }

        tracing::info!(
            "Warm pool: replenishing {} sandbox(es) (current {})",
            needed,
            current
        );
        let results = join_all((0..needed).map(|_| self.create_and_add())).await;
        for result in results {
            if let Err(e) = result {
                tracing::error!("Warm pool: creation failed: {}", e);
            }
        }
        self.update_size_gauge().await;
        Ok(())
    }

    /// Destroy every pooled sandbox; used at shutdown.
    pub async fn drain(&self) -> Result<()> {
        tracing::info!("Warm pool: draining");
        let mut drained = 0;
        while let Some(sandbox_id) = self.store.pool_pop().await? {
            self.store.pool_info_delete(&sandbox_id).await?;
            if let Err(e) = self
                .backend
                .destroy_sandbox(&sandbox_id, UNHEALTHY_GRACE)
                .await
            {
                tracing::error!("Warm pool: drain of {} failed: {}", sandbox_id, e);
            }
            drained += 1;
        }
        metrics().warm_pool_size.set(0);
        tracing::info!("Warm pool: drained {} sandbox(es)", drained);
        Ok(())
    }

    fn spawn_replenish(&self) {
        if self.shutdown.is_shutting_down() {
            return;
        }
        let pool = self.clone();
        self.shutdown.spawn(async move {
            if let Err(e) = pool.replenish().await {
                tracing::error!("Warm pool: replenish failed: {}", e);
            }
        });
    }

    async fn create_and_add(&self) -> Result<()> {
        // Racing replicas can both decide to refill; the max check bounds
        // the overshoot.
        if self.store.pool_len().await? >= self.max_size {
            return Ok(());
        }

        let created = retry_async("warm pool create", &self.retry, || self.create_ready(None))
            .await
            .inspect_err(|_| metrics().warm_pool_create_failures_total.inc())?;

        self.store.pool_push(&created).await?;
        tracing::info!("Warm pool: added {}", created.id);
        Ok(())
    }

    /// Create a sandbox and wait until its agent answers health checks.
    async fn create_ready(&self, conversation_id: Option<&str>) -> Result<Sandbox> {
        let sandbox = self.backend.create_sandbox(conversation_id).await?;
        if !self
            .backend
            .wait_for_agent_ready(&sandbox, AGENT_READY_TIMEOUT)
            .await
        {
            let _ = self
                .backend
                .destroy_sandbox(&sandbox.id, UNHEALTHY_GRACE)
                .await;
            return Err(WorkspaceError::ContainerUnavailable {
                reason: format!("agent in {} never became ready", sandbox.id),
            });
        }
        Ok(sandbox)
    }

    async fn update_size_gauge(&self) {
        if let Ok(size) = self.store.pool_len().await {
            metrics().warm_pool_size.set(size as i64);
        }
    }
}
