//! Graceful shutdown: every long-lived background task is tracked so the
//! process can signal, await bounded, then force.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Tracks background tasks and broadcasts the shutdown signal.
pub struct ShutdownManager {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    timeout: Duration,
}

impl ShutdownManager {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            timeout,
        }
    }

    /// Spawn a tracked background task.
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut tasks = self.tasks.lock().expect("task list lock");
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Receiver that flips to `true` when shutdown begins.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Number of tracked tasks that have not finished.
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .lock()
            .expect("task list lock")
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Signal shutdown, await tracked tasks up to the timeout, then abort
    /// whatever is left.
    pub async fn graceful_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("task list lock"));
        if handles.is_empty() {
            return;
        }

        tracing::info!(
            "Graceful shutdown: waiting for {} background task(s)",
            handles.len()
        );

        let wait_all = async {
            for handle in &handles {
                // Abort handles let us force the stragglers below; awaiting
                // a &JoinHandle is not possible, so poll completion instead.
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        };

        if tokio::time::timeout(self.timeout, wait_all).await.is_err() {
            let pending = handles.iter().filter(|h| !h.is_finished()).count();
            tracing::warn!("Shutdown timeout, aborting {} pending task(s)", pending);
            for handle in &handles {
                handle.abort();
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        tracing::info!("Graceful shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_tracked_tasks_complete_before_shutdown_returns() {
        let manager = ShutdownManager::new(Duration::from_secs(5));
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = done.clone();
        manager.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            done_clone.store(true, Ordering::SeqCst);
        });
        manager.graceful_shutdown().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted() {
        let manager = ShutdownManager::new(Duration::from_millis(50));
        manager.spawn(async {
            // Never completes on its own.
            std::future::pending::<()>().await;
        });
        tokio::time::timeout(Duration::from_secs(2), manager.graceful_shutdown())
            .await
            .expect("shutdown must not hang on a stuck task");
    }

    #[tokio::test]
    async fn test_shutdown_signal_observed_by_subscribers() {
        let manager = Arc::new(ShutdownManager::new(Duration::from_secs(1)));
        let mut rx = manager.subscribe();
        assert!(!manager.is_shutting_down());

        let m = manager.clone();
        let watcher = tokio::spawn(async move {
            rx.changed().await.expect("sender alive");
            assert!(*rx.borrow());
            let _ = m;
        });

        manager.graceful_shutdown().await;
        watcher.await.unwrap();
        assert!(manager.is_shutting_down());
    }
}
