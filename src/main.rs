//! workspaced - main entry point.
//!
//! Wires the backend selected by configuration, the shared store, the warm
//! pool, the orchestrator, and the garbage collector, then serves until a
//! shutdown signal arrives. The HTTP/SSE facade is a separate service that
//! links against the library.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use workspaced::backend::{ContainerBackend, DockerBackend, TaskRunnerBackend};
use workspaced::config::{BackendKind, Settings};
use workspaced::gc::GarbageCollector;
use workspaced::orchestrator::Orchestrator;
use workspaced::pool::WarmPool;
use workspaced::shutdown::ShutdownManager;
use workspaced::store::Store;
use workspaced::sync::{FileRecordStore, FileSync, S3BlobStore};

#[derive(Parser)]
#[command(
    name = "workspaced",
    version,
    about = "Multi-tenant sandbox serving layer"
)]
struct Cli {
    /// Validate configuration and exit.
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    if cli.check_config {
        println!("configuration ok");
        return Ok(());
    }

    tracing::info!(
        "Starting workspaced (backend: {}, pool: {}..{})",
        settings.container.backend.as_str(),
        settings.pool.min_size,
        settings.pool.max_size
    );

    let store = Store::new(workspaced::store::connect(&settings.store.redis_url).await?);
    let shutdown = Arc::new(ShutdownManager::new(settings.shutdown_timeout));

    let aws_sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(settings.aws.region.clone()))
        .load()
        .await;

    let backend: Arc<dyn ContainerBackend> = match settings.container.backend {
        BackendKind::Docker => Arc::new(
            DockerBackend::connect(settings.container.clone(), &settings.aws.region).await?,
        ),
        BackendKind::Runner => Arc::new(TaskRunnerBackend::new(
            &aws_sdk_config,
            store.clone(),
            settings.runner.clone(),
        )),
    };

    let blob: Arc<dyn workspaced::sync::BlobStore> = match &settings.aws.s3_bucket {
        Some(bucket) => Arc::new(S3BlobStore::new(
            &aws_sdk_config,
            bucket,
            &settings.aws.s3_workspace_prefix,
        )),
        None => {
            tracing::warn!("No blob store bucket configured; file sync will fail per-file");
            Arc::new(S3BlobStore::new(
                &aws_sdk_config,
                "",
                &settings.aws.s3_workspace_prefix,
            ))
        }
    };
    let file_sync = Arc::new(FileSync::new(
        blob,
        FileRecordStore::new(store.connection()),
        backend.clone(),
    ));

    let pool = Arc::new(WarmPool::new(
        backend.clone(),
        store.clone(),
        shutdown.clone(),
        settings.pool.min_size,
        settings.pool.max_size,
    ));

    let orchestrator = Orchestrator::new(
        backend.clone(),
        store.clone(),
        pool.clone(),
        file_sync,
        shutdown.clone(),
        &settings,
    );

    // Adopt whatever survived a previous incarnation, then pre-warm.
    orchestrator.reconcile_on_startup().await;
    if let Err(e) = pool.replenish().await {
        tracing::error!("Initial warm pool fill failed: {}", e);
    }

    let gc = Arc::new(GarbageCollector::new(
        backend.clone(),
        store.clone(),
        orchestrator.proxy_stop_callback(),
        &settings,
    ));
    gc.start(&shutdown);

    tracing::info!("workspaced ready");

    wait_for_signal().await;
    tracing::info!("Shutdown signal received");

    // Sandboxes are destroyed explicitly; the binding records let a future
    // incarnation's GC inherit anything we miss.
    orchestrator.destroy_all().await;
    shutdown.graceful_shutdown().await;

    tracing::info!("workspaced stopped");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("SIGTERM handler failed: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
