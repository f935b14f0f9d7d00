use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use convo_queue::api::job_routes;
use convo_queue::config::Config;
use convo_queue::graph::GraphRegistry;
use convo_queue::jobs::JobManager;
use convo_queue::worker::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    // Initialize tracing; keep the guard alive so buffered file logs flush on exit
    let (file_layer, _log_guard) = match &config.server.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "convo-queue.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("🧵 Convo Queue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}/api/jobs", config.server.bind);
    eprintln!(
        "   Workers: {} (timeout {}s)",
        config.pool.max_workers,
        config.pool.execution_timeout.as_secs()
    );
    eprintln!(
        "   Queue: max {} jobs, TTL {}s",
        config.jobs.max_queue_size,
        config.jobs.job_ttl.as_secs()
    );
    let registry = Arc::new(GraphRegistry::with_builtins());
    eprintln!(
        "   Graph: {} (in {}, kinds: {})\n",
        config.pool.graph.path.display(),
        config.pool.graph.base_dir.display(),
        registry.kinds().join(", ")
    );

    // ── Jobs + Workers ──────────────────────────────────────────────────
    let jobs = JobManager::new(config.jobs.clone());
    let pool = Arc::new(WorkerPool::start(
        config.pool.clone(),
        Arc::clone(&jobs),
        registry,
    )?);

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = job_routes(Arc::clone(&jobs), Arc::clone(&pool));
    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(addr = %config.server.bind, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    let report = pool.terminate().await;
    tracing::info!(
        exited = report.exited,
        abandoned = report.abandoned,
        "Shutdown complete"
    );

    Ok(())
}
