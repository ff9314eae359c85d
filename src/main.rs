use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use inbox_workers::api;
use inbox_workers::cli::{self, Cli, Command};
use inbox_workers::config::AppConfig;
use inbox_workers::context::AppContext;
use inbox_workers::llm::select_provider;
use inbox_workers::logging;
use inbox_workers::mail::ProviderRegistry;
use inbox_workers::metrics::LibSqlMetricsStore;
use inbox_workers::store::LibSqlStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let _log_guard = logging::init(config.log_dir.as_deref());

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting inbox workers");

    // ── Stores ──────────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlStore::new_local(&config.database_path)
            .await
            .with_context(|| {
                format!("Failed to open database at {}", config.database_path.display())
            })?,
    );
    let metrics = Arc::new(
        LibSqlMetricsStore::new_local(&config.metrics_path)
            .await
            .with_context(|| {
                format!("Failed to open metrics store at {}", config.metrics_path.display())
            })?,
    );
    tracing::info!(
        database = %config.database_path.display(),
        metrics = %config.metrics_path.display(),
        "Stores ready"
    );

    // ── Providers ───────────────────────────────────────────────────────
    let llm = select_provider(&config.llm.candidates()).context("No usable LLM provider")?;
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;
    let providers = Arc::new(ProviderRegistry::with_http(http, &config.sync));

    // ── Workers ─────────────────────────────────────────────────────────
    let port = config.http_port;
    let ctx = Arc::new(AppContext::new(config, store, metrics, llm, providers));
    let jobs = ctx
        .register_default_jobs()
        .await
        .context("Failed to register scheduled jobs")?;
    for job in &jobs {
        tracing::info!(job = %job.id, trigger = %job.trigger, next_run = ?job.next_run_time, "Job scheduled");
    }

    if let Some(Command::Worker { command }) = args.command {
        let output = cli::execute(&ctx, command, shutdown_signal()).await?;
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    ctx.scheduler.start().await;

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = api::router(Arc::clone(&ctx));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    tracing::info!(port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    ctx.scheduler.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
