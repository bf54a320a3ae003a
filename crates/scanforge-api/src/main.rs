//! `scanforge-api` binary entrypoint.
//!
//! Loads configuration, starts the webhook intake server, and spawns the
//! dispatcher workers and the reconciler.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;

use scanforge_api::server::{self, AppState};
use scanforge_core::Settings;
use scanforge_core::observability::{LogFormat, init_logging};
use scanforge_engine::dispatch::Dispatcher;
use scanforge_engine::lock::memory::InMemoryLockManager;
use scanforge_engine::queue::memory::InMemoryWorkQueue;
use scanforge_engine::reconcile::Reconciler;
use scanforge_engine::store::memory::InMemoryStore;
use scanforge_engine::webhook::CompletionHub;

#[derive(Debug, Parser)]
#[command(name = "scanforge-api", about = "Batch analysis orchestration service")]
struct Args {
    /// Configuration file (defaults to $SCANFORGE_CONFIG, then ./scanforge.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Webhook intake listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Prometheus exporter listen address.
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_listen: SocketAddr,

    /// Dispatcher tasks to run in this process.
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn choose_log_format(settings: &Settings) -> LogFormat {
    if settings.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Arc::new(match &args.config {
        Some(path) => Settings::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Settings::load().context("loading configuration")?,
    });

    init_logging(choose_log_format(&settings));

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_listen)
        .install()
        .context("installing Prometheus recorder")?;

    if !settings.debug {
        tracing::warn!(
            "running with the in-memory store and queue; state will not survive a restart"
        );
    }
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryWorkQueue::new());
    let locks = Arc::new(InMemoryLockManager::new(
        settings
            .instances
            .iter()
            .map(|i| (i.name.clone(), i.concurrency_cap)),
    ));
    let completions = Arc::new(CompletionHub::new());

    for worker in 0..args.workers.max(1) {
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&locks),
            Arc::clone(&completions),
            Arc::clone(&settings),
            format!("worker-{worker}"),
        );
        tokio::spawn(async move {
            if let Err(err) = dispatcher.run().await {
                tracing::error!(worker, error = %err, "dispatcher exited");
            }
        });
    }

    if let Some(max_bytes) = settings.paths.repo_cache_max_bytes {
        let cache = scanforge_engine::repo_cache::RepoCache::new(
            &settings.paths.workdir,
            "maintenance",
        )
        .with_fork_remote_base(&settings.fork_remote_base);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                match cache.gc_bare_clones(max_bytes).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "bare clone cache trimmed"),
                    Err(err) => tracing::warn!(error = %err, "bare clone gc failed"),
                }
            }
        });
    }

    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&locks),
        Arc::clone(&completions),
        Arc::clone(&settings),
    );
    tokio::spawn(async move { reconciler.run().await });

    let state = AppState::new(store, settings, completions);
    server::serve(state, args.listen)
        .await
        .context("serving webhook intake")?;
    Ok(())
}
