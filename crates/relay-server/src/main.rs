//! Standalone relay binary: loads configuration, builds a dispatcher
//! backed by a real outbound HTTP client, starts chaining, and serves
//! `relay-http`'s router.

mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::queue::memory::QueueConfig;
use relay_core::queue::QueueRepository;
use relay_core::{ChainingRetry, Dispatcher, ReqwestOutbound};
use tokio::net::TcpListener;

use cli::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = CliArgs::parse();
    let settings = config::load_settings(args.config)?;

    let self_uri = settings.self_uri()?;
    let upstream = settings.upstream_uris()?;
    let downstream = settings.downstream_uris()?;

    let outbound = Arc::new(ReqwestOutbound::new(Duration::from_secs(30))?);
    let queue_config = QueueConfig {
        retry_initial: settings.failed_dispatch_retry(),
        ..QueueConfig::default()
    };
    let queues = QueueRepository::from_config(
        outbound.clone(),
        settings.queue_path.as_deref(),
        queue_config,
    )?;

    let dispatcher = Dispatcher::new(self_uri.clone(), queues);
    dispatcher.spawn_queue_reaper(
        settings.reaper_grace_period() / 2,
        settings.reaper_grace_period(),
    );

    relay_core::start_chaining(
        dispatcher.clone(),
        outbound.clone(),
        upstream,
        downstream,
        ChainingRetry::default(),
    )
    .await;

    let router = relay_http::create_relay_router(dispatcher.clone());

    let listener = TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen_addr))?;
    tracing::info!(addr = %settings.listen_addr, self_uri = %self_uri, "relay listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited")?;

    dispatcher.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    tracing::info!("shutdown signal received");
}
