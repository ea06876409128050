//! Escrow ledger service binary

use std::sync::Arc;

use anyhow::Context;
use escrow_ledger::notifier::TracingNotifier;
use escrow_ledger::processor::HttpProcessor;
use escrow_ledger::{EscrowService, LedgerStore, ServiceConfig, api};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServiceConfig::load().context("loading configuration")?;
    info!(?config, "starting escrow ledger");

    let processor = Arc::new(HttpProcessor::new(&config.processor)?);
    let store = Arc::new(LedgerStore::new());
    let service = Arc::new(EscrowService::new(
        config.clone(),
        store,
        processor,
        Arc::new(TracingNotifier),
    ));

    let app = api::router(service);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await.context("serving")?;

    Ok(())
}
