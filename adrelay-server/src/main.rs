//! adrelay-server - token resolution and cached Graph reads over HTTP
//!
//! Holds the credential directory in memory, resolves a working token per
//! resource and serves upstream reads stale-while-revalidate.

mod api;

use adrelay_lib::candidates::{CandidateTokenProvider, CredentialDirectory};
use adrelay_lib::config::RelayConfig;
use adrelay_lib::service::RelayService;
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[command(name = "adrelay-server")]
#[command(about = "Token resolution and SWR cache server", long_about = None)]
#[command(version)]
struct Args {
    /// HTTP port to listen on
    #[arg(long, default_value = "8080", env = "ADRELAY_PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1", env = "ADRELAY_HOST")]
    host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "ADRELAY_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting adrelay-server v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_env().context("invalid ADRELAY_* environment")?;
    let directory = Arc::new(CredentialDirectory::new());
    let provider = CandidateTokenProvider::new().with_source(Arc::clone(&directory) as _);
    let service = Arc::new(RelayService::connect(config, provider).await?);

    tracing::info!(
        cache = service.cache_mode(),
        fresh_ttl = service.config().fresh_ttl_secs,
        stale_ttl = service.config().stale_ttl_secs,
        "Cache layer ready"
    );

    let state = api::ApiState::new(Arc::clone(&service), directory);
    let app = api::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(
        in_flight = service.swr().in_flight(),
        "Draining background refreshes"
    );
    service.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
