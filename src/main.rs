use anyhow::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenant_ratelimit::{config::Settings, limiter::RateLimiter, metrics::Metrics, service};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenant_ratelimit=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tenant rate limit service");

    let config_path = std::env::var("CONFIG_PATH").ok();
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path);
    }
    let settings = Settings::load(config_path.as_deref())?;

    let metrics = Arc::new(Metrics::new()?);
    let limiter = Arc::new(RateLimiter::from_settings(&settings, metrics).await?);
    let http_server = start_http_server(limiter, settings.server.http_addr);
    info!("HTTP server listening on {}", settings.server.http_addr);

    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

async fn start_http_server(limiter: Arc<RateLimiter>, addr: SocketAddr) -> Result<()> {
    let app = service::router(limiter);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
