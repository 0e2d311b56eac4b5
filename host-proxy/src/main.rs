//! host-proxy: HTTPS reverse proxy server

use host_proxy::acme::CertManager;
use host_proxy::{ProxyConfig, ProxyServer};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "host_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting host-proxy v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = if let Some(config_path) = std::env::args().nth(1) {
        info!("Loading configuration from {}", config_path);
        ProxyConfig::from_file(Path::new(&config_path))?
    } else {
        info!("No config file specified, using built-in defaults");
        ProxyConfig::default()
    };
    config.apply_env();

    let server = ProxyServer::new(config.clone())?;

    let certs = Arc::new(CertManager::new(&config.tls, server.challenges().clone())?);
    info!(
        "Certificates for {:?} from {:?} cached in {:?} (contact {})",
        config.tls.hosts,
        config.tls.issuer,
        config.tls.cache_dir,
        certs.email()
    );

    info!("proxy running");
    server.run(certs).await?;

    Ok(())
}
