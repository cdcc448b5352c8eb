//! plfm-vt Frontdoor
//!
//! Local HTTP front-end on a Unix socket.
//!
//! This service:
//! - Accepts connections on a single Unix socket
//! - Sniffs each connection's first byte to tell TLS from plaintext
//! - Terminates TLS with loaded or freshly generated credentials
//! - Forwards each request to the host named in its own Host header,
//!   using https for TLS connections and http otherwise

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_frontdoor::config::Options;
use plfm_frontdoor::{CredentialMaterial, Director, ForwardingEngine, HttpUpstream, Listener};

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to FRONTDOOR_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| options.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    options.validate()?;

    info!("Starting plfm-vt frontdoor");
    info!(
        bind_path = %options.bind_path.display(),
        proxy = options.proxy_url.is_some(),
        max_connections = options.max_connections,
        "Configuration loaded"
    );

    let material = CredentialMaterial::from_source(&options.credential_source())
        .context("failed to prepare TLS credentials")?;
    let tls_config = material
        .server_config()
        .context("failed to build TLS configuration")?;

    let upstream = HttpUpstream::new(&options.transport_config())
        .context("failed to build upstream transport")?;
    let engine = Arc::new(ForwardingEngine::new(Director::new(), Arc::new(upstream)));

    let listener = Listener::bind(options.listener_config(), tls_config, engine)
        .await
        .with_context(|| format!("failed to bind {}", options.bind_path.display()))?;

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                warn!(error = %e, "Signal handler unavailable, running until killed");
                std::future::pending::<()>().await
            }
        }
    };

    Arc::new(listener).run_until(shutdown).await?;
    Ok(())
}
